use std::time::Duration;

use matchlock::{Client, Sandbox, SandboxError};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), SandboxError> {
    let client = Client::new();
    client.start().await?;

    let sandbox = Sandbox::new("alpine:latest")
        .with_memory(512)
        .allow_host(["dl-cdn.alpinelinux.org"]);
    let vm_id = client.launch(&sandbox).await?;
    println!("sandbox ready: {vm_id}");

    let result = client
        .exec(
            "echo hello from the sandbox",
            None,
            Some(Duration::from_secs(30)),
        )
        .await?;
    print!("{}", result.stdout);

    client
        .write_file(
            "/workspace/note.txt",
            "written from the host\n",
            Some(Duration::from_secs(10)),
        )
        .await?;
    let note = client
        .read_file("/workspace/note.txt", Some(Duration::from_secs(10)))
        .await?;
    println!("note: {}", String::from_utf8_lossy(&note).trim_end());

    for entry in client
        .list_files("/workspace", Some(Duration::from_secs(10)))
        .await?
    {
        let kind = if entry.is_dir { "d" } else { "-" };
        println!("{kind} {:o} {:>8} {}", entry.mode, entry.size, entry.name);
    }

    client.close(Duration::from_secs(2)).await;
    client.remove().await?;
    Ok(())
}
