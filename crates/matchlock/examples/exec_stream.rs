use std::sync::Arc;
use std::time::Duration;

use matchlock::{Client, ExecStreamSinks, Sandbox, SandboxError, WriterSink};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), SandboxError> {
    let client = Client::new();
    client.start().await?;

    let vm_id = client.launch(&Sandbox::new("alpine:latest")).await?;
    println!("sandbox ready: {vm_id}");

    let sinks = ExecStreamSinks::new()
        .with_stdout(Arc::new(WriterSink::new(tokio::io::stdout())))
        .with_stderr(Arc::new(WriterSink::new(tokio::io::stderr())));
    let result = client
        .exec_stream(
            "for i in 1 2 3; do echo line $i; sleep 1; done",
            sinks,
            None,
            Some(Duration::from_secs(60)),
        )
        .await?;
    println!("exit={} duration={}ms", result.exit_code, result.duration_ms);

    client.close(Duration::from_secs(2)).await;
    client.remove().await?;
    Ok(())
}
