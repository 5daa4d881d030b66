use std::time::Duration;

use matchlock::{
    action_hook_fn, event_hook_fn, mutate_hook_fn, Client, HookAction, HookDecision, MutateOutput,
    Sandbox, SandboxError, VfsHookPhase, VfsHookRule, VfsInterceptionConfig, VfsOp,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), SandboxError> {
    let interception = VfsInterceptionConfig::new()
        .with_rule(
            VfsHookRule::named("host-block-create")
                .with_phase(VfsHookPhase::Before)
                .with_ops([VfsOp::Create])
                .with_path("/workspace/blocked-create.txt")
                .with_action(HookAction::Block),
        )
        .with_rule(
            VfsHookRule::named("sdk-block-write")
                .with_phase(VfsHookPhase::Before)
                .with_ops([VfsOp::Write])
                .with_path("/workspace/blocked-write.txt")
                .with_action_hook(action_hook_fn(|_request| Ok(HookDecision::Block))),
        )
        .with_rule(
            VfsHookRule::named("mutate-write")
                .with_phase(VfsHookPhase::Before)
                .with_ops([VfsOp::Write])
                .with_path("/workspace/mutated.txt")
                .with_mutate_hook(mutate_hook_fn(|request| {
                    Ok(Some(MutateOutput::Text(format!(
                        "mutated-by-hook size={} mode={:#o} uid={} gid={}",
                        request.size, request.mode, request.uid, request.gid
                    ))))
                })),
        )
        .with_rule(
            VfsHookRule::named("audit-after-write")
                .with_phase(VfsHookPhase::After)
                .with_ops([VfsOp::Write])
                .with_path("/workspace/*")
                .with_timeout_ms(2000)
                .with_event_hook(event_hook_fn(|event| {
                    println!(
                        "after hook op={} path={} size={} mode={:o} uid={} gid={}",
                        event.op, event.path, event.size, event.mode, event.uid, event.gid
                    );
                    Ok(())
                })),
        );

    let sandbox = Sandbox::new("alpine:latest").with_vfs_interception(interception);

    let client = Client::new();
    client.start().await?;
    let vm_id = client.launch(&sandbox).await?;
    println!("sandbox ready: {vm_id}");

    let rpc_timeout = Some(Duration::from_secs(10));

    match client
        .write_file("/workspace/blocked-create.txt", "blocked", rpc_timeout)
        .await
    {
        Ok(()) => println!("host create block unexpectedly succeeded"),
        Err(err) => println!("host create block rejected as expected: {err}"),
    }

    match client
        .write_file("/workspace/blocked-write.txt", "blocked", rpc_timeout)
        .await
    {
        Ok(()) => println!("local write block unexpectedly succeeded"),
        Err(err) => println!("local write block rejected as expected: {err}"),
    }

    client
        .write_file_with_mode("/workspace/mutated.txt", "original-content", 0o640, rpc_timeout)
        .await?;
    let mutated = client.read_file("/workspace/mutated.txt", rpc_timeout).await?;
    println!(
        "mutated file content: {:?}",
        String::from_utf8_lossy(&mutated).trim()
    );

    client
        .write_file_with_mode("/workspace/trigger.txt", "trigger", 0o600, rpc_timeout)
        .await?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    client.close(Duration::from_secs(2)).await;
    client.remove().await?;
    Ok(())
}
