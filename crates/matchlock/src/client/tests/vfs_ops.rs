use std::sync::Weak;

use crate::client::dispatch;
use crate::errors::HookError;
use crate::hooks::{ActionHook, HookFuture, VfsActionRequest};

use super::*;

fn interception_opts(rules: Vec<VfsHookRule>) -> CreateOptions {
    let mut opts = CreateOptions::new("alpine:latest");
    opts.vfs_interception = Some(VfsInterceptionConfig {
        emit_events: false,
        rules,
    });
    opts
}

#[tokio::test(flavor = "current_thread")]
async fn create_requires_an_image_before_any_io() {
    // No subprocess exists, so an RPC attempt would surface NotRunning;
    // the config check must fire first.
    let client = Client::with_config(Config::new("unused-binary"));
    let err = client
        .create(&CreateOptions::default())
        .await
        .expect_err("empty image must fail");
    match err {
        SandboxError::InvalidConfig(message) => assert!(message.contains("image")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn hook_compile_errors_surface_before_any_io() {
    let client = Client::with_config(Config::new("unused-binary"));
    let rule = VfsHookRule::named("two-slots")
        .with_phase(VfsHookPhase::After)
        .with_event_hook(event_hook_fn(|_event| Ok(())))
        .with_mutate_hook(mutate_hook_fn(|_request| Ok(None)));
    let err = client
        .create(&interception_opts(vec![rule]))
        .await
        .expect_err("multiple callbacks must fail");
    assert!(matches!(err, SandboxError::InvalidConfig(_)));
}

#[tokio::test(flavor = "current_thread")]
async fn create_sends_wire_rules_and_keeps_callbacks_local() {
    let (client, _mock) = connected_client().await;

    let counter = Arc::new(AtomicU64::new(0));
    let opts = interception_opts(vec![
        VfsHookRule::named("host-block")
            .with_phase(VfsHookPhase::Before)
            .with_ops([VfsOp::Create])
            .with_path("/workspace/blocked.txt")
            .with_action(crate::hooks::HookAction::Block),
        audit_rule(&counter),
    ]);
    let vm_id = client.create(&opts).await.expect("create");
    assert_eq!(vm_id, "vm-mock");
    assert_eq!(client.vm_id().as_deref(), Some("vm-mock"));

    let stats = mock_stats(&client).await;
    let interception = &stats["last_create_params"]["vfs"]["interception"];
    assert_eq!(interception["emit_events"], json!(true));
    let rules = interception["rules"].as_array().expect("wire rules");
    assert_eq!(rules.len(), 1, "callback rules must stay off the wire");
    assert_eq!(rules[0]["name"], "host-block");
    assert_eq!(rules[0]["action"], "block");

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn launch_delegates_to_create() {
    let (client, _mock) = connected_client().await;

    let sandbox = Sandbox::new("alpine:latest").with_cpus(2);
    let vm_id = client.launch(&sandbox).await.expect("launch");
    assert_eq!(vm_id, "vm-mock");

    let stats = mock_stats(&client).await;
    assert_eq!(stats["last_create_params"]["resources"]["cpus"], json!(2));

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn write_then_read_round_trips_without_mutate_hooks() {
    let (client, _mock) = connected_client().await;
    client
        .create(&CreateOptions::new("alpine:latest"))
        .await
        .expect("create");

    let payload = vec![0u8, 1, 2, 255, 254, 10, 13];
    client
        .write_file("/workspace/data.bin", payload.clone(), Some(Duration::from_secs(2)))
        .await
        .expect("write");
    let read_back = client
        .read_file("/workspace/data.bin", Some(Duration::from_secs(2)))
        .await
        .expect("read");
    assert_eq!(read_back, payload);

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn read_file_missing_is_a_file_error() {
    let (client, _mock) = connected_client().await;

    let err = client
        .read_file("/workspace/nope", Some(Duration::from_secs(2)))
        .await
        .expect_err("missing file must fail");
    match err {
        SandboxError::Rpc(rpc) => assert!(rpc.is_file_error()),
        other => panic!("unexpected error: {other:?}"),
    }

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn list_files_decodes_entries() {
    let (client, _mock) = connected_client().await;

    let files = client
        .list_files("/workspace", Some(Duration::from_secs(2)))
        .await
        .expect("list");
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].name, "hello.txt");
    assert_eq!(files[0].size, 5);
    assert_eq!(files[0].mode, 0o644);
    assert!(!files[0].is_dir);
    assert_eq!(files[1].name, "subdir");
    assert_eq!(files[1].mode, 0o755);
    assert!(files[1].is_dir);

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn action_hook_block_aborts_before_any_bytes_reach_the_wire() {
    let (client, _mock) = connected_client().await;

    let rule = VfsHookRule::named("deny-workspace-writes")
        .with_ops([VfsOp::Write])
        .with_path("/workspace/*")
        .with_action_hook(action_hook_fn(|_request| Ok(HookDecision::Block)));
    client
        .create(&interception_opts(vec![rule]))
        .await
        .expect("create");

    let err = client
        .write_file("/workspace/x", "abcd", Some(Duration::from_secs(2)))
        .await
        .expect_err("write must be blocked");
    match err {
        SandboxError::HookBlocked { op, path, hook } => {
            assert_eq!(op, "write");
            assert_eq!(path, "/workspace/x");
            assert_eq!(hook, "deny-workspace-writes");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let stats = mock_stats(&client).await;
    assert_eq!(stats["write_file"], json!(0));

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn action_hook_ignores_non_matching_paths() {
    let (client, _mock) = connected_client().await;

    let rule = VfsHookRule::named("deny-workspace-writes")
        .with_ops([VfsOp::Write])
        .with_path("/workspace/*")
        .with_action_hook(action_hook_fn(|_request| Ok(HookDecision::Block)));
    client
        .create(&interception_opts(vec![rule]))
        .await
        .expect("create");

    client
        .write_file("/tmp/elsewhere", "ok", Some(Duration::from_secs(2)))
        .await
        .expect("non-matching write passes");
    let stats = mock_stats(&client).await;
    assert_eq!(stats["write_file"], json!(1));

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn action_hook_sees_size_mode_and_host_ids() {
    let (client, _mock) = connected_client().await;

    let seen = Arc::new(std::sync::Mutex::new(None::<VfsActionRequest>));
    let seen_clone = Arc::clone(&seen);
    let rule = VfsHookRule::named("observe")
        .with_ops([VfsOp::Write])
        .with_action_hook(action_hook_fn(move |request| {
            *seen_clone.lock().expect("seen lock") = Some(request.clone());
            Ok(HookDecision::Allow)
        }));
    client
        .create(&interception_opts(vec![rule]))
        .await
        .expect("create");

    client
        .write_file_with_mode("/workspace/t", "abcd", 0o640, Some(Duration::from_secs(2)))
        .await
        .expect("write");

    let request = seen.lock().expect("seen lock").clone().expect("hook ran");
    assert_eq!(request.op, "write");
    assert_eq!(request.path, "/workspace/t");
    assert_eq!(request.size, 4);
    assert_eq!(request.mode, 0o640);

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn mutate_hook_rewrites_the_payload() {
    let (client, _mock) = connected_client().await;

    let rule = VfsHookRule::named("stamp")
        .with_ops([VfsOp::Write])
        .with_path("/workspace/*")
        .with_mutate_hook(mutate_hook_fn(|request| {
            Ok(Some(MutateOutput::Text(format!(
                "size={};mode={:#o}",
                request.size, request.mode
            ))))
        }));
    client
        .create(&interception_opts(vec![rule]))
        .await
        .expect("create");

    client
        .write_file_with_mode("/workspace/t", "abcd", 0o644, Some(Duration::from_secs(2)))
        .await
        .expect("write");
    let content = client
        .read_file("/workspace/t", Some(Duration::from_secs(2)))
        .await
        .expect("read");
    assert_eq!(content, b"size=4;mode=0o644");

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn mutate_hooks_thread_in_declaration_order() {
    let (client, _mock) = connected_client().await;

    let first = VfsHookRule::named("shrink")
        .with_ops([VfsOp::Write])
        .with_mutate_hook(mutate_hook_fn(|_request| {
            Ok(Some(MutateOutput::Bytes(b"ab".to_vec())))
        }));
    let second = VfsHookRule::named("measure")
        .with_ops([VfsOp::Write])
        .with_mutate_hook(mutate_hook_fn(|request| {
            Ok(Some(MutateOutput::Text(format!("len={}", request.size))))
        }));
    client
        .create(&interception_opts(vec![first, second]))
        .await
        .expect("create");

    client
        .write_file("/workspace/t", "abcdef", Some(Duration::from_secs(2)))
        .await
        .expect("write");
    let content = client
        .read_file("/workspace/t", Some(Duration::from_secs(2)))
        .await
        .expect("read");
    assert_eq!(content, b"len=2");

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn mutate_none_leaves_the_payload_unchanged() {
    let (client, _mock) = connected_client().await;

    let rule = VfsHookRule::named("inspect-only")
        .with_ops([VfsOp::Write])
        .with_mutate_hook(mutate_hook_fn(|_request| Ok(None)));
    client
        .create(&interception_opts(vec![rule]))
        .await
        .expect("create");

    client
        .write_file("/workspace/t", "original", Some(Duration::from_secs(2)))
        .await
        .expect("write");
    let content = client
        .read_file("/workspace/t", Some(Duration::from_secs(2)))
        .await
        .expect("read");
    assert_eq!(content, b"original");

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn action_hook_failure_aborts_the_call() {
    let (client, _mock) = connected_client().await;

    let rule = VfsHookRule::named("broken")
        .with_ops([VfsOp::Write])
        .with_action_hook(action_hook_fn(|_request| {
            Err(HookError::new("policy backend unavailable"))
        }));
    client
        .create(&interception_opts(vec![rule]))
        .await
        .expect("create");

    let err = client
        .write_file("/workspace/x", "abcd", Some(Duration::from_secs(2)))
        .await
        .expect_err("hook failure must abort");
    match err {
        SandboxError::HookFailed { hook, message } => {
            assert_eq!(hook, "broken");
            assert!(message.contains("unavailable"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    client.close(Duration::from_secs(2)).await;
}

struct SlowActionHook;

impl ActionHook for SlowActionHook {
    fn call<'a>(
        &'a self,
        _request: &'a VfsActionRequest,
    ) -> HookFuture<'a, Result<HookDecision, HookError>> {
        Box::pin(async {
            sleep(Duration::from_millis(500)).await;
            Ok(HookDecision::Allow)
        })
    }
}

#[tokio::test(flavor = "current_thread")]
async fn action_hook_timeout_aborts_the_call() {
    let (client, _mock) = connected_client().await;

    let rule = VfsHookRule::named("slow")
        .with_ops([VfsOp::Write])
        .with_timeout_ms(50)
        .with_action_hook(Arc::new(SlowActionHook));
    client
        .create(&interception_opts(vec![rule]))
        .await
        .expect("create");

    let err = client
        .write_file("/workspace/x", "abcd", Some(Duration::from_secs(2)))
        .await
        .expect_err("slow hook must time out");
    match err {
        SandboxError::HookFailed { hook, message } => {
            assert_eq!(hook, "slow");
            assert!(message.contains("timed out"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn safe_event_hook_fires_on_supervisor_events() {
    let (client, _mock) = connected_client().await;

    let counter = Arc::new(AtomicU64::new(0));
    client
        .create(&interception_opts(vec![audit_rule(&counter)]))
        .await
        .expect("create");

    client
        .write_file("/workspace/with-event.txt", "payload", Some(Duration::from_secs(2)))
        .await
        .expect("write");

    let observed = Arc::clone(&counter);
    wait_for(move || observed.load(AtomicOrdering::SeqCst) == 1).await;
    assert!(client.metrics_snapshot().events_dispatched >= 1);

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn safe_hook_runs_exactly_once_under_reentrant_synthesis() {
    let client = Client::with_config(Config::new("unused-binary"));
    let counter = Arc::new(AtomicU64::new(0));
    let weak: Weak<_> = Arc::downgrade(&client.inner);
    let synthetic = event_json("write", "/workspace/a.txt");
    let resynthesized = synthetic.clone();

    let counter_clone = Arc::clone(&counter);
    let rule = VfsHookRule::named("self-feeding")
        .with_phase(VfsHookPhase::After)
        .with_ops([VfsOp::Write])
        .with_path("/workspace/*")
        .with_event_hook(event_hook_fn(move |_event| {
            counter_clone.fetch_add(1, AtomicOrdering::SeqCst);
            // Deliver a matching event from inside the callback; the guard
            // must drop it instead of growing the stack.
            if let Some(inner) = weak.upgrade() {
                dispatch::dispatch_event(&inner, &resynthesized);
            }
            Ok(())
        }));
    let compiled =
        compile_interception(Some(&VfsInterceptionConfig {
            emit_events: false,
            rules: vec![rule],
        }))
        .expect("compile");
    client.set_hook_tables(compiled.tables);

    dispatch::dispatch_event(&client.inner, &synthetic);

    let observed = Arc::clone(&counter);
    wait_for(move || observed.load(AtomicOrdering::SeqCst) >= 1).await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(client.metrics_snapshot().safe_batches_dropped, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn no_callbacks_fire_for_events_after_close() {
    let (client, _mock) = connected_client().await;

    let counter = Arc::new(AtomicU64::new(0));
    client
        .create(&interception_opts(vec![audit_rule(&counter)]))
        .await
        .expect("create");
    client.close(Duration::from_secs(2)).await;
    assert!(client.hook_tables().is_empty());

    dispatch::dispatch_event(&client.inner, &event_json("write", "/workspace/late.txt"));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn dangerous_hook_may_reenter_the_sdk() {
    let (client, _mock) = connected_client().await;

    let counter = Arc::new(AtomicU64::new(0));
    let inner_stdout = Arc::new(std::sync::Mutex::new(String::new()));
    let counter_clone = Arc::clone(&counter);
    let stdout_clone = Arc::clone(&inner_stdout);
    let rule = VfsHookRule::named("reentrant")
        .with_phase(VfsHookPhase::After)
        .with_ops([VfsOp::Write])
        .with_path("/workspace/*")
        .with_dangerous_hook(dangerous_hook_fn(move |hook_client: Client, _event| {
            let counter = Arc::clone(&counter_clone);
            let stdout = Arc::clone(&stdout_clone);
            async move {
                let result = hook_client
                    .exec("echo inner", None, Some(Duration::from_secs(2)))
                    .await
                    .map_err(|err| HookError::new(err.to_string()))?;
                *stdout.lock().expect("stdout lock") = result.stdout;
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        }));
    client
        .create(&interception_opts(vec![rule]))
        .await
        .expect("create");

    client
        .send_request("probe_event", None, Some(Duration::from_secs(2)))
        .await
        .expect("probe_event #1");
    let observed = Arc::clone(&counter);
    wait_for(move || observed.load(AtomicOrdering::SeqCst) == 1).await;
    assert_eq!(inner_stdout.lock().expect("stdout lock").as_str(), "inner\n");

    client
        .send_request("probe_event", None, Some(Duration::from_secs(2)))
        .await
        .expect("probe_event #2");
    let observed = Arc::clone(&counter);
    wait_for(move || observed.load(AtomicOrdering::SeqCst) == 2).await;

    client.close(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "current_thread")]
async fn event_callback_failures_are_swallowed() {
    let (client, _mock) = connected_client().await;

    let rule = VfsHookRule::named("faulty")
        .with_phase(VfsHookPhase::After)
        .with_event_hook(event_hook_fn(|_event| Err(HookError::new("boom"))));
    client
        .create(&interception_opts(vec![rule]))
        .await
        .expect("create");

    client
        .send_request("probe_event", None, Some(Duration::from_secs(2)))
        .await
        .expect("probe_event");
    let metrics_client = client.clone();
    wait_for(move || metrics_client.metrics_snapshot().hook_callback_errors >= 1).await;

    // The dispatcher and unrelated requests are unaffected.
    let result = client
        .exec("echo still-alive", None, Some(Duration::from_secs(2)))
        .await
        .expect("exec after hook failure");
    assert_eq!(result.stdout, "still-alive\n");

    client.close(Duration::from_secs(2)).await;
}
