use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};

use super::*;
use crate::hooks::{
    action_hook_fn, compile_interception, dangerous_hook_fn, event_hook_fn, mutate_hook_fn,
    HookDecision, MutateOutput, VfsHookPhase, VfsHookRule, VfsInterceptionConfig, VfsOp,
};
use crate::sink::BufferSink;

/// Mock supervisor speaking the real line protocol. `rm` invocations are
/// recorded next to the script; the `rpc` subcommand enters the serve loop.
const MOCK_SCRIPT: &str = r#"#!/usr/bin/env python3
import base64
import json
import os
import sys

if len(sys.argv) > 1 and sys.argv[1] == "rm":
    target = sys.argv[2] if len(sys.argv) > 2 else ""
    with open(os.path.abspath(__file__) + ".rm", "w") as f:
        f.write(" ".join(sys.argv[2:]))
    sys.exit(3 if target == "vm-bad" else 0)

files = {}
ids_seen = []
held = []
cancel_targets = []
write_file_count = 0
last_create = None


def reply(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()


def notify(method, params):
    reply({"jsonrpc": "2.0", "method": method, "params": params})


def b64(text):
    return base64.b64encode(text.encode()).decode()


for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    try:
        msg = json.loads(line)
    except Exception:
        continue
    method = msg.get("method")
    rpc_id = msg.get("id")
    params = msg.get("params") or {}
    if rpc_id is not None:
        ids_seen.append(rpc_id)
    if method == "create":
        last_create = params
        image = params.get("image", "")
        vm = "vm-bad" if image == "badrm:latest" else "vm-mock"
        reply({"jsonrpc": "2.0", "id": rpc_id, "result": {"id": vm}})
    elif method == "exec":
        cmd = params.get("command", "")
        if cmd == "hold":
            held.append(rpc_id)
            continue
        if cmd == "die":
            sys.exit(0)
        if cmd == "missing-cmd":
            reply({"jsonrpc": "2.0", "id": rpc_id, "result": {
                "exit_code": 127, "stdout": b64(""),
                "stderr": b64("not found\n"), "duration_ms": 5}})
            continue
        out = cmd[5:] + "\n" if cmd.startswith("echo ") else ""
        reply({"jsonrpc": "2.0", "id": rpc_id, "result": {
            "exit_code": 0, "stdout": b64(out), "stderr": b64(""),
            "duration_ms": 42}})
    elif method == "exec_stream":
        cmd = params.get("command", "")
        if cmd == "stream-demo":
            notify("exec_stream.stdout", {"id": rpc_id, "data": b64("line1\n")})
            notify("exec_stream.stderr", {"id": rpc_id, "data": b64("warn\n")})
            notify("exec_stream.stdout", {"id": rpc_id, "data": b64("line2\n")})
            reply({"jsonrpc": "2.0", "id": rpc_id, "result": {
                "exit_code": 0, "duration_ms": 200}})
        else:
            notify("exec_stream.stdout", {"id": rpc_id, "data": b64("data")})
            reply({"jsonrpc": "2.0", "id": rpc_id, "result": {
                "exit_code": 0, "duration_ms": 50}})
    elif method == "write_file":
        write_file_count += 1
        path = params.get("path", "")
        files[path] = params.get("content", "")
        reply({"jsonrpc": "2.0", "id": rpc_id, "result": {}})
        if path == "/workspace/with-event.txt":
            raw = base64.b64decode(params.get("content", ""))
            notify("event", {"file": {"op": "write", "path": path,
                                      "size": len(raw),
                                      "mode": params.get("mode", 0),
                                      "uid": 0, "gid": 0}})
    elif method == "read_file":
        path = params.get("path", "")
        if path in files:
            reply({"jsonrpc": "2.0", "id": rpc_id,
                   "result": {"content": files[path]}})
        else:
            reply({"jsonrpc": "2.0", "id": rpc_id,
                   "error": {"code": -32002,
                             "message": "no such file: " + path}})
    elif method == "list_files":
        reply({"jsonrpc": "2.0", "id": rpc_id, "result": {"files": [
            {"name": "hello.txt", "size": 5, "mode": 420, "is_dir": False},
            {"name": "subdir", "size": 0, "mode": 493, "is_dir": True},
        ]}})
    elif method == "probe_event":
        file = params.get("file") or {"op": "write",
                                      "path": "/workspace/hooked.txt",
                                      "size": 7, "mode": 420,
                                      "uid": 0, "gid": 0}
        notify("event", {"file": file})
        reply({"jsonrpc": "2.0", "id": rpc_id, "result": {}})
    elif method == "cancel":
        cancel_targets.append(params.get("id"))
        reply({"jsonrpc": "2.0", "id": rpc_id, "result": {}})
    elif method == "stats":
        reply({"jsonrpc": "2.0", "id": rpc_id, "result": {
            "ids": ids_seen, "held": held,
            "cancel_targets": cancel_targets,
            "write_file": write_file_count,
            "last_create_params": last_create}})
    elif method == "close":
        reply({"jsonrpc": "2.0", "id": rpc_id, "result": {}})
    elif rpc_id is not None:
        reply({"jsonrpc": "2.0", "id": rpc_id,
               "error": {"code": -32601,
                         "message": "method not found: " + str(method)}})
"#;

static MOCK_SEQ: AtomicU64 = AtomicU64::new(0);

struct MockSupervisor {
    script_path: PathBuf,
}

impl MockSupervisor {
    fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let seq = MOCK_SEQ.fetch_add(1, AtomicOrdering::Relaxed);
        let script_path = std::env::temp_dir().join(format!("matchlock_mock_{nanos}_{seq}.py"));
        fs::write(&script_path, MOCK_SCRIPT).expect("write mock script");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&script_path).expect("stat mock script").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).expect("chmod mock script");
        }

        Self { script_path }
    }

    fn config(&self) -> Config {
        Config::new(&self.script_path)
    }

    fn rm_record_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.rm", self.script_path.display()))
    }
}

impl Drop for MockSupervisor {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.script_path);
        let _ = fs::remove_file(self.rm_record_path());
    }
}

async fn connected_client() -> (Client, MockSupervisor) {
    let mock = MockSupervisor::new();
    let client = Client::with_config(mock.config());
    client.start().await.expect("start supervisor");
    (client, mock)
}

async fn mock_stats(client: &Client) -> Value {
    client
        .send_request("stats", None, Some(Duration::from_secs(2)))
        .await
        .expect("stats")
}

/// Poll until `condition` holds; panics after two seconds.
async fn wait_for(condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn event_json(op: &str, path: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "event",
        "params": {"file": {"op": op, "path": path, "size": 4, "mode": 420, "uid": 0, "gid": 0}}
    })
}

fn audit_rule(counter: &Arc<AtomicU64>) -> VfsHookRule {
    let counter = Arc::clone(counter);
    VfsHookRule::named("audit")
        .with_phase(VfsHookPhase::After)
        .with_ops([VfsOp::Write])
        .with_path("/workspace/*")
        .with_event_hook(event_hook_fn(move |_event| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }))
}

#[path = "tests/vfs_ops.rs"]
mod vfs_ops;
