use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::errors::{HookError, SandboxError};

pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Virtual-filesystem operations the supervisor can intercept.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VfsOp {
    Stat,
    Readdir,
    Open,
    Create,
    Mkdir,
    Chmod,
    Remove,
    RemoveAll,
    Rename,
    Symlink,
    Readlink,
    Read,
    Write,
    Close,
    Sync,
    Truncate,
}

impl VfsOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stat => "stat",
            Self::Readdir => "readdir",
            Self::Open => "open",
            Self::Create => "create",
            Self::Mkdir => "mkdir",
            Self::Chmod => "chmod",
            Self::Remove => "remove",
            Self::RemoveAll => "remove_all",
            Self::Rename => "rename",
            Self::Symlink => "symlink",
            Self::Readlink => "readlink",
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
            Self::Sync => "sync",
            Self::Truncate => "truncate",
        }
    }
}

impl FromStr for VfsOp {
    type Err = SandboxError;

    /// Case-folding parse; stored form is always lowercase.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "stat" => Ok(Self::Stat),
            "readdir" => Ok(Self::Readdir),
            "open" => Ok(Self::Open),
            "create" => Ok(Self::Create),
            "mkdir" => Ok(Self::Mkdir),
            "chmod" => Ok(Self::Chmod),
            "remove" => Ok(Self::Remove),
            "remove_all" => Ok(Self::RemoveAll),
            "rename" => Ok(Self::Rename),
            "symlink" => Ok(Self::Symlink),
            "readlink" => Ok(Self::Readlink),
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "close" => Ok(Self::Close),
            "sync" => Ok(Self::Sync),
            "truncate" => Ok(Self::Truncate),
            other => Err(SandboxError::InvalidConfig(format!(
                "unknown vfs op: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VfsHookPhase {
    Before,
    After,
}

impl FromStr for VfsHookPhase {
    type Err = SandboxError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            other => Err(SandboxError::InvalidConfig(format!(
                "unknown hook phase: {other}"
            ))),
        }
    }
}

/// Wire-side rule action. `exec_after` is supervisor-defined and passed
/// through unchanged; the SDK attaches no local semantics to it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    Allow,
    Block,
    MutateWrite,
    ExecAfter,
}

impl FromStr for HookAction {
    type Err = SandboxError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "block" => Ok(Self::Block),
            "mutate_write" => Ok(Self::MutateWrite),
            "exec_after" => Ok(Self::ExecAfter),
            other => Err(SandboxError::InvalidConfig(format!(
                "unknown hook action: {other}"
            ))),
        }
    }
}

/// Metadata delivered to after-hooks for one intercepted operation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VfsHookEvent {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

/// Input to local before-op action hooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VfsActionRequest {
    pub op: String,
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Input to local before-write mutate hooks. `size` tracks the payload the
/// next hook in the chain will see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VfsMutateRequest {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookDecision {
    Allow,
    Block,
}

/// Replacement payload returned by a mutate hook. Text is UTF-8-encoded
/// before the next hook or the wire sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutateOutput {
    Bytes(Vec<u8>),
    Text(String),
}

impl MutateOutput {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.into_bytes(),
        }
    }
}

/// Safe after-hook: runs under the re-entrancy guard and must not call back
/// into the SDK.
pub trait EventHook: Send + Sync + 'static {
    fn call<'a>(&'a self, event: &'a VfsHookEvent) -> HookFuture<'a, Result<(), HookError>>;
}

/// Re-entrant after-hook: receives an owned client handle and may perform
/// further RPCs. Recursion is the implementor's concern.
pub trait DangerousEventHook: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        client: Client,
        event: &'a VfsHookEvent,
    ) -> HookFuture<'a, Result<(), HookError>>;
}

/// Before-write hook that may replace the payload of a `write_file`.
pub trait MutateHook: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        request: &'a VfsMutateRequest,
    ) -> HookFuture<'a, Result<Option<MutateOutput>, HookError>>;
}

/// Before-op hook deciding allow or block for read/write/readdir calls.
pub trait ActionHook: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        request: &'a VfsActionRequest,
    ) -> HookFuture<'a, Result<HookDecision, HookError>>;
}

struct FnEventHook<F>(F);

impl<F> EventHook for FnEventHook<F>
where
    F: Fn(&VfsHookEvent) -> Result<(), HookError> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, event: &'a VfsHookEvent) -> HookFuture<'a, Result<(), HookError>> {
        Box::pin(std::future::ready((self.0)(event)))
    }
}

struct FnDangerousHook<F>(F);

impl<F, Fut> DangerousEventHook for FnDangerousHook<F>
where
    F: Fn(Client, VfsHookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    fn call<'a>(
        &'a self,
        client: Client,
        event: &'a VfsHookEvent,
    ) -> HookFuture<'a, Result<(), HookError>> {
        Box::pin((self.0)(client, event.clone()))
    }
}

struct FnMutateHook<F>(F);

impl<F> MutateHook for FnMutateHook<F>
where
    F: Fn(&VfsMutateRequest) -> Result<Option<MutateOutput>, HookError> + Send + Sync + 'static,
{
    fn call<'a>(
        &'a self,
        request: &'a VfsMutateRequest,
    ) -> HookFuture<'a, Result<Option<MutateOutput>, HookError>> {
        Box::pin(std::future::ready((self.0)(request)))
    }
}

struct FnActionHook<F>(F);

impl<F> ActionHook for FnActionHook<F>
where
    F: Fn(&VfsActionRequest) -> Result<HookDecision, HookError> + Send + Sync + 'static,
{
    fn call<'a>(
        &'a self,
        request: &'a VfsActionRequest,
    ) -> HookFuture<'a, Result<HookDecision, HookError>> {
        Box::pin(std::future::ready((self.0)(request)))
    }
}

/// Wrap a sync closure as a safe event hook.
pub fn event_hook_fn<F>(f: F) -> Arc<dyn EventHook>
where
    F: Fn(&VfsHookEvent) -> Result<(), HookError> + Send + Sync + 'static,
{
    Arc::new(FnEventHook(f))
}

/// Wrap an async closure as a dangerous event hook.
pub fn dangerous_hook_fn<F, Fut>(f: F) -> Arc<dyn DangerousEventHook>
where
    F: Fn(Client, VfsHookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    Arc::new(FnDangerousHook(f))
}

/// Wrap a sync closure as a mutate hook.
pub fn mutate_hook_fn<F>(f: F) -> Arc<dyn MutateHook>
where
    F: Fn(&VfsMutateRequest) -> Result<Option<MutateOutput>, HookError> + Send + Sync + 'static,
{
    Arc::new(FnMutateHook(f))
}

/// Wrap a sync closure as an action hook.
pub fn action_hook_fn<F>(f: F) -> Arc<dyn ActionHook>
where
    F: Fn(&VfsActionRequest) -> Result<HookDecision, HookError> + Send + Sync + 'static,
{
    Arc::new(FnActionHook(f))
}

/// One interception rule. A rule either travels to the supervisor verbatim
/// (no callback) or registers exactly one SDK-local callback; the compiler
/// rejects rules carrying more than one callback slot.
#[derive(Clone, Default)]
pub struct VfsHookRule {
    pub name: String,
    pub phase: Option<VfsHookPhase>,
    /// Operation filter; empty matches every op.
    pub ops: Vec<VfsOp>,
    /// filepath-style glob; empty matches every path. `/` is an ordinary
    /// character.
    pub path: String,
    pub action: Option<HookAction>,
    /// Per-callback time budget; 0 means unbounded.
    pub timeout_ms: u64,
    pub event_hook: Option<Arc<dyn EventHook>>,
    pub dangerous_hook: Option<Arc<dyn DangerousEventHook>>,
    pub mutate_hook: Option<Arc<dyn MutateHook>>,
    pub action_hook: Option<Arc<dyn ActionHook>>,
}

impl std::fmt::Debug for VfsHookRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsHookRule")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("ops", &self.ops)
            .field("path", &self.path)
            .field("action", &self.action)
            .field("timeout_ms", &self.timeout_ms)
            .field("event_hook", &self.event_hook.is_some())
            .field("dangerous_hook", &self.dangerous_hook.is_some())
            .field("mutate_hook", &self.mutate_hook.is_some())
            .field("action_hook", &self.action_hook.is_some())
            .finish()
    }
}

impl VfsHookRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_phase(mut self, phase: VfsHookPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_ops(mut self, ops: impl IntoIterator<Item = VfsOp>) -> Self {
        self.ops.extend(ops);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_action(mut self, action: HookAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_event_hook(mut self, hook: Arc<dyn EventHook>) -> Self {
        self.event_hook = Some(hook);
        self
    }

    pub fn with_dangerous_hook(mut self, hook: Arc<dyn DangerousEventHook>) -> Self {
        self.dangerous_hook = Some(hook);
        self
    }

    pub fn with_mutate_hook(mut self, hook: Arc<dyn MutateHook>) -> Self {
        self.mutate_hook = Some(hook);
        self
    }

    pub fn with_action_hook(mut self, hook: Arc<dyn ActionHook>) -> Self {
        self.action_hook = Some(hook);
        self
    }

    fn callback_count(&self) -> usize {
        usize::from(self.event_hook.is_some())
            + usize::from(self.dangerous_hook.is_some())
            + usize::from(self.mutate_hook.is_some())
            + usize::from(self.action_hook.is_some())
    }

    fn to_wire(&self) -> WireRule {
        WireRule {
            action: self.action.unwrap_or(HookAction::Allow),
            name: (!self.name.is_empty()).then(|| self.name.clone()),
            phase: self.phase,
            ops: self.ops.clone(),
            path: (!self.path.is_empty()).then(|| self.path.clone()),
            timeout_ms: self.timeout_ms,
        }
    }
}

/// User-facing VFS interception configuration.
#[derive(Clone, Debug, Default)]
pub struct VfsInterceptionConfig {
    /// Ask the supervisor to emit file-operation events. Forced on when any
    /// local event hook is registered.
    pub emit_events: bool,
    pub rules: Vec<VfsHookRule>,
}

impl VfsInterceptionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_emit_events(mut self) -> Self {
        self.emit_events = true;
        self
    }

    pub fn with_rule(mut self, rule: VfsHookRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Wire-safe interception config: what actually travels in `create` params.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireInterception {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub emit_events: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<WireRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireRule {
    pub action: HookAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VfsHookPhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<VfsOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub timeout_ms: u64,
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

pub(crate) enum LocalCallback {
    Event(Arc<dyn EventHook>),
    Dangerous(Arc<dyn DangerousEventHook>),
    Mutate(Arc<dyn MutateHook>),
    Action(Arc<dyn ActionHook>),
}

/// Compiled SDK-local hook: tagged callback plus its match predicate.
pub(crate) struct LocalHook {
    pub name: String,
    pub ops: HashSet<VfsOp>,
    pub matcher: Option<GlobMatcher>,
    pub timeout: Option<Duration>,
    pub callback: LocalCallback,
}

impl LocalHook {
    pub(crate) fn matches(&self, op: &str, path: &str) -> bool {
        if !self.ops.is_empty() {
            match op.parse::<VfsOp>() {
                Ok(op) if self.ops.contains(&op) => {}
                _ => return false,
            }
        }
        if let Some(matcher) = &self.matcher {
            if !matcher.is_match(path) {
                return false;
            }
        }
        true
    }

    pub(crate) fn is_dangerous(&self) -> bool {
        matches!(self.callback, LocalCallback::Dangerous(_))
    }
}

#[derive(Default)]
pub(crate) struct LocalHookTables {
    pub event_hooks: Vec<LocalHook>,
    pub mutate_hooks: Vec<LocalHook>,
    pub action_hooks: Vec<LocalHook>,
}

impl LocalHookTables {
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.event_hooks.is_empty()
            && self.mutate_hooks.is_empty()
            && self.action_hooks.is_empty()
    }
}

pub(crate) struct CompiledHooks {
    pub wire: Option<WireInterception>,
    pub tables: LocalHookTables,
}

impl std::fmt::Debug for CompiledHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledHooks")
            .field("wire", &self.wire)
            .field("tables_len", &self.tables.event_hooks.len())
            .finish()
    }
}

/// Partition user rules into the wire config and the three local tables,
/// enforcing the per-rule callback/phase/action matrix.
pub(crate) fn compile_interception(
    config: Option<&VfsInterceptionConfig>,
) -> Result<CompiledHooks, SandboxError> {
    let Some(config) = config else {
        return Ok(CompiledHooks {
            wire: None,
            tables: LocalHookTables::default(),
        });
    };

    let mut emit_events = config.emit_events;
    let mut wire_rules = Vec::new();
    let mut tables = LocalHookTables::default();

    for (index, rule) in config.rules.iter().enumerate() {
        let label = rule_label(rule, index);
        if rule.callback_count() > 1 {
            return Err(SandboxError::InvalidConfig(format!(
                "{label}: at most one callback per rule"
            )));
        }

        if let Some(hook) = &rule.event_hook {
            require_after_phase(rule, &label)?;
            require_allow_action(rule, &label)?;
            tables
                .event_hooks
                .push(local_hook(rule, &label, LocalCallback::Event(Arc::clone(hook)))?);
            emit_events = true;
        } else if let Some(hook) = &rule.dangerous_hook {
            require_after_phase(rule, &label)?;
            require_allow_action(rule, &label)?;
            tables.event_hooks.push(local_hook(
                rule,
                &label,
                LocalCallback::Dangerous(Arc::clone(hook)),
            )?);
            emit_events = true;
        } else if let Some(hook) = &rule.mutate_hook {
            require_before_or_unset_phase(rule, &label)?;
            require_allow_action(rule, &label)?;
            tables
                .mutate_hooks
                .push(local_hook(rule, &label, LocalCallback::Mutate(Arc::clone(hook)))?);
        } else if let Some(hook) = &rule.action_hook {
            require_before_or_unset_phase(rule, &label)?;
            require_allow_action(rule, &label)?;
            tables
                .action_hooks
                .push(local_hook(rule, &label, LocalCallback::Action(Arc::clone(hook)))?);
        } else {
            if rule.action == Some(HookAction::MutateWrite) {
                return Err(SandboxError::InvalidConfig(format!(
                    "{label}: action mutate_write requires a mutate callback"
                )));
            }
            // Covers exec_after: supervisor-defined, forwarded verbatim.
            wire_rules.push(rule.to_wire());
        }
    }

    let wire = if wire_rules.is_empty() && !emit_events {
        None
    } else {
        Some(WireInterception {
            emit_events,
            rules: wire_rules,
        })
    };

    Ok(CompiledHooks { wire, tables })
}

fn rule_label(rule: &VfsHookRule, index: usize) -> String {
    if rule.name.is_empty() {
        format!("rule[{index}]")
    } else {
        rule.name.clone()
    }
}

fn require_after_phase(rule: &VfsHookRule, label: &str) -> Result<(), SandboxError> {
    if rule.phase != Some(VfsHookPhase::After) {
        return Err(SandboxError::InvalidConfig(format!(
            "{label}: event callbacks require phase after"
        )));
    }
    Ok(())
}

fn require_before_or_unset_phase(rule: &VfsHookRule, label: &str) -> Result<(), SandboxError> {
    if rule.phase == Some(VfsHookPhase::After) {
        return Err(SandboxError::InvalidConfig(format!(
            "{label}: mutate/action callbacks require phase before"
        )));
    }
    Ok(())
}

fn require_allow_action(rule: &VfsHookRule, label: &str) -> Result<(), SandboxError> {
    match rule.action {
        None | Some(HookAction::Allow) => Ok(()),
        Some(other) => Err(SandboxError::InvalidConfig(format!(
            "{label}: callback rules only accept action allow, got {other:?}"
        ))),
    }
}

fn local_hook(
    rule: &VfsHookRule,
    label: &str,
    callback: LocalCallback,
) -> Result<LocalHook, SandboxError> {
    let matcher = if rule.path.is_empty() {
        None
    } else {
        let glob = Glob::new(&rule.path).map_err(|err| {
            SandboxError::InvalidConfig(format!("{label}: invalid path glob: {err}"))
        })?;
        Some(glob.compile_matcher())
    };

    Ok(LocalHook {
        name: label.to_owned(),
        ops: rule.ops.iter().copied().collect(),
        matcher,
        timeout: (rule.timeout_ms > 0).then(|| Duration::from_millis(rule.timeout_ms)),
        callback,
    })
}
