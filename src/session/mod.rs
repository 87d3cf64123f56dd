//! Session orchestration: the thread → worker map and everything that flows
//! through it.
//!
//! The registry is the only writer of the thread map and the only component
//! that talks to persistence. It enforces the two structural invariants: at
//! most one session per thread (map key), and at most one in-flight turn per
//! session (per-thread turn mutex, acquired with `try_lock` so a concurrent
//! message is rejected rather than interleaved into the same stdin).

pub mod events;
pub mod invocation;
pub mod progress;
pub mod worker;

use crate::{
    config::BotConfig,
    environment::{EnvStartReport, EnvironmentMode},
    error::{Error, Result},
    storage::Storage,
    workspace::{checkout_at, Checkout, RepoSpec, Workspace},
};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use worker::Worker;

// ─── Chat-facing types ────────────────────────────────────────────────────────

/// Progress side effect: incremental text the adapter renders into the thread.
pub type ProgressFn = Arc<dyn Fn(String) + Send + Sync>;
/// Reaction side effect: an emoji the adapter attaches to the user's message.
pub type ReactionFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Correlation metadata for an inbound message: the chat platform's message
/// and author ids, when the adapter has them. Used for log correlation; the
/// engine never interprets them.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    pub message_id: Option<String>,
    pub author_id: Option<String>,
}

/// An interactive control rendered under a reply (a button).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub id: String,
    pub label: String,
}

/// Final reply for one inbound event: text, optionally with controls.
#[derive(Debug, Clone)]
pub struct Reply {
    pub content: String,
    pub controls: Vec<Control>,
}

impl Reply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            controls: Vec::new(),
        }
    }

    pub fn with_controls(content: impl Into<String>, controls: Vec<Control>) -> Self {
        Self {
            content: content.into(),
            controls,
        }
    }
}

// ─── Boundary parsing ─────────────────────────────────────────────────────────

/// Button action ids, parsed at the boundary into a closed set. The id format
/// is `<verb>_<threadId>` so a stale button from another thread cannot act on
/// this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAction {
    StartEnvironment,
    StartFallbackEnvironment,
    KeepHost,
    Terminate,
}

impl ThreadAction {
    pub fn custom_id(&self, thread_id: &str) -> String {
        format!("{}_{thread_id}", self.verb())
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::StartEnvironment => "devcontainer_start",
            Self::StartFallbackEnvironment => "devcontainer_fallback",
            Self::KeepHost => "devcontainer_skip",
            Self::Terminate => "terminate",
        }
    }

    /// Parse `<verb>_<threadId>`; returns the action and the embedded thread
    /// id so the caller can check it against the event's thread.
    pub fn parse(custom_id: &str) -> Option<(Self, &str)> {
        for action in [
            Self::StartEnvironment,
            Self::StartFallbackEnvironment,
            Self::KeepHost,
            Self::Terminate,
        ] {
            let prefix = action.verb();
            if let Some(rest) = custom_id.strip_prefix(prefix) {
                if let Some(thread) = rest.strip_prefix('_') {
                    if !thread.is_empty() {
                        return Some((action, thread));
                    }
                }
            }
        }
        None
    }
}

/// In-thread configuration directives (`/config devcontainer on|off`),
/// parsed before a message is treated as a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDirective {
    Devcontainer(bool),
}

impl ConfigDirective {
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split_whitespace();
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("/config"), Some("devcontainer"), Some("on"), None) => {
                Some(Self::Devcontainer(true))
            }
            (Some("/config"), Some("devcontainer"), Some("off"), None) => {
                Some(Self::Devcontainer(false))
            }
            _ => None,
        }
    }
}

/// What a button press resolves to. `StartEnvironment` is a directive back to
/// the adapter: it sets up a progress surface, then calls
/// [`SessionRegistry::start_environment`].
#[derive(Debug)]
pub enum ActionOutcome {
    Reply(Reply),
    StartEnvironment(EnvironmentMode),
    ThreadClosed(Reply),
}

// ─── Hooks ────────────────────────────────────────────────────────────────────

/// Callbacks into the chat adapter, injected once at construction. The
/// registry never talks to the chat platform directly.
#[derive(Clone, Default)]
pub struct RegistryHooks {
    /// Invoked when the registry decides to resume a stalled turn on its own
    /// (thread id, message to route).
    pub on_auto_resume: Option<Arc<dyn Fn(String, String) + Send + Sync>>,
    /// Invoked after a terminate action so the adapter can archive the thread.
    pub on_thread_close: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

// ─── Registry ─────────────────────────────────────────────────────────────────

struct SessionHandle {
    worker: Arc<Worker>,
    /// Serializes turns for one thread. Guarded separately from the map lock
    /// so a slow subprocess never blocks unrelated threads.
    turn_lock: Mutex<()>,
}

pub struct SessionRegistry {
    config: Arc<BotConfig>,
    data_dir: PathBuf,
    storage: Storage,
    workspace: Arc<dyn Workspace>,
    hooks: RegistryHooks,
    handles: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<BotConfig>,
        data_dir: impl Into<PathBuf>,
        storage: Storage,
        workspace: Arc<dyn Workspace>,
        hooks: RegistryHooks,
    ) -> Self {
        Self {
            config,
            data_dir: data_dir.into(),
            storage,
            workspace,
            hooks,
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.handles.read().await.len()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Create a session for a thread. At most one session per thread: a
    /// second create is rejected and the existing session is untouched.
    pub async fn create_session(&self, thread_id: &str) -> Result<Arc<Worker>> {
        let mut handles = self.handles.write().await;
        if handles.contains_key(thread_id) {
            return Err(Error::DuplicateSession(thread_id.to_string()));
        }
        let worker = Worker::new(
            thread_id,
            self.config.clone(),
            self.data_dir.clone(),
            self.workspace.clone(),
        );
        handles.insert(
            thread_id.to_string(),
            Arc::new(SessionHandle {
                worker: worker.clone(),
                turn_lock: Mutex::new(()),
            }),
        );
        info!(thread = %thread_id, worker = %worker.name(), "session created");
        Ok(worker)
    }

    pub async fn get_session(&self, thread_id: &str) -> Option<Arc<Worker>> {
        self.handles
            .read()
            .await
            .get(thread_id)
            .map(|h| h.worker.clone())
    }

    /// Rebuild the thread map from persisted state at startup. Sessions come
    /// back without a live subprocess; the next turn respawns one with the
    /// stored continuation token.
    pub async fn restore_active_sessions(&self) -> Result<usize> {
        let rows = self.storage.load_thread_states().await?;
        let mut restored = 0;
        for row in rows {
            let spec = match RepoSpec::parse(&row.repo_full_name) {
                Ok(s) => s,
                Err(e) => {
                    warn!(thread = %row.thread_id, error = %e, "skipping unrestorable thread");
                    continue;
                }
            };
            let worker = match self.create_session(&row.thread_id).await {
                Ok(w) => w,
                Err(e) => {
                    warn!(thread = %row.thread_id, error = %e, "skipping duplicate persisted thread");
                    continue;
                }
            };
            worker
                .restore(
                    checkout_at(&row.repo_path, spec),
                    row.continuation_token.clone(),
                    EnvironmentMode::parse(&row.environment_mode),
                )
                .await;
            restored += 1;
        }
        info!(count = restored, "restored active sessions");
        Ok(restored)
    }

    /// Bind a freshly created session to its repository and persist the
    /// initial thread state so a restart before the first turn still
    /// restores it.
    pub async fn bind_repository(&self, thread_id: &str, checkout: Checkout) -> Result<()> {
        let worker = self
            .get_session(thread_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(thread_id.to_string()))?;
        worker.bind_repository(checkout).await?;
        self.persist(&worker).await?;
        Ok(())
    }

    // ─── Message routing ─────────────────────────────────────────────────────

    /// Route one inbound message to its session. Turns within a thread are
    /// strictly serialized; a message arriving while another is in flight is
    /// rejected with a busy error, never queued into the same stdin.
    pub async fn route_message(
        &self,
        thread_id: &str,
        text: &str,
        meta: MessageMeta,
        progress: ProgressFn,
        reaction: ReactionFn,
    ) -> Result<Reply> {
        debug!(
            thread = %thread_id,
            message = ?meta.message_id,
            author = ?meta.author_id,
            "routing inbound message"
        );

        // Directives are dispatched here and never reach the subprocess.
        if let Some(directive) = ConfigDirective::parse(text) {
            return self.apply_directive(thread_id, directive).await;
        }

        let handle = self
            .handles
            .read()
            .await
            .get(thread_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(thread_id.to_string()))?;

        let _turn = handle
            .turn_lock
            .try_lock()
            .map_err(|_| Error::Busy(thread_id.to_string()))?;

        let outcome = handle.worker.send_message(text, &progress, &reaction).await?;

        // Only a confirmed terminal event reaches this point; persist the
        // advanced continuation token.
        self.persist(&handle.worker).await?;

        if let Some(at) = outcome.auto_resume_at {
            self.schedule_auto_resume(thread_id, at);
        }
        Ok(outcome.reply)
    }

    async fn apply_directive(&self, thread_id: &str, directive: ConfigDirective) -> Result<Reply> {
        let worker = self
            .get_session(thread_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(thread_id.to_string()))?;
        match directive {
            ConfigDirective::Devcontainer(on) => {
                worker.set_use_devcontainer(on).await;
                self.persist(&worker).await?;
                Ok(Reply::text(if on {
                    "next turns will run inside the devcontainer"
                } else {
                    "next turns will run on the host"
                }))
            }
        }
    }

    // ─── Buttons ─────────────────────────────────────────────────────────────

    /// Resolve a button press. The custom id is parsed into the closed
    /// [`ThreadAction`] set; an id whose embedded thread does not match the
    /// event's thread is rejected.
    pub async fn handle_action(&self, thread_id: &str, custom_id: &str) -> Result<ActionOutcome> {
        let Some((action, embedded)) = ThreadAction::parse(custom_id) else {
            return Err(Error::Configuration(format!(
                "unrecognized action id {custom_id:?}"
            )));
        };
        if embedded != thread_id {
            return Err(Error::Configuration(format!(
                "action id {custom_id:?} does not belong to thread {thread_id}"
            )));
        }
        match action {
            ThreadAction::StartEnvironment => {
                Ok(ActionOutcome::StartEnvironment(EnvironmentMode::Container))
            }
            ThreadAction::StartFallbackEnvironment => Ok(ActionOutcome::StartEnvironment(
                EnvironmentMode::FallbackContainer,
            )),
            ThreadAction::KeepHost => {
                let reply = self
                    .apply_directive(thread_id, ConfigDirective::Devcontainer(false))
                    .await?;
                Ok(ActionOutcome::Reply(reply))
            }
            ThreadAction::Terminate => {
                let reply = self.terminate(thread_id).await?;
                Ok(ActionOutcome::ThreadClosed(reply))
            }
        }
    }

    /// Provision a container for a thread's session, streaming progress to
    /// the caller. Persists the resulting mode either way (failure leaves
    /// the session on the host, which is also worth remembering).
    pub async fn start_environment(
        &self,
        thread_id: &str,
        mode: EnvironmentMode,
        progress: ProgressFn,
    ) -> Result<EnvStartReport> {
        let worker = self
            .get_session(thread_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(thread_id.to_string()))?;
        let report = worker.start_environment(mode, &progress).await;
        self.persist(&worker).await?;
        Ok(report)
    }

    /// Tear down a session: kill any in-flight subprocess, drop it from the
    /// map, delete persisted state, and tell the adapter to archive the
    /// thread. The turn lock is deliberately not taken: the kill unblocks
    /// the in-flight turn, which then finds its lock released normally.
    async fn terminate(&self, thread_id: &str) -> Result<Reply> {
        let handle = self
            .handles
            .write()
            .await
            .remove(thread_id)
            .ok_or_else(|| Error::SessionNotFound(thread_id.to_string()))?;
        handle.worker.abort().await;
        self.storage.delete_thread_state(thread_id).await?;
        if let Some(hook) = &self.hooks.on_thread_close {
            hook.as_ref()(thread_id.to_string());
        }
        info!(thread = %thread_id, "session terminated");
        Ok(Reply::text("this thread has been closed"))
    }

    // ─── Replies with controls ───────────────────────────────────────────────

    /// Greeting posted when a thread is opened, with the environment choice
    /// and terminate buttons.
    pub async fn initial_reply(&self, thread_id: &str, repo_full_name: &str) -> Result<Reply> {
        let worker = self
            .get_session(thread_id)
            .await
            .ok_or_else(|| Error::SessionNotFound(thread_id.to_string()))?;
        let content = format!(
            "Hi, I'm {}. Ask me anything about {repo_full_name}.\n\
             Choose where I should run:",
            worker.name()
        );
        Ok(Reply::with_controls(
            content,
            vec![
                Control {
                    id: ThreadAction::StartEnvironment.custom_id(thread_id),
                    label: "Start devcontainer".to_string(),
                },
                Control {
                    id: ThreadAction::StartFallbackEnvironment.custom_id(thread_id),
                    label: "Start fallback devcontainer".to_string(),
                },
                Control {
                    id: ThreadAction::KeepHost.custom_id(thread_id),
                    label: "Run on host".to_string(),
                },
                Control {
                    id: ThreadAction::Terminate.custom_id(thread_id),
                    label: "End thread".to_string(),
                },
            ],
        ))
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    async fn persist(&self, worker: &Worker) -> Result<()> {
        let Some(checkout) = worker.repository().await else {
            return Ok(());
        };
        let token = worker.continuation_token().await;
        let mode = worker.environment_mode().await;
        self.storage
            .upsert_thread_state(
                worker.thread_id(),
                &checkout.spec.full_name(),
                &checkout.path.display().to_string(),
                token.as_deref(),
                mode.as_str(),
            )
            .await
    }

    fn schedule_auto_resume(&self, thread_id: &str, at: chrono::DateTime<chrono::Utc>) {
        let Some(hook) = self.hooks.on_auto_resume.clone() else {
            return;
        };
        let thread_id = thread_id.to_string();
        let wait = (at - chrono::Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        info!(thread = %thread_id, at = %at, "auto-resume scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            hook.as_ref()(thread_id, "continue".to_string());
        });
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_ids_round_trip() {
        for action in [
            ThreadAction::StartEnvironment,
            ThreadAction::StartFallbackEnvironment,
            ThreadAction::KeepHost,
            ThreadAction::Terminate,
        ] {
            let id = action.custom_id("thread-9");
            let (parsed, thread) = ThreadAction::parse(&id).unwrap();
            assert_eq!(parsed, action);
            assert_eq!(thread, "thread-9");
        }
    }

    #[test]
    fn foreign_and_malformed_action_ids_rejected() {
        assert!(ThreadAction::parse("terminate_").is_none());
        assert!(ThreadAction::parse("terminate").is_none());
        assert!(ThreadAction::parse("selfdestruct_t1").is_none());
        assert!(ThreadAction::parse("").is_none());
    }

    #[test]
    fn config_directive_parsing() {
        assert_eq!(
            ConfigDirective::parse("/config devcontainer on"),
            Some(ConfigDirective::Devcontainer(true))
        );
        assert_eq!(
            ConfigDirective::parse("  /config devcontainer off  "),
            Some(ConfigDirective::Devcontainer(false))
        );
        assert_eq!(ConfigDirective::parse("/config devcontainer maybe"), None);
        assert_eq!(ConfigDirective::parse("/config devcontainer on please"), None);
        assert_eq!(ConfigDirective::parse("hello"), None);
    }
}
