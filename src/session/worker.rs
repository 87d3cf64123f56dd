//! One assistant session per chat thread.
//!
//! A worker owns at most one claude subprocess at a time, frames prompts into
//! it, parses the stream-json output incrementally, and keeps the
//! continuation token that lets a fresh subprocess pick up the conversation,
//! including after a daemon restart, when the worker is rebuilt from
//! persisted state with no live child.

use super::{
    events::{parse_line, StreamEvent},
    invocation::TurnInvocation,
    progress::Coalescer,
    Control, ProgressFn, ReactionFn, Reply, ThreadAction,
};
use crate::{
    config::BotConfig,
    environment::{exec_prefix, EnvController, EnvStartReport, EnvironmentMode},
    error::{Error, Result},
    workspace::{Checkout, Workspace},
};
use chrono::{DateTime, TimeZone, Utc};
use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::{Mutex, RwLock},
};
use tracing::{debug, info, warn};

/// Reaction emitted when a turn starts being processed.
const REACTION_WORKING: &str = "👀";
/// Reaction emitted when the terminal result arrives.
const REACTION_DONE: &str = "🔚";

/// Marker the claude CLI uses for a usage-limit stop:
/// `Claude AI usage limit reached|<unix epoch seconds>`.
const USAGE_LIMIT_MARKER: &str = "Claude AI usage limit reached|";

/// What a completed turn hands back to the registry.
pub struct TurnOutcome {
    pub reply: Reply,
    /// When set, the registry should schedule an autonomous resume of this
    /// thread at the given instant (usage-limit stops).
    pub auto_resume_at: Option<DateTime<Utc>>,
}

pub struct Worker {
    thread_id: String,
    /// Friendly display name, shown in greetings and logs.
    name: String,
    config: Arc<BotConfig>,
    data_dir: PathBuf,
    workspace: Arc<dyn Workspace>,
    invocation: TurnInvocation,
    repo: RwLock<Option<Checkout>>,
    continuation: RwLock<Option<String>>,
    env_mode: RwLock<EnvironmentMode>,
    /// Set once the first message has been routed; repository binding is
    /// idempotent only before this point.
    routed: AtomicBool,
    /// Set by abort() before killing the child so the event loop does not
    /// report an intentional kill as a crash.
    cancelled: AtomicBool,
    /// The in-flight subprocess, if any. Shared between send_message (which
    /// stores and waits) and abort() (which kills).
    current_child: Mutex<Option<Child>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("thread_id", &self.thread_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        thread_id: impl Into<String>,
        config: Arc<BotConfig>,
        data_dir: impl Into<PathBuf>,
        workspace: Arc<dyn Workspace>,
    ) -> Arc<Self> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Arc::new(Self {
            thread_id: thread_id.into(),
            name: format!("worker-{}", &suffix[..8]),
            invocation: TurnInvocation::new(&config.claude),
            config,
            data_dir: data_dir.into(),
            workspace,
            repo: RwLock::new(None),
            continuation: RwLock::new(None),
            env_mode: RwLock::new(EnvironmentMode::Host),
            routed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            current_child: Mutex::new(None),
        })
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn continuation_token(&self) -> Option<String> {
        self.continuation.read().await.clone()
    }

    pub async fn environment_mode(&self) -> EnvironmentMode {
        *self.env_mode.read().await
    }

    pub async fn repository(&self) -> Option<Checkout> {
        self.repo.read().await.clone()
    }

    // ─── Binding & restore ───────────────────────────────────────────────────

    /// Bind this session to a repository working copy. Idempotent before the
    /// first routed message; rejected afterwards.
    pub async fn bind_repository(&self, checkout: Checkout) -> Result<()> {
        if self.routed.load(Ordering::Acquire) {
            return Err(Error::AlreadyBound(self.thread_id.clone()));
        }
        *self.repo.write().await = Some(checkout);
        Ok(())
    }

    /// Rehydrate a worker from persisted thread state. No subprocess is
    /// spawned; the next turn starts one with `--continue`.
    pub async fn restore(
        &self,
        checkout: Checkout,
        continuation: Option<String>,
        mode: EnvironmentMode,
    ) {
        *self.repo.write().await = Some(checkout);
        *self.continuation.write().await = continuation;
        *self.env_mode.write().await = mode;
        // A restored session has history: rebinding is no longer allowed.
        self.routed.store(true, Ordering::Release);
    }

    /// Environment-mode intent for the next spawn. Does not touch an
    /// in-flight subprocess.
    pub async fn set_use_devcontainer(&self, on: bool) {
        *self.env_mode.write().await = if on {
            EnvironmentMode::Container
        } else {
            EnvironmentMode::Host
        };
    }

    // ─── Environment startup ─────────────────────────────────────────────────

    /// Provision a container environment for this session. On success the
    /// session's mode switches to `mode`; on failure it stays on the host
    /// and the report carries a human-readable summary. Never errors;
    /// environment failures are recoverable.
    pub async fn start_environment(
        &self,
        mode: EnvironmentMode,
        progress: &ProgressFn,
    ) -> EnvStartReport {
        let Some(checkout) = self.repo.read().await.clone() else {
            return EnvStartReport {
                success: false,
                message: "no repository bound to this thread yet".to_string(),
            };
        };
        let pat = match self
            .workspace
            .repository_pat(&checkout.spec.full_name())
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "PAT lookup failed; provisioning without token");
                None
            }
        };
        let controller = EnvController::new(
            self.config.environment.clone(),
            checkout.path.clone(),
            self.data_dir.clone(),
            pat,
            Duration::from_millis(self.config.progress.update_interval_ms),
        );
        let report = controller.start(mode, progress.as_ref()).await;
        let mut env = self.env_mode.write().await;
        *env = if report.success {
            mode
        } else {
            EnvironmentMode::Host
        };
        report
    }

    // ─── Turns ───────────────────────────────────────────────────────────────

    /// Run one serialized turn. The registry guarantees no other turn is in
    /// flight for this thread before calling.
    pub async fn send_message(
        &self,
        text: &str,
        progress: &ProgressFn,
        reaction: &ReactionFn,
    ) -> Result<TurnOutcome> {
        let checkout = self
            .repo
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Configuration("no repository bound to this thread".into()))?;
        self.routed.store(true, Ordering::Release);
        self.cancelled.store(false, Ordering::Release);

        reaction.as_ref()(REACTION_WORKING);

        let continuation = self.continuation.read().await.clone();
        let args = self.invocation.build(text, continuation.as_deref());
        let mode = *self.env_mode.read().await;

        let mut cmd = match exec_prefix(mode, &self.config.environment, &checkout.path, &self.data_dir)
        {
            Some(prefix) => {
                let mut c = Command::new(&prefix[0]);
                c.args(&prefix[1..]).arg(&self.config.claude.bin);
                c
            }
            None => Command::new(&self.config.claude.bin),
        };
        cmd.args(&args)
            .current_dir(&checkout.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(worker = %self.name, thread = %self.thread_id, mode = %mode, "spawning claude");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Subprocess(format!("failed to spawn {}: {e}", self.config.claude.bin)))?;

        // Drain stderr so the child cannot block on a full pipe; keep the
        // output at debug level for operators.
        if let Some(stderr) = child.stderr.take() {
            let worker = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "claude_stderr", worker = %worker, "{line}");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Subprocess("no stdout handle".into()))?;
        *self.current_child.lock().await = Some(child);

        let loop_result = self.event_loop(stdout, progress, reaction).await;

        // Reap whatever is left of the child, whether the loop succeeded,
        // failed, or was aborted.
        let status = match self.current_child.lock().await.take() {
            Some(mut child) => child.wait().await.ok(),
            None => None,
        };

        if self.cancelled.load(Ordering::Acquire) {
            return Err(Error::Subprocess("turn aborted".into()));
        }

        let terminal = loop_result?;
        let Some(terminal) = terminal else {
            let detail = match status {
                Some(s) if !s.success() => format!("exited with {s} before a terminal result"),
                _ => "stream closed before a terminal result".to_string(),
            };
            return Err(Error::Subprocess(detail));
        };

        if let Some(s) = status {
            if !s.success() {
                // A terminal result followed by a non-zero exit still counts
                // as a failed turn; the token must not advance.
                return Err(Error::Subprocess(format!("exited with {s} after result")));
            }
        }

        // Confirmed terminal event: only now does the continuation advance.
        if let Some(token) = &terminal.token {
            *self.continuation.write().await = Some(token.clone());
        }
        info!(worker = %self.name, thread = %self.thread_id, "turn complete");

        Ok(self.outcome_from_terminal(terminal))
    }

    /// Read stream-json records until the terminal result or stream end.
    /// Returns Ok(None) when the stream closed without a terminal record.
    async fn event_loop(
        &self,
        stdout: tokio::process::ChildStdout,
        progress: &ProgressFn,
        reaction: &ReactionFn,
    ) -> Result<Option<Terminal>> {
        let progress = progress.as_ref();
        let reaction = reaction.as_ref();
        let mut lines = BufReader::new(stdout).lines();
        let mut coalescer = Coalescer::new(Duration::from_millis(
            self.config.progress.update_interval_ms,
        ));
        let mut init_session_id: Option<String> = None;

        while let Some(line) = lines.next_line().await? {
            if self.cancelled.load(Ordering::Acquire) {
                coalescer.discard();
                return Ok(None);
            }
            let Some(event) = parse_line(&line) else {
                continue;
            };
            match event {
                StreamEvent::System { session_id, .. } => {
                    if let Some(sid) = session_id {
                        init_session_id = Some(sid);
                    }
                }
                StreamEvent::Assistant { message } => {
                    for tool in message.tool_names() {
                        if let Some(batch) = coalescer.push(Instant::now(), &format!("🔧 {tool}")) {
                            progress(batch);
                        }
                    }
                    let text = message.text();
                    if !text.is_empty() {
                        if let Some(batch) = coalescer.push(Instant::now(), &text) {
                            progress(batch);
                        }
                    }
                }
                StreamEvent::Result {
                    result,
                    session_id,
                    is_error,
                    ..
                } => {
                    // The final batch is flushed unconditionally: the last
                    // event of a turn is never rate-limited away.
                    if let Some(batch) = coalescer.flush() {
                        progress(batch);
                    }
                    reaction(REACTION_DONE);
                    return Ok(Some(Terminal {
                        text: result.unwrap_or_default(),
                        token: session_id.or(init_session_id),
                        is_error: is_error.unwrap_or(false),
                    }));
                }
                StreamEvent::User { .. } | StreamEvent::Unknown => {}
            }
        }
        coalescer.discard();
        Ok(None)
    }

    fn outcome_from_terminal(&self, terminal: Terminal) -> TurnOutcome {
        if let Some(resume_at) = parse_usage_limit(&terminal.text) {
            let reply = Reply::text(format!(
                "Claude usage limit reached. This thread will automatically resume at {}.",
                resume_at.to_rfc3339()
            ));
            return TurnOutcome {
                reply,
                auto_resume_at: Some(resume_at),
            };
        }
        let content = if terminal.is_error && terminal.text.is_empty() {
            "the assistant reported an error with no details".to_string()
        } else {
            terminal.text
        };
        // Completed replies carry the terminate button so a thread can be
        // closed without scrolling back to the greeting.
        let reply = Reply::with_controls(
            content,
            vec![Control {
                id: ThreadAction::Terminate.custom_id(&self.thread_id),
                label: "End thread".to_string(),
            }],
        );
        TurnOutcome {
            reply,
            auto_resume_at: None,
        }
    }

    // ─── Abort ───────────────────────────────────────────────────────────────

    /// Forcibly stop any in-flight subprocess. Safe to call when idle. Sets
    /// the cancelled flag first so the event loop unwinds without reporting
    /// a crash; never touches the registry's locks, so terminate cannot
    /// deadlock a thread.
    pub async fn abort(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(mut child) = self.current_child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
            info!(worker = %self.name, thread = %self.thread_id, "in-flight subprocess killed");
        }
    }
}

struct Terminal {
    text: String,
    token: Option<String>,
    is_error: bool,
}

/// Detect the usage-limit terminal form and convert its epoch to a UTC
/// instant. Anything malformed is treated as a normal result.
fn parse_usage_limit(text: &str) -> Option<DateTime<Utc>> {
    let rest = text.strip_prefix(USAGE_LIMIT_MARKER)?;
    let epoch: i64 = rest.trim().parse().ok()?;
    Utc.timestamp_opt(epoch, 0).single()
}

// ─── Tests ────────────────────────────────────────────────────────────────────
