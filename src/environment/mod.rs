//! Execution-environment negotiation for a session's subprocess.
//!
//! A session runs claude either on the host, inside the repository's own
//! devcontainer, or inside a generic fallback devcontainer when the
//! repository has none (or its config is broken). The controller drives one
//! `devcontainer up` attempt, streaming build output through the caller's
//! progress callback with bounded memory. A failed primary attempt is
//! reported, never retried automatically; switching to the fallback is the
//! caller's decision.

pub mod log_window;

use crate::config::EnvironmentConfig;
use log_window::LogWindow;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc,
};
use tracing::{debug, info, warn};

/// Milestone substrings that force an immediate progress flush so the user
/// sees pulls/builds/errors promptly while routine chatter stays batched.
const SIGNIFICANT_PATTERNS: &[&str] = &[
    "pulling",
    "downloading",
    "extracting",
    "building",
    "creating",
    "starting",
    "waiting",
    "complete",
    "success",
    "error",
    "failed",
];

/// Minimum gap between two significant-line flushes.
const SIGNIFICANT_FLUSH_GAP: Duration = Duration::from_millis(500);

const FALLBACK_CONFIG_FILE: &str = "fallback-devcontainer.json";
const FALLBACK_IMAGE: &str = "mcr.microsoft.com/devcontainers/universal:2";

// ─── Environment mode ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentMode {
    Host,
    Container,
    FallbackContainer,
}

impl EnvironmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Container => "container",
            Self::FallbackContainer => "fallback_container",
        }
    }

    /// Inverse of [`as_str`]; unknown values from old databases fall back to
    /// host execution, which is always available.
    pub fn parse(s: &str) -> Self {
        match s {
            "container" => Self::Container,
            "fallback_container" => Self::FallbackContainer,
            _ => Self::Host,
        }
    }

    pub fn is_container(&self) -> bool {
        !matches!(self, Self::Host)
    }
}

impl std::fmt::Display for EnvironmentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one provisioning attempt. Environment failures are recoverable,
/// so this is a report, not an error.
#[derive(Debug, Clone)]
pub struct EnvStartReport {
    pub success: bool,
    pub message: String,
}

// ─── Controller ───────────────────────────────────────────────────────────────

/// Transient delegate for a single `devcontainer up` attempt. Created per
/// call, discarded when the attempt resolves.
pub struct EnvController {
    cfg: EnvironmentConfig,
    repo_path: PathBuf,
    data_dir: PathBuf,
    /// Repository PAT, injected into the provisioning tool's environment as
    /// GITHUB_TOKEN. Never logged, never echoed through the progress stream.
    pat: Option<String>,
    update_interval: Duration,
}

impl EnvController {
    pub fn new(
        cfg: EnvironmentConfig,
        repo_path: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        pat: Option<String>,
        update_interval: Duration,
    ) -> Self {
        Self {
            cfg,
            repo_path: repo_path.into(),
            data_dir: data_dir.into(),
            pat,
            update_interval,
        }
    }

    /// Run one provisioning attempt for `mode`, streaming log excerpts
    /// through `progress`. Never returns an error: spawn failures and
    /// non-zero exits both become a failure report whose message carries the
    /// last log excerpt.
    ///
    /// The child is spawned without kill-on-drop: a caller that stops
    /// waiting leaves the provisioning process running where the container
    /// tooling can query or clean it up later.
    pub async fn start(
        &self,
        mode: EnvironmentMode,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> EnvStartReport {
        debug_assert!(mode.is_container());

        let mut cmd = Command::new(&self.cfg.bin);
        cmd.arg("up")
            .arg("--workspace-folder")
            .arg(&self.repo_path);
        if mode == EnvironmentMode::FallbackContainer {
            match self.ensure_fallback_config().await {
                Ok(path) => {
                    cmd.arg("--config").arg(path);
                }
                Err(e) => {
                    return EnvStartReport {
                        success: false,
                        message: format!("could not write fallback config: {e}"),
                    }
                }
            }
        }
        if let Some(pat) = &self.pat {
            cmd.env("GITHUB_TOKEN", pat);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(mode = %mode, repo = %self.repo_path.display(), "starting devcontainer");

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, bin = %self.cfg.bin, "devcontainer CLI unavailable");
                return EnvStartReport {
                    success: false,
                    message: format!("could not launch {}: {e}", self.cfg.bin),
                };
            }
        };

        // Merge stdout and stderr into one ordered line stream.
        let (tx, mut rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }

        let mut window = LogWindow::new(self.cfg.log_window_lines);
        let mut last_flush: Option<Instant> = None;
        while let Some(line) = rx.recv().await {
            debug!(target: "devcontainer", "{line}");
            window.push(&line);
            let now = Instant::now();
            let elapsed_ok = |gap: Duration| match last_flush {
                None => true,
                Some(prev) => now.duration_since(prev) >= gap,
            };
            let flush = if is_significant(&line) {
                elapsed_ok(SIGNIFICANT_FLUSH_GAP)
            } else {
                elapsed_ok(self.update_interval)
            };
            if flush && !window.is_empty() {
                last_flush = Some(now);
                progress(window.render());
            }
        }

        let status = match child.wait().await {
            Ok(s) => s,
            Err(e) => {
                return EnvStartReport {
                    success: false,
                    message: format!("could not reap devcontainer process: {e}"),
                }
            }
        };

        if !window.is_empty() {
            progress(window.render());
        }

        if status.success() {
            info!(mode = %mode, "devcontainer ready");
            EnvStartReport {
                success: true,
                message: format!("{mode} environment is ready"),
            }
        } else {
            warn!(mode = %mode, status = %status, "devcontainer start failed");
            let excerpt = window.tail(10);
            EnvStartReport {
                success: false,
                message: if excerpt.is_empty() {
                    format!("devcontainer exited with {status}")
                } else {
                    format!("devcontainer exited with {status}:\n{excerpt}")
                },
            }
        }
    }

    /// Write the pinned-image fallback devcontainer config on first use.
    async fn ensure_fallback_config(&self) -> std::io::Result<PathBuf> {
        let path = self.data_dir.join(FALLBACK_CONFIG_FILE);
        if !path.exists() {
            tokio::fs::create_dir_all(&self.data_dir).await?;
            let config = serde_json::json!({
                "name": "botd-fallback",
                "image": FALLBACK_IMAGE,
            });
            tokio::fs::write(&path, serde_json::to_vec_pretty(&config)?).await?;
        }
        Ok(path)
    }
}

/// Program-plus-args prefix that wraps a claude invocation so it executes
/// inside the already-provisioned container for `mode`. Host mode needs no
/// prefix.
pub fn exec_prefix(
    mode: EnvironmentMode,
    cfg: &EnvironmentConfig,
    repo_path: &Path,
    data_dir: &Path,
) -> Option<Vec<String>> {
    if !mode.is_container() {
        return None;
    }
    let mut prefix = vec![
        cfg.bin.clone(),
        "exec".to_string(),
        "--workspace-folder".to_string(),
        repo_path.display().to_string(),
    ];
    if mode == EnvironmentMode::FallbackContainer {
        prefix.push("--config".to_string());
        prefix.push(data_dir.join(FALLBACK_CONFIG_FILE).display().to_string());
    }
    Some(prefix)
}

fn is_significant(line: &str) -> bool {
    let lower = line.to_lowercase();
    SIGNIFICANT_PATTERNS.iter().any(|p| lower.contains(p))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
