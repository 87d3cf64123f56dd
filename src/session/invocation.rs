//! Builds the claude CLI argument list for one turn.
//!
//! Pure translation of settings into arguments. Deterministic, no I/O.

use crate::config::ClaudeConfig;

/// Session Configuration Builder.
///
/// stream-json output requires `--verbose` on the claude side regardless of
/// the daemon's own log verbosity, so both flags are always present. A
/// continuation token selects `--continue` rather than resume-by-id: there is
/// exactly one active subprocess per thread, so "continue most recent" is
/// unambiguous and survives daemon restarts without tracking claude's ids.
#[derive(Debug, Clone)]
pub struct TurnInvocation {
    dangerously_skip_permissions: bool,
    append_system_prompt: Option<String>,
}

impl TurnInvocation {
    pub fn new(cfg: &ClaudeConfig) -> Self {
        Self {
            dangerously_skip_permissions: cfg.dangerously_skip_permissions,
            append_system_prompt: cfg.append_system_prompt.clone(),
        }
    }

    pub fn build(&self, prompt: &str, continuation: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if continuation.is_some() {
            args.push("--continue".to_string());
        }

        if self.dangerously_skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }

        if let Some(suffix) = &self.append_system_prompt {
            args.push(format!("--append-system-prompt={suffix}"));
        }

        args
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
