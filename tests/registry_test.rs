//! End-to-end registry tests against a stub `claude` executable.
//! No real claude CLI is needed; these run in CI (unix only, the stubs are
//! shell scripts).
#![cfg(unix)]

use botd::{
    config::BotConfig,
    error::Error,
    session::{
        ActionOutcome, MessageMeta, ProgressFn, ReactionFn, RegistryHooks, SessionRegistry,
        ThreadAction,
    },
    storage::Storage,
    workspace::{checkout_at, LocalWorkspace, RepoSpec},
    EnvironmentMode,
};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tempfile::TempDir;

fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn make_registry(
    dir: &TempDir,
    claude_body: &str,
    hooks: RegistryHooks,
) -> (Arc<SessionRegistry>, Storage) {
    let data_dir = dir.path().join("data");
    let claude = write_stub(dir.path(), "claude", claude_body);
    let mut config = BotConfig::default();
    config.claude.bin = claude.display().to_string();
    config.progress.update_interval_ms = 10;
    let storage = Storage::new(&data_dir).await.unwrap();
    let workspace = Arc::new(LocalWorkspace::new(dir.path().join("repos"), storage.clone()));
    let registry = Arc::new(SessionRegistry::new(
        Arc::new(config),
        data_dir,
        storage.clone(),
        workspace,
        hooks,
    ));
    (registry, storage)
}

fn repo_checkout(dir: &TempDir) -> botd::workspace::Checkout {
    let path = dir.path().join("workdir");
    std::fs::create_dir_all(&path).unwrap();
    checkout_at(path, RepoSpec::parse("acme/app").unwrap())
}

fn collecting_progress() -> (ProgressFn, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let f: ProgressFn = Arc::new(move |text| sink.lock().unwrap().push(text));
    (f, seen)
}

fn collecting_reactions() -> (ReactionFn, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let f: ReactionFn = Arc::new(move |emoji: &str| sink.lock().unwrap().push(emoji.to_string()));
    (f, seen)
}

const HAPPY_TURN: &str = r#"printf '%s\n' '{"type":"system","subtype":"init","session_id":"init-1"}'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
printf '%s\n' '{"type":"result","subtype":"success","result":"done","session_id":"s1","is_error":false}'"#;

#[tokio::test]
async fn end_to_end_turn_yields_reply_and_token() {
    let dir = TempDir::new().unwrap();
    let (registry, _storage) = make_registry(&dir, HAPPY_TURN, RegistryHooks::default()).await;

    let worker = registry.create_session("t1").await.unwrap();
    registry
        .bind_repository("t1", repo_checkout(&dir))
        .await
        .unwrap();

    let (progress, progress_seen) = collecting_progress();
    let (reaction, reactions_seen) = collecting_reactions();
    let meta = MessageMeta {
        message_id: Some("m-42".into()),
        author_id: Some("u-7".into()),
    };
    let reply = registry
        .route_message("t1", "hello", meta, progress, reaction)
        .await
        .unwrap();

    assert_eq!(reply.content, "done");
    assert!(reply
        .controls
        .iter()
        .any(|c| c.id == ThreadAction::Terminate.custom_id("t1")));
    assert_eq!(worker.continuation_token().await.as_deref(), Some("s1"));
    let progress_seen = progress_seen.lock().unwrap();
    assert!(progress_seen.iter().any(|p| p.contains("hi")));
    let reactions = reactions_seen.lock().unwrap();
    assert_eq!(reactions.as_slice(), ["👀", "🔚"]);
}

#[tokio::test]
async fn route_before_create_is_rejected_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let (registry, _storage) = make_registry(&dir, HAPPY_TURN, RegistryHooks::default()).await;

    let (progress, _) = collecting_progress();
    let (reaction, _) = collecting_reactions();
    let err = registry
        .route_message("ghost", "hello", MessageMeta::default(), progress, reaction)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
    assert_eq!(registry.active_count().await, 0);
}

#[tokio::test]
async fn duplicate_create_keeps_original_session() {
    let dir = TempDir::new().unwrap();
    let (registry, _storage) = make_registry(&dir, HAPPY_TURN, RegistryHooks::default()).await;

    let original = registry.create_session("t1").await.unwrap();
    registry
        .bind_repository("t1", repo_checkout(&dir))
        .await
        .unwrap();
    let err = registry.create_session("t1").await.unwrap_err();
    assert!(matches!(err, Error::DuplicateSession(_)));

    let still_there = registry.get_session("t1").await.unwrap();
    assert_eq!(still_there.name(), original.name());
    assert_eq!(
        still_there.environment_mode().await,
        EnvironmentMode::Host
    );
    assert!(still_there.continuation_token().await.is_none());
}

#[tokio::test]
async fn concurrent_second_message_is_rejected_busy() {
    let dir = TempDir::new().unwrap();
    let slow = r#"printf '%s\n' '{"type":"system","subtype":"init","session_id":"i"}'
sleep 1
printf '%s\n' '{"type":"result","result":"slow done","session_id":"s2"}'"#;
    let (registry, _storage) = make_registry(&dir, slow, RegistryHooks::default()).await;

    registry.create_session("t1").await.unwrap();
    registry
        .bind_repository("t1", repo_checkout(&dir))
        .await
        .unwrap();

    let reg = registry.clone();
    let first = tokio::spawn(async move {
        let (progress, _) = collecting_progress();
        let (reaction, _) = collecting_reactions();
        reg.route_message("t1", "one", MessageMeta::default(), progress, reaction)
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let (progress, _) = collecting_progress();
    let (reaction, _) = collecting_reactions();
    let second = registry
        .route_message("t1", "two", MessageMeta::default(), progress, reaction)
        .await;
    assert!(matches!(second.unwrap_err(), Error::Busy(_)));

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.content, "slow done");
}

#[tokio::test]
async fn crash_preserves_token_and_continue_flag_appears_after_success() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("already-ran");
    let args_log = dir.path().join("args.log");
    // First invocation succeeds with token C1; every later one crashes
    // before emitting a terminal record.
    let body = format!(
        r#"echo "$@" >> {args}
if [ -f {marker} ]; then
  exit 1
fi
touch {marker}
printf '%s\n' '{{"type":"result","result":"ok","session_id":"C1"}}'"#,
        args = args_log.display(),
        marker = marker.display(),
    );
    let (registry, _storage) = make_registry(&dir, &body, RegistryHooks::default()).await;

    let worker = registry.create_session("t1").await.unwrap();
    registry
        .bind_repository("t1", repo_checkout(&dir))
        .await
        .unwrap();

    let (progress, _) = collecting_progress();
    let (reaction, _) = collecting_reactions();
    registry
        .route_message(
            "t1",
            "first",
            MessageMeta::default(),
            progress.clone(),
            reaction.clone(),
        )
        .await
        .unwrap();
    assert_eq!(worker.continuation_token().await.as_deref(), Some("C1"));

    let err = registry
        .route_message("t1", "second", MessageMeta::default(), progress, reaction)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Subprocess(_)));
    // Not cleared, not advanced.
    assert_eq!(worker.continuation_token().await.as_deref(), Some("C1"));

    let log = std::fs::read_to_string(&args_log).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(!lines[0].contains("--continue"));
    assert!(lines[1].contains("--continue"));
    assert!(!lines[1].contains("--resume"));
    assert!(!lines[1].contains("C1"));
}

#[tokio::test]
async fn restore_rebuilds_sessions_without_spawning() {
    let dir = TempDir::new().unwrap();
    let (registry, storage) = make_registry(&dir, HAPPY_TURN, RegistryHooks::default()).await;

    storage
        .upsert_thread_state("abc", "acme/app", "/tmp/acme/app", Some("tok1"), "container")
        .await
        .unwrap();

    let restored = registry.restore_active_sessions().await.unwrap();
    assert_eq!(restored, 1);

    let worker = registry.get_session("abc").await.unwrap();
    assert_eq!(worker.continuation_token().await.as_deref(), Some("tok1"));
    assert_eq!(
        worker.environment_mode().await,
        EnvironmentMode::Container
    );
}

#[tokio::test]
async fn terminate_kills_in_flight_turn_and_closes_thread() {
    let dir = TempDir::new().unwrap();
    // Emits one record then blocks; exec replaces the shell so the kill
    // reaches the process holding stdout.
    let body = r#"printf '%s\n' '{"type":"system","subtype":"init","session_id":"i"}'
exec sleep 30"#;
    let closed = Arc::new(AtomicBool::new(false));
    let closed_flag = closed.clone();
    let hooks = RegistryHooks {
        on_thread_close: Some(Arc::new(move |_thread| {
            closed_flag.store(true, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    let (registry, storage) = make_registry(&dir, body, hooks).await;

    registry.create_session("t1").await.unwrap();
    registry
        .bind_repository("t1", repo_checkout(&dir))
        .await
        .unwrap();

    let reg = registry.clone();
    let in_flight = tokio::spawn(async move {
        let (progress, _) = collecting_progress();
        let (reaction, _) = collecting_reactions();
        reg.route_message("t1", "long task", MessageMeta::default(), progress, reaction)
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let outcome = registry
        .handle_action("t1", &ThreadAction::Terminate.custom_id("t1"))
        .await
        .unwrap();
    assert!(matches!(outcome, ActionOutcome::ThreadClosed(_)));
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(registry.active_count().await, 0);
    assert!(storage.load_thread_states().await.unwrap().is_empty());

    // The in-flight turn unwinds as a failed turn, not a hang.
    let result = in_flight.await.unwrap();
    assert!(matches!(result.unwrap_err(), Error::Subprocess(_)));
}

#[tokio::test]
async fn config_directive_flips_environment_intent() {
    let dir = TempDir::new().unwrap();
    let (registry, _storage) = make_registry(&dir, HAPPY_TURN, RegistryHooks::default()).await;

    let worker = registry.create_session("t1").await.unwrap();
    registry
        .bind_repository("t1", repo_checkout(&dir))
        .await
        .unwrap();

    let (progress, _) = collecting_progress();
    let (reaction, _) = collecting_reactions();
    let reply = registry
        .route_message(
            "t1",
            "/config devcontainer on",
            MessageMeta::default(),
            progress.clone(),
            reaction.clone(),
        )
        .await
        .unwrap();
    assert!(reply.content.contains("devcontainer"));
    assert_eq!(
        worker.environment_mode().await,
        EnvironmentMode::Container
    );

    registry
        .route_message(
            "t1",
            "/config devcontainer off",
            MessageMeta::default(),
            progress,
            reaction,
        )
        .await
        .unwrap();
    assert_eq!(worker.environment_mode().await, EnvironmentMode::Host);
}

#[tokio::test]
async fn initial_reply_offers_environment_and_terminate_buttons() {
    let dir = TempDir::new().unwrap();
    let (registry, _storage) = make_registry(&dir, HAPPY_TURN, RegistryHooks::default()).await;

    registry.create_session("t1").await.unwrap();
    let reply = registry.initial_reply("t1", "acme/app").await.unwrap();
    assert!(reply.content.contains("acme/app"));
    assert_eq!(reply.controls.len(), 4);
    assert!(reply
        .controls
        .iter()
        .any(|c| c.id == ThreadAction::Terminate.custom_id("t1")));
}

#[tokio::test]
async fn foreign_action_id_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (registry, _storage) = make_registry(&dir, HAPPY_TURN, RegistryHooks::default()).await;
    registry.create_session("t1").await.unwrap();

    let err = registry
        .handle_action("t1", &ThreadAction::Terminate.custom_id("other-thread"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(registry.active_count().await, 1);
}
