use anyhow::Result;
use botd::{
    config::BotConfig,
    session::{MessageMeta, ProgressFn, ReactionFn, RegistryHooks, SessionRegistry},
    storage::Storage,
    workspace::{checkout_at, LocalWorkspace, RepoSpec},
};
use clap::Parser;
use std::{io::Write as _, path::PathBuf, sync::Arc};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "botd",
    about = "Chat-thread orchestrator daemon for the claude coding-assistant CLI",
    version
)]
struct Args {
    /// Data directory for config, the SQLite database, and fallback
    /// devcontainer config
    #[arg(long, env = "BOTD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Base directory containing repository checkouts at <base>/<owner>/<repo>
    #[arg(long, env = "BOTD_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "BOTD_LOG", default_value = "info")]
    log: String,

    /// Open a local console session against this repository (owner/repo)
    /// instead of waiting for a chat adapter
    #[arg(long)]
    repo: Option<String>,

    /// Use this path as the working copy for --repo instead of resolving it
    /// under the work dir
    #[arg(long)]
    repo_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(args.log.clone())
        .compact()
        .init();

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(".botd"));
    let work_dir = args.work_dir.clone().unwrap_or_else(|| data_dir.join("repos"));

    let config = Arc::new(BotConfig::load(&data_dir).await);
    let storage = Storage::new(&data_dir).await?;
    let workspace = Arc::new(LocalWorkspace::new(work_dir, storage.clone()));

    let registry = Arc::new(SessionRegistry::new(
        config,
        data_dir,
        storage,
        workspace.clone(),
        RegistryHooks::default(),
    ));

    let restored = registry.restore_active_sessions().await?;
    info!(restored, "botd ready");

    match &args.repo {
        Some(spec) => console_session(&registry, workspace, spec, args.repo_path.clone()).await,
        None => {
            eprintln!("no chat adapter attached; pass --repo owner/repo for a console session");
            Ok(())
        }
    }
}

/// Minimal interactive surface: one console thread bound to one repository.
/// Stands in for the chat adapter during local use and smoke testing.
async fn console_session(
    registry: &SessionRegistry,
    workspace: Arc<LocalWorkspace>,
    repo_spec: &str,
    repo_path: Option<PathBuf>,
) -> Result<()> {
    use botd::workspace::Workspace as _;

    const THREAD_ID: &str = "console";

    let spec = RepoSpec::parse(repo_spec)?;
    let checkout = match repo_path {
        Some(path) => checkout_at(path, spec.clone()),
        None => workspace.ensure_repository(&spec).await?,
    };

    if registry.get_session(THREAD_ID).await.is_none() {
        registry.create_session(THREAD_ID).await?;
        registry.bind_repository(THREAD_ID, checkout).await?;
    }

    let progress: ProgressFn = Arc::new(|text| println!("… {text}"));
    let reaction: ReactionFn = Arc::new(|emoji| println!("[{emoji}]"));

    println!("console session for {} (empty line to exit)", spec.full_name());
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 || line.trim().is_empty() {
            break;
        }
        match registry
            .route_message(
                THREAD_ID,
                line.trim(),
                MessageMeta::default(),
                progress.clone(),
                reaction.clone(),
            )
            .await
        {
            Ok(reply) => println!("{}", reply.content),
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}
