pub mod config;
pub mod environment;
pub mod error;
pub mod session;
pub mod storage;
pub mod workspace;

pub use config::BotConfig;
pub use environment::EnvironmentMode;
pub use error::{Error, Result};
pub use session::{
    ActionOutcome, ConfigDirective, Control, MessageMeta, ProgressFn, ReactionFn, RegistryHooks,
    Reply, SessionRegistry, ThreadAction,
};
pub use storage::Storage;
pub use workspace::{LocalWorkspace, RepoSpec, Workspace};
