//! agentbox: project-aware container CLI
//!
//! Runs coding agents in containers named after the project they belong
//! to, with interactive sessions, live resource stats and file copies on
//! top of the Docker Engine API.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod copy;
pub mod engine;
pub mod error;
pub mod names;
pub mod session;
pub mod stats;
pub mod terminal;
pub mod testing;

pub use cli::{Cli, Command, ContainerCommand};
pub use commands::{dispatch, Context};
pub use config::ResolvedConfig;
pub use engine::{default_socket_path, DockerEngine, Engine, EngineError};
pub use error::{Error, Result};
pub use session::{SessionIo, SessionOutcome};
pub use terminal::Terminal;
