//! Server module for Harbor
//!
//! # Module Structure
//!
//! - `config`: Configuration structures
//! - `loader`: Configuration loading from files and environment
//! - `init`: Server wiring and run loop

pub mod config;
mod init;
mod loader;

pub use init::run;
pub use loader::{load_config, user_config_path};
