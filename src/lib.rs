pub mod api;
pub mod archive;
pub mod batch;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod module;
pub mod orchestrator;
pub mod schema;
pub mod scratch;
pub mod settings;
pub mod transfer;

pub use config::Config;
pub use error::SdkError;
pub use module::{Module, ModuleContext, ModuleResult};
