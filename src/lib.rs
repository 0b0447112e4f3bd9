pub mod ai;
pub mod codegen;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod http;
pub mod log;
pub mod orchestrator;
pub mod planning;
pub mod store;
pub mod tools;
pub mod util;
pub mod validate;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, TaskEvent};
