//! Kest flow execution engine.
//!
//! Parses Markdown flow scripts and step graphs into scenarios, runs
//! them against an HTTP API with templated variables, captures and
//! assertions, records every exchange in a local history store, and
//! reports progress as console lines or an SSE stream.

pub mod assertion;
pub mod capture;
pub mod config;
pub mod error;
pub mod graph;
pub mod history;
pub mod http;
pub mod markdown_parser;
pub mod model;
pub mod report;
pub mod runner;
pub mod scope;
pub mod sink;
pub mod sse;
pub mod template;

pub use config::{load_path, load_scenario, KestConfig};
pub use error::{KestError, ParseError, StepError};
pub use http::{HttpExecutor, ReqwestExecutor};
pub use model::*;
pub use runner::{CancelToken, FlowRunner, RunOptions, ScenarioRunner};
pub use scope::{RunContext, VariableScope};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
