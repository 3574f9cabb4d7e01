//! Agent server that answers prompts by letting a model call tools, including
//! code execution in a disposable sandbox.

pub mod config;
pub mod logging;
pub mod model;
pub mod net_filter;
pub mod orchestrator;
pub mod router;
pub mod streaming;
pub mod tools;
pub mod traces;
