pub mod cli;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod error_log;
pub mod extract;
pub mod fetch;
pub mod logging;
pub mod pipeline;
pub mod png;
pub mod resolution;
pub mod sandbox;
pub mod util;
