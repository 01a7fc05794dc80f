pub mod bus;
pub mod config;
pub mod generation;
pub mod history;
pub mod llm;
pub mod pool;
pub mod prompt;
pub mod service;
pub mod session;
pub mod telemetry;
