// Core modules
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod execution;
pub mod graduation;
pub mod indication;
pub mod indicators;
pub mod market;
pub mod models;
pub mod persistence;
pub mod pool;
pub mod positions;
pub mod retention;
pub mod strategy;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::EngineError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
