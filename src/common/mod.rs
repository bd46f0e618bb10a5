pub mod config;
pub mod crypto;
pub mod metrics;
