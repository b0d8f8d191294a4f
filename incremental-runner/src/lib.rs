pub mod app_context;
pub mod config;
pub mod drops;
pub mod health;
pub mod http;
pub mod metrics;
pub mod metrics_constants;
pub mod runner;
