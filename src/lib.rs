pub mod app;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod relay;
pub mod settings;
pub mod telemetry;
pub mod transport;
