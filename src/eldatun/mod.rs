pub mod admin;
pub mod app;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod mux;
pub mod net;
pub mod packet;
pub mod runtime_paths;
pub mod server;
pub mod splice;
pub mod telemetry;
