pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod sandbox;
pub mod server;
pub mod tasks;
pub mod telemetry;
