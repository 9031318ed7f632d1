pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod language;
pub mod limits;
pub mod models;
pub mod routes;
pub mod sandbox;
pub mod session;
pub mod store;
pub mod web_server;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
