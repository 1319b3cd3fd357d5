pub mod config;
pub mod error;
pub mod models;
pub mod ollama_api;
pub mod relay;
pub mod routes;
pub mod session;
pub mod transcoder;

pub use error::RelayError;
pub use routes::{router, AppState};
