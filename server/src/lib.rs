//! AirSense ingestion server
//!
//! Accepts one JSON reading per TCP connection from field sensors, keeps every
//! accepted reading in memory and appends it to an external database.

pub mod api;
pub mod config;
pub mod listener;
pub mod persist;
pub mod session;
pub mod store;

pub use config::ServerConfig;
pub use listener::Listener;
pub use session::SessionContext;
pub use store::ReadingsStore;
