pub mod config;
pub mod connection;
pub mod message_log;
pub mod registry;
pub mod session;
pub mod signal;
pub mod telemetry;
pub mod transport;

pub use bottle_storage as storage;
