pub mod connection;
pub mod ice;
pub mod types;

pub use types::{ServerConfig, DEFAULT_ICE_SERVERS};
