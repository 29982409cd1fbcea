//! lattice-core — wire protocol, daemon configuration, and error types
//! shared by every lattice crate.

pub mod config;
pub mod error;
pub mod wire;

pub use config::LatticeConfig;
pub use error::RpcError;
