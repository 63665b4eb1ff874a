//! Error types for Pingclair core

use thiserror::Error;

/// Result type for Pingclair core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for pingclair-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    RouteTable(#[from] crate::route_table::RouteTableError),

    #[error(transparent)]
    Persistence(#[from] crate::persistence::PersistenceError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
