//! Pingclair Core Library
//!
//! Route Table, Event Bus, Persistence adapter, core configuration, and the
//! plaintext HTTP edge listener. Does not implement TLS itself: the
//! certificate callback boundary lives in `pingclair-tls`.

pub mod config;
pub mod domain;
pub mod error;
pub mod event_bus;
pub mod persistence;
pub mod route_table;
pub mod server;

pub use config::{AcmeMode, CoreConfig};
pub use error::{Error, Result};
pub use event_bus::{Event, EventBus, EventSubscription};
pub use route_table::{Route, RouteTable, RouteTableError};

/// Pingclair version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
