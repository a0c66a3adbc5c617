pub mod auth;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod message_store;
pub mod metrics;
pub mod mqtt;
pub mod persistence;
#[cfg(feature = "lunatic")]
pub mod process;
pub mod retained;
pub mod session;
pub mod structure;
pub mod topic_tree;
pub mod will;

pub use config::{AckMode, BrokerConfig};
pub use coordinator::{ConnectOutcome, Coordinator, DisconnectReason, RejectReason};
pub use error::{BrokerError, Result};

pub type ClientId = String;
pub type PacketId = u16;
