//! NetCore peer: the I/O half of the bus.
//! UDP notification channel, TCP payload/synced-call channel, and the connector that owns both.

pub mod config;
pub mod connector;
pub mod dispatch;
pub mod reliable;
pub mod unreliable;
mod worker;

pub use connector::Connector;
pub use dispatch::Handler;
pub use netcore_core::{
    Inbound, LinkSpec, NetCoreError, Notification, PayloadMessage, Role, Value,
};
pub use reliable::{LinkState, ReliableChannel};
pub use unreliable::UnreliableChannel;
