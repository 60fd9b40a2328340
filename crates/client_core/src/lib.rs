//! Client side of message synchronization: a bounded local timeline kept
//! consistent with the server over HTTP windows and realtime frames.

pub mod engine;
pub mod error;
pub mod gateway;
pub mod link;
pub mod timeline;

pub use engine::{connect_realtime, ClientEvent, SyncEngine};
pub use error::SyncError;
pub use gateway::{HttpGateway, MessageGateway};
pub use link::{NullLink, RealtimeLink, WsLink};
pub use timeline::{DeleteRepair, Timeline, CATCH_UP_RADIUS, MAX_MATERIALIZED};
