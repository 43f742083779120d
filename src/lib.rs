//! Broadcast relay for multi-process socket servers.
//!
//! Each process keeps delivering events to its own sockets. Events broadcast
//! locally are also written to a shared log; every other process tails the
//! log's change feed and replays those events to its own sockets.

pub mod broadcaster;
pub mod codec;
pub mod config;
pub mod origin;
pub mod record;
pub mod relay;
pub mod store;
pub mod utils;

pub use broadcaster::{DeliveryOrigin, LocalBroadcaster, RoomBroadcaster};
pub use codec::Payload;
pub use config::RelayConfig;
pub use origin::OriginId;
pub use record::DeliveryOptions;
pub use relay::{Relay, RelayAdapter, RelayError};
