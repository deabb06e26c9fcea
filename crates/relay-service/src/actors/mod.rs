//! Actor model for the relay.
//!
//! ```text
//! RoomRegistryActor (singleton, root CancellationToken)
//! ├── RoomActor (one per live room; ledger + routing table)
//! └── ConnectionActor (one per WebSocket; routes through its RoomActor)
//! ```
//!
//! All room state lives inside its `RoomActor`. HTTP handlers and connection
//! actors reach it through `RoomRegistryHandle`, which resolves the room and
//! retries when a request races with a room that is stopping.

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

pub use connection::ConnectionActor;
pub use messages::{ConnectionCommand, RegistryStatus};
pub use metrics::{ActorType, MailboxMonitor, RelayMetrics};
pub use registry::RoomRegistryHandle;
pub use room::{RoomActorHandle, RoomStopped};
