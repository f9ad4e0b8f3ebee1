//! Wire messages and the transport/monitor contracts.

pub mod messages;
pub mod transport;

pub use messages::{MapEntry, MapUpdate, Message, PeeringKind, PeeringMessage, PgTempRequest};
pub use transport::{Connection, Messenger, MonClient, SubscribeMode};
