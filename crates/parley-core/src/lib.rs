pub mod ids;
pub mod message;
pub mod transport;

pub use ids::{ConnectionId, ConversationId, UserId};
pub use message::MessagePayload;
pub use transport::{Inbound, Transport, TransportError};
