//! Client-side session and reply-correlation layer for a message-oriented
//! board service.
//!
//! A shared [`ConnectionManager`] decodes every inbound message and offers it
//! to the observers held by a [`DispatchRegistry`]; the [`SessionController`]
//! issues account requests (login, register, edit profile), registers a
//! one-shot observer for each expected reply code, and hands the caller a
//! [`PendingReply`] that resolves when the correlated reply arrives. A
//! persistent observer carries the server's session-expiry push.

pub mod connection;
pub mod dispatch;
pub mod protocol;
pub mod serializer;
pub mod session;

pub use connection::{ConnectionError, ConnectionManager};
pub use dispatch::{DispatchRegistry, Observer, ObserverId, ObserverKind, RegistryError};
pub use protocol::{
    AckReply,
    LoginReply,
    Opcode,
    ProtocolMessage,
    ReplyParseError,
    ReplyStatus,
    UserProfile,
};
pub use serializer::{BincodeSerializer, Serializer};
pub use session::{
    Credential,
    PendingReply,
    Session,
    SessionController,
    SessionError,
    SessionExpiryEvents,
};
