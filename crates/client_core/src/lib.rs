//! Client side of the chat system: a per-user [`ChatSession`] driven by a
//! [`ChatBackend`], either in-process ([`EmbeddedBackend`]) or over the
//! network ([`RemoteBackend`]).

pub mod backend;
pub mod embedded;
pub mod error;
mod notice;
pub mod remote;
mod session;

pub use backend::{ChatBackend, SnapshotStream};
pub use embedded::EmbeddedBackend;
pub use error::BackendError;
pub use notice::Notice;
pub use remote::RemoteBackend;
pub use session::{
    ChatSession, PendingMessage, SessionConfig, SessionEvent, DEFAULT_NOTICE_TTL,
    DEFAULT_TYPING_IDLE,
};

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
