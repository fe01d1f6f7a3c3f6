//! An asynchronous client for the Redis serialization protocol (RESP2).
//!
//! The crate is split the same way the bytes flow:
//!
//! * `request` / `reply`: encoding of commands and decoding of replies, no I/O.
//! * `codec`: adapts the above to `tokio_util` framed readers and writers.
//! * `connection`: a TCP connection with an explicit lifecycle.
//! * `context`: the per-caller state that picks the implicit connection.
//! * `dispatch`: writes requests and reads replies on behalf of a context.
//! * `pubsub`: the background listener and subscriber queues.

pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod pubsub;
pub mod reply;
pub mod request;

pub use config::Config;
pub use connection::Connection;
pub use context::{Context, ContextId};
pub use pubsub::{Subscription, SubscriptionKind};
pub use reply::Reply;
pub use request::{Arg, Request};

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// The server answered with an error reply (`-` tag).
    #[error("{0}")]
    Server(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Frame(#[from] reply::FrameError),
    #[error("connection closed")]
    Closed,
    #[error("not a pub/sub connection")]
    NotPubSub,
    #[error("connection is in pub/sub mode, replies are consumed by the listener")]
    PubSubMode,
    #[error("invalid port {0}, expected a value between 1 and 65535")]
    InvalidPort(u16),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// An error raised while reading the reply of `command`.
    #[error("{source}; command: {command}")]
    Command {
        command: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns the innermost error, looking through any `Command` wrapping.
    pub fn root(&self) -> &Error {
        match self {
            Error::Command { source, .. } => source.root(),
            err => err,
        }
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.root(), Error::Server(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.root(), Error::Closed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
