use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;
use uuid::Uuid;

use crate::codec::RespCodec;
use crate::config::Config;
use crate::context::ContextId;
use crate::pubsub::{self, Registry};
use crate::reply::Reply;
use crate::request::Request;
use crate::Error;

pub(crate) type ReplyReader = FramedRead<OwnedReadHalf, RespCodec>;
type RequestWriter = FramedWrite<OwnedWriteHalf, RespCodec>;

/// A TCP connection to a Redis server.
///
/// `Connection` is a handle: clones share the same socket. It is closed once, either by
/// [`Connection::disconnect`] or when the last handle is dropped. Every read or write after
/// that fails with [`Error::Closed`].
///
/// A pub/sub connection hands its read half to a background listener task, see
/// [`Connection::pubsub_connect`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    owner: Option<ContextId>,
    peer_addr: SocketAddr,
    // Guards the streams and the close transition. Held for the whole of a read or a write
    // so that a concurrent disconnect never sees a half-used stream.
    state: tokio::sync::Mutex<State>,
    // Mirrors `State::closed`, set only once both streams have been released.
    closed: AtomicBool,
    registry: Option<Registry>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

struct State {
    // `None` on pub/sub connections, the listener owns the read half.
    reader: Option<ReplyReader>,
    writer: Option<RequestWriter>,
    closed: bool,
}

impl Connection {
    /// Opens an unowned connection: any context may use it as its implicit owner.
    pub async fn connect(host: &str, port: u16) -> Result<Connection, Error> {
        Connection::open(&Config::new(host, port)?, None, false).await
    }

    /// Opens an unowned connection in pub/sub mode.
    pub async fn pubsub_connect(host: &str, port: u16) -> Result<Connection, Error> {
        Connection::open(&Config::new(host, port)?, None, true).await
    }

    pub(crate) async fn open(
        config: &Config,
        owner: Option<ContextId>,
        pubsub: bool,
    ) -> Result<Connection, Error> {
        let stream = TcpStream::connect((config.host(), config.port())).await?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;

        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, RespCodec::new());
        let writer = FramedWrite::new(write_half, RespCodec::new());

        let id = Uuid::new_v4();
        let (reader, registry, listener) = if pubsub {
            let registry = Registry::new();
            let listener = tokio::spawn(pubsub::listen(reader, registry.clone(), id));
            (None, Some(registry), Some(listener))
        } else {
            (Some(reader), None, None)
        };

        debug!(connection_id = %id, %peer_addr, pubsub, "connection opened");

        Ok(Connection {
            inner: Arc::new(Inner {
                id,
                owner,
                peer_addr,
                state: tokio::sync::Mutex::new(State {
                    reader,
                    writer: Some(writer),
                    closed: false,
                }),
                closed: AtomicBool::new(false),
                registry,
                listener: Mutex::new(listener),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn owner(&self) -> Option<ContextId> {
        self.inner.owner
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_pubsub(&self) -> bool {
        self.inner.registry.is_some()
    }

    /// Whether `context` may use this connection without opening its own.
    pub fn is_owned_by(&self, context: ContextId) -> bool {
        self.inner.owner.map_or(true, |owner| owner == context)
    }

    pub(crate) fn registry(&self) -> Option<&Registry> {
        self.inner.registry.as_ref()
    }

    /// Closes the connection.
    ///
    /// A `QUIT` is sent first on a best effort basis; whatever happens to it, both halves of
    /// the socket are released and the listener task, if any, is stopped. Returns `false` if
    /// the connection was already closed.
    pub async fn disconnect(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return false;
        }

        if let Some(writer) = state.writer.as_mut() {
            if let Err(err) = writer.send(Request::new("QUIT")).await {
                debug!(connection_id = %self.inner.id, error = %err, "failed to send QUIT");
            }
        }

        if let Some(mut writer) = state.writer.take() {
            if let Err(err) = writer.get_mut().shutdown().await {
                debug!(connection_id = %self.inner.id, error = %err, "failed to shut down socket");
            }
        }
        state.reader.take();

        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
            // Wait for the task to drop its read half, so the socket is released on return.
            let _ = listener.await;
        }
        if let Some(registry) = &self.inner.registry {
            registry.close();
        }

        state.closed = true;
        self.inner.closed.store(true, Ordering::Release);

        debug!(connection_id = %self.inner.id, "connection closed");
        true
    }

    /// Encodes `request`, writes it and flushes.
    pub(crate) async fn write_request(&self, request: Request) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }

        let writer = state.writer.as_mut().ok_or(Error::Closed)?;
        writer.send(request).await
    }

    /// Reads exactly one reply. Error replies are returned as `Error::Server`.
    pub(crate) async fn read_reply(&self) -> Result<Reply, Error> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }

        let reader = match state.reader.as_mut() {
            Some(reader) => reader,
            None if self.is_pubsub() => return Err(Error::PubSubMode),
            None => return Err(Error::Closed),
        };

        match reader.next().await {
            Some(reply) => reply?.into_result(),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )
            .into()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner)
            .field("peer_addr", &self.inner.peer_addr)
            .field("pubsub", &self.is_pubsub())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            debug!(connection_id = %self.id, "connection dropped without disconnect");
        }

        if let Some(listener) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
    }
}
