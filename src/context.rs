use std::fmt;
use uuid::Uuid;

use crate::config::Config;
use crate::connection::Connection;
use crate::dispatch;
use crate::reply::Reply;
use crate::request::Request;
use crate::Error;

/// Identifies the caller that owns a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> ContextId {
        ContextId(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-caller state: who is calling, where to connect, and the connection used when none is
/// passed explicitly.
///
/// Each task or thread keeps its own `Context`, so implicit connections are never shared
/// between callers. Dropping the context drops its implicit connection.
pub struct Context {
    id: ContextId,
    config: Config,
    current: Option<Connection>,
}

impl Context {
    pub fn new(config: Config) -> Context {
        Context {
            id: ContextId::new(),
            config,
            current: None,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The implicit connection, once a request without an explicit connection was sent.
    pub fn current(&self) -> Option<&Connection> {
        self.current.as_ref()
    }

    pub(crate) fn set_current(&mut self, connection: Connection) {
        self.current = Some(connection);
    }

    /// Opens a connection owned by this context. It does not become the implicit one.
    pub async fn connect(&self) -> Result<Connection, Error> {
        Connection::open(&self.config, Some(self.id), false).await
    }

    pub async fn pubsub_connect(&self) -> Result<Connection, Error> {
        Connection::open(&self.config, Some(self.id), true).await
    }

    pub async fn send(
        &mut self,
        connection: Option<&Connection>,
        request: Request,
    ) -> Result<Reply, Error> {
        dispatch::send(self, connection, request).await
    }

    pub async fn send_no_reply(
        &mut self,
        connection: Option<&Connection>,
        request: Request,
    ) -> Result<Connection, Error> {
        dispatch::send_no_reply(self, connection, request).await
    }

    /// Disconnects the implicit connection. Returns `false` if there was nothing to close.
    pub async fn close(&mut self) -> bool {
        match self.current.take() {
            Some(connection) => connection.disconnect().await,
            None => false,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
