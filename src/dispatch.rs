use tracing::{debug, instrument};

use crate::connection::Connection;
use crate::context::Context;
use crate::reply::Reply;
use crate::request::Request;
use crate::Error;

/// Writes `request` without waiting for a reply and returns the connection it went out on.
///
/// The connection is picked in this order:
///
/// 1. `connection`, if it is owned by `ctx` or unowned.
/// 2. The implicit connection of `ctx`, if it is still open.
/// 3. A new connection to the configured address, which becomes the implicit connection.
#[instrument(skip_all, fields(context_id = %ctx.id(), command = %request.command()))]
pub async fn send_no_reply(
    ctx: &mut Context,
    connection: Option<&Connection>,
    request: Request,
) -> Result<Connection, Error> {
    let connection = resolve(ctx, connection).await?;
    connection.write_request(request).await?;
    Ok(connection)
}

/// Writes `request` and reads one reply.
///
/// Errors raised while reading the reply are wrapped in `Error::Command`, which keeps the
/// original error as its source.
///
/// There is no timeout: a server that never answers blocks the caller.
pub async fn send(
    ctx: &mut Context,
    connection: Option<&Connection>,
    request: Request,
) -> Result<Reply, Error> {
    let command = request.to_string();
    let connection = send_no_reply(ctx, connection, request).await?;

    connection
        .read_reply()
        .await
        .map_err(|source| Error::Command {
            command,
            source: Box::new(source),
        })
}

async fn resolve(ctx: &mut Context, explicit: Option<&Connection>) -> Result<Connection, Error> {
    if let Some(connection) = explicit {
        if connection.is_owned_by(ctx.id()) {
            return Ok(connection.clone());
        }
        debug!(connection_id = %connection.id(), "connection belongs to another context");
    }

    if let Some(current) = ctx.current() {
        if !current.is_closed() {
            return Ok(current.clone());
        }
    }

    let connection = Connection::open(ctx.config(), Some(ctx.id()), false).await?;
    debug!(connection_id = %connection.id(), "opened implicit connection");
    ctx.set_current(connection.clone());

    Ok(connection)
}
