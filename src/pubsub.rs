//! Publish/subscribe.
//!
//! A pub/sub connection never returns replies to its caller. A listener task reads every
//! frame pushed by the server and forwards message payloads to the queues registered for
//! the channel (or pattern) they were published on.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use strum_macros::EnumString;
use thiserror::Error as ThisError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::connection::{Connection, ReplyReader};
use crate::reply::Reply;
use crate::request::{Arg, Request};
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// `SUBSCRIBE`: an exact channel name.
    Channel,
    /// `PSUBSCRIBE`: a glob-style pattern, matched by the server.
    Pattern,
}

impl SubscriptionKind {
    fn subscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
        }
    }

    fn unsubscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
        }
    }
}

/// A queue of payloads published on one channel or pattern.
///
/// The queue ends (`recv` returns `None`) when the connection is closed, when the key is
/// unsubscribed or when the listener stops reading, for example because the server went
/// away.
#[derive(Debug)]
pub struct Subscription {
    key: Bytes,
    kind: SubscriptionKind,
    receiver: UnboundedReceiver<Reply>,
}

impl Subscription {
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    pub async fn recv(&mut self) -> Option<Reply> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Reply> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Reply;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Connection {
    /// Subscribes to `key` and returns the queue its payloads are pushed to.
    ///
    /// The server's confirmation is consumed by the listener, so this returns as soon as the
    /// command is written. Several subscriptions to the same key each get every payload.
    pub async fn subscribe(
        &self,
        key: impl Into<Arg>,
        kind: SubscriptionKind,
    ) -> Result<Subscription, Error> {
        let registry = self.registry().ok_or(Error::NotPubSub)?;
        if self.is_closed() {
            return Err(Error::Closed);
        }

        // Text, symbol and byte keys must all route to the same entry.
        let key = key.into().to_bytes()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        registry.register(kind, key.clone(), sender.clone())?;

        let request = Request::new(kind.subscribe_command()).arg(key.clone());
        if let Err(err) = self.write_request(request).await {
            registry.unregister(kind, &key, &sender);
            return Err(err);
        }

        debug!(connection_id = %self.id(), key = %String::from_utf8_lossy(&key), ?kind, "subscribed");

        Ok(Subscription {
            key,
            kind,
            receiver,
        })
    }

    /// Unsubscribes from `key` and ends every queue registered for it with the same `kind`.
    /// Returns how many queues were ended.
    pub async fn unsubscribe(
        &self,
        key: impl Into<Arg>,
        kind: SubscriptionKind,
    ) -> Result<usize, Error> {
        let registry = self.registry().ok_or(Error::NotPubSub)?;
        let key = key.into().to_bytes()?;

        let request = Request::new(kind.unsubscribe_command()).arg(key.clone());
        self.write_request(request).await?;

        Ok(registry.remove(kind, &key))
    }

    /// Number of live queues registered for `key` with the given `kind`.
    pub fn subscribers(&self, key: impl Into<Arg>, kind: SubscriptionKind) -> Result<usize, Error> {
        let registry = self.registry().ok_or(Error::NotPubSub)?;
        let key = key.into().to_bytes()?;

        Ok(registry.subscribers(kind, &key))
    }
}

/// Subscriber queues by kind and key, in subscription order. A channel and a pattern
/// spelled the same are separate entries.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    inner: Arc<Mutex<RegistryState>>,
}

type QueueKey = (SubscriptionKind, Bytes);

#[derive(Default)]
struct RegistryState {
    queues: HashMap<QueueKey, Vec<UnboundedSender<Reply>>>,
    // Set once the listener is gone, nothing will be delivered anymore.
    closed: bool,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(
        &self,
        kind: SubscriptionKind,
        key: Bytes,
        sender: UnboundedSender<Reply>,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        state.queues.entry((kind, key)).or_default().push(sender);
        Ok(())
    }

    fn unregister(&self, kind: SubscriptionKind, key: &Bytes, sender: &UnboundedSender<Reply>) {
        let mut state = self.lock();
        let entry = (kind, key.clone());
        if let Some(senders) = state.queues.get_mut(&entry) {
            senders.retain(|s| !s.same_channel(sender));
            if senders.is_empty() {
                state.queues.remove(&entry);
            }
        }
    }

    fn remove(&self, kind: SubscriptionKind, key: &Bytes) -> usize {
        self.lock()
            .queues
            .remove(&(kind, key.clone()))
            .map_or(0, |senders| senders.len())
    }

    fn subscribers(&self, kind: SubscriptionKind, key: &Bytes) -> usize {
        self.lock()
            .queues
            .get(&(kind, key.clone()))
            .map_or(0, |senders| senders.iter().filter(|s| !s.is_closed()).count())
    }

    /// Pushes `payload` to every queue of `key`, dropping the queues nobody reads anymore.
    /// Returns the number of queues it reached.
    fn dispatch(&self, kind: SubscriptionKind, key: Bytes, payload: Reply) -> usize {
        let mut state = self.lock();
        let entry = (kind, key);
        let Some(senders) = state.queues.get_mut(&entry) else {
            return 0;
        };

        senders.retain(|sender| sender.send(payload.clone()).is_ok());
        let delivered = senders.len();
        if delivered == 0 {
            state.queues.remove(&entry);
        }

        delivered
    }

    /// Ends every queue and refuses new ones.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.queues.clear();
    }

    #[cfg(test)]
    pub(crate) fn handles(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[derive(Debug, PartialEq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
enum PushKind {
    Subscribe,
    Psubscribe,
    Unsubscribe,
    Punsubscribe,
    Message,
    Pmessage,
}

/// A frame pushed by the server on a subscribed connection.
#[derive(Debug, PartialEq)]
enum Push {
    /// Confirmation of a (p)subscribe or (p)unsubscribe.
    Ack(PushKind),
    Message {
        channel: Bytes,
        payload: Reply,
    },
    PMessage {
        pattern: Bytes,
        channel: Bytes,
        payload: Reply,
    },
}

#[derive(Debug, ThisError, PartialEq)]
enum PushError {
    #[error("expected array, got {0}")]
    NotAnArray(Reply),
    #[error("unknown push kind {0}")]
    UnknownKind(String),
    #[error("malformed {0} push")]
    Malformed(&'static str),
}

impl TryFrom<Reply> for Push {
    type Error = PushError;

    fn try_from(reply: Reply) -> Result<Self, Self::Error> {
        let parts = match reply {
            Reply::Array(Some(parts)) => parts,
            reply => return Err(PushError::NotAnArray(reply)),
        };
        let mut parts = parts.into_iter();

        let kind = parts
            .next()
            .as_ref()
            .and_then(Reply::as_str)
            .map(|s| s.to_string())
            .ok_or(PushError::Malformed("untyped"))?;
        let kind = PushKind::from_str(&kind).map_err(|_| PushError::UnknownKind(kind))?;

        match kind {
            PushKind::Message => {
                let channel = next_key(&mut parts).ok_or(PushError::Malformed("message"))?;
                let payload = parts.next().ok_or(PushError::Malformed("message"))?;
                Ok(Push::Message { channel, payload })
            }
            PushKind::Pmessage => {
                let pattern = next_key(&mut parts).ok_or(PushError::Malformed("pmessage"))?;
                let channel = next_key(&mut parts).ok_or(PushError::Malformed("pmessage"))?;
                // Everything after the channel is the payload, normally a single bulk string.
                let mut rest: Vec<Reply> = parts.collect();
                let payload = match rest.len() {
                    0 => return Err(PushError::Malformed("pmessage")),
                    1 => rest.remove(0),
                    _ => Reply::Array(Some(rest)),
                };
                Ok(Push::PMessage {
                    pattern,
                    channel,
                    payload,
                })
            }
            kind => Ok(Push::Ack(kind)),
        }
    }
}

fn next_key(parts: &mut impl Iterator<Item = Reply>) -> Option<Bytes> {
    match parts.next()? {
        Reply::Bulk(Some(bytes)) => Some(bytes),
        Reply::Status(s) => Some(Bytes::from(s)),
        _ => None,
    }
}

/// Reads pushes until the stream ends or a frame cannot be decoded, then ends every queue.
#[instrument(name = "pubsub_listener", skip(reader, registry))]
pub(crate) async fn listen(mut reader: ReplyReader, registry: Registry, connection_id: Uuid) {
    debug!("listening");

    loop {
        let reply = match reader.next().await {
            Some(Ok(reply)) => reply.into_result(),
            Some(Err(err)) => Err(err),
            None => {
                debug!("end of stream");
                break;
            }
        };

        match reply {
            Ok(reply) => route(&registry, reply),
            Err(err) => {
                debug!(error = %err, "stopped reading pushes");
                break;
            }
        }
    }

    registry.close();
}

fn route(registry: &Registry, reply: Reply) {
    match Push::try_from(reply) {
        Ok(Push::Ack(kind)) => debug!(?kind, "acknowledged"),
        Ok(Push::Message { channel, payload }) => {
            registry.dispatch(SubscriptionKind::Channel, channel, payload);
        }
        // Routed by the pattern the queue subscribed with, not the channel that matched it.
        Ok(Push::PMessage {
            pattern,
            channel,
            payload,
        }) => {
            trace!(channel = %String::from_utf8_lossy(&channel), "pattern message");
            registry.dispatch(SubscriptionKind::Pattern, pattern, payload);
        }
        Err(err) => warn!(error = %err, "skipping push"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::SubscriptionKind::{Channel, Pattern};

    fn bulk(s: &str) -> Reply {
        Reply::Bulk(Some(Bytes::copy_from_slice(s.as_bytes())))
    }

    fn push(parts: &[&str]) -> Reply {
        Reply::Array(Some(parts.iter().map(|p| bulk(p)).collect()))
    }

    #[test]
    fn parse_acknowledgements() {
        let reply = Reply::Array(Some(vec![bulk("subscribe"), bulk("news"), Reply::Integer(1)]));

        assert_eq!(Push::try_from(reply), Ok(Push::Ack(PushKind::Subscribe)));

        let reply = Reply::Array(Some(vec![
            bulk("PUNSUBSCRIBE"),
            bulk("news.*"),
            Reply::Integer(0),
        ]));

        assert_eq!(Push::try_from(reply), Ok(Push::Ack(PushKind::Punsubscribe)));
    }

    #[test]
    fn parse_message() {
        assert_eq!(
            Push::try_from(push(&["message", "news", "hi"])),
            Ok(Push::Message {
                channel: Bytes::from("news"),
                payload: bulk("hi"),
            })
        );
    }

    #[test]
    fn parse_pmessage() {
        assert_eq!(
            Push::try_from(push(&["pmessage", "news.*", "news.tech", "hello"])),
            Ok(Push::PMessage {
                pattern: Bytes::from("news.*"),
                channel: Bytes::from("news.tech"),
                payload: bulk("hello"),
            })
        );
    }

    #[test]
    fn parse_invalid_pushes() {
        assert_eq!(
            Push::try_from(Reply::Integer(1)),
            Err(PushError::NotAnArray(Reply::Integer(1)))
        );
        assert_eq!(
            Push::try_from(push(&["pong", ""])),
            Err(PushError::UnknownKind("pong".to_string()))
        );
        assert_eq!(
            Push::try_from(push(&["message", "news"])),
            Err(PushError::Malformed("message"))
        );
    }

    #[test]
    fn route_fans_out_by_key() {
        let registry = Registry::new();
        let (first, mut first_rx) = mpsc::unbounded_channel();
        let (second, mut second_rx) = mpsc::unbounded_channel();
        let (other, mut other_rx) = mpsc::unbounded_channel();
        registry.register(Channel, Bytes::from("news"), first).unwrap();
        registry.register(Channel, Bytes::from("news"), second).unwrap();
        registry.register(Channel, Bytes::from("sport"), other).unwrap();

        route(&registry, push(&["message", "news", "hi"]));

        assert_eq!(first_rx.try_recv().unwrap(), bulk("hi"));
        assert_eq!(second_rx.try_recv().unwrap(), bulk("hi"));
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn route_pmessage_by_pattern() {
        let registry = Registry::new();
        let (pattern, mut pattern_rx) = mpsc::unbounded_channel();
        let (channel, mut channel_rx) = mpsc::unbounded_channel();
        registry.register(Pattern, Bytes::from("news.*"), pattern).unwrap();
        registry.register(Channel, Bytes::from("news.tech"), channel).unwrap();

        route(&registry, push(&["pmessage", "news.*", "news.tech", "hello"]));

        assert_eq!(pattern_rx.try_recv().unwrap(), bulk("hello"));
        assert!(channel_rx.try_recv().is_err());
    }

    #[test]
    fn route_keeps_channels_and_patterns_apart() {
        let registry = Registry::new();
        let (channel, mut channel_rx) = mpsc::unbounded_channel();
        let (pattern, mut pattern_rx) = mpsc::unbounded_channel();
        registry.register(Channel, Bytes::from("news"), channel).unwrap();
        registry.register(Pattern, Bytes::from("news"), pattern).unwrap();

        route(&registry, push(&["message", "news", "direct"]));
        route(&registry, push(&["pmessage", "news", "news", "matched"]));

        assert_eq!(channel_rx.try_recv().unwrap(), bulk("direct"));
        assert!(channel_rx.try_recv().is_err());
        assert_eq!(pattern_rx.try_recv().unwrap(), bulk("matched"));
        assert!(pattern_rx.try_recv().is_err());
    }

    #[test]
    fn remove_leaves_the_other_kind() {
        let registry = Registry::new();
        let (channel, _channel_rx) = mpsc::unbounded_channel();
        let (pattern, _pattern_rx) = mpsc::unbounded_channel();
        let key = Bytes::from("news");
        registry.register(Channel, key.clone(), channel).unwrap();
        registry.register(Pattern, key.clone(), pattern).unwrap();

        assert_eq!(registry.remove(Channel, &key), 1);
        assert_eq!(registry.subscribers(Channel, &key), 0);
        assert_eq!(registry.subscribers(Pattern, &key), 1);
    }

    #[test]
    fn dispatch_without_subscribers_is_dropped() {
        let registry = Registry::new();

        assert_eq!(registry.dispatch(Channel, Bytes::from("nobody"), bulk("x")), 0);
    }

    #[test]
    fn dispatch_prunes_dropped_queues() {
        let registry = Registry::new();
        let (kept, mut kept_rx) = mpsc::unbounded_channel();
        let (dropped, dropped_rx) = mpsc::unbounded_channel();
        let key = Bytes::from("k");
        registry.register(Channel, key.clone(), kept).unwrap();
        registry.register(Channel, key.clone(), dropped).unwrap();
        drop(dropped_rx);

        assert_eq!(registry.dispatch(Channel, key.clone(), bulk("1")), 1);
        assert_eq!(registry.subscribers(Channel, &key), 1);
        assert_eq!(kept_rx.try_recv().unwrap(), bulk("1"));
    }

    #[test]
    fn unregister_removes_only_that_queue() {
        let registry = Registry::new();
        let (first, _first_rx) = mpsc::unbounded_channel();
        let (second, _second_rx) = mpsc::unbounded_channel();
        let key = Bytes::from("k");
        registry.register(Channel, key.clone(), first.clone()).unwrap();
        registry.register(Channel, key.clone(), second).unwrap();

        registry.unregister(Channel, &key, &first);

        assert_eq!(registry.subscribers(Channel, &key), 1);
    }

    #[test]
    fn close_ends_queues_and_refuses_new_ones() {
        let registry = Registry::new();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        registry.register(Channel, Bytes::from("k"), sender).unwrap();

        registry.close();

        assert!(matches!(
            receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        let (sender, _receiver) = mpsc::unbounded_channel();
        assert!(matches!(
            registry.register(Channel, Bytes::from("k"), sender),
            Err(Error::Closed)
        ));
    }
}
