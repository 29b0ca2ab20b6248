use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Error;

/// Command-level view of the shared store used by [`crate::storage::Storage`] and the
/// priority renewer's publisher.
///
/// The `*_many` operations are executed as one batch: either every command in the
/// batch is applied and `Ok` is returned, or the whole batch is reported as failed.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `HINCRBY` each `(field, delta)` of `key`, creating the hash if needed.
    async fn hincrby_many(&self, key: &str, fields: &[(String, i64)]) -> Result<(), Error>;

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), Error>;

    /// Reads every hash in `keys`. Missing keys are returned as empty maps, in the
    /// same position as their key.
    async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>, Error>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), Error>;

    async fn scard(&self, key: &str) -> Result<u64, Error>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), Error>;

    /// Renames every `(from, to)` pair. Pairs whose source does not exist are skipped.
    async fn rename_many(&self, pairs: &[(String, String)]) -> Result<(), Error>;

    async fn del(&self, keys: &[String]) -> Result<(), Error>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = PubSubMessage> + Send>>;

/// Opens an exclusive subscribing session. The stream ends when the session is lost.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, Error>;
}
