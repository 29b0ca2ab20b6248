use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use crate::error::{Error, ErrorDetails};
use crate::kv_store::{KeyValueStore, MessageStream, PubSubMessage, Subscriber};

/// Renames KEYS[1] -> KEYS[2], KEYS[3] -> KEYS[4], ... skipping sources that
/// no longer exist. The script runs without interleaving with other clients, so
/// gateways never write to a hash in the middle of its batch.
const RENAME_MANY_SCRIPT: &str = r#"
local renamed = 0
for i = 1, #KEYS, 2 do
    if redis.call('EXISTS', KEYS[i]) == 1 then
        redis.call('RENAME', KEYS[i], KEYS[i + 1])
        renamed = renamed + 1
    end
end
return renamed
"#;

/// A store session over one multiplexed connection.
///
/// Each `RedisStore` owns its own connection: the flusher's storage commands
/// and the priority renewer's publishes use separate instances so a slow
/// batch never delays a response.
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    rename_many_script: Script,
}

impl RedisStore {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let (client, conn) = Self::init_conn(url).await.map_err(|e| {
            tracing::error!("Failed to connect to Redis: {e}");
            e
        })?;
        Ok(Self {
            client,
            conn,
            rename_many_script: Script::new(RENAME_MANY_SCRIPT),
        })
    }

    async fn init_conn(url: &str) -> Result<(redis::Client, MultiplexedConnection), Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new_without_logging(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new_without_logging(ErrorDetails::StoreUnavailable {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;

        Ok((client, conn))
    }

    /// A subscriber opening its own pub/sub session against the same server.
    pub fn subscriber(&self) -> RedisSubscriber {
        RedisSubscriber {
            client: self.client.clone(),
        }
    }
}

fn store_error(command: &str, e: redis::RedisError) -> Error {
    Error::new_without_logging(ErrorDetails::StoreUnavailable {
        message: format!("{command} failed: {e}"),
    })
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn hincrby_many(&self, key: &str, fields: &[(String, i64)]) -> Result<(), Error> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (field, delta) in fields {
            pipe.hincr(key, field, *delta).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("HINCRBY", e))?;
        Ok(())
    }

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), Error> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(|e| store_error("HSET", e))
    }

    async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>, Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hgetall(key);
        }
        pipe.query_async(&mut conn)
            .await
            .map_err(|e| store_error("HGETALL", e))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member)
            .await
            .map_err(|e| store_error("SADD", e))
    }

    async fn scard(&self, key: &str) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        conn.scard(key).await.map_err(|e| store_error("SCARD", e))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        conn.smembers(key)
            .await
            .map_err(|e| store_error("SMEMBERS", e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        conn.rename::<_, _, ()>(from, to)
            .await
            .map_err(|e| store_error("RENAME", e))
    }

    async fn rename_many(&self, pairs: &[(String, String)]) -> Result<(), Error> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut invocation = self.rename_many_script.prepare_invoke();
        for (from, to) in pairs {
            invocation.key(from).key(to);
        }
        let renamed: u64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("RENAME", e))?;
        if renamed < pairs.len() as u64 {
            tracing::debug!(
                requested = pairs.len(),
                renamed,
                "Skipped renaming keys that no longer exist"
            );
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys)
            .await
            .map_err(|e| store_error("DEL", e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("EXPIRE", e))?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| store_error("PUBLISH", e))?;
        Ok(())
    }
}

pub struct RedisSubscriber {
    client: redis::Client,
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, Error> {
        let mut pubsub_conn = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| store_error("Opening pub/sub connection", e))?;

        pubsub_conn
            .subscribe(channel)
            .await
            .map_err(|e| store_error("SUBSCRIBE", e))?;

        let stream = pubsub_conn.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(PubSubMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(e) => {
                    tracing::warn!("Failed to decode pub/sub message: {e}");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
