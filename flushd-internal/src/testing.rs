#![cfg(test)]
//! In-memory collaborators for tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::backend::{AuthorizeResponse, UsageBackend};
use crate::credentials::Credentials;
use crate::error::{Error, ErrorDetails};
use crate::kv_store::{KeyValueStore, MessageStream, PubSubMessage, Subscriber};
use crate::storage::Usage;

/// Failures to inject into a [`MemoryStore`].
#[derive(Debug, Default)]
pub struct Faults {
    pub fail_scard: bool,
    pub fail_smembers: bool,
    /// Renames whose source is in this set fail, along with the rest of their batch.
    pub failing_renames: HashSet<String>,
    /// Reads of any key containing one of these fail, along with the rest of their batch.
    pub failing_reads: Vec<String>,
    /// Number of upcoming deletes that fail.
    pub fail_deletes: usize,
    pub fail_writes: bool,
    /// Number of upcoming publishes that fail.
    pub fail_publishes: usize,
    /// Number of upcoming subscribe calls that fail.
    pub fail_subscribes: usize,
}

#[derive(Debug, Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    ttls: HashMap<String, Duration>,
    commands: Vec<&'static str>,
    published: Vec<PubSubMessage>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    pubsub: broadcast::Sender<PubSubMessage>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults::default()),
            pubsub,
        }
    }

    pub fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, command: &'static str) -> MutexGuard<'_, State> {
        let mut state = self.state();
        state.commands.push(command);
        state
    }

    pub fn hash(&self, key: &str) -> HashMap<String, String> {
        self.state().hashes.get(key).cloned().unwrap_or_default()
    }

    pub fn set_members(&self, key: &str) -> Vec<String> {
        self.state()
            .sets
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.state().ttls.get(key).copied()
    }

    /// Every existing key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let state = self.state();
        let mut keys: Vec<String> = state
            .hashes
            .keys()
            .chain(state.sets.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn command_count(&self, command: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| **c == command)
            .count()
    }

    pub fn published(&self) -> Vec<PubSubMessage> {
        self.state().published.clone()
    }

    /// Deliver `payload` to subscribers without recording it as published by the daemon.
    pub fn send(&self, channel: &str, payload: &str) {
        let _ = self.pubsub.send(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
    }

    fn failure(command: &str) -> Error {
        Error::new_without_logging(ErrorDetails::StoreUnavailable {
            message: format!("{command} failed: injected failure"),
        })
    }
}

fn rename_key(state: &mut State, from: &str, to: &str) -> bool {
    let mut renamed = false;
    if let Some(hash) = state.hashes.remove(from) {
        state.hashes.insert(to.to_string(), hash);
        renamed = true;
    }
    if let Some(set) = state.sets.remove(from) {
        state.sets.insert(to.to_string(), set);
        renamed = true;
    }
    if let Some(ttl) = state.ttls.remove(from) {
        state.ttls.insert(to.to_string(), ttl);
    }
    renamed
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn hincrby_many(&self, key: &str, fields: &[(String, i64)]) -> Result<(), Error> {
        if self.faults().fail_writes {
            return Err(Self::failure("HINCRBY"));
        }
        let mut state = self.record("HINCRBY");
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, delta) in fields {
            let current: i64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
            hash.insert(field.clone(), (current + delta).to_string());
        }
        Ok(())
    }

    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> Result<(), Error> {
        if self.faults().fail_writes {
            return Err(Self::failure("HSET"));
        }
        let mut state = self.record("HSET");
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, String>>, Error> {
        let failing = {
            let faults = self.faults();
            keys.iter()
                .any(|key| faults.failing_reads.iter().any(|f| key.contains(f.as_str())))
        };
        if failing {
            return Err(Self::failure("HGETALL"));
        }
        let state = self.record("HGETALL");
        Ok(keys
            .iter()
            .map(|key| state.hashes.get(key).cloned().unwrap_or_default())
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), Error> {
        if self.faults().fail_writes {
            return Err(Self::failure("SADD"));
        }
        let mut state = self.record("SADD");
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn scard(&self, key: &str) -> Result<u64, Error> {
        if self.faults().fail_scard {
            return Err(Self::failure("SCARD"));
        }
        let state = self.record("SCARD");
        Ok(state.sets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        if self.faults().fail_smembers {
            return Err(Self::failure("SMEMBERS"));
        }
        let state = self.record("SMEMBERS");
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        if self.faults().failing_renames.contains(from) {
            return Err(Self::failure("RENAME"));
        }
        let mut state = self.record("RENAME");
        if rename_key(&mut state, from, to) {
            Ok(())
        } else {
            Err(Error::new_without_logging(ErrorDetails::StoreUnavailable {
                message: "RENAME failed: no such key".to_string(),
            }))
        }
    }

    async fn rename_many(&self, pairs: &[(String, String)]) -> Result<(), Error> {
        let failing = {
            let faults = self.faults();
            pairs
                .iter()
                .any(|(from, _)| faults.failing_renames.contains(from))
        };
        if failing {
            return Err(Self::failure("RENAME"));
        }
        let mut state = self.record("RENAME");
        for (from, to) in pairs {
            rename_key(&mut state, from, to);
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), Error> {
        {
            let mut faults = self.faults();
            if faults.fail_deletes > 0 {
                faults.fail_deletes -= 1;
                return Err(Self::failure("DEL"));
            }
        }
        let mut state = self.record("DEL");
        for key in keys {
            state.hashes.remove(key);
            state.sets.remove(key);
            state.ttls.remove(key);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        if self.faults().fail_writes {
            return Err(Self::failure("EXPIRE"));
        }
        let mut state = self.record("EXPIRE");
        if state.hashes.contains_key(key) || state.sets.contains_key(key) {
            state.ttls.insert(key.to_string(), ttl);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        {
            let mut faults = self.faults();
            if faults.fail_publishes > 0 {
                faults.fail_publishes -= 1;
                return Err(Self::failure("PUBLISH"));
            }
        }
        let message = PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        self.record("PUBLISH").published.push(message.clone());
        let _ = self.pubsub.send(message);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemoryStore {
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, Error> {
        {
            let mut faults = self.faults();
            if faults.fail_subscribes > 0 {
                faults.fail_subscribes -= 1;
                return Err(Self::failure("SUBSCRIBE"));
            }
        }
        self.record("SUBSCRIBE");
        let channel = channel.to_string();
        let stream = BroadcastStream::new(self.pubsub.subscribe()).filter_map(move |msg| {
            let channel = channel.clone();
            async move { msg.ok().filter(|m| m.channel == channel) }
        });
        Ok(Box::pin(stream))
    }
}

/// A [`UsageBackend`] serving canned responses and recording every call.
#[derive(Default)]
pub struct FakeBackend {
    /// Returned by `authorize`, per service id.
    pub responses: Mutex<HashMap<String, AuthorizeResponse>>,
    /// Returned by `authorize_with_usage`, per predicted metric. Missing metrics succeed.
    pub predicted_responses: Mutex<HashMap<String, AuthorizeResponse>>,
    /// Services whose calls fail with the given error.
    pub failing_services: Mutex<HashMap<String, ErrorDetails>>,
    pub authorize_delay: Mutex<Duration>,
    pub authorize_calls: AtomicUsize,
    pub authorize_with_usage_calls: AtomicUsize,
    pub reports: Mutex<Vec<(String, Credentials, Usage)>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, service_id: &str, response: AuthorizeResponse) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(service_id.to_string(), response);
        self
    }

    pub fn fail_service(&self, service_id: &str, details: ErrorDetails) {
        self.failing_services
            .lock()
            .unwrap()
            .insert(service_id.to_string(), details);
    }

    pub fn authorize_calls(&self) -> usize {
        self.authorize_calls.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<(String, Credentials, Usage)> {
        self.reports.lock().unwrap().clone()
    }

    fn check_failure(&self, service_id: &str) -> Result<(), Error> {
        match self.failing_services.lock().unwrap().get(service_id) {
            Some(details) => Err(Error::new_without_logging(details.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl UsageBackend for FakeBackend {
    async fn authorize(
        &self,
        service_id: &str,
        _credentials: &Credentials,
    ) -> Result<AuthorizeResponse, Error> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.authorize_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_failure(service_id)?;
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(service_id)
            .cloned()
            .unwrap_or(AuthorizeResponse {
                success: true,
                ..Default::default()
            }))
    }

    async fn authorize_with_usage(
        &self,
        service_id: &str,
        _credentials: &Credentials,
        predicted_usage: &Usage,
    ) -> Result<AuthorizeResponse, Error> {
        self.authorize_with_usage_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure(service_id)?;
        let predicted = self.predicted_responses.lock().unwrap();
        Ok(predicted_usage
            .keys()
            .find_map(|metric| predicted.get(metric).cloned())
            .unwrap_or(AuthorizeResponse {
                success: true,
                ..Default::default()
            }))
    }

    async fn report(
        &self,
        service_id: &str,
        credentials: &Credentials,
        usage: &Usage,
    ) -> Result<(), Error> {
        self.check_failure(service_id)?;
        self.reports.lock().unwrap().push((
            service_id.to_string(),
            credentials.clone(),
            usage.clone(),
        ));
        Ok(())
    }
}
