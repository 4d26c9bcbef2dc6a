//! In-memory broker for tests and single-node runs.
//!
//! All state sits behind one mutex; blocking pops park on per-key wakers and
//! pub/sub rides on broadcast channels. Key TTLs are honored lazily, on the
//! next access.

use crate::{Broker, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio_stream::wrappers::BroadcastStream;

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, BTreeSet<(i64, String)>>,
    strings: HashMap<String, String>,
    deadlines: HashMap<String, Instant>,
}

impl State {
    fn purge_if_expired(&mut self, key: &str) {
        let expired = self
            .deadlines
            .get(key)
            .is_some_and(|deadline| Instant::now() >= *deadline);
        if expired {
            self.deadlines.remove(key);
            self.lists.remove(key);
            self.hashes.remove(key);
            self.zsets.remove(key);
            self.strings.remove(key);
        }
    }
}

/// A [`Broker`] backed by process-local state.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    wakers: Mutex<HashMap<String, Arc<Notify>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn waker(&self, key: &str) -> Arc<Notify> {
        self.wakers
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    fn pop_front_now(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        state.lists.get_mut(key).and_then(VecDeque::pop_front)
    }
}

fn slice_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let resolve = |idx: isize| -> isize {
        if idx < 0 {
            len as isize + idx
        } else {
            idx
        }
    };
    let start = resolve(start).max(0) as usize;
    let stop = resolve(stop);
    if stop < 0 {
        return None;
    }
    let stop = (stop as usize).min(len.saturating_sub(1));
    if start > stop || len == 0 {
        return None;
    }
    Some((start, stop))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push_back(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.purge_if_expired(key);
            state
                .lists
                .entry(key.to_string())
                .or_default()
                .push_back(value.to_string());
        }
        self.waker(key).notify_one();
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>> {
        Ok(self.pop_front_now(key))
    }

    async fn blocking_pop_front(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.pop_front_now(key) {
                return Ok(Some(value));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let waker = self.waker(key);
            tokio::select! {
                _ = waker.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = slice_bounds(list.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(list.iter().skip(start).take(stop - start + 1).cloned().collect())
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_set_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        Ok(state
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current = hash.get(field).map(String::as_str);
        if current == expected {
            hash.insert(field.to_string(), new.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        let zset = state.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        zset.insert((score, member.to_string()));
        Ok(())
    }

    async fn zset_pop_due(&self, key: &str, max_score: i64) -> Result<Option<(String, i64)>> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(None);
        };
        let due = zset
            .iter()
            .next()
            .filter(|(score, _)| *score <= max_score)
            .cloned();
        if let Some(entry) = due {
            zset.remove(&entry);
            return Ok(Some((entry.1, entry.0)));
        }
        Ok(None)
    }

    async fn zset_peek_score(&self, key: &str) -> Result<Option<i64>> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        Ok(state
            .zsets
            .get(key)
            .and_then(|zset| zset.iter().next().map(|(score, _)| *score)))
    }

    async fn zset_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        let Some(zset) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = slice_bounds(zset.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(zset
            .iter()
            .skip(start)
            .take(stop - start + 1)
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        if let Some(zset) = state.zsets.get_mut(key) {
            zset.retain(|(_, m)| m != member);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), value.to_string());
        state.deadlines.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.deadlines.remove(key);
        state.lists.remove(key);
        state.hashes.remove(key);
        state.zsets.remove(key);
        state.strings.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        Ok(state.lists.contains_key(key)
            || state.hashes.contains_key(key)
            || state.zsets.contains_key(key)
            || state.strings.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.purge_if_expired(key);
        state.deadlines.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // A send error only means nobody is subscribed.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let receiver = self.sender(channel).subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|msg| async move { msg.ok() });
        Ok(stream.boxed())
    }
}
