//! In-process quota store.
//!
//! Same contract as the Redis store, backed by a mutex-guarded map with lazy
//! expiry against an injected clock. Shared by every worker in one process
//! (tests, single-node dev runs); it does not coordinate across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enrich_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::store::{epoch_secs, QuotaStore, WindowDecision};

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Text(String),
    /// (score, member) pairs.
    Window(Vec<(f64, String)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory [`QuotaStore`].
#[derive(Debug)]
pub struct MemoryQuotaStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl MemoryQuotaStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulates a store outage: every call fails with [`Error::Store`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Absolute expiry of a live key, for tests.
    pub fn expiry_of(&self, key: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        live(&mut entries, key, now).and_then(|e| e.expires_at)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::store("quota store offline"))
        } else {
            Ok(())
        }
    }
}

/// Returns the entry for `key` unless it has expired, evicting it if so.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    let expired = entries
        .get(key)
        .and_then(|e| e.expires_at)
        .is_some_and(|at| at <= now);
    if expired {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str) -> Error {
    Error::store(format!("WRONGTYPE operation against key {}", key))
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn get_count(&self, key: &str) -> Result<u64> {
        self.check_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match live(&mut entries, key, now).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Counter(n)) => Ok(*n),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn incr_expire_at(&self, key: &str, expire_at: DateTime<Utc>) -> Result<u64> {
        self.check_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if let Some(entry) = live(&mut entries, key, now) {
            return match &mut entry.value {
                Value::Counter(n) => {
                    *n += 1;
                    if entry.expires_at.is_none() {
                        entry.expires_at = Some(expire_at);
                    }
                    Ok(*n)
                }
                _ => Err(wrong_type(key)),
            };
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Counter(1),
                expires_at: Some(expire_at),
            },
        );
        Ok(1)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::store(format!("invalid ttl: {}", e)))?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if live(&mut entries, key, now).is_none() {
            return Ok(false);
        }
        Ok(entries.remove(key).is_some())
    }

    async fn delete_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        self.check_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        let owned = matches!(
            live(&mut entries, key, now).map(|e| &e.value),
            Some(Value::Text(current)) if current == value
        );
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u64,
        member: &str,
    ) -> Result<WindowDecision> {
        self.check_online()?;
        let store_now = self.clock.now();
        let mut entries = self.entries.lock();

        let score = epoch_secs(now);
        let cutoff = score - window.as_secs_f64();
        let ttl = chrono::Duration::from_std(window * 2)
            .map_err(|e| Error::store(format!("invalid window: {}", e)))?;

        // Evict first so the entry below is either live or fresh
        let _ = live(&mut entries, key, store_now);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Window(Vec::new()),
            expires_at: None,
        });

        let Value::Window(members) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        members.retain(|(s, _)| *s > cutoff);
        let count = members.len() as u64;
        let admitted = count < limit;
        if admitted {
            members.retain(|(_, m)| m != member);
            members.push((score, member.to_string()));
            entry.expires_at = Some(store_now + ttl);
        }

        Ok(WindowDecision { admitted, count })
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check_online()?;
        let expires_at = match ttl {
            Some(ttl) => Some(
                self.clock.now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| Error::store(format!("invalid ttl: {}", e)))?,
            ),
            None => None,
        };
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_online()?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match live(&mut entries, key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(Value::Counter(n)) => Ok(Some(n.to_string())),
            Some(Value::Window(_)) => Err(wrong_type(key)),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}
