// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    error::LockError,
    providers::{Script, ScriptKind, Store},
};

/// In-process [Store] for tests and single process deployments.
///
/// Expiry is lazy and measured on the [tokio] clock, so a paused test runtime
/// controls it. Scripts are not interpreted; their [ScriptKind] contract is
/// implemented natively while holding the store lock, which makes them atomic
/// relative to every other operation on the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, Entry>,
    sets: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl State {
    fn entry(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self
            .values
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    fn release(&mut self, keys: &[&str], args: &[&str]) -> Result<i64, LockError> {
        let ([lock, tracking], [token]) = (keys, args) else {
            return Err(arity(ScriptKind::Release, keys, args));
        };

        let owned = self
            .entry(lock, Instant::now())
            .is_some_and(|entry| entry.value == *token);
        if !owned {
            return Ok(0);
        }

        self.values.remove(*lock);
        if let Some(members) = self.sets.get_mut(*tracking) {
            members.remove(*lock);
        }
        Ok(1)
    }

    fn renew(&mut self, keys: &[&str], args: &[&str]) -> Result<i64, LockError> {
        let ([tracking], [ttl]) = (keys, args) else {
            return Err(arity(ScriptKind::Renew, keys, args));
        };
        let ttl = ttl
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| LockError::store(format!("invalid renew ttl {ttl:?}: {e}")))?;

        let members: Vec<String> = self
            .sets
            .get(*tracking)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();

        let now = Instant::now();
        let mut renewed = 0;
        for member in members {
            match self.entry(&member, now) {
                Some(entry) => {
                    entry.expires_at = deadline(now, ttl);
                    renewed += 1;
                }
                None => {
                    if let Some(members) = self.sets.get_mut(*tracking) {
                        members.remove(&member);
                    }
                }
            }
        }
        Ok(renewed)
    }
}

/// Leases too long to represent never expire in practice.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn arity(kind: ScriptKind, keys: &[&str], args: &[&str]) -> LockError {
    LockError::store(format!(
        "{kind:?} script called with {} keys and {} args",
        keys.len(),
        args.len()
    ))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remaining time to live of `key`, if it exists.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.state()
            .entry(key, now)
            .map(|entry| entry.expires_at - now)
    }

    /// Drop `key` as if its lease had run out. Set membership is untouched.
    pub fn force_expire(&self, key: &str) -> bool {
        self.state().values.remove(key).is_some()
    }

    pub fn members(&self, set: &str) -> Vec<String> {
        self.state()
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        Ok(self
            .state()
            .entry(key, Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LockError> {
        self.state().values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(Instant::now(), ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut state = self.state();
        if state.entry(key, now).is_some() {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(now, ttl),
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        Ok(match self.state().entry(key, now) {
            Some(entry) => {
                entry.expires_at = deadline(now, ttl);
                true
            }
            None => false,
        })
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<bool, LockError> {
        Ok(self
            .state()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn execute(&self, script: &Script, keys: &[&str], args: &[&str]) -> Result<i64, LockError> {
        let mut state = self.state();
        match script.kind() {
            ScriptKind::Release => state.release(keys, args),
            ScriptKind::Renew => state.renew(keys, args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_existing_entry() {
        let store = MemoryStore::new();

        assert!(store.set_if_absent("key", "a", TTL).await.unwrap());
        assert!(!store.set_if_absent("key", "b", TTL).await.unwrap());
        assert_eq!(store.get("key").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let store = MemoryStore::new();
        store.set("key", "a", TTL).await.unwrap();

        tokio::time::advance(TTL).await;

        assert_eq!(store.get("key").await.unwrap(), None);
        assert!(!store.expire("key", TTL).await.unwrap());
        assert!(store.set_if_absent("key", "b", TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_extends_ttl() {
        let store = MemoryStore::new();
        store.set("key", "a", TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.expire("key", TTL).await.unwrap());

        assert_eq!(store.ttl("key"), Some(TTL));
    }

    #[tokio::test(start_paused = true)]
    async fn release_script_only_deletes_matching_token() {
        let store = MemoryStore::new();
        let script = Script::release();
        store.set("key", "owner", TTL).await.unwrap();
        store.add_to_set("tracked", "key").await.unwrap();

        let result = store
            .execute(&script, &["key", "tracked"], &["intruder"])
            .await
            .unwrap();
        assert_eq!(result, 0);
        assert_eq!(store.get("key").await.unwrap().as_deref(), Some("owner"));
        assert_eq!(store.members("tracked"), vec!["key".to_string()]);

        let result = store
            .execute(&script, &["key", "tracked"], &["owner"])
            .await
            .unwrap();
        assert_eq!(result, 1);
        assert_eq!(store.get("key").await.unwrap(), None);
        assert!(store.members("tracked").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_script_extends_members_and_prunes_missing() {
        let store = MemoryStore::new();
        store.set("live", "a", Duration::from_secs(1)).await.unwrap();
        store.add_to_set("tracked", "live").await.unwrap();
        store.add_to_set("tracked", "gone").await.unwrap();

        let renewed = store
            .execute(&Script::renew(), &["tracked"], &["60000"])
            .await
            .unwrap();

        assert_eq!(renewed, 1);
        assert_eq!(store.ttl("live"), Some(Duration::from_secs(60)));
        assert_eq!(store.members("tracked"), vec!["live".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_ttls_saturate() {
        let store = MemoryStore::new();

        assert!(store.set_if_absent("key", "a", Duration::MAX).await.unwrap());
        assert!(store.ttl("key").is_some_and(|ttl| ttl >= FAR_FUTURE));

        assert!(store.expire("key", Duration::MAX).await.unwrap());
        store.set("other", "b", Duration::MAX).await.unwrap();
        store.add_to_set("tracked", "key").await.unwrap();
        let forever = u64::MAX.to_string();
        let renewed = store
            .execute(&Script::renew(), &["tracked"], &[forever.as_str()])
            .await
            .unwrap();

        assert_eq!(renewed, 1);
        assert!(store.ttl("key").is_some());
        assert!(store.ttl("other").is_some());
    }

    #[tokio::test]
    async fn scripts_reject_wrong_arity() {
        let store = MemoryStore::new();

        let error = store
            .execute(&Script::release(), &["key"], &["token"])
            .await
            .unwrap_err();
        assert!(matches!(error, LockError::Store(_)));

        let error = store
            .execute(&Script::renew(), &["tracked"], &["soon"])
            .await
            .unwrap_err();
        assert!(matches!(error, LockError::Store(_)));
    }
}
