// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! A reentrant, lease based distributed lock over a shared key-value store
//!
//! Each execution context (a thread or a task, identified by a [ContextId])
//! may hold one lock at a time. A lock is an entry in the store holding the
//! context's ownership token under a time to live. Acquiring a lock the
//! context already holds nests instead of deadlocking, and only the final,
//! balanced release deletes the entry, and only if the entry still carries
//! the context's token.
//!
//! Locks that outlive their lease are kept alive by a [RenewalDaemon], which
//! extends every lock this process handed out.
//!
//! # Examples
//!
//! ## Manually
//! You are responsible for pairing every successful acquisition with a release.
//! ```rust,no_run
//! use relock::{ContextId, LockManager, MemoryStore, key::device_key};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = LockManager::builder().store(MemoryStore::new()).build();
//!     let daemon = manager.renewal_daemon().unwrap().spawn().unwrap();
//!
//!     let ctx = ContextId::next();
//!     let key = device_key("1000");
//!     if manager.acquire(ctx, &key).await.unwrap() {
//!         // do synchronized work!
//!         manager.release(ctx, &key).await.unwrap();
//!     }
//!
//!     daemon.shutdown().await;
//! }
//! ```
//!
//! ## Scoped
//! [LockManager::with] retries acquisition, runs the closure and releases.
//! ```rust,no_run
//! use relock::{ContextId, LockManager, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = LockManager::builder().store(MemoryStore::new()).build();
//!
//!     let result = manager
//!         .with(ContextId::next(), "REMOTE-LOCK:7", async || {
//!             // do synchronized work!
//!             42
//!         })
//!         .await;
//! }
//! ```

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod key;
pub mod providers;

use bon::Builder;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::{
    context::{ContextState, instance_identity},
    error::LockError,
};

pub use config::LockConfig;
pub use context::ContextId;
pub use daemon::{RenewalDaemon, RenewalHandle};
pub use providers::memory::MemoryStore;
#[cfg(feature = "redis")]
pub use providers::redis::RedisStore;
pub use providers::{Script, ScriptKind, Scripts, Store};

/// Result of a [LockManager::release].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The context did not hold the key, nothing changed.
    NotHeld,
    /// One nested acquisition was undone and the lock is still held.
    Reentered { depth: u32 },
    /// The lock was deleted from the store.
    Released,
    /// The context let go of the lock but the store entry did not carry its
    /// token, so the entry is left to expire on its own.
    Lingering,
}

enum Claim {
    Reentered(u32),
    Vacant(String),
    Conflict(String),
}

enum Attempt {
    Acquired,
    Contended,
    Conflict,
}

#[derive(Builder)]
pub struct LockManager<S>
where
    S: Store,
{
    store: S,
    #[builder(default)]
    config: LockConfig,
    #[builder(default)]
    scripts: Scripts,
    /// Prefix of every ownership token handed out by this manager.
    #[builder(default = instance_identity(), into)]
    instance: String,

    #[builder(skip)]
    contexts: Mutex<HashMap<ContextId, ContextState>>,
}

impl<S> LockManager<S>
where
    S: Store,
{
    /// Attempt to acquire `key` for the configured lease.
    ///
    /// Returns `false` without waiting when another holder owns the key, or
    /// when the context already holds a different key.
    pub async fn acquire(&self, ctx: ContextId, key: &str) -> Result<bool, LockError> {
        self.acquire_for(ctx, key, self.config.lease()).await
    }

    /// Attempt to acquire `key` for `lease`.
    ///
    /// If the context already holds `key` the acquisition nests and the lease
    /// is extended.
    pub async fn acquire_for(
        &self,
        ctx: ContextId,
        key: &str,
        lease: Duration,
    ) -> Result<bool, LockError> {
        Ok(matches!(
            self.attempt(ctx, key, lease).await?,
            Attempt::Acquired
        ))
    }

    /// Acquire `key` using the configured lease, spin interval and attempts.
    pub async fn acquire_with_timeout(
        &self,
        ctx: ContextId,
        key: &str,
    ) -> Result<bool, LockError> {
        self.acquire_with_timeout_for(
            ctx,
            key,
            self.config.lease(),
            self.config.spin_interval(),
            self.config.max_attempts,
        )
        .await
    }

    /// Acquire `key`, trying up to `max_attempts` times and sleeping `spin`
    /// between attempts.
    pub async fn acquire_with_timeout_for(
        &self,
        ctx: ContextId,
        key: &str,
        lease: Duration,
        spin: Duration,
        max_attempts: u32,
    ) -> Result<bool, LockError> {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.attempt(ctx, key, lease).await? {
                Attempt::Acquired => return Ok(true),
                Attempt::Conflict => return Ok(false),
                Attempt::Contended if attempt < attempts => sleep(spin).await,
                Attempt::Contended => {}
            }
        }

        debug!("Giving up on lock {} after {} attempts", key, attempts);
        Ok(false)
    }

    /// Undo one acquisition of `key` by the context.
    ///
    /// Nested acquisitions only decrement the depth. The final release runs
    /// the release script and forgets the lock locally whatever the store
    /// answers, so a failing store can not leave the context locked out.
    pub async fn release(&self, ctx: ContextId, key: &str) -> Result<ReleaseOutcome, LockError> {
        let token = {
            let mut contexts = self.contexts();
            let Some(state) = contexts.get_mut(&ctx).filter(|state| state.key == key) else {
                warn!("Context {} does not hold lock {}", ctx, key);
                return Ok(ReleaseOutcome::NotHeld);
            };

            if state.depth > 0 {
                state.depth -= 1;
                trace!("{} left lock {} at depth {}", state.token, key, state.depth);
                return Ok(ReleaseOutcome::Reentered { depth: state.depth });
            }

            match contexts.remove(&ctx) {
                Some(state) => state.token,
                None => context::token(&self.instance, ctx),
            }
        };

        let deleted = self
            .store
            .execute(
                &self.scripts.release,
                &[key, self.config.tracking_set.as_str()],
                &[token.as_str()],
            )
            .await;

        match deleted {
            Ok(1) => {
                info!("{} released lock {}", token, key);
                Ok(ReleaseOutcome::Released)
            }
            Ok(_) => {
                warn!("{} released lock {} but it was no longer its own", token, key);
                Ok(ReleaseOutcome::Lingering)
            }
            Err(error) => {
                warn!("{} failed to delete lock {}: {}", token, key, error);
                Err(error)
            }
        }
    }

    /// Release whichever lock the context holds.
    pub async fn release_held(&self, ctx: ContextId) -> Result<ReleaseOutcome, LockError> {
        match self.held(ctx) {
            Some((key, _)) => self.release(ctx, &key).await,
            None => {
                warn!("Context {} holds no lock", ctx);
                Ok(ReleaseOutcome::NotHeld)
            }
        }
    }

    /// Execute a closure while holding `key`.
    ///
    /// Acquisition follows [LockManager::acquire_with_timeout]. The lock is
    /// released once the closure completes. A failed release is logged and
    /// does not discard the closure's result: the context no longer holds the
    /// lock and the store entry expires with its lease.
    pub async fn with<R>(
        &self,
        ctx: ContextId,
        key: &str,
        f: impl AsyncFnOnce() -> R,
    ) -> Result<R, LockError> {
        if !self.acquire_with_timeout(ctx, key).await? {
            return Err(LockError::Unavailable(key.to_string()));
        }

        let result = f().await;
        if let Err(error) = self.release(ctx, key).await {
            warn!("Lock {} left to expire after scoped use: {}", key, error);
        }

        Ok(result)
    }

    /// The key the context holds and how deeply it is nested.
    pub fn held(&self, ctx: ContextId) -> Option<(String, u32)> {
        self.contexts()
            .get(&ctx)
            .map(|state| (state.key.clone(), state.depth))
    }

    /// The ownership token the context writes into the store.
    pub fn token(&self, ctx: ContextId) -> String {
        context::token(&self.instance, ctx)
    }

    /// Number of contexts currently holding a lock through this manager.
    pub fn active_contexts(&self) -> usize {
        self.contexts().len()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// A [RenewalDaemon] sharing this manager's store, configuration and
    /// scripts. Fails when the configuration does not validate.
    pub fn renewal_daemon(&self) -> Result<RenewalDaemon<S>, LockError>
    where
        S: Clone,
    {
        RenewalDaemon::from_config(self.store.clone(), &self.config, &self.scripts)
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<ContextId, ContextState>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, ctx: ContextId, key: &str) -> Claim {
        match self.contexts().get_mut(&ctx) {
            Some(state) if state.key == key => {
                state.depth += 1;
                Claim::Reentered(state.depth)
            }
            Some(state) => Claim::Conflict(state.key.clone()),
            None => Claim::Vacant(context::token(&self.instance, ctx)),
        }
    }

    fn unwind(&self, ctx: ContextId, key: &str) {
        if let Some(state) = self
            .contexts()
            .get_mut(&ctx)
            .filter(|state| state.key == key && state.depth > 0)
        {
            state.depth -= 1;
        }
    }

    async fn attempt(&self, ctx: ContextId, key: &str, lease: Duration) -> Result<Attempt, LockError> {
        match self.claim(ctx, key) {
            Claim::Reentered(depth) => {
                match self.store.expire(key, lease).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Lock {} expired while held by context {}", key, ctx),
                    Err(error) => {
                        self.unwind(ctx, key);
                        return Err(error);
                    }
                }
                trace!("Context {} entered lock {} at depth {}", ctx, key, depth);
                Ok(Attempt::Acquired)
            }
            Claim::Conflict(held) => {
                warn!(
                    "Context {} holds lock {} and can not also take {}",
                    ctx, held, key
                );
                Ok(Attempt::Conflict)
            }
            Claim::Vacant(token) => {
                if !self.store.set_if_absent(key, &token, lease).await? {
                    debug!("Acquiring lock {} as {} failed", key, token);
                    return Ok(Attempt::Contended);
                }

                self.contexts()
                    .insert(ctx, ContextState::new(token.clone(), key));
                if let Err(error) = self
                    .store
                    .add_to_set(&self.config.tracking_set, key)
                    .await
                {
                    warn!("Lock {} acquired but will not be renewed: {}", key, error);
                }

                debug!("{} acquired lock {}", token, key);
                Ok(Attempt::Acquired)
            }
        }
    }
}
