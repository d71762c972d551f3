// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{borrow::Cow, future::Future, time::Duration};

use crate::error::LockError;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

/// `Store` is a trait that abstracts the backend specific details of the
/// shared key-value store the locks live in.
///
/// Every operation is a single round trip; [Store::execute] must run the
/// whole script atomically with respect to every other operation on the
/// same store.
pub trait Store {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, LockError>> + Send;

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), LockError>> + Send;

    /// Store `value` under `key` only if the key does not exist yet.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Reset the time to live of an existing key. Returns `false` when the
    /// key does not exist.
    fn expire(&self, key: &str, ttl: Duration)
    -> impl Future<Output = Result<bool, LockError>> + Send;

    fn add_to_set(
        &self,
        set: &str,
        member: &str,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    fn execute(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[&str],
    ) -> impl Future<Output = Result<i64, LockError>> + Send;
}

/// Which contract a [Script] fulfils.
///
/// Stores that can evaluate script source run [Script::source]; stores that
/// cannot, such as [memory::MemoryStore], implement the contract natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// `KEYS = [lock, tracking set]`, `ARGV = [token]`. Deletes the lock and
    /// untracks it when the stored token matches. Returns 1 or 0.
    Release,
    /// `KEYS = [tracking set]`, `ARGV = [ttl in milliseconds]`. Extends every
    /// tracked key and drops members that no longer exist. Returns the number
    /// of keys renewed.
    Renew,
}

const RELEASE_SOURCE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    redis.call('SREM', KEYS[2], KEYS[1])
    return 1
end
return 0
"#;

const RENEW_SOURCE: &str = r#"
local renewed = 0
for _, key in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    if redis.call('PEXPIRE', key, ARGV[1]) == 1 then
        renewed = renewed + 1
    else
        redis.call('SREM', KEYS[1], key)
    end
end
return renewed
"#;

/// A server side script evaluated atomically by a [Store].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    kind: ScriptKind,
    source: Cow<'static, str>,
}

impl Script {
    pub fn new(kind: ScriptKind, source: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn release() -> Self {
        Self::new(ScriptKind::Release, RELEASE_SOURCE)
    }

    pub fn renew() -> Self {
        Self::new(ScriptKind::Renew, RENEW_SOURCE)
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// The scripts a [LockManager](crate::LockManager) and its
/// [RenewalDaemon](crate::RenewalDaemon) run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scripts {
    pub release: Script,
    pub renew: Script,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            release: Script::release(),
            renew: Script::renew(),
        }
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}
