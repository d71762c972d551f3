// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use redis::{Client, aio::ConnectionManager};
use tracing::debug;

use crate::{
    error::LockError,
    providers::{Script, ScriptKind, Store, millis},
};

/// [Redis](redis) backed [Store].
///
/// Scripts are evaluated server side with `EVALSHA`, falling back to `EVAL`
/// the first time a script is seen.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    scripts: Arc<ScriptCache>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

/// Prepared [redis::Script]s keyed by [ScriptKind], so the SHA1 of a script
/// is computed once rather than on every call.
#[derive(Default)]
struct ScriptCache {
    scripts: Mutex<HashMap<ScriptKind, (String, Arc<redis::Script>)>>,
}

impl ScriptCache {
    fn get(&self, script: &Script) -> Arc<redis::Script> {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        match scripts.get(&script.kind()) {
            Some((source, prepared)) if source == script.source() => Arc::clone(prepared),
            _ => {
                let prepared = Arc::new(redis::Script::new(script.source()));
                scripts.insert(
                    script.kind(),
                    (script.source().to_string(), Arc::clone(&prepared)),
                );
                prepared
            }
        }
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        debug!("Connected to redis at {}", url);
        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            scripts: Arc::default(),
        }
    }
}

impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut connection = self.connection.clone();
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LockError> {
        let mut connection = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut connection = self.connection.clone();
        let reply: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut connection)
            .await?;
        Ok(reply == 1)
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<bool, LockError> {
        let mut connection = self.connection.clone();
        let added: i64 = redis::cmd("SADD")
            .arg(set)
            .arg(member)
            .query_async(&mut connection)
            .await?;
        Ok(added == 1)
    }

    async fn execute(&self, script: &Script, keys: &[&str], args: &[&str]) -> Result<i64, LockError> {
        let mut connection = self.connection.clone();
        let script = self.scripts.get(script);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }
        Ok(invocation.invoke_async(&mut connection).await?)
    }
}
