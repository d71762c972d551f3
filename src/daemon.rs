// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{sync::Arc, time::Duration};

use bon::Builder;
use tokio::{
    select,
    sync::Notify,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{info, trace, warn};

use crate::{
    config::LockConfig,
    error::LockError,
    providers::{Script, Scripts, Store, millis},
};

/// Periodically extends the lease of every lock in the tracking set.
///
/// Renewal is deliberately coarse: the daemon does not know which context
/// uses which key, so every tracked key gets the full lease each period.
#[derive(Builder, Debug)]
pub struct RenewalDaemon<S>
where
    S: Store,
{
    store: S,
    #[builder(into)]
    tracking_set: String,
    lease: Duration,
    period: Duration,
    #[builder(default)]
    initial_delay: Duration,
    #[builder(default = Script::renew())]
    script: Script,
}

impl<S> RenewalDaemon<S>
where
    S: Store,
{
    pub fn from_config(store: S, config: &LockConfig, scripts: &Scripts) -> Result<Self, LockError> {
        config.validate()?;
        Ok(Self::builder()
            .store(store)
            .tracking_set(config.tracking_set.clone())
            .lease(config.lease())
            .period(config.renewal_period())
            .initial_delay(config.renewal_initial_delay())
            .script(scripts.renew.clone())
            .build())
    }

    /// Run a single renewal pass and return how many keys were extended.
    pub async fn renew_now(&self) -> Result<u64, LockError> {
        let lease = millis(self.lease).to_string();
        let renewed = self
            .store
            .execute(&self.script, &[self.tracking_set.as_str()], &[lease.as_str()])
            .await?;
        u64::try_from(renewed)
            .map_err(|_| LockError::UnexpectedReply(format!("renewed {renewed} keys")))
    }

    /// Start renewing in the background. The first pass runs after the
    /// initial delay, later passes every period.
    ///
    /// The period must be positive and shorter than the lease, otherwise
    /// leases could run out between two passes.
    pub fn spawn(self) -> Result<RenewalHandle, LockError>
    where
        S: Send + Sync + 'static,
    {
        if self.period.is_zero() || self.period >= self.lease {
            return Err(LockError::Config(format!(
                "renewal period {:?} must be positive and shorter than the lease {:?}",
                self.period, self.lease
            )));
        }

        let notify = Arc::new(Notify::new());
        let stop = Arc::clone(&notify);

        let task = tokio::spawn(async move {
            info!(
                "Renewing locks in {} every {:?}",
                self.tracking_set, self.period
            );
            let now = Instant::now();
            let start = now.checked_add(self.initial_delay).unwrap_or(now);
            let mut ticker = interval_at(start, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                select! {
                    _ = ticker.tick() => match self.renew_now().await {
                        Ok(renewed) => trace!("Renewed {} locks in {}", renewed, self.tracking_set),
                        Err(error) => warn!("Renewing locks in {} failed: {}", self.tracking_set, error),
                    },
                    _ = stop.notified() => break,
                }
            }
            info!("Stopped renewing locks in {}", self.tracking_set);
        });

        Ok(RenewalHandle { notify, task })
    }
}

/// Handle to a running [RenewalDaemon].
#[derive(Debug)]
pub struct RenewalHandle {
    notify: Arc<Notify>,
    task: JoinHandle<()>,
}

impl RenewalHandle {
    /// Stop renewing and wait for the background task to finish.
    pub async fn shutdown(self) {
        self.notify.notify_one();
        if let Err(error) = self.task.await {
            warn!("Renewal task ended abnormally: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory::MemoryStore;

    const LEASE: Duration = Duration::from_secs(30);

    fn daemon(store: MemoryStore) -> RenewalDaemon<MemoryStore> {
        RenewalDaemon::builder()
            .store(store)
            .tracking_set("tracked")
            .lease(LEASE)
            .period(Duration::from_secs(10))
            .initial_delay(Duration::from_secs(5))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn renew_now_extends_tracked_keys() {
        let store = MemoryStore::new();
        store.set("a", "x", Duration::from_secs(1)).await.unwrap();
        store.set("b", "y", Duration::from_secs(1)).await.unwrap();
        store.set("untracked", "z", Duration::from_secs(1)).await.unwrap();
        store.add_to_set("tracked", "a").await.unwrap();
        store.add_to_set("tracked", "b").await.unwrap();

        let renewed = daemon(store.clone()).renew_now().await.unwrap();

        assert_eq!(renewed, 2);
        assert_eq!(store.ttl("a"), Some(LEASE));
        assert_eq!(store.ttl("b"), Some(LEASE));
        assert_eq!(store.ttl("untracked"), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_daemon_waits_for_initial_delay() {
        let store = MemoryStore::new();
        store.set("a", "x", Duration::from_secs(8)).await.unwrap();
        store.add_to_set("tracked", "a").await.unwrap();

        let handle = daemon(store.clone()).spawn().expect("should start renewing");

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.ttl("a"), Some(Duration::from_secs(4)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.ttl("a"), Some(LEASE - Duration::from_secs(1)));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_renewal() {
        let store = MemoryStore::new();
        store.set("a", "x", Duration::from_secs(8)).await.unwrap();
        store.add_to_set("tracked", "a").await.unwrap();

        daemon(store.clone())
            .spawn()
            .expect("should start renewing")
            .shutdown()
            .await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(store.ttl("a"), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn spawn_rejects_unusable_periods() {
        let zero = RenewalDaemon::builder()
            .store(MemoryStore::new())
            .tracking_set("tracked")
            .lease(LEASE)
            .period(Duration::ZERO)
            .build();
        assert!(matches!(zero.spawn(), Err(LockError::Config(_))));

        let too_slow = RenewalDaemon::builder()
            .store(MemoryStore::new())
            .tracking_set("tracked")
            .lease(LEASE)
            .period(LEASE)
            .build();
        assert!(matches!(too_slow.spawn(), Err(LockError::Config(_))));
    }

    #[test]
    fn from_config_validates() {
        let config = LockConfig::builder().renewal_period_secs(0).build();
        let result = RenewalDaemon::from_config(MemoryStore::new(), &config, &Scripts::default());
        assert!(matches!(result, Err(LockError::Config(_))));
    }
}
