// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{collections::HashMap, time::Duration};

use bon::Builder;
use config::{Config, Environment};
use serde::Deserialize;

use crate::error::LockError;

pub const DEFAULT_LEASE_SECS: u64 = 60;
pub const DEFAULT_TRACKING_SET: &str = "LOCK-KEYS";

const ENV_PREFIX: &str = "RELOCK";

/// Tunables shared by the [LockManager](crate::LockManager) and the
/// [RenewalDaemon](crate::RenewalDaemon).
#[derive(Builder, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Lease given to a lock on acquisition and on every renewal.
    #[builder(default = DEFAULT_LEASE_SECS)]
    pub lease_secs: u64,

    /// Pause between attempts of a timed acquisition.
    #[builder(default = 50)]
    pub spin_interval_ms: u64,

    /// Attempts made by a timed acquisition, including the first one.
    #[builder(default = 3)]
    pub max_attempts: u32,

    #[builder(default = 20)]
    pub renewal_period_secs: u64,

    #[builder(default = 5)]
    pub renewal_initial_delay_secs: u64,

    /// Store set listing every lock this process handed out.
    #[builder(default = DEFAULT_TRACKING_SET.to_string(), into)]
    pub tracking_set: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LockConfig {
    /// Read `RELOCK_*` environment variables on top of the defaults, for
    /// example `RELOCK_LEASE_SECS=30`.
    pub fn from_env() -> Result<Self, LockError> {
        Self::load(Environment::with_prefix(ENV_PREFIX))
    }

    /// Same as [LockConfig::from_env] with an explicit variable map.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, LockError> {
        Self::load(Environment::with_prefix(ENV_PREFIX).source(Some(vars)))
    }

    fn load(environment: Environment) -> Result<Self, LockError> {
        let config: Self = Config::builder()
            .add_source(environment.try_parsing(true))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| LockError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LockError> {
        if self.lease_secs == 0 {
            return Err(LockError::Config("lease_secs must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(LockError::Config("max_attempts must be positive".into()));
        }
        if self.renewal_period_secs == 0 {
            return Err(LockError::Config(
                "renewal_period_secs must be positive".into(),
            ));
        }
        if self.renewal_period_secs >= self.lease_secs {
            return Err(LockError::Config(format!(
                "renewal_period_secs ({}) must be shorter than lease_secs ({})",
                self.renewal_period_secs, self.lease_secs
            )));
        }
        if self.tracking_set.is_empty() {
            return Err(LockError::Config("tracking_set must not be empty".into()));
        }
        Ok(())
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn spin_interval(&self) -> Duration {
        Duration::from_millis(self.spin_interval_ms)
    }

    pub fn renewal_period(&self) -> Duration {
        Duration::from_secs(self.renewal_period_secs)
    }

    pub fn renewal_initial_delay(&self) -> Duration {
        Duration::from_secs(self.renewal_initial_delay_secs)
    }
}
