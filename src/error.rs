// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::error::Error;

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum LockError {
    /// The backing store failed or could not be reached.
    #[error("store error: {0}")]
    Store(Box<dyn Error + Send + Sync>),

    /// The store answered with something the caller did not expect.
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The lock could not be taken within the configured attempts.
    #[error("lock {0} could not be acquired")]
    Unavailable(String),
}

impl LockError {
    pub fn store(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        LockError::Store(error.into())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for LockError {
    fn from(error: redis::RedisError) -> Self {
        LockError::Store(Box::new(error))
    }
}
