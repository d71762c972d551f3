// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! Naming helpers for lock keys.

use std::fmt::Display;

pub const DEVICE_LOCK: &str = "DEVICE-LOCK";
pub const REMOTE_LOCK: &str = "REMOTE-LOCK";

/// Build the key `<category>:<id>`.
pub fn lock_key(category: &str, id: impl Display) -> String {
    format!("{category}:{id}")
}

pub fn device_key(id: impl Display) -> String {
    lock_key(DEVICE_LOCK, id)
}

pub fn remote_key(id: impl Display) -> String {
    lock_key(REMOTE_LOCK, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(device_key("1000"), "DEVICE-LOCK:1000");
        assert_eq!(remote_key(42), "REMOTE-LOCK:42");
        assert_eq!(lock_key("ORDER", "a-1"), "ORDER:a-1");
    }
}
