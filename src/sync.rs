// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The transfer table and per-transfer waiter lists are guarded by
//! `std::sync::RwLock`. A waiter callback that panics while the transfer
//! driver holds a guard would poison the lock and take every later request
//! for that cache down with it. These helpers log the event and recover the
//! guard instead.
//!
//! ```no_run
//! use std::sync::RwLock;
//! use uricache::sync::{resilient_read, resilient_write};
//!
//! let lock = RwLock::new(42);
//! let value = *resilient_read(&lock);
//! *resilient_write(&lock) = value + 1;
//! ```
//!
//! Guards are never held across an `.await`.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "uricache::sync",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition; recovering. \
                 A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "uricache::sync",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition; recovering. \
                 A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}
