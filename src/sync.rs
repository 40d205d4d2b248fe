// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The transfer table, registry cache and selection state are all plain
//! `std::sync::RwLock`s held for a handful of instructions. A panic in one
//! transfer task must not take the whole manager down, so a poisoned lock is
//! logged and its data recovered instead of propagating the panic.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning.
#[inline]
pub fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelstash::sync",
                "RwLock poisoned during read; a task panicked while holding it. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning.
#[inline]
pub fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelstash::sync",
                "RwLock poisoned during write; a task panicked while holding it. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}
