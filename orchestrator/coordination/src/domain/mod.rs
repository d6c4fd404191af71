// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordination Domain Layer
//!
//! In-memory coordination primitives. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`key_lock`] | `KeyLock`, `KeyLockGuard` |
//! | [`resource_latch`] | `ResourceLatch` |

pub mod key_lock;
pub mod resource_latch;

pub use key_lock::{KeyLock, KeyLockGuard};
pub use resource_latch::ResourceLatch;
