// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `reconcile-gate-coordination` — Per-Object Coordination
//!
//! Serializes reconciles of the same object and drops events older than what
//! has already been written back.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `KeyLock`, `ResourceLatch` |
//! | [`application`] | Application | `AdmissionService` use-case trait |
//!
//! ## Key Concepts
//!
//! - **KeyLock**: a mutex per key, created on first use and removed when the
//!   last holder or waiter lets go.
//! - **ResourceLatch**: the highest resource version written back per UID.
//! - **Admission**: rate limit, latch check, lock, latch re-check. The
//!   resulting ticket holds the lock for the duration of the reconcile.

pub mod domain;
pub mod application;

pub use domain::*;
