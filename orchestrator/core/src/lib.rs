// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `reconcile-gate-core` — Admission Primitives
//!
//! Building blocks consulted before a workflow event is reconciled.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | Object identity, image references, lookup errors, gate configuration |
//! | [`infrastructure`] | Infrastructure | Rate limiter, image index, registry client, keychain, telemetry |
//! | [`presentation`] | Presentation | Axum rate-limit middleware |

pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
