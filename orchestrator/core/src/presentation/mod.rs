// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`reconcile-gate-core`)
//!
//! HTTP surface. **No admission logic lives here**: the middleware only maps
//! requests to principals and limiter outcomes to responses.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`rate_limit`] | HTTP (Axum) | Per-client-IP rate limiting middleware |

pub mod rate_limit;

pub use rate_limit::{rate_limit_middleware, PrincipalExtractor, RateLimitLayerState};
