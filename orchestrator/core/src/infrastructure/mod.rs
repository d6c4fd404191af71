// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod image_index;
pub mod keychain;
pub mod rate_limiter;
pub mod registry;
pub mod telemetry;

pub use image_index::{ImageIndex, LookupContext};
pub use rate_limiter::{Admission, RateLimiter, VisitorBucket};
pub use registry::RegistryClient;
