// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain types shared by the admission components. No I/O.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`identity`] | `Uid`, `ResourceVersion`, `ObjectIdentity`, `Principal` |
//! | [`image`] | `ImageReference`, `ImageConfig`, `ImageCommand`, `Platform` |
//! | [`registry`] | `ImageConfigSource`, `ImageLookupError`, `ErrorClass` |
//! | [`gate_config`] | `GateConfigManifest` and its sections |

pub mod gate_config;
pub mod identity;
pub mod image;
pub mod registry;
