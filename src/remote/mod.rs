// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote system of record.
//!
//! Two capability traits, [`traits::ReadClient`] (bulk snapshot) and
//! [`traits::WriteClient`] (single-entity writes). [`http::HttpRemote`]
//! implements both over HTTP; [`memory::InMemoryRemote`] implements both in
//! process.

pub mod traits;
pub mod wire;
pub mod http;
pub mod memory;
