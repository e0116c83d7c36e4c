// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local mirror storage.
//!
//! - [`sql`]: durable mirror on SQLite or MySQL (sqlx `Any` driver)
//! - [`memory`]: map-backed mirror for tests and embedded use
//! - [`query`]: composable task predicates, translated to SQL by [`sql_translator`]

pub mod traits;
pub mod memory;
pub mod sql;
pub mod query;
pub mod sql_translator;
