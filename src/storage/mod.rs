// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage seams and backends.
//!
//! - [`traits::KvStore`] + [`traits::StreamLog`]: the shared in-memory store (Redis)
//! - [`traits::ClaimRecordStore`]: the relational system of record (SQLite / MySQL)
//!
//! [`memory`] provides in-process versions of both for tests and single-node use.

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;
