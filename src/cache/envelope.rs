// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};

/// Payload plus an advisory expiry, stored as one JSON document.
///
/// ```json
/// {"data": {"id": 1, "name": "Tea House"}, "expire_at": 1767084657058}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalEnvelope<T> {
    pub data: T,
    /// Epoch millis after which the data counts as stale
    pub expire_at: i64,
}

impl<T> LogicalEnvelope<T> {
    pub fn new(data: T, expire_at: i64) -> Self {
        Self { data, expire_at }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_at <= now_ms
    }
}
