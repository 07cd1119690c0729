// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Claim and resource data structures.
//!
//! A [`Claim`] is the durable record that one client was granted one unit of a
//! [`Resource`]. Claims travel through every transport as a flat string map
//! (see [`Claim::to_fields`]) so the same parser guards all bindings.
//!
//! # Example
//!
//! ```
//! use claim_engine::Claim;
//!
//! let claim = Claim::new(42, 7, 1001);
//! let fields = claim.to_field_map();
//! let parsed = Claim::from_fields(&fields).unwrap();
//! assert_eq!(parsed, claim);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FIELD_CLAIM_ID: &str = "claim_id";
pub const FIELD_RESOURCE_ID: &str = "resource_id";
pub const FIELD_CLIENT_ID: &str = "client_id";
pub const FIELD_CREATED_AT: &str = "created_at";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimParseError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' is not a valid integer: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("invalid claim JSON: {0}")]
    Json(String),
}

/// A durable record that one client holds one unit of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Unique, monotonically increasing id from [`crate::IdGenerator`]
    pub claim_id: u64,
    pub resource_id: u64,
    pub client_id: u64,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
}

impl Claim {
    pub fn new(claim_id: u64, resource_id: u64, client_id: u64) -> Self {
        Self {
            claim_id,
            resource_id,
            client_id,
            created_at: now_millis(),
        }
    }

    /// Field/value pairs for append-log transports.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_CLAIM_ID.to_string(), self.claim_id.to_string()),
            (FIELD_RESOURCE_ID.to_string(), self.resource_id.to_string()),
            (FIELD_CLIENT_ID.to_string(), self.client_id.to_string()),
            (FIELD_CREATED_AT.to_string(), self.created_at.to_string()),
        ]
    }

    pub fn to_field_map(&self) -> BTreeMap<String, String> {
        self.to_fields().into_iter().collect()
    }

    /// Parse a claim from transport fields. Unknown fields are ignored;
    /// every known field is required, none is defaulted.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, ClaimParseError> {
        let claim_id = required(fields, FIELD_CLAIM_ID)?;
        let resource_id = required(fields, FIELD_RESOURCE_ID)?;
        let client_id = required(fields, FIELD_CLIENT_ID)?;
        let created_at = required(fields, FIELD_CREATED_AT)?;

        Ok(Self {
            claim_id,
            resource_id,
            client_id,
            created_at,
        })
    }

    /// JSON body used by the broker binding.
    pub fn to_json(&self) -> Vec<u8> {
        // A map of strings cannot fail to serialize.
        serde_json::to_vec(&self.to_field_map()).unwrap_or_default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ClaimParseError> {
        let fields: BTreeMap<String, String> =
            serde_json::from_slice(bytes).map_err(|e| ClaimParseError::Json(e.to_string()))?;
        Self::from_fields(&fields)
    }
}

fn required<T: std::str::FromStr>(fields: &BTreeMap<String, String>, field: &'static str) -> Result<T, ClaimParseError> {
    let raw = fields.get(field).ok_or(ClaimParseError::MissingField(field))?;
    raw.trim().parse::<T>().map_err(|_| ClaimParseError::InvalidNumber {
        field,
        value: raw.clone(),
    })
}

/// The scarce item clients race for (e.g. a flash-sale voucher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: u64,
    pub title: String,
    /// Units left; never negative
    pub stock: u32,
    /// Sale window start (epoch millis, 0 = unbounded)
    pub window_start: i64,
    /// Sale window end (epoch millis, 0 = unbounded)
    pub window_end: i64,
}

impl Resource {
    pub fn new(resource_id: u64, title: impl Into<String>, stock: u32) -> Self {
        Self {
            resource_id,
            title: title.into(),
            stock,
            window_start: 0,
            window_end: 0,
        }
    }

    #[must_use]
    pub fn with_window(mut self, start_ms: i64, end_ms: i64) -> Self {
        self.window_start = start_ms;
        self.window_end = end_ms;
        self
    }

    /// Whether `now_ms` falls inside the sale window.
    #[must_use]
    pub fn is_open(&self, now_ms: i64) -> bool {
        let started = self.window_start <= 0 || now_ms >= self.window_start;
        let not_ended = self.window_end <= 0 || now_ms <= self.window_end;
        started && not_ended
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
