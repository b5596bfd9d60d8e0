//! Wire-level data model: node documents, requests, dispatch commands, and the
//! header names carried on every message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Raw header values as they travel on the bus: names to byte values, decoded
/// with [`crate::codec`]'s header helpers on demand.
pub type Headers = BTreeMap<String, Vec<u8>>;

/// Staleness and reservation TTL defaults.
pub const STALENESS_THRESHOLD_S: i64 = 30;
pub const RESERVATION_TTL_S: i64 = 30;
pub const MAX_GPU_UTILIZATION: f64 = 0.85;

/// Header keys carried on every bus message.
pub mod headers {
    pub const SCHEMA_VERSION: &str = "arcnet-schema-version";
    pub const ENTITY_TYPE: &str = "arcnet-entity-type";
    pub const RETRY_COUNT: &str = "arcnet-retry-count";
    pub const ORIGINAL_REQUEST_ID: &str = "arcnet-original-request-id";
    pub const FIRST_ATTEMPT_AT: &str = "arcnet-first-attempt-at";
    pub const NEXT_RETRY_AT: &str = "arcnet-next-retry-at";
    pub const LAST_FAILURE_REASON: &str = "arcnet-last-failure-reason";
    pub const REJECTED_AT: &str = "arcnet-rejected-at";
    pub const TOTAL_RETRIES: &str = "arcnet-total-retries";
    pub const REJECTION_REASON: &str = "arcnet-rejection-reason";
    pub const DISPATCHED_AT: &str = "arcnet-dispatched-at";
    pub const ASSIGNED_NODE: &str = "arcnet-assigned-node";
    pub const REQUEST_ID: &str = "arcnet-request-id";
    pub const ORIGINAL_TOPIC: &str = "arcnet-original-topic";
    pub const ERROR: &str = "arcnet-error";
    pub const TRACE_PARENT: &str = "arcnet-trace-parent";
}

/// Topic name helpers, §6.
pub mod topics {
    pub const TELEMETRY: &str = "arc.telemetry.node";
    pub const REQUEST: &str = "arc.request.inference";
    pub const RETRY: &str = "arc.request.retry";
    pub const REJECTED: &str = "arc.request.rejected";

    pub fn dispatch(geozone: &str) -> String {
        format!("arc.command.dispatch.{geozone}")
    }

    pub fn dead_letter(original_topic: &str) -> String {
        format!("dead-letter.{original_topic}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergySource {
    Solar,
    Grid,
    Battery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    Normal,
    Background,
}

/// A node's reservation, active iff `expires_at > now`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub request_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// One physical GPU node, projected from telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDocument {
    pub id: Uuid,
    pub name: String,
    pub geozone: String,
    pub geohash: String,
    pub energy_source: EnergySource,
    pub battery_level: f64,
    pub gpu_utilization: f64,
    pub gpu_memory_free_gb: f64,
    pub gpu_count: u32,
    pub gpu_memory_total_gb: f64,
    pub models_loaded: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
    pub reservation: Option<Reservation>,
}

impl NodeDocument {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_seen).num_seconds() > STALENESS_THRESHOLD_S
    }

    pub fn has_active_reservation(&self, now: DateTime<Utc>) -> bool {
        self.reservation
            .as_ref()
            .map(|r| r.is_active(now))
            .unwrap_or(false)
    }
}

/// Raw telemetry record as it arrives on `arc.telemetry.node`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub node_id: Uuid,
    pub name: String,
    pub geozone: String,
    pub geohash: String,
    pub energy_source: EnergySource,
    pub battery_level: f64,
    pub gpu_utilization: f64,
    pub gpu_memory_free_gb: f64,
    pub gpu_count: u32,
    pub gpu_memory_total_gb: f64,
    pub models_loaded: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
}

/// Recognized inference request schema versions, §3.
pub const REQUEST_SCHEMA_VERSIONS: &[i32] = &[1, 2];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub id: Uuid,
    pub schema_version: i32,
    pub model_id: String,
    pub context_window_tokens: u32,
    pub priority: Priority,
    pub max_latency_ms: u32,
    pub requester_geozone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchCommand {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub node_id: Uuid,
    pub node_geohash: String,
    pub model_id: String,
    pub priority: Priority,
    pub max_latency_ms: u32,
    pub context_window_tokens: u32,
    pub schema_version: i32,
}

impl DispatchCommand {
    pub fn for_request(
        request: &InferenceRequest,
        node: &NodeDocument,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: "inference-dispatch".to_string(),
            timestamp: now,
            request_id: request.id,
            node_id: node.id,
            node_geohash: node.geohash.clone(),
            model_id: request.model_id.clone(),
            priority: request.priority,
            max_latency_ms: request.max_latency_ms,
            context_window_tokens: request.context_window_tokens,
            schema_version: request.schema_version,
        }
    }
}

/// Retry envelope carried entirely in headers, §3/§6. The payload stays the
/// original request bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEnvelope {
    pub retry_count: u32,
    pub original_request_id: Uuid,
    pub first_attempt_at: DateTime<Utc>,
    pub last_failure_reason: String,
    pub next_retry_at: DateTime<Utc>,
}

impl RetryEnvelope {
    pub fn to_headers(&self) -> Headers {
        let mut out = Headers::new();
        out.insert(
            headers::RETRY_COUNT.to_string(),
            self.retry_count.to_be_bytes().to_vec(),
        );
        out.insert(
            headers::ORIGINAL_REQUEST_ID.to_string(),
            self.original_request_id.to_string().into_bytes(),
        );
        out.insert(
            headers::FIRST_ATTEMPT_AT.to_string(),
            self.first_attempt_at.to_rfc3339().into_bytes(),
        );
        out.insert(
            headers::LAST_FAILURE_REASON.to_string(),
            self.last_failure_reason.clone().into_bytes(),
        );
        out.insert(
            headers::NEXT_RETRY_AT.to_string(),
            self.next_retry_at.to_rfc3339().into_bytes(),
        );
        out
    }

    pub fn from_headers(headers: &Headers) -> Option<Self> {
        let retry_count = u32::from_be_bytes(
            headers
                .get(self::headers::RETRY_COUNT)?
                .as_slice()
                .try_into()
                .ok()?,
        );
        let original_request_id =
            Uuid::parse_str(std::str::from_utf8(headers.get(self::headers::ORIGINAL_REQUEST_ID)?).ok()?)
                .ok()?;
        let first_attempt_at = DateTime::parse_from_rfc3339(
            std::str::from_utf8(headers.get(self::headers::FIRST_ATTEMPT_AT)?).ok()?,
        )
        .ok()?
        .with_timezone(&Utc);
        let last_failure_reason =
            String::from_utf8(headers.get(self::headers::LAST_FAILURE_REASON)?.clone()).ok()?;
        let next_retry_at = DateTime::parse_from_rfc3339(
            std::str::from_utf8(headers.get(self::headers::NEXT_RETRY_AT)?).ok()?,
        )
        .ok()?
        .with_timezone(&Utc);

        Some(Self {
            retry_count,
            original_request_id,
            first_attempt_at,
            last_failure_reason,
            next_retry_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedEnvelope {
    pub rejected_at: DateTime<Utc>,
    pub total_retries: u32,
    pub rejection_reason: String,
    pub original_request_id: Uuid,
}

impl RejectedEnvelope {
    pub fn to_headers(&self) -> Headers {
        let mut out = Headers::new();
        out.insert(
            headers::REJECTED_AT.to_string(),
            self.rejected_at.to_rfc3339().into_bytes(),
        );
        out.insert(
            headers::TOTAL_RETRIES.to_string(),
            self.total_retries.to_be_bytes().to_vec(),
        );
        out.insert(
            headers::REJECTION_REASON.to_string(),
            self.rejection_reason.clone().into_bytes(),
        );
        out.insert(
            headers::ORIGINAL_REQUEST_ID.to_string(),
            self.original_request_id.to_string().into_bytes(),
        );
        out
    }
}
