//! The state mirror: a node document store projected from telemetry, with
//! candidate queries and an optimistic per-node reservation protocol.
//!
//! `dashmap` gives per-shard locking for free: every `reserve`/`release`
//! goes through a single entry lookup that holds that shard's lock for the
//! duration of the check-and-set, never across a network call.

use crate::error::StateError;
use crate::model::{NodeDocument, Reservation, TelemetryRecord};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

pub struct StateMirror {
    nodes: DashMap<Uuid, NodeDocument>,
    staleness_threshold: ChronoDuration,
    max_gpu_utilization: f64,
}

impl StateMirror {
    pub fn new(staleness_threshold_s: i64, max_gpu_utilization: f64) -> Self {
        Self {
            nodes: DashMap::new(),
            staleness_threshold: ChronoDuration::seconds(staleness_threshold_s),
            max_gpu_utilization,
        }
    }

    fn is_stale(&self, node: &NodeDocument, now: DateTime<Utc>) -> bool {
        now - node.last_seen > self.staleness_threshold
    }

    /// Projects one telemetry record into the store. Last-writer-wins by
    /// `last_seen`; a record older than what's stored is dropped silently.
    /// The node's reservation, if any, survives a telemetry update untouched
    /// — telemetry never carries reservation state.
    pub fn upsert_telemetry(&self, record: TelemetryRecord) -> bool {
        match self.nodes.entry(record.node_id) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(NodeDocument {
                    id: record.node_id,
                    name: record.name,
                    geozone: record.geozone,
                    geohash: record.geohash,
                    energy_source: record.energy_source,
                    battery_level: record.battery_level,
                    gpu_utilization: record.gpu_utilization,
                    gpu_memory_free_gb: record.gpu_memory_free_gb,
                    gpu_count: record.gpu_count,
                    gpu_memory_total_gb: record.gpu_memory_total_gb,
                    models_loaded: record.models_loaded,
                    last_seen: record.last_seen,
                    reservation: None,
                });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if record.last_seen < existing.last_seen {
                    return false;
                }
                let reservation = existing.reservation.clone();
                slot.insert(NodeDocument {
                    id: record.node_id,
                    name: record.name,
                    geozone: record.geozone,
                    geohash: record.geohash,
                    energy_source: record.energy_source,
                    battery_level: record.battery_level,
                    gpu_utilization: record.gpu_utilization,
                    gpu_memory_free_gb: record.gpu_memory_free_gb,
                    gpu_count: record.gpu_count,
                    gpu_memory_total_gb: record.gpu_memory_total_gb,
                    models_loaded: record.models_loaded,
                    last_seen: record.last_seen,
                    reservation,
                });
                true
            }
        }
    }

    /// Nodes that have the model loaded, aren't overloaded, aren't stale, and
    /// have no active reservation. Ordering is unspecified here; scoring
    /// happens downstream in the scheduler.
    pub fn candidates(&self, model_id: &str, now: DateTime<Utc>) -> Vec<NodeDocument> {
        self.nodes
            .iter()
            .filter(|entry| {
                let node = entry.value();
                node.models_loaded.contains(model_id)
                    && node.gpu_utilization < self.max_gpu_utilization
                    && !self.is_stale(node, now)
                    && !node.has_active_reservation(now)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Optimistic compare-and-set: succeeds only if the node has no active
    /// reservation at the point of write.
    pub fn reserve(
        &self,
        node_id: Uuid,
        request_id: Uuid,
        ttl_s: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let mut slot = self
            .nodes
            .get_mut(&node_id)
            .ok_or(StateError::NotFound(node_id))?;

        if self.is_stale(&slot, now) {
            return Err(StateError::StaleConflict(node_id));
        }

        if slot.has_active_reservation(now) {
            return Err(StateError::AlreadyReserved(node_id));
        }

        slot.reservation = Some(Reservation {
            request_id,
            expires_at: now + ChronoDuration::seconds(ttl_s),
        });
        Ok(())
    }

    /// Clears `reservation` iff the stored `request_id` matches. Idempotent:
    /// calling with a non-matching id, or on an already-unreserved node,
    /// leaves state unchanged.
    pub fn release(&self, node_id: Uuid, request_id: Uuid) {
        if let Some(mut slot) = self.nodes.get_mut(&node_id) {
            let matches = slot
                .reservation
                .as_ref()
                .map(|r| r.request_id == request_id)
                .unwrap_or(false);
            if matches {
                slot.reservation = None;
            }
        }
    }

    pub fn get(&self, node_id: Uuid) -> Option<NodeDocument> {
        self.nodes.get(&node_id).map(|n| n.clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot of all nodes, for operational visibility and tests — not a
    /// query the scheduler itself uses.
    pub fn snapshot(&self) -> Vec<NodeDocument> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }
}
