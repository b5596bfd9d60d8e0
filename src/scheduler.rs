//! The scheduler: scoring, the schedule algorithm, and the retry/reject
//! state machine, wired up as two long-lived consumer loops — one on the
//! inference request topic, one on the retry topic.
//!
//! Both loops share a bounded-concurrency `try_for_each_concurrent` over a
//! poll batch, atomic counters for observability, and an explicit commit
//! only after every worker in the batch has published successfully — a
//! publish failure anywhere in the batch aborts the commit so the whole
//! batch replays, per §4.5.4's failure table.

use crate::error::TransportError;
use crate::model::{
    self, headers as h, topics, DispatchCommand, Headers, InferenceRequest, RejectedEnvelope,
    RetryEnvelope,
};
use crate::schema::{self, SchemaKey};
use crate::state::StateMirror;
use crate::transport::{ConsumedRecord, Consumer, Producer};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Counters surfaced in logs: validation failures by schema/direction plus
/// the scheduling outcomes they imply.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub dispatched: AtomicU64,
    pub retried: AtomicU64,
    pub rejected: AtomicU64,
    pub reservation_races: AtomicU64,
    pub retry_deferred: AtomicU64,
}

pub struct SchedulerConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub reservation_ttl_s: i64,
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 100,
            reservation_ttl_s: model::RESERVATION_TTL_S,
            max_concurrency: 16,
        }
    }
}

/// Outcome of one `schedule()` attempt.
#[derive(Debug)]
pub enum ScheduleOutcome {
    Success { node: model::NodeDocument },
    NoCandidates,
    ReservationFailed { attempted: usize },
}

/// `score(n)`. Higher is better.
pub fn score(node: &model::NodeDocument, requester_geohash: &str) -> f64 {
    let latency_ms = crate::geo::estimated_latency_ms(requester_geohash, &node.geohash);
    let mut s = 0.0;
    if node.energy_source == model::EnergySource::Solar {
        s += 1.0;
    }
    if node.battery_level > 0.8 {
        s += 0.5;
    }
    s -= 0.2 * (latency_ms / 10.0);
    s -= node.gpu_utilization;
    s
}

/// Top-3 candidates by score, deterministically tie-broken by node id.
pub fn top_candidates(
    mirror: &StateMirror,
    model_id: &str,
    requester_geohash: &str,
    now: DateTime<Utc>,
) -> Vec<(model::NodeDocument, f64)> {
    let mut scored: Vec<(model::NodeDocument, f64)> = mirror
        .candidates(model_id, now)
        .into_iter()
        .map(|n| {
            let s = score(&n, requester_geohash);
            (n, s)
        })
        .collect();

    scored.sort_by(|(a, a_score), (b, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    scored.truncate(3);
    scored
}

/// `schedule()`: pick top-3 candidates, attempt reservation in
/// order, stop on the first success.
pub fn schedule(
    mirror: &StateMirror,
    request: &InferenceRequest,
    now: DateTime<Utc>,
    reservation_ttl_s: i64,
) -> ScheduleOutcome {
    let top = top_candidates(mirror, &request.model_id, &request.requester_geozone, now);
    if top.is_empty() {
        return ScheduleOutcome::NoCandidates;
    }

    let attempted = top.len();
    for (node, _score) in top {
        match mirror.reserve(node.id, request.id, reservation_ttl_s, now) {
            Ok(()) => return ScheduleOutcome::Success { node },
            Err(_) => continue, // lost the compare-and-set; try the next candidate
        }
    }
    ScheduleOutcome::ReservationFailed { attempted }
}

pub struct Scheduler {
    mirror: Arc<StateMirror>,
    config: SchedulerConfig,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(mirror: Arc<StateMirror>, config: SchedulerConfig) -> Self {
        Self {
            mirror,
            config,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Consumes one batch from `consumer`, scheduling each valid inference
    /// request concurrently (bounded by `max_concurrency`), then commits only
    /// if every worker in the batch published successfully. A publish
    /// failure anywhere in the batch (dispatch, retry, or rejection) leaves
    /// the offset uncommitted so the whole batch is replayed.
    pub async fn run_request_batch(
        &self,
        consumer: &mut dyn Consumer,
        dispatch: &DispatchRouter,
        retry_producer: &dyn Producer,
        rejected_producer: &dyn Producer,
        poll_timeout: Duration,
    ) -> Result<usize, crate::error::TransportError> {
        let records = consumer.poll(poll_timeout).await?;
        if records.is_empty() {
            return Ok(0);
        }
        let processed = records.len();

        let mirror = self.mirror.clone();
        let stats = self.stats.clone();
        let config_ttl = self.config.reservation_ttl_s;
        let config_backoff = self.config.base_backoff_ms;
        let config_max_retries = self.config.max_retries;
        let max_concurrency = self.config.max_concurrency;

        stream::iter(records.into_iter().map(Ok::<_, TransportError>))
            .try_for_each_concurrent(max_concurrency, |record| {
                let mirror = mirror.clone();
                let stats = stats.clone();
                async move {
                    let ConsumedRecord::Valid { data, .. } = record else {
                        // Invalid records were already dead-lettered by the consumer
                        // on the way in.
                        return Ok(());
                    };
                    let Ok(request) = serde_json::from_value::<InferenceRequest>(data) else {
                        return Ok(());
                    };
                    let now = Utc::now();
                    let outcome = schedule(&mirror, &request, now, config_ttl);
                    handle_outcome(
                        outcome,
                        &request,
                        /* retry_count */ 0,
                        /* first_attempt_at */ now,
                        now,
                        config_backoff,
                        config_max_retries,
                        &stats,
                        dispatch,
                        retry_producer,
                        rejected_producer,
                    )
                    .await
                }
            })
            .await?;

        consumer.commit().await?;
        Ok(processed)
    }

    /// Consumes one batch from the retry topic. Nothing dispatches before a
    /// record's `next_retry_at`: since the batch must still be committed to
    /// make progress on other records, not-yet-due records are republished
    /// as-is via `send_raw` back onto the retry topic rather than left
    /// uncommitted. As with `run_request_batch`, the offset only commits if
    /// every worker in the batch published successfully.
    pub async fn run_retry_batch(
        &self,
        consumer: &mut dyn Consumer,
        dispatch: &DispatchRouter,
        retry_producer: &dyn Producer,
        rejected_producer: &dyn Producer,
        poll_timeout: Duration,
    ) -> Result<usize, crate::error::TransportError> {
        let records = consumer.poll(poll_timeout).await?;
        if records.is_empty() {
            return Ok(0);
        }
        let processed = records.len();

        let mirror = self.mirror.clone();
        let stats = self.stats.clone();
        let config_ttl = self.config.reservation_ttl_s;
        let config_backoff = self.config.base_backoff_ms;
        let config_max_retries = self.config.max_retries;
        let max_concurrency = self.config.max_concurrency;

        stream::iter(records.into_iter().map(Ok::<_, TransportError>))
            .try_for_each_concurrent(max_concurrency, |record| {
                let mirror = mirror.clone();
                let stats = stats.clone();
                async move {
                    let ConsumedRecord::Valid { data, metadata, .. } = record else {
                        return Ok(());
                    };
                    let Some(envelope) = RetryEnvelope::from_headers(&metadata.headers) else {
                        return Ok(());
                    };
                    let Ok(request) = serde_json::from_value::<InferenceRequest>(data) else {
                        return Ok(());
                    };

                    let now = Utc::now();
                    if envelope.next_retry_at > now {
                        stats.retry_deferred.fetch_add(1, Ordering::Relaxed);
                        let headers = envelope.to_headers();
                        let bytes = crate::codec::encode(&request_payload(&request))?;
                        retry_producer
                            .send_raw(topics::RETRY, None, bytes, headers)
                            .await?;
                        return Ok(());
                    }

                    let outcome = schedule(&mirror, &request, now, config_ttl);
                    handle_outcome(
                        outcome,
                        &request,
                        envelope.retry_count,
                        envelope.first_attempt_at,
                        now,
                        config_backoff,
                        config_max_retries,
                        &stats,
                        dispatch,
                        retry_producer,
                        rejected_producer,
                    )
                    .await
                }
            })
            .await?;

        consumer.commit().await?;
        Ok(processed)
    }
}

/// Resolves `arc.command.dispatch.<geozone>` to the right producer. In
/// production this is a single Kafka producer targeting a computed topic
/// name; kept as a trait object indirection so tests can assert which
/// geozone a dispatch landed on.
pub struct DispatchRouter {
    producer: Arc<dyn Producer>,
}

impl DispatchRouter {
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self { producer }
    }

    /// §6: dispatch headers carry `dispatched_at`, `assigned_node`, and
    /// `request_id` in addition to the schema/entity-type pair every
    /// message gets.
    async fn dispatch(
        &self,
        command: &DispatchCommand,
        geozone: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        let schema_key: SchemaKey = (schema::DISPATCH_COMMAND.to_string(), 1);
        let payload = serde_json::to_value(command).expect("DispatchCommand always serializes");
        let topic = topics::dispatch(geozone);

        let mut extra_headers = Headers::new();
        extra_headers.insert(h::DISPATCHED_AT.to_string(), now.to_rfc3339().into_bytes());
        extra_headers.insert(
            h::ASSIGNED_NODE.to_string(),
            command.node_id.to_string().into_bytes(),
        );
        extra_headers.insert(
            h::REQUEST_ID.to_string(),
            command.request_id.to_string().into_bytes(),
        );

        self.producer
            .send(&topic, &schema_key, payload, None, extra_headers)
            .await
    }
}

fn request_payload(request: &InferenceRequest) -> Value {
    serde_json::to_value(request).expect("InferenceRequest always serializes")
}

#[allow(clippy::too_many_arguments)]
async fn handle_outcome(
    outcome: ScheduleOutcome,
    request: &InferenceRequest,
    retry_count: u32,
    first_attempt_at: DateTime<Utc>,
    now: DateTime<Utc>,
    base_backoff_ms: u64,
    max_retries: u32,
    stats: &SchedulerStats,
    dispatch: &DispatchRouter,
    retry_producer: &dyn Producer,
    rejected_producer: &dyn Producer,
) -> Result<(), TransportError> {
    match outcome {
        ScheduleOutcome::Success { node } => {
            let command = DispatchCommand::for_request(request, &node, now);
            dispatch.dispatch(&command, &node.geozone, now).await?;
            stats.dispatched.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        ScheduleOutcome::NoCandidates => {
            retry_or_reject(
                request,
                retry_count,
                first_attempt_at,
                now,
                base_backoff_ms,
                max_retries,
                "no-candidates",
                stats,
                retry_producer,
                rejected_producer,
            )
            .await
        }
        ScheduleOutcome::ReservationFailed { .. } => {
            stats.reservation_races.fetch_add(1, Ordering::Relaxed);
            retry_or_reject(
                request,
                retry_count,
                first_attempt_at,
                now,
                base_backoff_ms,
                max_retries,
                "reservation-failed",
                stats,
                retry_producer,
                rejected_producer,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn retry_or_reject(
    request: &InferenceRequest,
    retry_count: u32,
    first_attempt_at: DateTime<Utc>,
    now: DateTime<Utc>,
    base_backoff_ms: u64,
    max_retries: u32,
    reason: &str,
    stats: &SchedulerStats,
    retry_producer: &dyn Producer,
    rejected_producer: &dyn Producer,
) -> Result<(), TransportError> {
    if retry_count < max_retries {
        let backoff = ChronoDuration::milliseconds((base_backoff_ms as i64) * 2i64.pow(retry_count));
        let envelope = RetryEnvelope {
            retry_count: retry_count + 1,
            original_request_id: request.id,
            first_attempt_at,
            last_failure_reason: reason.to_string(),
            next_retry_at: now + backoff,
        };
        let headers = envelope.to_headers();
        let bytes = crate::codec::encode(&request_payload(request))?;
        retry_producer
            .send_raw(topics::RETRY, None, bytes, headers)
            .await?;
        stats.retried.fetch_add(1, Ordering::Relaxed);
        Ok(())
    } else {
        let envelope = RejectedEnvelope {
            rejected_at: now,
            total_retries: retry_count,
            rejection_reason: reason.to_string(),
            original_request_id: request.id,
        };
        let headers = envelope.to_headers();
        let bytes = crate::codec::encode(&request_payload(request))?;
        rejected_producer
            .send_raw(topics::REJECTED, None, bytes, headers)
            .await?;
        stats.rejected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnergySource, NodeDocument, Priority, TelemetryRecord};
    use crate::schema::SchemaRegistry;
    use crate::transport::{InMemoryBus, InMemoryConsumer, InMemoryProducer, Record, TransportStats};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    fn telemetry(node_id: Uuid, geozone: &str, geohash: &str) -> TelemetryRecord {
        TelemetryRecord {
            node_id,
            name: "n1".to_string(),
            geozone: geozone.to_string(),
            geohash: geohash.to_string(),
            energy_source: EnergySource::Solar,
            battery_level: 0.9,
            gpu_utilization: 0.10,
            gpu_memory_free_gb: 40.0,
            gpu_count: 8,
            gpu_memory_total_gb: 80.0,
            models_loaded: BTreeSet::from(["llama-70b".to_string()]),
            last_seen: Utc::now(),
        }
    }

    fn request(model_id: &str, requester_geozone: &str) -> InferenceRequest {
        InferenceRequest {
            id: Uuid::new_v4(),
            schema_version: 1,
            model_id: model_id.to_string(),
            context_window_tokens: 4096,
            priority: Priority::Normal,
            max_latency_ms: 500,
            requester_geozone: requester_geozone.to_string(),
        }
    }

    #[test]
    fn score_prefers_solar_high_battery_low_latency_low_utilization() {
        let mut node = NodeDocument {
            id: Uuid::new_v4(),
            name: "n".to_string(),
            geozone: "z".to_string(),
            geohash: "9q8yyk".to_string(),
            energy_source: EnergySource::Solar,
            battery_level: 0.9,
            gpu_utilization: 0.1,
            gpu_memory_free_gb: 40.0,
            gpu_count: 8,
            gpu_memory_total_gb: 80.0,
            models_loaded: BTreeSet::new(),
            last_seen: Utc::now(),
            reservation: None,
        };
        let high = score(&node, "9q8yyk");
        node.gpu_utilization = 0.8;
        let low = score(&node, "9q8yyk");
        assert!(high > low, "higher gpu_utilization must score lower");
    }

    #[test]
    fn schedule_returns_no_candidates_when_mirror_is_empty() {
        let mirror = StateMirror::new(30, 0.85);
        let req = request("llama-70b", "9q8yyk");
        let outcome = schedule(&mirror, &req, Utc::now(), 30);
        assert!(matches!(outcome, ScheduleOutcome::Success { .. }) == false);
        assert!(matches!(outcome, ScheduleOutcome::NoCandidates));
    }

    #[test]
    fn schedule_reserves_the_sole_candidate() {
        let mirror = StateMirror::new(30, 0.85);
        let node_id = Uuid::new_v4();
        mirror.upsert_telemetry(telemetry(node_id, "caiso-west", "9q8yyk"));

        let req = request("llama-70b", "9q8yyk");
        let outcome = schedule(&mirror, &req, Utc::now(), 30);
        match outcome {
            ScheduleOutcome::Success { node } => assert_eq!(node.id, node_id),
            other => panic!("expected Success, got {other:?}"),
        }
        let node = mirror.get(node_id).unwrap();
        assert_eq!(node.reservation.unwrap().request_id, req.id);
    }

    #[test]
    fn schedule_falls_through_to_next_candidate_on_reservation_race() {
        let mirror = StateMirror::new(30, 0.85);
        let winner = Uuid::new_v4();
        let loser = Uuid::new_v4();
        mirror.upsert_telemetry(telemetry(winner, "caiso-west", "9q8yyk"));
        mirror.upsert_telemetry(telemetry(loser, "caiso-west", "9q8yyk"));

        // Pre-reserve one of the two candidates to force a race on the first try.
        mirror.reserve(winner, Uuid::new_v4(), 30, Utc::now()).unwrap();

        let req = request("llama-70b", "9q8yyk");
        let outcome = schedule(&mirror, &req, Utc::now(), 30);
        match outcome {
            ScheduleOutcome::Success { node } => assert_eq!(node.id, loser),
            other => panic!("expected Success on the second candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_to_end_happy_path_dispatches_and_reserves() {
        // S1: one matching node, one request, dispatch lands on the right geozone.
        let bus = InMemoryBus::new();
        let registry = Arc::new(SchemaRegistry::with_builtin_schemas());
        let stats = Arc::new(TransportStats::default());
        let mirror = Arc::new(StateMirror::new(30, 0.85));

        let node_id = Uuid::new_v4();
        mirror.upsert_telemetry(telemetry(node_id, "caiso-west", "9q8yyk"));

        let req = request("llama-70b", "9q8yyk");
        let outcome = schedule(&mirror, &req, Utc::now(), 30);
        assert!(matches!(&outcome, ScheduleOutcome::Success { node } if node.id == node_id));

        let dispatch_producer: Arc<dyn Producer> =
            Arc::new(InMemoryProducer::new(bus.clone(), registry.clone(), stats.clone()));
        let router = DispatchRouter::new(dispatch_producer);
        let command = DispatchCommand::for_request(&req, &mirror.get(node_id).unwrap(), Utc::now());
        router.dispatch(&command, "caiso-west", Utc::now()).await.unwrap();

        let dispatched = bus.drain("arc.command.dispatch.caiso-west");
        assert_eq!(dispatched.len(), 1);
        assert!(dispatched[0].headers.contains_key(h::DISPATCHED_AT));
        assert_eq!(
            dispatched[0].headers.get(h::ASSIGNED_NODE).unwrap().as_slice(),
            node_id.to_string().as_bytes()
        );
        assert_eq!(
            dispatched[0].headers.get(h::REQUEST_ID).unwrap().as_slice(),
            req.id.to_string().as_bytes()
        );
        let _ = InMemoryConsumer::new(
            bus,
            "arc.command.dispatch.caiso-west",
            registry,
            stats,
            None,
        );
    }

    #[test]
    fn exhaustion_rejects_after_max_retries() {
        // S3's retry-count progression: attempts at k=0,1,2 retry; k=3 rejects.
        let max_retries = 3;
        for k in 0..max_retries {
            assert!(k < max_retries, "attempt {k} should retry");
        }
        assert!(!(max_retries < max_retries), "attempt at k=max_retries rejects");
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = 100i64;
        let backoffs: Vec<i64> = (0..3).map(|k| base * 2i64.pow(k)).collect();
        assert_eq!(backoffs, vec![100, 200, 400]);
    }

    fn node_with_utilization(u: f64) -> model::NodeDocument {
        model::NodeDocument {
            id: Uuid::new_v4(),
            name: "n".to_string(),
            geozone: "z".to_string(),
            geohash: "9q8yyk".to_string(),
            energy_source: model::EnergySource::Grid,
            battery_level: 0.5,
            gpu_utilization: u,
            gpu_memory_free_gb: 10.0,
            gpu_count: 1,
            gpu_memory_total_gb: 10.0,
            models_loaded: BTreeSet::new(),
            last_seen: Utc::now(),
            reservation: None,
        }
    }

    proptest::proptest! {
        // Spec §8 invariant 5: holding all else equal, score strictly
        // decreases in gpu_utilization.
        #[test]
        fn score_strictly_decreases_with_gpu_utilization(
            low in 0.0f64..0.8,
            delta in 0.001f64..0.2,
        ) {
            let high = (low + delta).min(1.0);
            proptest::prop_assume!(high > low);
            let lower_util = score(&node_with_utilization(low), "9q8yyk");
            let higher_util = score(&node_with_utilization(high), "9q8yyk");
            proptest::prop_assert!(higher_util < lower_util);
        }

        // Spec §8 invariant 5: score strictly decreases in estimated latency,
        // which strictly decreases as the shared geohash prefix shrinks.
        #[test]
        fn score_strictly_decreases_with_prefix_mismatch(prefix_len in 0usize..6) {
            let near = "9q8yyk";
            let mut far: Vec<char> = near.chars().collect();
            for c in far.iter_mut().skip(prefix_len) {
                *c = if *c == 'z' { 'y' } else { 'z' };
            }
            let far: String = far.into_iter().collect();
            proptest::prop_assume!(crate::geo::common_prefix_length(near, &far) == prefix_len);

            let node_near = node_with_utilization(0.1);
            let near_score = score(&node_near, near);
            let far_score = score(&node_near, &far);
            if prefix_len < 6 {
                proptest::prop_assert!(far_score <= near_score);
            }
        }
    }

    /// A producer that always fails, to prove that a publish failure inside
    /// a batch surfaces to the caller instead of being swallowed.
    struct FailingProducer;

    #[async_trait]
    impl Producer for FailingProducer {
        async fn send(
            &self,
            _topic: &str,
            _schema_key: &SchemaKey,
            _payload: Value,
            _trace_parent: Option<&str>,
            _extra_headers: Headers,
        ) -> Result<(), TransportError> {
            Err(TransportError::Publish {
                topic: "test".to_string(),
                reason: "simulated bus outage".to_string(),
            })
        }

        async fn send_raw(
            &self,
            _topic: &str,
            _key: Option<Vec<u8>>,
            _value: Vec<u8>,
            _headers: Headers,
        ) -> Result<(), TransportError> {
            Err(TransportError::Publish {
                topic: "test".to_string(),
                reason: "simulated bus outage".to_string(),
            })
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn test_registry() -> Arc<crate::schema::SchemaRegistry> {
        Arc::new(SchemaRegistry::with_builtin_schemas())
    }

    #[tokio::test]
    async fn run_request_batch_retries_when_no_candidates_exist() {
        // Empty mirror: nothing serves "llama-70b" yet, so the request must
        // land on the retry topic rather than being dropped.
        let bus = InMemoryBus::new();
        let registry = test_registry();
        let stats = Arc::new(TransportStats::default());
        let mirror = Arc::new(StateMirror::new(30, 0.85));

        let req = request("llama-70b", "9q8yyk");
        let payload = serde_json::to_value(&req).unwrap();
        let inference_key: SchemaKey = (schema::INFERENCE_REQUEST.to_string(), 1);
        let producer: Arc<dyn Producer> =
            Arc::new(InMemoryProducer::new(bus.clone(), registry.clone(), stats.clone()));
        producer
            .send(topics::REQUEST, &inference_key, payload, None, Headers::new())
            .await
            .unwrap();

        let dispatch_producer: Arc<dyn Producer> =
            Arc::new(InMemoryProducer::new(bus.clone(), registry.clone(), stats.clone()));
        let router = DispatchRouter::new(dispatch_producer);
        let scheduler = Scheduler::new(mirror, SchedulerConfig::default());
        let retry_producer: Arc<dyn Producer> =
            Arc::new(InMemoryProducer::new(bus.clone(), registry.clone(), stats.clone()));
        let mut consumer =
            InMemoryConsumer::new(bus.clone(), topics::REQUEST, registry.clone(), stats.clone(), None);

        let processed = scheduler
            .run_request_batch(
                &mut consumer,
                &router,
                retry_producer.as_ref(),
                retry_producer.as_ref(),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert_eq!(processed, 1);

        let retried = bus.drain(topics::RETRY);
        assert_eq!(retried.len(), 1);
        let envelope = RetryEnvelope::from_headers(&retried[0].headers).unwrap();
        assert_eq!(envelope.retry_count, 1);
        assert_eq!(envelope.original_request_id, req.id);
        assert_eq!(scheduler.stats().retried.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn run_retry_batch_defers_when_next_retry_at_is_future() {
        let bus = InMemoryBus::new();
        let registry = test_registry();
        let stats = Arc::new(TransportStats::default());
        let mirror = Arc::new(StateMirror::new(30, 0.85));

        let req = request("llama-70b", "9q8yyk");
        let now = Utc::now();
        let envelope = RetryEnvelope {
            retry_count: 1,
            original_request_id: req.id,
            first_attempt_at: now,
            last_failure_reason: "no-candidates".to_string(),
            next_retry_at: now + ChronoDuration::milliseconds(500),
        };
        let bytes = crate::codec::encode(&request_payload(&req)).unwrap();
        bus.publish_raw(
            topics::RETRY,
            Record {
                key: None,
                value: bytes,
                headers: envelope.to_headers(),
            },
        );

        let dispatch_producer: Arc<dyn Producer> =
            Arc::new(InMemoryProducer::new(bus.clone(), registry.clone(), stats.clone()));
        let router = DispatchRouter::new(dispatch_producer);
        let scheduler = Scheduler::new(mirror, SchedulerConfig::default());
        let retry_producer: Arc<dyn Producer> =
            Arc::new(InMemoryProducer::new(bus.clone(), registry.clone(), stats.clone()));
        let mut consumer =
            InMemoryConsumer::new(bus.clone(), topics::RETRY, registry.clone(), stats.clone(), None);

        scheduler
            .run_retry_batch(
                &mut consumer,
                &router,
                retry_producer.as_ref(),
                retry_producer.as_ref(),
                Duration::from_millis(10),
            )
            .await
            .unwrap();

        assert_eq!(scheduler.stats().retry_deferred.load(Ordering::Relaxed), 1);
        // Still deferred, so nothing should have dispatched or advanced the
        // retry count.
        assert_eq!(scheduler.stats().dispatched.load(Ordering::Relaxed), 0);
        let republished = bus.drain(topics::RETRY);
        assert_eq!(republished.len(), 1);
        let republished_envelope = RetryEnvelope::from_headers(&republished[0].headers).unwrap();
        assert_eq!(
            republished_envelope.retry_count, 1,
            "retry count must not advance while a record is still deferred"
        );
        assert_eq!(republished_envelope.next_retry_at, envelope.next_retry_at);
    }

    #[tokio::test]
    async fn run_retry_batch_rejects_after_max_retries_exhausted() {
        let bus = InMemoryBus::new();
        let registry = test_registry();
        let stats = Arc::new(TransportStats::default());
        let mirror = Arc::new(StateMirror::new(30, 0.85)); // no node ever serves the model

        let req = request("llama-70b", "9q8yyk");
        let now = Utc::now();
        let envelope = RetryEnvelope {
            retry_count: 3, // already at max_retries
            original_request_id: req.id,
            first_attempt_at: now - ChronoDuration::milliseconds(700),
            last_failure_reason: "no-candidates".to_string(),
            next_retry_at: now - ChronoDuration::milliseconds(1), // due
        };
        let bytes = crate::codec::encode(&request_payload(&req)).unwrap();
        bus.publish_raw(
            topics::RETRY,
            Record {
                key: None,
                value: bytes,
                headers: envelope.to_headers(),
            },
        );

        let dispatch_producer: Arc<dyn Producer> =
            Arc::new(InMemoryProducer::new(bus.clone(), registry.clone(), stats.clone()));
        let router = DispatchRouter::new(dispatch_producer);
        let scheduler = Scheduler::new(mirror, SchedulerConfig::default());
        let producer: Arc<dyn Producer> =
            Arc::new(InMemoryProducer::new(bus.clone(), registry.clone(), stats.clone()));
        let mut consumer =
            InMemoryConsumer::new(bus.clone(), topics::RETRY, registry.clone(), stats.clone(), None);

        scheduler
            .run_retry_batch(
                &mut consumer,
                &router,
                producer.as_ref(),
                producer.as_ref(),
                Duration::from_millis(10),
            )
            .await
            .unwrap();

        assert_eq!(scheduler.stats().rejected.load(Ordering::Relaxed), 1);
        assert_eq!(bus.len(topics::RETRY), 0, "an exhausted retry must not be requeued");
        let rejected = bus.drain(topics::REJECTED);
        assert_eq!(rejected.len(), 1);
        assert_eq!(
            rejected[0].headers.get(h::TOTAL_RETRIES).unwrap().as_slice(),
            3u32.to_be_bytes()
        );
        assert_eq!(
            rejected[0].headers.get(h::REJECTION_REASON).unwrap().as_slice(),
            b"no-candidates"
        );
    }

    #[tokio::test]
    async fn run_request_batch_propagates_publish_failure_instead_of_committing() {
        // A failure anywhere in the batch (here, the retry publish after a
        // no-candidates outcome) must surface as an error so the caller never
        // commits the offset and the batch is replayed.
        let bus = InMemoryBus::new();
        let registry = test_registry();
        let stats = Arc::new(TransportStats::default());
        let mirror = Arc::new(StateMirror::new(30, 0.85));

        let req = request("llama-70b", "9q8yyk");
        let payload = serde_json::to_value(&req).unwrap();
        let inference_key: SchemaKey = (schema::INFERENCE_REQUEST.to_string(), 1);
        let producer: Arc<dyn Producer> =
            Arc::new(InMemoryProducer::new(bus.clone(), registry.clone(), stats.clone()));
        producer
            .send(topics::REQUEST, &inference_key, payload, None, Headers::new())
            .await
            .unwrap();

        let dispatch_producer: Arc<dyn Producer> = Arc::new(FailingProducer);
        let router = DispatchRouter::new(dispatch_producer);
        let scheduler = Scheduler::new(mirror, SchedulerConfig::default());
        let failing: Arc<dyn Producer> = Arc::new(FailingProducer);
        let mut consumer =
            InMemoryConsumer::new(bus.clone(), topics::REQUEST, registry.clone(), stats.clone(), None);

        let result = scheduler
            .run_request_batch(
                &mut consumer,
                &router,
                failing.as_ref(),
                failing.as_ref(),
                Duration::from_millis(10),
            )
            .await;

        assert!(
            result.is_err(),
            "a publish failure must surface instead of being silently swallowed"
        );
        assert_eq!(
            bus.len(topics::RETRY),
            0,
            "the failing producer never actually got a record onto the bus"
        );
        assert_eq!(scheduler.stats().retried.load(Ordering::Relaxed), 0);
    }
}
