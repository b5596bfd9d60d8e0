//! Validated, versioned, headered transport over the event bus.
//!
//! `Producer::send` validates before publishing; nothing reaches the bus on a
//! validation failure. `Consumer::poll` validates on the way in and routes
//! anything that fails decode/derive/validate to a dead-letter topic instead
//! of surfacing it to the caller as an error.

use crate::codec;
use crate::error::{CodecError, TransportError, ValidationError};
use crate::model::{headers as h, topics, Headers};
use crate::schema::{schema_key_of, SchemaKey, SchemaRegistry};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One bus message as it appears on the wire.
#[derive(Debug, Clone)]
pub struct Record {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Headers,
}

/// Where a valid record was read from.
#[derive(Debug, Clone)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub headers: Headers,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// What `poll` hands back for one raw record: either it decoded and validated
/// cleanly, or it didn't and (if a dead-letter producer is attached) was
/// already side-published there.
#[derive(Debug, Clone)]
pub enum ConsumedRecord {
    Valid {
        data: Value,
        schema_key: SchemaKey,
        metadata: RecordMetadata,
    },
    Invalid {
        error: String,
        raw_bytes: Vec<u8>,
        metadata: RecordMetadata,
        attempted_payload: Option<Value>,
    },
}

/// Counters for §7's `validation_failures{schema, direction}` and friends,
/// logged periodically rather than exported (no metrics crate in scope).
#[derive(Debug, Default)]
pub struct TransportStats {
    pub produce_validation_failures: AtomicU64,
    pub consume_validation_failures: AtomicU64,
    pub dead_lettered: AtomicU64,
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Validate against `schema_key`, encode, publish with headers built from
    /// `schema_key`, any `trace_parent` in flight, and `extra_headers`
    /// (e.g. the dispatch-specific `dispatched_at`/`assigned_node`/
    /// `request_id` headers of §6). Raises on validation failure; nothing is
    /// published in that case.
    async fn send(
        &self,
        topic: &str,
        schema_key: &SchemaKey,
        payload: Value,
        trace_parent: Option<&str>,
        extra_headers: Headers,
    ) -> Result<(), TransportError>;

    /// Republish raw bytes without re-validating. Used exclusively for
    /// retry/rejected envelopes and dead-letter forwarding.
    async fn send_raw(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        headers: Headers,
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Consumer: Send {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>, TransportError>;

    /// Commit is explicit: callers invoke this only after every handler in a
    /// poll batch has returned without error.
    async fn commit(&mut self) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

fn build_headers(schema_key: &SchemaKey, trace_parent: Option<&str>, extra_headers: Headers) -> Headers {
    let mut headers = Headers::new();
    headers.insert(
        h::SCHEMA_VERSION.to_string(),
        codec::int32_be_encode(schema_key.1).to_vec(),
    );
    headers.insert(
        h::ENTITY_TYPE.to_string(),
        codec::string_encode(&schema_key.0),
    );
    if let Some(tp) = trace_parent {
        headers.insert(h::TRACE_PARENT.to_string(), codec::string_encode(tp));
    }
    headers.extend(extra_headers);
    headers
}

fn extract_request_key(payload: &Value) -> Option<Vec<u8>> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .map(|s| s.as_bytes().to_vec())
}

// ---------------------------------------------------------------------------
// In-memory transport: deterministic fake used by scheduler tests and
// end-to-end scenarios. No network, no broker.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Topic {
    queue: VecDeque<Record>,
    next_offset: i64,
}

/// Shared in-process broker state. Cloning a handle to this is how tests wire
/// a producer and a consumer to the same set of topics.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    topics: Arc<Mutex<std::collections::HashMap<String, Topic>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_raw(&self, topic: &str, record: Record) {
        let mut topics = self.topics.lock().unwrap();
        let entry = topics.entry(topic.to_string()).or_default();
        entry.queue.push_back(record);
    }

    pub fn drain(&self, topic: &str) -> Vec<Record> {
        let mut topics = self.topics.lock().unwrap();
        match topics.get_mut(topic) {
            Some(t) => t.queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .map(|t| t.queue.len())
            .unwrap_or(0)
    }

    fn pop_batch(&self, topic: &str, max: usize) -> Vec<(Record, i64)> {
        let mut topics = self.topics.lock().unwrap();
        let entry = topics.entry(topic.to_string()).or_default();
        let mut out = Vec::new();
        for _ in 0..max {
            let Some(record) = entry.queue.pop_front() else {
                break;
            };
            let offset = entry.next_offset;
            entry.next_offset += 1;
            out.push((record, offset));
        }
        out
    }
}

pub struct InMemoryProducer {
    bus: InMemoryBus,
    registry: Arc<SchemaRegistry>,
    stats: Arc<TransportStats>,
}

impl InMemoryProducer {
    pub fn new(bus: InMemoryBus, registry: Arc<SchemaRegistry>, stats: Arc<TransportStats>) -> Self {
        Self {
            bus,
            registry,
            stats,
        }
    }
}

#[async_trait]
impl Producer for InMemoryProducer {
    async fn send(
        &self,
        topic: &str,
        schema_key: &SchemaKey,
        payload: Value,
        trace_parent: Option<&str>,
        extra_headers: Headers,
    ) -> Result<(), TransportError> {
        let validated = self
            .registry
            .validate_or_fail(schema_key, payload)
            .map_err(|e: ValidationError| {
                self.stats
                    .produce_validation_failures
                    .fetch_add(1, Ordering::Relaxed);
                TransportError::from(e)
            })?;

        let key = extract_request_key(&validated);
        let value = codec::encode(&validated).map_err(TransportError::from)?;
        let headers = build_headers(schema_key, trace_parent, extra_headers);

        self.bus.publish_raw(topic, Record { key, value, headers });
        Ok(())
    }

    async fn send_raw(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        headers: Headers,
    ) -> Result<(), TransportError> {
        self.bus.publish_raw(topic, Record { key, value, headers });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct InMemoryConsumer {
    bus: InMemoryBus,
    topic: String,
    registry: Arc<SchemaRegistry>,
    stats: Arc<TransportStats>,
    dead_letter: Option<Arc<dyn Producer>>,
    batch_size: usize,
}

impl InMemoryConsumer {
    pub fn new(
        bus: InMemoryBus,
        topic: impl Into<String>,
        registry: Arc<SchemaRegistry>,
        stats: Arc<TransportStats>,
        dead_letter: Option<Arc<dyn Producer>>,
    ) -> Self {
        Self {
            bus,
            topic: topic.into(),
            registry,
            stats,
            dead_letter,
            batch_size: 64,
        }
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>, TransportError> {
        let batch = self.bus.pop_batch(&self.topic, self.batch_size);
        if batch.is_empty() {
            tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(batch.len());
        for (record, offset) in batch {
            let metadata = RecordMetadata {
                topic: self.topic.clone(),
                partition: 0,
                offset,
                headers: record.headers.clone(),
                timestamp: chrono::Utc::now(),
            };

            out.push(
                self.classify(record, metadata).await,
            );
        }
        Ok(out)
    }

    async fn commit(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(dl) = &self.dead_letter {
            dl.close().await?;
        }
        Ok(())
    }
}

impl InMemoryConsumer {
    async fn classify(&self, record: Record, metadata: RecordMetadata) -> ConsumedRecord {
        let decoded: Result<Value, CodecError> = codec::decode(&record.value);

        let payload = match decoded {
            Ok(p) => p,
            Err(err) => {
                self.dead_letter(&record, &metadata, err.to_string()).await;
                return ConsumedRecord::Invalid {
                    error: err.to_string(),
                    raw_bytes: record.value,
                    metadata,
                    attempted_payload: None,
                };
            }
        };

        let schema_key = match schema_key_of(&record.headers, &payload) {
            Some(key) => key,
            None => {
                // No schema info: treated as raw, no validation.
                return ConsumedRecord::Valid {
                    data: payload,
                    schema_key: (String::new(), 0),
                    metadata,
                };
            }
        };

        match self.registry.validate(&schema_key, &payload) {
            Ok(()) => ConsumedRecord::Valid {
                data: payload,
                schema_key,
                metadata,
            },
            Err(errors) => {
                self.stats
                    .consume_validation_failures
                    .fetch_add(1, Ordering::Relaxed);
                let reason = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                self.dead_letter(&record, &metadata, reason.clone()).await;
                ConsumedRecord::Invalid {
                    error: reason,
                    raw_bytes: record.value,
                    metadata,
                    attempted_payload: Some(payload),
                }
            }
        }
    }

    async fn dead_letter(&self, record: &Record, metadata: &RecordMetadata, error: String) {
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        let Some(dl) = &self.dead_letter else {
            return;
        };
        let mut headers = Headers::new();
        headers.insert(
            h::ORIGINAL_TOPIC.to_string(),
            codec::string_encode(&metadata.topic),
        );
        headers.insert(h::ERROR.to_string(), codec::string_encode(&error));
        let target = topics::dead_letter(&metadata.topic);
        if let Err(e) = dl
            .send_raw(&target, record.key.clone(), record.value.clone(), headers)
            .await
        {
            tracing::error!(error = %e, topic = %target, "failed to publish to dead-letter topic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::INFERENCE_REQUEST;
    use serde_json::json;

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::with_builtin_schemas())
    }

    #[tokio::test]
    async fn valid_payload_flows_through_without_dead_lettering() {
        let bus = InMemoryBus::new();
        let stats = Arc::new(TransportStats::default());
        let producer = InMemoryProducer::new(bus.clone(), registry(), stats.clone());

        let payload = json!({
            "id": "11111111-1111-1111-1111-111111111111",
            "schema_version": 1,
            "model_id": "llama-70b",
            "context_window_tokens": 4096,
            "priority": "normal",
            "max_latency_ms": 500,
            "requester_geozone": "9q8yyk",
        });
        let key = (INFERENCE_REQUEST.to_string(), 1);
        producer
            .send("arc.request.inference", &key, payload, None, Headers::new())
            .await
            .unwrap();

        let mut consumer =
            InMemoryConsumer::new(bus.clone(), "arc.request.inference", registry(), stats, None);
        let records = consumer.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], ConsumedRecord::Valid { .. }));
        assert_eq!(bus.len("dead-letter.arc.request.inference"), 0);
    }

    #[tokio::test]
    async fn invalid_bytes_are_dead_lettered_and_commit_proceeds() {
        let bus = InMemoryBus::new();
        let stats = Arc::new(TransportStats::default());
        let dl_producer: Arc<dyn Producer> =
            Arc::new(InMemoryProducer::new(bus.clone(), registry(), stats.clone()));

        bus.publish_raw(
            "arc.telemetry.node",
            Record {
                key: None,
                value: b"not json at all".to_vec(),
                headers: Headers::new(),
            },
        );

        let mut consumer = InMemoryConsumer::new(
            bus.clone(),
            "arc.telemetry.node",
            registry(),
            stats,
            Some(dl_producer),
        );
        let records = consumer.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], ConsumedRecord::Invalid { .. }));
        consumer.commit().await.unwrap();

        let dead = bus.drain("dead-letter.arc.telemetry.node");
        assert_eq!(dead.len(), 1);
        assert!(dead[0].headers.contains_key(h::ORIGINAL_TOPIC));
        assert!(dead[0].headers.contains_key(h::ERROR));
    }

    #[tokio::test]
    async fn send_raw_does_not_validate() {
        let bus = InMemoryBus::new();
        let stats = Arc::new(TransportStats::default());
        let producer = InMemoryProducer::new(bus.clone(), registry(), stats);
        producer
            .send_raw("arc.request.retry", None, b"whatever bytes".to_vec(), Headers::new())
            .await
            .unwrap();
        assert_eq!(bus.len("arc.request.retry"), 1);
    }
}
