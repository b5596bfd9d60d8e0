//! `rdkafka`-backed implementation of the [`crate::transport::Producer`] and
//! [`crate::transport::Consumer`] traits — the real event bus, as opposed to
//! the in-memory fake used in tests.

use crate::codec;
use crate::error::{CodecError, TransportError, ValidationError};
use crate::model::{headers as h, topics, Headers};
use crate::schema::{schema_key_of, SchemaKey, SchemaRegistry};
use crate::transport::{ConsumedRecord, Producer, RecordMetadata, TransportStats};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as RdConsumer, StreamConsumer};
use rdkafka::message::{Headers as RdHeaders, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn to_rdkafka_headers(headers: &Headers) -> OwnedHeaders {
    let mut owned = OwnedHeaders::new();
    for (k, v) in headers {
        owned = owned.insert(rdkafka::message::Header {
            key: k,
            value: Some(v.as_slice()),
        });
    }
    owned
}

fn from_rdkafka_headers(headers: Option<&rdkafka::message::BorrowedHeaders>) -> Headers {
    let mut out = Headers::new();
    let Some(headers) = headers else {
        return out;
    };
    for i in 0..headers.count() {
        let header = headers.get(i);
        if let Some(value) = header.value {
            out.insert(header.key.to_string(), value.to_vec());
        }
    }
    out
}

/// Producer side: `ack=all`, idempotent, bounded retries.
pub struct KafkaProducer {
    inner: FutureProducer,
    registry: Arc<SchemaRegistry>,
    stats: Arc<TransportStats>,
    publish_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(
        bootstrap_servers: &str,
        registry: Arc<SchemaRegistry>,
        stats: Arc<TransportStats>,
    ) -> Result<Self, TransportError> {
        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.send.max.retries", "5")
            .set("retry.backoff.ms", "100")
            .create()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Self {
            inner,
            registry,
            stats,
            publish_timeout: Duration::from_secs(10),
        })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
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

        let key = validated
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let value = codec::encode(&validated).map_err(TransportError::from)?;

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

        self.send_raw(topic, key.map(String::into_bytes), value, headers)
            .await
    }

    async fn send_raw(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        headers: Headers,
    ) -> Result<(), TransportError> {
        let mut record = FutureRecord::to(topic)
            .payload(&value)
            .headers(to_rdkafka_headers(&headers));
        if let Some(k) = &key {
            record = record.key(k);
        }

        self.inner
            .send(record, self.publish_timeout)
            .await
            .map_err(|(err, _owned_msg)| TransportError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        // FutureProducer flushes on drop; nothing to await explicitly.
        Ok(())
    }
}

/// Consumer side: decode, derive schema key, validate; anything that fails
/// any of those three steps is dead-lettered rather than returned as an
/// error.
pub struct KafkaConsumer {
    inner: StreamConsumer,
    topic: String,
    registry: Arc<SchemaRegistry>,
    stats: Arc<TransportStats>,
    dead_letter: Option<Arc<dyn Producer>>,
    batch_size: usize,
}

impl KafkaConsumer {
    pub fn new(
        bootstrap_servers: &str,
        group_id: &str,
        topic: impl Into<String>,
        registry: Arc<SchemaRegistry>,
        stats: Arc<TransportStats>,
        dead_letter: Option<Arc<dyn Producer>>,
    ) -> Result<Self, TransportError> {
        let topic = topic.into();
        let inner: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        RdConsumer::subscribe(&inner, &[topic.as_str()])
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Self {
            inner,
            topic,
            registry,
            stats,
            dead_letter,
            batch_size: 64,
        })
    }
}

#[async_trait]
impl crate::transport::Consumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>, TransportError> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;

        while out.len() < self.batch_size {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            let msg = match tokio::time::timeout(remaining, self.inner.recv()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    return Err(TransportError::Poll {
                        topic: self.topic.clone(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => break, // timed out waiting for the next message
            };

            let value = msg.payload().unwrap_or_default().to_vec();
            let headers = from_rdkafka_headers(msg.headers());
            let metadata = RecordMetadata {
                topic: self.topic.clone(),
                partition: msg.partition(),
                offset: msg.offset(),
                headers: headers.clone(),
                timestamp: msg
                    .timestamp()
                    .to_millis()
                    .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
                    .unwrap_or_else(chrono::Utc::now),
            };

            out.push(self.classify(value, headers, metadata).await);
        }

        Ok(out)
    }

    async fn commit(&mut self) -> Result<(), TransportError> {
        RdConsumer::commit_consumer_state(&self.inner, CommitMode::Async).map_err(|e| {
            TransportError::Commit {
                topic: self.topic.clone(),
                reason: e.to_string(),
            }
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(dl) = &self.dead_letter {
            dl.close().await?;
        }
        Ok(())
    }
}

impl KafkaConsumer {
    async fn classify(
        &self,
        raw_bytes: Vec<u8>,
        headers: Headers,
        metadata: RecordMetadata,
    ) -> ConsumedRecord {
        let decoded: Result<Value, CodecError> = codec::decode(&raw_bytes);

        let payload = match decoded {
            Ok(p) => p,
            Err(err) => {
                self.dead_letter(&raw_bytes, None, &metadata, err.to_string())
                    .await;
                return ConsumedRecord::Invalid {
                    error: err.to_string(),
                    raw_bytes,
                    metadata,
                    attempted_payload: None,
                };
            }
        };

        let schema_key = match schema_key_of(&headers, &payload) {
            Some(key) => key,
            None => {
                return ConsumedRecord::Valid {
                    data: payload,
                    schema_key: (String::new(), 0),
                    metadata,
                }
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
                self.dead_letter(&raw_bytes, Some(&payload), &metadata, reason.clone())
                    .await;
                ConsumedRecord::Invalid {
                    error: reason,
                    raw_bytes,
                    metadata,
                    attempted_payload: Some(payload),
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        raw_bytes: &[u8],
        _attempted_payload: Option<&Value>,
        metadata: &RecordMetadata,
        error: String,
    ) {
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
            .send_raw(&target, None, raw_bytes.to_vec(), headers)
            .await
        {
            tracing::error!(error = %e, topic = %target, "failed to publish to dead-letter topic");
        }
    }
}
