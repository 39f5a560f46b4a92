//! Outbound publication of per-camera summaries.
//!
//! One message per camera per cycle on `devices/<client>/<site>/cameras/<camera>/all`,
//! carrying a `Date`/`TimeStamp` header pair and a single-element JSON array payload.

mod mqtt;

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::aggregate::QuadrantSummary;
use crate::error::ScanError;

pub use mqtt::{
    MqttEndpoint, MqttPublisher, MqttSettings, TlsMaterials, DEFAULT_RECONNECT_DELAY,
};

pub const DATE_HEADER: &str = "Date";
pub const TIMESTAMP_HEADER: &str = "TimeStamp";

/// A fully built outbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishMessage {
    pub topic: String,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl PublishMessage {
    /// Build the message for one camera's summary at `timestamp`.
    pub fn for_summary(
        client: &str,
        site: &str,
        camera_name: &str,
        summary: &QuadrantSummary,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ScanError> {
        let payload = serde_json::to_vec(&[summary])
            .map_err(|e| ScanError::Publish(format!("encode payload: {}", e)))?;
        let stamp = format_timestamp(timestamp);
        Ok(Self {
            topic: camera_topic(client, site, camera_name),
            headers: vec![
                (DATE_HEADER.to_string(), stamp.clone()),
                (TIMESTAMP_HEADER.to_string(), stamp),
            ],
            payload,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

pub fn camera_topic(client: &str, site: &str, camera_name: &str) -> String {
    format!("devices/{}/{}/cameras/{}/all", client, site, camera_name)
}

/// `2024-05-01T12:00:00.123456+00:00`
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Downstream bus. Implementations must be usable from the cycle worker thread.
pub trait Publisher: Send + Sync {
    fn publish(&self, message: &PublishMessage) -> Result<(), ScanError>;
}

/// Writes each message to the log instead of a bus. For dry runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, message: &PublishMessage) -> Result<(), ScanError> {
        log::info!(
            "{} [{}] {}",
            message.topic,
            message.header(TIMESTAMP_HEADER).unwrap_or_default(),
            String::from_utf8_lossy(&message.payload)
        );
        Ok(())
    }
}

/// Records every publish in memory; optionally fails for selected topics.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<PublishMessage>>,
    failing_topics: Mutex<Vec<String>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish to `topic` fail.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        if let Ok(mut topics) = self.failing_topics.lock() {
            topics.push(topic.into());
        }
    }

    pub fn messages(&self) -> Vec<PublishMessage> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&self, message: &PublishMessage) -> Result<(), ScanError> {
        let failing = self
            .failing_topics
            .lock()
            .map_err(|_| ScanError::Publish("publisher lock poisoned".to_string()))?
            .iter()
            .any(|topic| *topic == message.topic);
        if failing {
            return Err(ScanError::Publish(format!("broker rejected {}", message.topic)));
        }
        self.messages
            .lock()
            .map_err(|_| ScanError::Publish("publisher lock poisoned".to_string()))?
            .push(message.clone());
        Ok(())
    }
}
