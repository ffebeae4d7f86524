//! Telemetry artifacts produced on the device and delivered upstream.
//!
//! An [`Artifact`] is either a still image or a sensor reading, stamped with
//! its capture time truncated to the whole minute. The truncated timestamp is
//! the ordering and dedup key used by the durable queue.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Timelike, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Timestamp layout used in published messages.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The class of an artifact. Each kind is queued and drained independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    SensorReading,
}

impl ArtifactKind {
    /// All kinds, in drain order.
    pub fn all() -> &'static [ArtifactKind] {
        &[ArtifactKind::Image, ArtifactKind::SensorReading]
    }

    /// Short stable name, used for queue directories and log fields.
    pub fn name(&self) -> &'static str {
        match self {
            ArtifactKind::Image => "image",
            ArtifactKind::SensorReading => "sensor",
        }
    }

    /// Last segment of the inbound request topic for this kind.
    pub fn request_suffix(&self) -> &'static str {
        match self {
            ArtifactKind::Image => "image",
            ArtifactKind::SensorReading => "data",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A small ordered set of named numeric fields, e.g. temperature/pressure/humidity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    fields: Vec<(String, f64)>,
}

impl SensorReading {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, replacing the value if the name already exists.
    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn fields(&self) -> &[(String, f64)] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Opaque artifact content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Encoded image bytes (format is the capture source's business).
    Image(#[serde(with = "base64_bytes")] Vec<u8>),

    /// Sensor reading fields.
    Sensor(SensorReading),
}

impl Payload {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Payload::Image(_) => ArtifactKind::Image,
            Payload::Sensor(_) => ArtifactKind::SensorReading,
        }
    }
}

/// A unit of telemetry awaiting a send-or-buffer decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    payload: Payload,
    captured_at: DateTime<Utc>,
}

impl Artifact {
    /// Create an artifact. The capture time is truncated to the whole minute.
    pub fn new(payload: Payload, captured_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            captured_at: truncate_to_minute(captured_at),
        }
    }

    /// Create an artifact stamped with the current time.
    pub fn captured_now(payload: Payload) -> Self {
        Self::new(payload, Utc::now())
    }

    pub fn kind(&self) -> ArtifactKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Encode the message body published to the broker.
    ///
    /// Images become `{"image_data": <base64>, "captured_at": ..}`; sensor
    /// readings become their fields in order followed by `captured_at`.
    pub fn encode_message(&self) -> Result<Vec<u8>, serde_json::Error> {
        let captured_at = self.captured_at.format(WIRE_TIME_FORMAT).to_string();
        match &self.payload {
            Payload::Image(bytes) => serde_json::to_vec(&ImageMessage {
                image_data: STANDARD.encode(bytes),
                captured_at,
            }),
            Payload::Sensor(reading) => serde_json::to_vec(&SensorMessage {
                reading,
                captured_at,
            }),
        }
    }
}

#[derive(Serialize)]
struct ImageMessage {
    image_data: String,
    captured_at: String,
}

struct SensorMessage<'a> {
    reading: &'a SensorReading,
    captured_at: String,
}

impl Serialize for SensorMessage<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.reading.len() + 1))?;
        for (name, value) in self.reading.fields() {
            map.serialize_entry(name, value)?;
        }
        map.serialize_entry("captured_at", &self.captured_at)?;
        map.end()
    }
}

/// Zero the seconds and sub-second part of a timestamp.
pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Topic layout for one device.
#[derive(Debug, Clone)]
pub struct Topics {
    device: String,
}

impl Topics {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Topic an artifact of this kind is published on.
    pub fn publish_topic(&self, kind: ArtifactKind) -> String {
        format!("{}/{}", self.device, kind.name())
    }

    /// Inbound topic on which the server requests an out-of-band capture.
    pub fn request_topic(&self, kind: ArtifactKind) -> String {
        format!("{}/request/{}", self.device, kind.request_suffix())
    }

    /// Map an inbound request topic back to the kind it asks for.
    pub fn parse_request(&self, topic: &str) -> Option<ArtifactKind> {
        ArtifactKind::all()
            .iter()
            .copied()
            .find(|kind| self.request_topic(*kind) == topic)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_truncate_to_minute() {
        let t = ts(10, 15, 42) + chrono::Duration::milliseconds(250);
        assert_eq!(truncate_to_minute(t), ts(10, 15, 0));
    }

    #[test]
    fn test_artifact_truncates_capture_time() {
        let artifact = Artifact::new(Payload::Image(vec![1, 2, 3]), ts(8, 0, 59));
        assert_eq!(artifact.captured_at(), ts(8, 0, 0));
        assert_eq!(artifact.kind(), ArtifactKind::Image);
    }

    #[test]
    fn test_sensor_reading_keeps_order_and_replaces() {
        let reading = SensorReading::new()
            .with_field("temp", 21.5)
            .with_field("press", 1013.2)
            .with_field("temp", 22.0);

        assert_eq!(reading.len(), 2);
        assert_eq!(reading.fields()[0].0, "temp");
        assert_eq!(reading.get("temp"), Some(22.0));
        assert_eq!(reading.get("humidity"), None);
    }

    #[test]
    fn test_encode_image_message() {
        let artifact = Artifact::new(Payload::Image(b"jpeg".to_vec()), ts(9, 30, 12));
        let body: serde_json::Value =
            serde_json::from_slice(&artifact.encode_message().unwrap()).unwrap();

        assert_eq!(body["image_data"], "anBlZw==");
        assert_eq!(body["captured_at"], "2024-05-01 09:30:00");
    }

    #[test]
    fn test_encode_sensor_message_field_order() {
        let reading = SensorReading::new()
            .with_field("temp", 20.0)
            .with_field("press", 1000.5)
            .with_field("humidity", 40.0);
        let artifact = Artifact::new(Payload::Sensor(reading), ts(9, 31, 0));
        let body = String::from_utf8(artifact.encode_message().unwrap()).unwrap();

        assert_eq!(
            body,
            r#"{"temp":20.0,"press":1000.5,"humidity":40.0,"captured_at":"2024-05-01 09:31:00"}"#
        );
    }

    #[test]
    fn test_payload_record_uses_base64() {
        let json = serde_json::to_string(&Payload::Image(vec![0xff, 0x00])).unwrap();
        assert_eq!(json, r#"{"type":"image","data":"/wA="}"#);

        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Payload::Image(vec![0xff, 0x00]));
    }

    #[test]
    fn test_topics() {
        let topics = Topics::new("iot7");
        assert_eq!(topics.publish_topic(ArtifactKind::Image), "iot7/image");
        assert_eq!(topics.publish_topic(ArtifactKind::SensorReading), "iot7/sensor");
        assert_eq!(topics.request_topic(ArtifactKind::SensorReading), "iot7/request/data");

        assert_eq!(
            topics.parse_request("iot7/request/image"),
            Some(ArtifactKind::Image)
        );
        assert_eq!(
            topics.parse_request("iot7/request/data"),
            Some(ArtifactKind::SensorReading)
        );
        assert_eq!(topics.parse_request("iot8/request/data"), None);
        assert_eq!(topics.parse_request("iot7/image"), None);
    }
}
