//! Outbound messages: recognised plates and fatal stream errors.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use std::io::{self, Stdout, Write};

use crate::error::{LprError, LprErrorKind};

/// Payload on the plate channel, one per recognised plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateMessage {
    #[serde(rename = "licensePlate")]
    pub license_plate: String,
}

/// Payload on the error channel, sent once when the stream is given up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
    pub message: String,
}

impl ErrorMessage {
    pub fn retries_exhausted(cause: &LprError) -> Self {
        Self {
            error: "Max retries exceeded".to_string(),
            message: format!("Error capturing and processing image: {}", cause),
        }
    }
}

/// Fire-and-forget message sink.
pub trait Publisher {
    fn publish(&self, topic: &str, payload: &Value) -> Result<(), LprError>;
}

impl<P: Publisher + ?Sized> Publisher for &P {
    fn publish(&self, topic: &str, payload: &Value) -> Result<(), LprError> {
        (**self).publish(topic, payload)
    }
}

/// Writes `{"topic": ..., "payload": ...}` per line to any writer.
pub struct JsonLinesPublisher<W: Write> {
    out: Mutex<W>,
}

impl JsonLinesPublisher<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> JsonLinesPublisher<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write> Publisher for JsonLinesPublisher<W> {
    fn publish(&self, topic: &str, payload: &Value) -> Result<(), LprError> {
        let line = json!({ "topic": topic, "payload": payload });
        let mut out = self.out.lock();
        writeln!(out, "{}", line)
            .and_then(|_| out.flush())
            .map_err(|e| LprErrorKind::Publish { topic: topic.to_string(), reason: e.to_string() })?;
        debug!(topic, "published");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::error::Error;

    #[test]
    fn plate_payload_uses_wire_name() -> Result<(), Box<dyn Error>> {
        let payload = serde_json::to_value(PlateMessage { license_plate: "AB123".into() })?;
        assert_eq!(payload, json!({ "licensePlate": "AB123" }));
        Ok(())
    }

    #[test]
    fn error_payload_carries_cause() -> Result<(), Box<dyn Error>> {
        let cause: LprError = LprErrorKind::RetryBudgetExceeded { attempts: 6, last: "eof".into() }.into();
        let payload = serde_json::to_value(ErrorMessage::retries_exhausted(&cause))?;
        assert_eq!(payload["error"], "Max retries exceeded");
        assert_eq!(
            payload["message"],
            "Error capturing and processing image: gave up after 6 consecutive stream failures: eof"
        );
        Ok(())
    }

    #[test]
    fn one_json_object_per_line() -> Result<(), Box<dyn Error>> {
        let publisher = JsonLinesPublisher::new(Vec::new());
        publisher.publish("alpr/ramp/req", &json!({ "licensePlate": "X1" }))?;
        publisher.publish("alpr/ramp/req", &json!({ "licensePlate": "Y2" }))?;
        let written = String::from_utf8(publisher.into_inner())?;
        let lines: Vec<Value> = written.lines().map(serde_json::from_str).collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], json!({ "topic": "alpr/ramp/req", "payload": { "licensePlate": "Y2" } }));
        Ok(())
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_is_a_publish_error() {
        let err = JsonLinesPublisher::new(Broken).publish("t", &json!({})).unwrap_err();
        assert_eq!(err.kind().name(), "PublishError");
    }
}
