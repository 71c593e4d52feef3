//! Helpers for building and interpreting `FunctionMessage` values.
//!
//! `Timestamp` carries Unix time in seconds. `QOS` follows the MQTT levels
//! by convention only; nothing on the wire enforces it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use function_proto::FunctionMessage;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u32> for Qos {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl From<Qos> for u32 {
    fn from(value: Qos) -> Self {
        match value {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

pub fn new_invoke_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// A request for `function_name` with a fresh invoke id and the current time.
pub fn new_invocation(
    function_name: impl Into<String>,
    topic: impl Into<String>,
    qos: Qos,
    payload: impl Into<Bytes>,
) -> FunctionMessage {
    FunctionMessage {
        id: 0,
        qos: qos.into(),
        topic: topic.into(),
        payload: payload.into(),
        timestamp: now_timestamp(),
        function_name: function_name.into(),
        function_invoke_id: new_invoke_id(),
    }
}

pub trait FunctionMessageExt {
    /// Assigns a fresh invoke id when the message has none. Returns the id.
    fn ensure_invoke_id(&mut self) -> &str;

    /// Response carrying `payload` that keeps the routing and correlation
    /// fields of this request.
    fn reply(&self, payload: impl Into<Bytes>) -> FunctionMessage;

    fn timestamp_utc(&self) -> Option<DateTime<Utc>>;

    fn qos_level(&self) -> Option<Qos>;
}

impl FunctionMessageExt for FunctionMessage {
    fn ensure_invoke_id(&mut self) -> &str {
        if self.function_invoke_id.is_empty() {
            self.function_invoke_id = new_invoke_id();
        }
        &self.function_invoke_id
    }

    fn reply(&self, payload: impl Into<Bytes>) -> FunctionMessage {
        FunctionMessage {
            id: self.id,
            qos: self.qos,
            topic: self.topic.clone(),
            payload: payload.into(),
            timestamp: now_timestamp(),
            function_name: self.function_name.clone(),
            function_invoke_id: self.function_invoke_id.clone(),
        }
    }

    fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    fn qos_level(&self) -> Option<Qos> {
        Qos::try_from(self.qos).ok()
    }
}
