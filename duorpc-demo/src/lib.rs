//! Shared interface of the sample calculator application.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use duorpc::{Decode, Encode, Reader, Result, Writer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum TelemetryType {
    Beginning,
    End,
}

/// Wall-clock timestamp carried as whole seconds since the Unix epoch.
///
/// The hand-written codec impls illustrate custom serialization for a type
/// the wire format has no built-in encoding for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(pub SystemTime);

impl Timestamp {
    #[must_use]
    pub fn now() -> Self {
        Self(SystemTime::now())
    }
}

impl Encode for Timestamp {
    fn encode(&self, w: &mut Writer) {
        let secs = self
            .0
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs() as i64);
        secs.encode(w);
    }
}

impl Decode for Timestamp {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let secs = i64::decode(r)?;
        Ok(Self(UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TelemetryInfo {
    pub event: String,
    pub kind: TelemetryType,
    pub success: bool,
    pub time: Timestamp,
}

/// Either of the two argument types `universal_add` accepts.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Value {
    Int(i32),
    Text(String),
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum AddErrorCode {
    NoError,
    IncompatibleTypes,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AddError {
    pub description: String,
    pub code: AddErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum AddResult {
    Int(i32),
    Text(String),
    Error(AddError),
}

#[duorpc::interface]
pub trait CalculatorService {
    async fn simple_sum(&self, a: i32, b: i32) -> Result<i32>;
    async fn array_sum(&self, values: Vec<i32>) -> Result<i32>;
    async fn string_concatenate(&self, a: String, b: String) -> Result<String>;
    async fn universal_add(&self, a: Value, b: Value) -> Result<AddResult>;

    /// Fire-and-forget method.
    fn send_telemetry_event(&self, tm: TelemetryInfo) -> Result<()>;
}
