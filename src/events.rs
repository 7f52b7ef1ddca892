//! Structured event records for an external metrics collaborator.
//!
//! Recording is fire-and-forget: a sink must never block the dispatcher
//! or a unit for long, and never fails.

use std::fmt;
use std::sync::Mutex;
use std::time::SystemTime;

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventCode {
    FireReported,
    FireQueued,
    FireAssigned,
    /// `value` is the distance flown.
    UnitTravel,
    /// `value` is the litres dropped.
    AgentDropped,
    UnitRefilled,
    FireExtinguished,
    UnitFaulted,
    FireRequeued,
    MessageDropped,
}

impl EventCode {
    pub fn as_str(self) -> &'static str {
        match self {
            EventCode::FireReported => "FIRE_REPORTED",
            EventCode::FireQueued => "FIRE_QUEUED",
            EventCode::FireAssigned => "FIRE_ASSIGNED",
            EventCode::UnitTravel => "DRONE_TRAVELS",
            EventCode::AgentDropped => "AGENT_DROPPED",
            EventCode::UnitRefilled => "DRONE_REFILLED",
            EventCode::FireExtinguished => "FIRE_EXTINGUISHED",
            EventCode::UnitFaulted => "DRONE_FAULTED",
            EventCode::FireRequeued => "FIRE_REQUEUED",
            EventCode::MessageDropped => "MESSAGE_DROPPED",
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(timestamp, entity, code, value, detail)`.
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub timestamp: SystemTime,
    pub entity: String,
    pub code: EventCode,
    pub value: f64,
    pub detail: String,
}

impl EventRecord {
    pub fn new(
        entity: impl Into<String>,
        code: EventCode,
        value: f64,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: SystemTime::now(),
            entity: entity.into(),
            code,
            value,
            detail: detail.into(),
        }
    }
}

/// Destination for event records.
///
/// Implementations must be `Send + Sync`; every unit and dispatcher
/// thread shares one sink.
pub trait EventSink: Send + Sync {
    fn record(&self, record: EventRecord);
}

/// Forwards records to `tracing` under the `firefleet::events` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, record: EventRecord) {
        tracing::debug!(
            target: "firefleet::events",
            entity = %record.entity,
            code = record.code.as_str(),
            value = record.value,
            detail = %record.detail,
            "event"
        );
    }
}

/// Keeps every record in memory; used for run summaries and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().expect("event sink mutex poisoned").clone()
    }

    pub fn count(&self, code: EventCode) -> usize {
        let guard = self.records.lock().expect("event sink mutex poisoned");
        guard.iter().filter(|record| record.code == code).count()
    }

    /// Sum of `value` over records with `code`.
    pub fn total(&self, code: EventCode) -> f64 {
        let guard = self.records.lock().expect("event sink mutex poisoned");
        guard
            .iter()
            .filter(|record| record.code == code)
            .map(|record| record.value)
            .sum()
    }
}

impl EventSink for MemorySink {
    fn record(&self, record: EventRecord) {
        self.records
            .lock()
            .expect("event sink mutex poisoned")
            .push(record);
    }
}

/// Send every record to both sinks.
impl<A: EventSink, B: EventSink> EventSink for (A, B) {
    fn record(&self, record: EventRecord) {
        self.0.record(record.clone());
        self.1.record(record);
    }
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn record(&self, record: EventRecord) {
        (**self).record(record);
    }
}
