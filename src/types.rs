//! Shared identifiers and the fire event model used across the system.

use std::fmt;

/// Unique identifier for a fire event.
pub type TaskId = u64;
/// Unique identifier for a drone unit.
pub type UnitId = u64;
/// Unique identifier for a physical zone.
pub type ZoneId = u64;

/// Severity reported for a fire, which fixes how much agent it needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    High,
    Moderate,
    Low,
    /// Any label the incident source sent that is not one of the above.
    Unknown,
}

impl Severity {
    /// Parse a severity label, ignoring case.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Severity::High,
            "MODERATE" => Severity::Moderate,
            "LOW" => Severity::Low,
            _ => Severity::Unknown,
        }
    }

    /// Litres of agent required to put the fire out.
    pub fn demand(self) -> i64 {
        match self {
            Severity::High => 30,
            Severity::Moderate => 20,
            Severity::Low => 10,
            Severity::Unknown => 0,
        }
    }

    /// Dispatch rank; lower ranks are served first.
    pub fn rank(self) -> u8 {
        match self {
            Severity::High => 0,
            Severity::Moderate => 1,
            Severity::Low => 2,
            Severity::Unknown => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::High => "High",
            Severity::Moderate => "Moderate",
            Severity::Low => "Low",
            Severity::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Lifecycle of a fire as seen by whoever holds it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FireState {
    Active,
    Extinguished,
}

/// A point on the simulation plane.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance_to(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// A reported fire. Moves between the dispatcher and at most one unit.
#[derive(Clone, Debug, PartialEq)]
pub struct FireEvent {
    pub id: TaskId,
    /// Timestamp as reported by the incident source.
    pub time: String,
    pub zone_id: ZoneId,
    pub event_type: String,
    pub severity: Severity,
    remaining_demand: i64,
    fault: bool,
    state: FireState,
}

impl FireEvent {
    /// Construct an active fire whose demand follows from its severity.
    pub fn new(
        id: TaskId,
        time: impl Into<String>,
        zone_id: ZoneId,
        event_type: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            id,
            time: time.into(),
            zone_id,
            event_type: event_type.into(),
            severity,
            remaining_demand: severity.demand(),
            fault: false,
            state: FireState::Active,
        }
    }

    /// Mark this fire so the unit servicing it fails mid-drop.
    pub fn with_fault(mut self, fault: bool) -> Self {
        self.fault = fault;
        self
    }

    pub fn remaining_demand(&self) -> i64 {
        self.remaining_demand
    }

    pub fn has_fault(&self) -> bool {
        self.fault
    }

    pub fn state(&self) -> FireState {
        self.state
    }

    pub fn is_satisfied(&self) -> bool {
        self.remaining_demand <= 0
    }

    /// Apply `amount` litres of agent. Negative amounts are ignored so the
    /// demand never grows.
    pub fn extinguish(&mut self, amount: i64) {
        if amount > 0 {
            self.remaining_demand -= amount;
        }
        if self.is_satisfied() {
            self.state = FireState::Extinguished;
        }
    }

    /// Drop the fault marker before the task is handed to another unit.
    pub fn clear_fault(&mut self) {
        self.fault = false;
    }
}

impl fmt::Display for FireEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fire#{} zone={} severity={} remaining={}",
            self.id, self.zone_id, self.severity, self.remaining_demand
        )
    }
}
