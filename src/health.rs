//! Health reporting for the bus and its components.

use std::fmt;

use serde::Serialize;

/// Health of the bus or one of its components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Not running.
    Down,
    /// Running but not ready to serve yet.
    UpNotReady,
    /// Running normally.
    UpOk,
    /// Running but permanently impaired; needs operator attention.
    UpFatalBroken,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Down => "DOWN",
            Self::UpNotReady => "UP_NOT_READY",
            Self::UpOk => "UP_OK",
            Self::UpFatalBroken => "UP_FATAL_BROKEN",
        }
    }

    /// Whether this status breaks the aggregate health of the bus.
    pub const fn is_broken(self) -> bool {
        matches!(self, Self::Down | Self::UpFatalBroken)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthNote {
    pub severity: Severity,
    pub message: String,
}

/// Health snapshot of one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub notes: Vec<HealthNote>,
}

impl ComponentHealth {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            notes: Vec::new(),
        }
    }

    pub fn up() -> Self {
        Self::new(HealthStatus::UpOk)
    }

    pub fn down(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Down).with_note(Severity::Critical, message)
    }

    pub fn with_note(mut self, severity: Severity, message: impl Into<String>) -> Self {
        self.notes.push(HealthNote {
            severity,
            message: message.into(),
        });
        self
    }
}

/// Aggregate health returned by [`CacheBus::health`](crate::bus::CacheBus::health).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusHealth {
    pub status: HealthStatus,
    pub components: Vec<(&'static str, ComponentHealth)>,
}

impl BusHealth {
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components
            .iter()
            .find(|(component, _)| *component == name)
            .map(|(_, health)| health)
    }
}

/// Combine component statuses into the bus status.
///
/// A stopped bus is `Down`. A running bus is `UpFatalBroken` as soon as any
/// component is broken, `UpOk` otherwise.
pub fn aggregate<'a>(started: bool, components: impl IntoIterator<Item = &'a ComponentHealth>) -> HealthStatus {
    if !started {
        return HealthStatus::Down;
    }
    if components.into_iter().any(|component| component.status.is_broken()) {
        HealthStatus::UpFatalBroken
    } else {
        HealthStatus::UpOk
    }
}

/// Health of a worker-backed component from its failure count.
pub(crate) fn worker_health(role: &str, failed: usize, threshold: usize) -> ComponentHealth {
    if failed >= threshold {
        ComponentHealth::new(HealthStatus::UpFatalBroken).with_note(
            Severity::Critical,
            format!("{failed} {role} worker(s) failed permanently (threshold {threshold})"),
        )
    } else if failed > 0 {
        ComponentHealth::up().with_note(
            Severity::Warning,
            format!("{failed} {role} worker(s) failed permanently"),
        )
    } else {
        ComponentHealth::up()
    }
}
