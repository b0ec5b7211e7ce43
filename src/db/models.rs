use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The measurement a rule reads from a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Ping,
    Download,
}

impl MetricKind {
    /// Reads this metric from a measurement. `None` means the run produced no value for it.
    pub fn read(self, result: &MeasurementResult) -> Option<f64> {
        match self {
            MetricKind::Ping => result.ping,
            MetricKind::Download => result.download,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Ping => "ping",
            MetricKind::Download => "download",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    GreaterThan,
    LessThan,
}

impl Condition {
    pub fn is_met(self, value: f64, threshold: f64) -> bool {
        match self {
            Condition::GreaterThan => value > threshold,
            Condition::LessThan => value < threshold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Condition::GreaterThan => "GREATER_THAN",
            Condition::LessThan => "LESS_THAN",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: i32,
    pub target_id: String,
    pub metric: MetricKind,
    pub condition: Condition,
    pub threshold: f64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAlertRuleRequest {
    pub target_id: String,
    pub metric: MetricKind,
    pub condition: Condition,
    pub threshold: f64,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Partial update of a rule. The target and metric of a rule are fixed once created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAlertRuleRequest {
    pub condition: Option<Condition>,
    pub threshold: Option<f64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentType {
    Outage,
    Alert,
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncidentType::Outage => f.write_str("OUTAGE"),
            IncidentType::Alert => f.write_str("ALERT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: i32,
    pub target_id: String,
    #[serde(rename = "type")]
    pub incident_type: IncidentType,
    pub description: String,
    pub resolved: bool,
    pub rule_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIncidentRequest {
    #[serde(rename = "type")]
    pub incident_type: IncidentType,
    pub description: String,
    pub target_id: String,
    #[serde(default)]
    pub rule_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasurementStatus {
    Success,
    Failure,
}

/// Output of one test run against a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementResult {
    pub target_id: String,
    /// Round trip in milliseconds.
    pub ping: Option<f64>,
    /// Throughput in Mbps.
    pub download: Option<f64>,
    pub status: MeasurementStatus,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MeasurementResult {
    pub fn success(target_id: impl Into<String>, ping: Option<f64>, download: Option<f64>) -> Self {
        Self {
            target_id: target_id.into(),
            ping,
            download,
            status: MeasurementStatus::Success,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(target_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            ping: None,
            download: None,
            status: MeasurementStatus::Failure,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == MeasurementStatus::Success
    }
}
