//! Typed events carried by the [`EventBus`](super::EventBus).
//!
//! Serialized as `{"type": "<EVENT_NAME>", "payload": {...}}` with camelCase
//! payload fields. These names and shapes are what UI and notification
//! bridges consume, so they must not drift.
use serde::{Deserialize, Serialize};

use crate::db::models::{
    AlertRule, CreateAlertRuleRequest, IncidentType, MeasurementResult, UpdateAlertRuleRequest,
};
use crate::scheduler::MonitoringTargetConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuccessPayload {
    pub target_id: String,
    /// Wall time of the run in milliseconds.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFailurePayload {
    pub target_id: String,
    pub error: String,
    pub failure_count: u32,
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestCompletedPayload {
    pub target_id: String,
    pub result: MeasurementResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestFailedPayload {
    pub target_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertTriggeredPayload {
    pub target_id: String,
    pub rule_id: i32,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentCreatedPayload {
    pub id: i32,
    pub target_id: String,
    #[serde(rename = "type")]
    pub incident_type: IncidentType,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentResolvedPayload {
    pub id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRuleCreatedPayload {
    pub id: i32,
    pub target_id: String,
    pub rule: AlertRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRuleUpdatedPayload {
    pub id: i32,
    pub rule: AlertRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRuleDeletedPayload {
    pub id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRuleUpdateRequestedPayload {
    pub id: i32,
    #[serde(flatten)]
    pub changes: UpdateAlertRuleRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRuleDeleteRequestedPayload {
    pub id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetPayload {
    pub target_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfigPayload {
    pub target_id: String,
    pub config: MonitoringTargetConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisableReason {
    /// `disableTarget` was called.
    Manual,
    /// Consecutive failures reached the target's `maxFailures`.
    FailureThreshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDisabledPayload {
    pub target_id: String,
    pub reason: DisableReason,
    pub failure_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitoringEvent {
    MonitoringTestSuccess(TestSuccessPayload),
    MonitoringTestFailure(TestFailurePayload),
    SpeedTestCompleted(SpeedTestCompletedPayload),
    SpeedTestFailed(SpeedTestFailedPayload),
    AlertTriggered(AlertTriggeredPayload),
    IncidentCreated(IncidentCreatedPayload),
    IncidentResolved(IncidentResolvedPayload),
    AlertRuleCreated(AlertRuleCreatedPayload),
    AlertRuleUpdated(AlertRuleUpdatedPayload),
    AlertRuleDeleted(AlertRuleDeletedPayload),
    MonitoringSchedulerStarted {},
    MonitoringSchedulerStopped {},
    MonitoringSchedulerPaused {},
    MonitoringSchedulerResumed {},
    MonitoringTargetAdded(TargetConfigPayload),
    MonitoringTargetRemoved(TargetPayload),
    MonitoringTargetUpdated(TargetConfigPayload),
    MonitoringTargetEnabled(TargetPayload),
    MonitoringTargetDisabled(TargetDisabledPayload),
    MonitoringTargetPaused(TargetPayload),
    MonitoringTargetResumed(TargetPayload),
    MonitoringSchedulerStartRequested {},
    MonitoringSchedulerStopRequested {},
    MonitoringTargetAddRequested(TargetConfigPayload),
    MonitoringTargetRemoveRequested(TargetPayload),
    AlertRuleCreateRequested(CreateAlertRuleRequest),
    AlertRuleUpdateRequested(AlertRuleUpdateRequestedPayload),
    AlertRuleDeleteRequested(AlertRuleDeleteRequestedPayload),
}

/// Subscription key for [`MonitoringEvent`], one per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    MonitoringTestSuccess,
    MonitoringTestFailure,
    SpeedTestCompleted,
    SpeedTestFailed,
    AlertTriggered,
    IncidentCreated,
    IncidentResolved,
    AlertRuleCreated,
    AlertRuleUpdated,
    AlertRuleDeleted,
    MonitoringSchedulerStarted,
    MonitoringSchedulerStopped,
    MonitoringSchedulerPaused,
    MonitoringSchedulerResumed,
    MonitoringTargetAdded,
    MonitoringTargetRemoved,
    MonitoringTargetUpdated,
    MonitoringTargetEnabled,
    MonitoringTargetDisabled,
    MonitoringTargetPaused,
    MonitoringTargetResumed,
    MonitoringSchedulerStartRequested,
    MonitoringSchedulerStopRequested,
    MonitoringTargetAddRequested,
    MonitoringTargetRemoveRequested,
    AlertRuleCreateRequested,
    AlertRuleUpdateRequested,
    AlertRuleDeleteRequested,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::MonitoringTestSuccess => "MONITORING_TEST_SUCCESS",
            EventKind::MonitoringTestFailure => "MONITORING_TEST_FAILURE",
            EventKind::SpeedTestCompleted => "SPEED_TEST_COMPLETED",
            EventKind::SpeedTestFailed => "SPEED_TEST_FAILED",
            EventKind::AlertTriggered => "ALERT_TRIGGERED",
            EventKind::IncidentCreated => "INCIDENT_CREATED",
            EventKind::IncidentResolved => "INCIDENT_RESOLVED",
            EventKind::AlertRuleCreated => "ALERT_RULE_CREATED",
            EventKind::AlertRuleUpdated => "ALERT_RULE_UPDATED",
            EventKind::AlertRuleDeleted => "ALERT_RULE_DELETED",
            EventKind::MonitoringSchedulerStarted => "MONITORING_SCHEDULER_STARTED",
            EventKind::MonitoringSchedulerStopped => "MONITORING_SCHEDULER_STOPPED",
            EventKind::MonitoringSchedulerPaused => "MONITORING_SCHEDULER_PAUSED",
            EventKind::MonitoringSchedulerResumed => "MONITORING_SCHEDULER_RESUMED",
            EventKind::MonitoringTargetAdded => "MONITORING_TARGET_ADDED",
            EventKind::MonitoringTargetRemoved => "MONITORING_TARGET_REMOVED",
            EventKind::MonitoringTargetUpdated => "MONITORING_TARGET_UPDATED",
            EventKind::MonitoringTargetEnabled => "MONITORING_TARGET_ENABLED",
            EventKind::MonitoringTargetDisabled => "MONITORING_TARGET_DISABLED",
            EventKind::MonitoringTargetPaused => "MONITORING_TARGET_PAUSED",
            EventKind::MonitoringTargetResumed => "MONITORING_TARGET_RESUMED",
            EventKind::MonitoringSchedulerStartRequested => "MONITORING_SCHEDULER_START_REQUESTED",
            EventKind::MonitoringSchedulerStopRequested => "MONITORING_SCHEDULER_STOP_REQUESTED",
            EventKind::MonitoringTargetAddRequested => "MONITORING_TARGET_ADD_REQUESTED",
            EventKind::MonitoringTargetRemoveRequested => "MONITORING_TARGET_REMOVE_REQUESTED",
            EventKind::AlertRuleCreateRequested => "ALERT_RULE_CREATE_REQUESTED",
            EventKind::AlertRuleUpdateRequested => "ALERT_RULE_UPDATE_REQUESTED",
            EventKind::AlertRuleDeleteRequested => "ALERT_RULE_DELETE_REQUESTED",
        }
    }
}

impl MonitoringEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MonitoringEvent::MonitoringTestSuccess(_) => EventKind::MonitoringTestSuccess,
            MonitoringEvent::MonitoringTestFailure(_) => EventKind::MonitoringTestFailure,
            MonitoringEvent::SpeedTestCompleted(_) => EventKind::SpeedTestCompleted,
            MonitoringEvent::SpeedTestFailed(_) => EventKind::SpeedTestFailed,
            MonitoringEvent::AlertTriggered(_) => EventKind::AlertTriggered,
            MonitoringEvent::IncidentCreated(_) => EventKind::IncidentCreated,
            MonitoringEvent::IncidentResolved(_) => EventKind::IncidentResolved,
            MonitoringEvent::AlertRuleCreated(_) => EventKind::AlertRuleCreated,
            MonitoringEvent::AlertRuleUpdated(_) => EventKind::AlertRuleUpdated,
            MonitoringEvent::AlertRuleDeleted(_) => EventKind::AlertRuleDeleted,
            MonitoringEvent::MonitoringSchedulerStarted {} => EventKind::MonitoringSchedulerStarted,
            MonitoringEvent::MonitoringSchedulerStopped {} => EventKind::MonitoringSchedulerStopped,
            MonitoringEvent::MonitoringSchedulerPaused {} => EventKind::MonitoringSchedulerPaused,
            MonitoringEvent::MonitoringSchedulerResumed {} => EventKind::MonitoringSchedulerResumed,
            MonitoringEvent::MonitoringTargetAdded(_) => EventKind::MonitoringTargetAdded,
            MonitoringEvent::MonitoringTargetRemoved(_) => EventKind::MonitoringTargetRemoved,
            MonitoringEvent::MonitoringTargetUpdated(_) => EventKind::MonitoringTargetUpdated,
            MonitoringEvent::MonitoringTargetEnabled(_) => EventKind::MonitoringTargetEnabled,
            MonitoringEvent::MonitoringTargetDisabled(_) => EventKind::MonitoringTargetDisabled,
            MonitoringEvent::MonitoringTargetPaused(_) => EventKind::MonitoringTargetPaused,
            MonitoringEvent::MonitoringTargetResumed(_) => EventKind::MonitoringTargetResumed,
            MonitoringEvent::MonitoringSchedulerStartRequested {} => {
                EventKind::MonitoringSchedulerStartRequested
            }
            MonitoringEvent::MonitoringSchedulerStopRequested {} => {
                EventKind::MonitoringSchedulerStopRequested
            }
            MonitoringEvent::MonitoringTargetAddRequested(_) => {
                EventKind::MonitoringTargetAddRequested
            }
            MonitoringEvent::MonitoringTargetRemoveRequested(_) => {
                EventKind::MonitoringTargetRemoveRequested
            }
            MonitoringEvent::AlertRuleCreateRequested(_) => EventKind::AlertRuleCreateRequested,
            MonitoringEvent::AlertRuleUpdateRequested(_) => EventKind::AlertRuleUpdateRequested,
            MonitoringEvent::AlertRuleDeleteRequested(_) => EventKind::AlertRuleDeleteRequested,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// The target this event concerns, if any.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            MonitoringEvent::MonitoringTestSuccess(p) => Some(&p.target_id),
            MonitoringEvent::MonitoringTestFailure(p) => Some(&p.target_id),
            MonitoringEvent::SpeedTestCompleted(p) => Some(&p.target_id),
            MonitoringEvent::SpeedTestFailed(p) => Some(&p.target_id),
            MonitoringEvent::AlertTriggered(p) => Some(&p.target_id),
            MonitoringEvent::IncidentCreated(p) => Some(&p.target_id),
            MonitoringEvent::AlertRuleCreated(p) => Some(&p.target_id),
            MonitoringEvent::AlertRuleUpdated(p) => Some(&p.rule.target_id),
            MonitoringEvent::AlertRuleCreateRequested(request) => Some(&request.target_id),
            MonitoringEvent::MonitoringTargetAdded(p)
            | MonitoringEvent::MonitoringTargetUpdated(p)
            | MonitoringEvent::MonitoringTargetAddRequested(p) => Some(&p.target_id),
            MonitoringEvent::MonitoringTargetRemoved(p)
            | MonitoringEvent::MonitoringTargetEnabled(p)
            | MonitoringEvent::MonitoringTargetPaused(p)
            | MonitoringEvent::MonitoringTargetResumed(p)
            | MonitoringEvent::MonitoringTargetRemoveRequested(p) => Some(&p.target_id),
            MonitoringEvent::MonitoringTargetDisabled(p) => Some(&p.target_id),
            MonitoringEvent::IncidentResolved(_)
            | MonitoringEvent::AlertRuleDeleted(_)
            | MonitoringEvent::AlertRuleUpdateRequested(_)
            | MonitoringEvent::AlertRuleDeleteRequested(_)
            | MonitoringEvent::MonitoringSchedulerStarted {}
            | MonitoringEvent::MonitoringSchedulerStopped {}
            | MonitoringEvent::MonitoringSchedulerPaused {}
            | MonitoringEvent::MonitoringSchedulerResumed {}
            | MonitoringEvent::MonitoringSchedulerStartRequested {}
            | MonitoringEvent::MonitoringSchedulerStopRequested {} => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_event_wire_shape() {
        let event = MonitoringEvent::MonitoringTestFailure(TestFailurePayload {
            target_id: "t1".to_string(),
            error: "timeout".to_string(),
            failure_count: 2,
            duration: 1500,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "MONITORING_TEST_FAILURE",
                "payload": {
                    "targetId": "t1",
                    "error": "timeout",
                    "failureCount": 2,
                    "duration": 1500
                }
            })
        );
    }

    #[test]
    fn test_alert_and_incident_wire_shape() {
        let alert = MonitoringEvent::AlertTriggered(AlertTriggeredPayload {
            target_id: "t1".to_string(),
            rule_id: 4,
            value: 150.0,
            threshold: 100.0,
        });
        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["type"], "ALERT_TRIGGERED");
        assert_eq!(value["payload"]["ruleId"], 4);
        assert_eq!(value["payload"]["value"], 150.0);

        let incident = MonitoringEvent::IncidentCreated(IncidentCreatedPayload {
            id: 1,
            target_id: "t1".to_string(),
            incident_type: IncidentType::Alert,
            description: "Alert triggered".to_string(),
        });
        let value = serde_json::to_value(&incident).unwrap();
        assert_eq!(value["payload"]["type"], "ALERT");
    }

    #[test]
    fn test_lifecycle_events_carry_empty_payload() {
        let value = serde_json::to_value(MonitoringEvent::MonitoringSchedulerStarted {}).unwrap();
        assert_eq!(value, json!({"type": "MONITORING_SCHEDULER_STARTED", "payload": {}}));

        let parsed: MonitoringEvent =
            serde_json::from_value(json!({"type": "MONITORING_SCHEDULER_PAUSED", "payload": {}}))
                .unwrap();
        assert_eq!(parsed, MonitoringEvent::MonitoringSchedulerPaused {});
    }

    #[test]
    fn test_rule_update_request_flattens_changes() {
        let parsed: MonitoringEvent = serde_json::from_value(json!({
            "type": "ALERT_RULE_UPDATE_REQUESTED",
            "payload": {"id": 7, "threshold": 250.0}
        }))
        .unwrap();
        assert_eq!(
            parsed,
            MonitoringEvent::AlertRuleUpdateRequested(AlertRuleUpdateRequestedPayload {
                id: 7,
                changes: UpdateAlertRuleRequest {
                    threshold: Some(250.0),
                    ..Default::default()
                },
            })
        );
        assert_eq!(parsed.target_id(), None);
    }

    #[test]
    fn test_kind_names_match_serialized_tag() {
        let events = vec![
            MonitoringEvent::MonitoringTestSuccess(TestSuccessPayload {
                target_id: "t1".to_string(),
                duration: 3,
            }),
            MonitoringEvent::MonitoringTargetRemoved(TargetPayload {
                target_id: "t1".to_string(),
            }),
            MonitoringEvent::MonitoringTargetDisabled(TargetDisabledPayload {
                target_id: "t1".to_string(),
                reason: DisableReason::FailureThreshold,
                failure_count: 3,
            }),
            MonitoringEvent::IncidentResolved(IncidentResolvedPayload { id: 2 }),
            MonitoringEvent::MonitoringSchedulerStopRequested {},
            MonitoringEvent::AlertRuleDeleteRequested(AlertRuleDeleteRequestedPayload { id: 3 }),
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.name());
        }
    }
}
