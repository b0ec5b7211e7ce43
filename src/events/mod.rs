pub mod bus;
pub mod models;

pub use bus::{EventBus, EventHandler, ListenerId};
pub use models::{
    AlertRuleCreatedPayload, AlertRuleDeleteRequestedPayload, AlertRuleDeletedPayload,
    AlertRuleUpdateRequestedPayload, AlertRuleUpdatedPayload, AlertTriggeredPayload,
    DisableReason, EventKind, IncidentCreatedPayload, IncidentResolvedPayload, MonitoringEvent,
    SpeedTestCompletedPayload, SpeedTestFailedPayload, TargetConfigPayload, TargetDisabledPayload,
    TargetPayload, TestFailurePayload, TestSuccessPayload,
};
