pub mod evaluation_service;
pub mod incident_service;
pub mod rule_service;

pub use evaluation_service::{
    EvaluationError, EvaluationOptions, EvaluationService, EvaluationWorker,
};
pub use incident_service::{IncidentError, IncidentManager};
pub use rule_service::{AlertRuleError, AlertRuleService, RuleRequestWorker};
