pub mod models;
pub mod services;

pub use services::{
    AlertRuleRepository, AlertRuleSource, IncidentRepository, RepositoryError,
    alert_service::InMemoryAlertRuleStore, incident_service::InMemoryIncidentStore,
};
