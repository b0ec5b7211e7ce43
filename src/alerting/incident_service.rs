use std::sync::Arc;
use tracing::{debug, error, info};

use crate::db::models::{CreateIncidentRequest, Incident};
use crate::db::{IncidentRepository, RepositoryError};
use crate::events::{EventBus, IncidentCreatedPayload, IncidentResolvedPayload, MonitoringEvent};

#[derive(Debug, thiserror::Error)]
pub enum IncidentError {
    #[error("Incident not found: {0}")]
    NotFound(i32),
    #[error("Incident repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Records incidents and announces them on the event bus.
pub struct IncidentManager {
    repository: Arc<dyn IncidentRepository>,
    event_bus: Arc<EventBus>,
}

impl IncidentManager {
    pub fn new(repository: Arc<dyn IncidentRepository>, event_bus: Arc<EventBus>) -> Self {
        Self {
            repository,
            event_bus,
        }
    }

    /// Stores the incident and emits `INCIDENT_CREATED`.
    pub async fn create_incident(
        &self,
        request: CreateIncidentRequest,
    ) -> Result<Incident, IncidentError> {
        let incident = self.record(request).await?;
        self.announce(&incident);
        Ok(incident)
    }

    /// Stores the incident without emitting anything. Callers that need to
    /// emit their own event first pair this with [`IncidentManager::announce`].
    pub(crate) async fn record(
        &self,
        request: CreateIncidentRequest,
    ) -> Result<Incident, IncidentError> {
        let incident = self.repository.create(request).await.map_err(|e| {
            error!(error = %e, "Failed to store incident");
            IncidentError::from(e)
        })?;
        info!(
            incident_id = incident.id,
            target_id = %incident.target_id,
            incident_type = %incident.incident_type,
            "Incident created"
        );
        Ok(incident)
    }

    pub(crate) fn announce(&self, incident: &Incident) {
        self.event_bus
            .emit(MonitoringEvent::IncidentCreated(IncidentCreatedPayload {
                id: incident.id,
                target_id: incident.target_id.clone(),
                incident_type: incident.incident_type,
                description: incident.description.clone(),
            }));
    }

    pub async fn get_incident(&self, id: i32) -> Result<Option<Incident>, IncidentError> {
        Ok(self.repository.find_by_id(id).await?)
    }

    pub async fn get_incidents_by_target_id(
        &self,
        target_id: &str,
    ) -> Result<Vec<Incident>, IncidentError> {
        Ok(self.repository.find_by_target_id(target_id).await?)
    }

    pub async fn get_unresolved_incidents(&self) -> Result<Vec<Incident>, IncidentError> {
        Ok(self.repository.find_unresolved().await?)
    }

    /// Marks an incident resolved. Resolving twice is a no-op; only the first
    /// call emits `INCIDENT_RESOLVED`.
    pub async fn resolve_incident(&self, id: i32) -> Result<(), IncidentError> {
        let changed = match self.repository.resolve(id).await {
            Ok(changed) => changed,
            Err(RepositoryError::IncidentNotFound(_)) => return Err(IncidentError::NotFound(id)),
            Err(e) => {
                error!(incident_id = id, error = %e, "Failed to resolve incident");
                return Err(e.into());
            }
        };
        if !changed {
            debug!(incident_id = id, "Incident already resolved");
            return Ok(());
        }
        info!(incident_id = id, "Incident resolved");
        self.event_bus
            .emit(MonitoringEvent::IncidentResolved(IncidentResolvedPayload { id }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryIncidentStore;
    use crate::db::models::IncidentType;
    use crate::events::EventKind;
    use std::sync::Mutex;

    fn setup() -> (IncidentManager, Arc<Mutex<Vec<MonitoringEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::IncidentCreated, EventKind::IncidentResolved] {
            let sink = events.clone();
            bus.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
        }
        let manager = IncidentManager::new(Arc::new(InMemoryIncidentStore::new()), bus);
        (manager, events)
    }

    fn outage(target_id: &str) -> CreateIncidentRequest {
        CreateIncidentRequest {
            incident_type: IncidentType::Outage,
            description: "Target unreachable".to_string(),
            target_id: target_id.to_string(),
            rule_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_incident_emits_event() {
        let (manager, events) = setup();
        let incident = manager.create_incident(outage("t1")).await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![MonitoringEvent::IncidentCreated(IncidentCreatedPayload {
                id: incident.id,
                target_id: "t1".to_string(),
                incident_type: IncidentType::Outage,
                description: "Target unreachable".to_string(),
            })]
        );
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent_and_emits_once() {
        let (manager, events) = setup();
        let incident = manager.create_incident(outage("t1")).await.unwrap();

        manager.resolve_incident(incident.id).await.unwrap();
        manager.resolve_incident(incident.id).await.unwrap();

        let resolved = events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.kind() == EventKind::IncidentResolved)
            .count();
        assert_eq!(resolved, 1);
        assert!(manager.get_unresolved_incidents().await.unwrap().is_empty());
        assert!(manager.get_incident(incident.id).await.unwrap().unwrap().resolved);
    }

    #[tokio::test]
    async fn test_resolve_unknown_incident() {
        let (manager, _) = setup();
        assert!(matches!(
            manager.resolve_incident(42).await,
            Err(IncidentError::NotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_incidents_by_target() {
        let (manager, _) = setup();
        manager.create_incident(outage("t1")).await.unwrap();
        manager.create_incident(outage("t2")).await.unwrap();
        manager.create_incident(outage("t1")).await.unwrap();

        let incidents = manager.get_incidents_by_target_id("t1").await.unwrap();
        assert_eq!(incidents.len(), 2);
        assert!(manager.get_incidents_by_target_id("t3").await.unwrap().is_empty());
    }
}
