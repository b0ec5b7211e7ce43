use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::models::{AlertRule, CreateAlertRuleRequest, UpdateAlertRuleRequest};
use crate::db::{AlertRuleRepository, AlertRuleSource, RepositoryError};
use crate::events::{
    AlertRuleCreatedPayload, AlertRuleDeletedPayload, AlertRuleUpdatedPayload, EventBus,
    EventKind, ListenerId, MonitoringEvent,
};

#[derive(Debug, thiserror::Error)]
pub enum AlertRuleError {
    #[error("Alert rule not found: {0}")]
    NotFound(i32),
    #[error("Threshold must be a finite number, got {0}")]
    InvalidThreshold(f64),
    #[error("Alert rule must name a target")]
    InvalidTarget,
    #[error("Alert rule repository error: {0}")]
    Repository(RepositoryError),
}

impl From<RepositoryError> for AlertRuleError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::RuleNotFound(id) => AlertRuleError::NotFound(id),
            other => AlertRuleError::Repository(other),
        }
    }
}

#[derive(Debug)]
enum RuleRequest {
    Create(CreateAlertRuleRequest),
    Update {
        id: i32,
        changes: UpdateAlertRuleRequest,
    },
    Delete(i32),
}

/// CRUD over alert rules that keeps bus subscribers informed.
pub struct AlertRuleService {
    repository: Arc<dyn AlertRuleRepository>,
    event_bus: Arc<EventBus>,
}

impl AlertRuleService {
    pub fn new(repository: Arc<dyn AlertRuleRepository>, event_bus: Arc<EventBus>) -> Self {
        Self {
            repository,
            event_bus,
        }
    }

    pub async fn create_alert_rule(
        &self,
        request: CreateAlertRuleRequest,
    ) -> Result<AlertRule, AlertRuleError> {
        if request.target_id.trim().is_empty() {
            return Err(AlertRuleError::InvalidTarget);
        }
        check_threshold(request.threshold)?;

        let rule = self.repository.create(request).await.map_err(log_failure)?;
        info!(rule_id = rule.id, target_id = %rule.target_id, metric = %rule.metric, "Alert rule created");
        self.event_bus
            .emit(MonitoringEvent::AlertRuleCreated(AlertRuleCreatedPayload {
                id: rule.id,
                target_id: rule.target_id.clone(),
                rule: rule.clone(),
            }));
        Ok(rule)
    }

    pub async fn get_alert_rule(&self, id: i32) -> Result<AlertRule, AlertRuleError> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or(AlertRuleError::NotFound(id))
    }

    pub async fn get_alert_rules_by_target_id(
        &self,
        target_id: &str,
    ) -> Result<Vec<AlertRule>, AlertRuleError> {
        Ok(self.repository.find_rules_by_target_id(target_id).await?)
    }

    pub async fn update_alert_rule(
        &self,
        id: i32,
        request: UpdateAlertRuleRequest,
    ) -> Result<AlertRule, AlertRuleError> {
        if let Some(threshold) = request.threshold {
            check_threshold(threshold)?;
        }
        let rule = self
            .repository
            .update(id, request)
            .await
            .map_err(log_failure)?;
        info!(rule_id = id, "Alert rule updated");
        self.emit_updated(&rule);
        Ok(rule)
    }

    pub async fn toggle_alert_rule(
        &self,
        id: i32,
        enabled: bool,
    ) -> Result<AlertRule, AlertRuleError> {
        let rule = self
            .repository
            .toggle_enabled(id, enabled)
            .await
            .map_err(log_failure)?;
        info!(rule_id = id, enabled, "Alert rule toggled");
        self.emit_updated(&rule);
        Ok(rule)
    }

    pub async fn delete_alert_rule(&self, id: i32) -> Result<(), AlertRuleError> {
        self.repository.delete(id).await.map_err(log_failure)?;
        info!(rule_id = id, "Alert rule deleted");
        self.event_bus
            .emit(MonitoringEvent::AlertRuleDeleted(AlertRuleDeletedPayload { id }));
        Ok(())
    }

    /// Serves `ALERT_RULE_*_REQUESTED` events from the bus. Requests are
    /// applied in arrival order on a background task.
    pub fn attach_request_handlers(self: Arc<Self>, queue_capacity: usize) -> RuleRequestWorker {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let event_bus = self.event_bus.clone();
        let mut listeners = Vec::with_capacity(3);

        let sender = tx.clone();
        let id = event_bus.on(EventKind::AlertRuleCreateRequested, move |event| {
            if let MonitoringEvent::AlertRuleCreateRequested(request) = event {
                enqueue(&sender, RuleRequest::Create(request.clone()));
            }
        });
        listeners.push((EventKind::AlertRuleCreateRequested, id));

        let sender = tx.clone();
        let id = event_bus.on(EventKind::AlertRuleUpdateRequested, move |event| {
            if let MonitoringEvent::AlertRuleUpdateRequested(payload) = event {
                enqueue(
                    &sender,
                    RuleRequest::Update {
                        id: payload.id,
                        changes: payload.changes.clone(),
                    },
                );
            }
        });
        listeners.push((EventKind::AlertRuleUpdateRequested, id));

        let sender = tx;
        let id = event_bus.on(EventKind::AlertRuleDeleteRequested, move |event| {
            if let MonitoringEvent::AlertRuleDeleteRequested(payload) = event {
                enqueue(&sender, RuleRequest::Delete(payload.id));
            }
        });
        listeners.push((EventKind::AlertRuleDeleteRequested, id));

        let handle = tokio::spawn(self.run_requests(rx));
        RuleRequestWorker {
            event_bus,
            listeners,
            handle,
        }
    }

    async fn run_requests(self: Arc<Self>, mut rx: mpsc::Receiver<RuleRequest>) {
        debug!("Alert rule request worker started");
        while let Some(request) = rx.recv().await {
            let outcome = match request {
                RuleRequest::Create(request) => self.create_alert_rule(request).await.map(drop),
                RuleRequest::Update { id, changes } => {
                    self.update_alert_rule(id, changes).await.map(drop)
                }
                RuleRequest::Delete(id) => self.delete_alert_rule(id).await,
            };
            if let Err(e) = outcome {
                warn!(error = %e, "Requested alert rule change was rejected");
            }
        }
        debug!("Alert rule request worker stopped");
    }

    fn emit_updated(&self, rule: &AlertRule) {
        self.event_bus
            .emit(MonitoringEvent::AlertRuleUpdated(AlertRuleUpdatedPayload {
                id: rule.id,
                rule: rule.clone(),
            }));
    }
}

fn enqueue(sender: &mpsc::Sender<RuleRequest>, request: RuleRequest) {
    match sender.try_send(request) {
        Ok(()) => {}
        Err(TrySendError::Full(request)) => {
            warn!(?request, "Alert rule request queue is full; dropping request");
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Alert rule request worker has stopped; dropping request");
        }
    }
}

/// Handle to the worker started by [`AlertRuleService::attach_request_handlers`].
pub struct RuleRequestWorker {
    event_bus: Arc<EventBus>,
    listeners: Vec<(EventKind, ListenerId)>,
    handle: JoinHandle<()>,
}

impl RuleRequestWorker {
    /// Unsubscribes from the bus and waits for queued requests to be applied.
    pub async fn shutdown(self) {
        for (kind, id) in self.listeners {
            self.event_bus.off(kind, id);
        }
        if let Err(e) = self.handle.await {
            error!(error = %e, "Alert rule request worker terminated abnormally");
        }
    }
}

fn check_threshold(threshold: f64) -> Result<(), AlertRuleError> {
    if threshold.is_finite() {
        Ok(())
    } else {
        Err(AlertRuleError::InvalidThreshold(threshold))
    }
}

fn log_failure(e: RepositoryError) -> AlertRuleError {
    error!(error = %e, "Alert rule operation failed");
    e.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryAlertRuleStore;
    use crate::db::models::{Condition, MetricKind};
    use crate::events::{AlertRuleDeleteRequestedPayload, AlertRuleUpdateRequestedPayload};
    use std::sync::Mutex;

    fn setup() -> (AlertRuleService, Arc<Mutex<Vec<String>>>) {
        let (service, names, _) = setup_with_bus();
        (service, names)
    }

    fn setup_with_bus() -> (AlertRuleService, Arc<Mutex<Vec<String>>>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let names = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            EventKind::AlertRuleCreated,
            EventKind::AlertRuleUpdated,
            EventKind::AlertRuleDeleted,
        ] {
            let sink = names.clone();
            bus.on(kind, move |event| {
                sink.lock().unwrap().push(event.name().to_string());
            });
        }
        let service = AlertRuleService::new(Arc::new(InMemoryAlertRuleStore::new()), bus.clone());
        (service, names, bus)
    }

    fn ping_rule(threshold: f64) -> CreateAlertRuleRequest {
        CreateAlertRuleRequest {
            target_id: "t1".to_string(),
            metric: MetricKind::Ping,
            condition: Condition::GreaterThan,
            threshold,
            enabled: None,
        }
    }

    #[tokio::test]
    async fn test_rule_lifecycle_emits_events() {
        let (service, names) = setup();
        let rule = service.create_alert_rule(ping_rule(100.0)).await.unwrap();

        let updated = service
            .update_alert_rule(
                rule.id,
                UpdateAlertRuleRequest {
                    threshold: Some(200.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.threshold, 200.0);

        let toggled = service.toggle_alert_rule(rule.id, false).await.unwrap();
        assert!(!toggled.enabled);

        service.delete_alert_rule(rule.id).await.unwrap();
        assert!(matches!(
            service.get_alert_rule(rule.id).await,
            Err(AlertRuleError::NotFound(_))
        ));

        assert_eq!(
            *names.lock().unwrap(),
            vec![
                "ALERT_RULE_CREATED",
                "ALERT_RULE_UPDATED",
                "ALERT_RULE_UPDATED",
                "ALERT_RULE_DELETED"
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_rules_are_rejected() {
        let (service, names) = setup();
        assert!(matches!(
            service.create_alert_rule(ping_rule(f64::INFINITY)).await,
            Err(AlertRuleError::InvalidThreshold(_))
        ));
        let mut request = ping_rule(1.0);
        request.target_id = String::new();
        assert!(matches!(
            service.create_alert_rule(request).await,
            Err(AlertRuleError::InvalidTarget)
        ));
        assert!(matches!(
            service.toggle_alert_rule(5, true).await,
            Err(AlertRuleError::NotFound(5))
        ));
        assert!(names.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rules_by_target() {
        let (service, _) = setup();
        service.create_alert_rule(ping_rule(1.0)).await.unwrap();
        service.create_alert_rule(ping_rule(2.0)).await.unwrap();

        let rules = service.get_alert_rules_by_target_id("t1").await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(service.get_alert_rules_by_target_id("t2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_events_are_applied_in_order() {
        let (service, names, bus) = setup_with_bus();
        let service = Arc::new(service);
        let worker = service.clone().attach_request_handlers(16);

        bus.emit(MonitoringEvent::AlertRuleCreateRequested(ping_rule(f64::NAN)));
        bus.emit(MonitoringEvent::AlertRuleCreateRequested(ping_rule(100.0)));
        bus.emit(MonitoringEvent::AlertRuleCreateRequested(ping_rule(200.0)));
        bus.emit(MonitoringEvent::AlertRuleUpdateRequested(
            AlertRuleUpdateRequestedPayload {
                id: 1,
                changes: UpdateAlertRuleRequest {
                    threshold: Some(300.0),
                    ..Default::default()
                },
            },
        ));
        bus.emit(MonitoringEvent::AlertRuleDeleteRequested(
            AlertRuleDeleteRequestedPayload { id: 2 },
        ));
        bus.emit(MonitoringEvent::AlertRuleDeleteRequested(
            AlertRuleDeleteRequestedPayload { id: 42 },
        ));
        worker.shutdown().await;

        assert_eq!(service.get_alert_rule(1).await.unwrap().threshold, 300.0);
        assert!(matches!(
            service.get_alert_rule(2).await,
            Err(AlertRuleError::NotFound(2))
        ));
        assert_eq!(
            *names.lock().unwrap(),
            vec![
                "ALERT_RULE_CREATED",
                "ALERT_RULE_CREATED",
                "ALERT_RULE_UPDATED",
                "ALERT_RULE_DELETED"
            ]
        );
        for kind in [
            EventKind::AlertRuleCreateRequested,
            EventKind::AlertRuleUpdateRequested,
            EventKind::AlertRuleDeleteRequested,
        ] {
            assert_eq!(bus.listener_count(kind), 0);
        }
    }
}
