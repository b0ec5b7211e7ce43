use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alerting::incident_service::{IncidentError, IncidentManager};
use crate::db::models::{AlertRule, CreateIncidentRequest, Incident, IncidentType, MeasurementResult};
use crate::db::{AlertRuleSource, RepositoryError};
use crate::events::{
    AlertTriggeredPayload, DisableReason, EventBus, EventKind, ListenerId, MonitoringEvent,
};

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("Failed to load alert rules: {0}")]
    Rules(#[from] RepositoryError),
    #[error("Rule {rule_id} has a non-finite threshold ({threshold})")]
    InvalidThreshold { rule_id: i32, threshold: f64 },
    #[error("Incident error: {0}")]
    Incident(#[from] IncidentError),
}

#[derive(Debug, Clone, Copy)]
pub struct EvaluationOptions {
    /// Jobs waiting for the worker. Further results are dropped with a warning.
    pub queue_capacity: usize,
    /// Open an `OUTAGE` incident when a target is disabled for repeated failures.
    pub outage_incidents: bool,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            outage_incidents: true,
        }
    }
}

#[derive(Debug)]
enum EvaluationJob {
    Measurement(MeasurementResult),
    Outage { target_id: String, failure_count: u32 },
}

/// Checks measurement results against the alert rules of their target.
///
/// Every enabled rule in violation produces an `ALERT` incident on every
/// evaluation; there is no cooldown or deduplication between results.
pub struct EvaluationService {
    rules: Arc<dyn AlertRuleSource>,
    incidents: Arc<IncidentManager>,
    event_bus: Arc<EventBus>,
}

impl EvaluationService {
    pub fn new(
        rules: Arc<dyn AlertRuleSource>,
        incidents: Arc<IncidentManager>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            rules,
            incidents,
            event_bus,
        }
    }

    pub async fn evaluate(
        &self,
        result: &MeasurementResult,
    ) -> Result<Vec<Incident>, EvaluationError> {
        self.check_alert_rules(&result.target_id, result).await
    }

    /// Evaluates the enabled rules of `target_id` and returns the incidents
    /// created. A failing rule is logged and does not stop the others.
    pub async fn check_alert_rules(
        &self,
        target_id: &str,
        result: &MeasurementResult,
    ) -> Result<Vec<Incident>, EvaluationError> {
        let rules = self
            .rules
            .find_rules_by_target_id(target_id)
            .await
            .map_err(|e| {
                error!(target_id, error = %e, "Failed to load alert rules");
                EvaluationError::from(e)
            })?;

        let mut fired = Vec::new();
        for rule in rules.iter().filter(|rule| rule.enabled) {
            match self.evaluate_rule(target_id, rule, result).await {
                Ok(Some(incident)) => fired.push(incident),
                Ok(None) => {}
                Err(e) => {
                    error!(target_id, rule_id = rule.id, error = %e, "Error evaluating alert rule");
                }
            }
        }
        Ok(fired)
    }

    async fn evaluate_rule(
        &self,
        target_id: &str,
        rule: &AlertRule,
        result: &MeasurementResult,
    ) -> Result<Option<Incident>, EvaluationError> {
        let Some(value) = rule.metric.read(result) else {
            debug!(target_id, rule_id = rule.id, metric = %rule.metric, "Metric missing from result; skipping rule");
            return Ok(None);
        };
        if !rule.threshold.is_finite() {
            return Err(EvaluationError::InvalidThreshold {
                rule_id: rule.id,
                threshold: rule.threshold,
            });
        }
        if !rule.condition.is_met(value, rule.threshold) {
            return Ok(None);
        }

        let description = format!(
            "Alert triggered: {} {} {} (actual: {})",
            rule.metric, rule.condition, rule.threshold, value
        );
        let incident = self
            .incidents
            .record(CreateIncidentRequest {
                incident_type: IncidentType::Alert,
                description,
                target_id: target_id.to_string(),
                rule_id: Some(rule.id),
            })
            .await?;

        info!(target_id, rule_id = rule.id, value, threshold = rule.threshold, "Alert rule triggered");
        self.event_bus
            .emit(MonitoringEvent::AlertTriggered(AlertTriggeredPayload {
                target_id: target_id.to_string(),
                rule_id: rule.id,
                value,
                threshold: rule.threshold,
            }));
        self.incidents.announce(&incident);
        Ok(Some(incident))
    }

    /// Opens an `OUTAGE` incident for a target taken out of rotation.
    pub async fn report_outage(
        &self,
        target_id: &str,
        failure_count: u32,
    ) -> Result<Incident, EvaluationError> {
        let incident = self
            .incidents
            .create_incident(CreateIncidentRequest {
                incident_type: IncidentType::Outage,
                description: format!(
                    "Target {target_id} disabled after {failure_count} consecutive failures"
                ),
                target_id: target_id.to_string(),
                rule_id: None,
            })
            .await?;
        Ok(incident)
    }

    /// Subscribes to completed measurements (and, if enabled, failure-threshold
    /// disables) and evaluates them on a background task.
    pub fn attach(self: Arc<Self>, options: EvaluationOptions) -> EvaluationWorker {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let event_bus = self.event_bus.clone();
        let mut listeners = Vec::with_capacity(2);

        let sender = tx.clone();
        let id = event_bus.on(EventKind::SpeedTestCompleted, move |event| {
            if let MonitoringEvent::SpeedTestCompleted(payload) = event {
                enqueue(&sender, EvaluationJob::Measurement(payload.result.clone()));
            }
        });
        listeners.push((EventKind::SpeedTestCompleted, id));

        if options.outage_incidents {
            let sender = tx;
            let id = event_bus.on(EventKind::MonitoringTargetDisabled, move |event| {
                if let MonitoringEvent::MonitoringTargetDisabled(payload) = event {
                    if payload.reason == DisableReason::FailureThreshold {
                        enqueue(
                            &sender,
                            EvaluationJob::Outage {
                                target_id: payload.target_id.clone(),
                                failure_count: payload.failure_count,
                            },
                        );
                    }
                }
            });
            listeners.push((EventKind::MonitoringTargetDisabled, id));
        }

        let handle = tokio::spawn(self.run_worker(rx));
        EvaluationWorker {
            event_bus,
            listeners,
            handle,
        }
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::Receiver<EvaluationJob>) {
        info!("Alert evaluation worker started");
        while let Some(job) = rx.recv().await {
            match job {
                EvaluationJob::Measurement(result) => {
                    if let Err(e) = self.evaluate(&result).await {
                        error!(target_id = %result.target_id, error = %e, "Alert evaluation failed");
                    }
                }
                EvaluationJob::Outage {
                    target_id,
                    failure_count,
                } => {
                    if let Err(e) = self.report_outage(&target_id, failure_count).await {
                        error!(target_id = %target_id, error = %e, "Failed to record outage incident");
                    }
                }
            }
        }
        info!("Alert evaluation worker stopped");
    }
}

fn enqueue(sender: &mpsc::Sender<EvaluationJob>, job: EvaluationJob) {
    match sender.try_send(job) {
        Ok(()) => {}
        Err(TrySendError::Full(job)) => {
            warn!(?job, "Alert evaluation queue is full; dropping job");
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Alert evaluation worker has stopped; dropping job");
        }
    }
}

/// Handle to the background evaluator started by [`EvaluationService::attach`].
pub struct EvaluationWorker {
    event_bus: Arc<EventBus>,
    listeners: Vec<(EventKind, ListenerId)>,
    handle: JoinHandle<()>,
}

impl EvaluationWorker {
    /// Unsubscribes from the bus, lets the worker finish queued jobs and waits for it.
    pub async fn shutdown(self) {
        for (kind, id) in self.listeners {
            self.event_bus.off(kind, id);
        }
        if let Err(e) = self.handle.await {
            error!(error = %e, "Alert evaluation worker terminated abnormally");
        }
    }
}
