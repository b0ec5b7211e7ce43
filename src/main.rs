use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pulsewatch::alerting::{AlertRuleService, EvaluationService, IncidentManager};
use pulsewatch::db::{InMemoryAlertRuleStore, InMemoryIncidentStore};
use pulsewatch::events::EventBus;
use pulsewatch::probes::HttpProbeRunner;
use pulsewatch::scheduler::MonitoringScheduler;
use pulsewatch::server::config::AppConfig;
use pulsewatch::server::event_forwarder::spawn_forwarder;
use pulsewatch::version::VERSION;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str, default_filter: &str) {
    // JSON to a daily rotated file, human-readable to stdout
    let file_appender = rolling::daily(log_dir, "pulsewatch.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Logging depends on the config, so config errors go to stderr.
    let config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&config.log_dir, &config.log_filter);
    info!(version = VERSION, targets = config.targets.len(), rules = config.rules.len(), "Starting pulsewatch");

    let event_bus = Arc::new(EventBus::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let forwarder = spawn_forwarder(&event_bus, shutdown_rx);

    let rule_store = Arc::new(InMemoryAlertRuleStore::new());
    let rule_service = Arc::new(AlertRuleService::new(rule_store.clone(), event_bus.clone()));
    for rule in &config.rules {
        rule_service.create_alert_rule(rule.request()).await?;
    }
    info!(count = rule_store.len(), "Alert rules loaded");
    let alerting_options = config.alerting.options();
    let rule_request_worker = rule_service
        .clone()
        .attach_request_handlers(alerting_options.queue_capacity);

    let incidents = Arc::new(IncidentManager::new(
        Arc::new(InMemoryIncidentStore::new()),
        event_bus.clone(),
    ));
    let evaluator = Arc::new(EvaluationService::new(
        rule_store.clone(),
        incidents.clone(),
        event_bus.clone(),
    ));
    let evaluation_worker = evaluator.attach(alerting_options);

    let runner = Arc::new(HttpProbeRunner::new()?);
    for target in &config.targets {
        runner.register(target.id.clone(), target.url.clone());
    }

    let scheduler = MonitoringScheduler::with_settings(
        runner,
        event_bus.clone(),
        config.scheduler.settings(),
    );
    for target in &config.targets {
        if let Err(e) = scheduler.add_target(target.monitoring_config()) {
            warn!(target_id = %target.id, error = %e, "Skipping target");
        }
    }
    scheduler.attach_request_handlers();
    scheduler.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    scheduler.stop();
    rule_request_worker.shutdown().await;
    evaluation_worker.shutdown().await;

    let unresolved = incidents.get_unresolved_incidents().await?;
    let stats = scheduler.get_stats();
    info!(
        total_runs = stats.total_runs,
        failed_runs = stats.failed_runs,
        unresolved_incidents = unresolved.len(),
        "Monitoring summary"
    );

    let _ = shutdown_tx.send(());
    if let Err(e) = forwarder.await {
        error!(error = %e, "Event forwarder terminated abnormally");
    }
    info!("pulsewatch stopped");
    Ok(())
}
