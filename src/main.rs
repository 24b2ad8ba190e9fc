// Copyright 2025 Cowboy AI, LLC.

//! Process entrypoint (§14): load config, install tracing, open the store,
//! connect the MQ substrate, wire the bus manager and rule executors to the
//! two control-plane reflectors, start the metrics endpoint, then run until
//! `SIGINT`/`SIGTERM` drains everything gracefully.

use std::sync::Arc;

use eventbridge::bus::{BusManager, BusManagerConfig};
use eventbridge::config::Settings;
use eventbridge::errors::Result;
use eventbridge::event_repo::{BusHandler, EventRepository, EventRepositoryConfig, RuleExecutors, RuleHandler};
use eventbridge::informer::{Informer, InformerConfig};
use eventbridge::persistence::{self, BusReflector, RuleReflector};
use eventbridge::rule::target::DispatcherRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("eventbridge-job: fatal bootstrap error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let settings = Settings::load()?;
    eventbridge::telemetry::init(&settings.logging)?;
    info!("eventbridge-job starting up");

    let pool = persistence::connect(&settings.store.dsn, settings.store.pool_size).await?;
    persistence::migrate(&pool).await?;
    info!("store connected and migrated");

    let dispatcher_registry = Arc::new(DispatcherRegistry::with_builtins_config(std::time::Duration::from_secs(
        settings.http_dispatcher.idle_timeout_secs,
    ))?);
    let rule_executors = Arc::new(RuleExecutors::new(
        dispatcher_registry,
        settings.executor.transform_concurrency,
        settings.executor_update_timeout(),
    ));

    let nats_client = async_nats::connect(&settings.mq.url)
        .await
        .map_err(|e| eventbridge::EventBridgeError::Mq(e.to_string()))?;
    let jetstream = async_nats::jetstream::new(nats_client);
    info!(url = %settings.mq.url, "mq substrate connected");

    let bus_manager_config = BusManagerConfig {
        default_host: settings.mq.default_host.clone(),
        workers_per_topic: settings.bus_consumer.workers_per_topic,
        orderly_invisibility_base: settings.orderly_invisibility_base(),
        consumer_timeout: settings.consumer_timeout(),
        req_timeout: settings.bus_req_timeout(),
    };
    let event_repo_config = EventRepositoryConfig {
        rule_parallelism: settings.event_repo.rule_parallelism,
    };

    // BusManager needs its handler (this repository) at construction, and
    // the repository needs a way to requeue through the manager it is
    // handling for — `Arc::new_cyclic` hands us the manager's own `Weak`
    // before the `Arc` exists, breaking the cycle without an unsafe
    // late-bound cell.
    let rule_executors_for_repo = rule_executors.clone();
    let bus_manager: Arc<BusManager> = Arc::new_cyclic(|weak_bus| {
        let repo = Arc::new(EventRepository::new(rule_executors_for_repo, weak_bus.clone(), event_repo_config));
        BusManager::new(jetstream, repo, bus_manager_config)
    });

    let informer_config = InformerConfig {
        delta_queue_capacity: settings.informer.delta_queue_capacity,
        retry_queue_capacity: settings.informer.retry_queue_capacity,
        worker_pool_size: settings.informer.worker_pool_size,
        backoff: eventbridge::informer::BackoffPolicy {
            max_step: std::time::Duration::from_secs(settings.informer.backoff_max_step_secs),
            ..Default::default()
        },
    };

    let bus_reflector = Arc::new(BusReflector::new(
        pool.clone(),
        settings.informer_poll_interval(),
        settings.informer_db_timeout(),
    ));
    let bus_handler = Arc::new(BusHandler::new(Arc::downgrade(&bus_manager)));
    let mut bus_informer = Informer::new("bus", bus_reflector, bus_handler, informer_config.clone());
    bus_informer.start();

    let rule_reflector = Arc::new(RuleReflector::new(
        pool.clone(),
        settings.informer_poll_interval(),
        settings.informer_db_timeout(),
    ));
    let rule_handler = Arc::new(RuleHandler::new(rule_executors.clone()));
    let mut rule_informer = Informer::new("rule", rule_reflector, rule_handler, informer_config);
    rule_informer.start();

    info!("informers started");

    let metrics_shutdown = CancellationToken::new();
    eventbridge::metrics::init();
    let metrics_addr = settings
        .metrics
        .bind_address
        .parse()
        .map_err(|e| eventbridge::EventBridgeError::Config(format!("metrics.bind_address: {e}")))?;
    let metrics_task = tokio::spawn(eventbridge::metrics::serve(metrics_addr, metrics_shutdown.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");

    metrics_shutdown.cancel();
    match metrics_task.await {
        Ok(Err(e)) => error!(error = %e, "metrics server exited with an error"),
        Err(e) => error!(error = %e, "metrics server task panicked"),
        Ok(Ok(())) => {}
    }

    bus_informer.close().await;
    rule_informer.close().await;
    bus_manager.close().await;
    pool.close().await;

    info!("eventbridge-job shut down cleanly");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
