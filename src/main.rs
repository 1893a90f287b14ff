use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

use courier::config::Config;
use courier::functions::{
    ChannelSerializer, DeliveryExecutor, DurableBackend, FallbackBackend, JobScheduler,
    SchedulingBackend, sweeper, worker,
};
use courier::services::{
    DryRunTransport, JobQueue, MessageTransport, Notifier, PgJobQueue, PgNotifier,
    PgScheduleStore, PgTicketResolver, ScheduleStore, TicketResolver,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env());
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;

    let pg_store = PgScheduleStore::new(pool.clone());
    pg_store.migrate().await?;
    let store: Arc<dyn ScheduleStore> = Arc::new(pg_store);

    // the embedding platform injects the real channel client; standalone
    // runs log sends instead of performing them
    let transport: Arc<dyn MessageTransport> = Arc::new(DryRunTransport);
    tracing::info!("no channel transport wired, sends run dry");

    let tickets: Arc<dyn TicketResolver> = Arc::new(PgTicketResolver::new(pool.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(PgNotifier::new(pool.clone()));

    let executor = Arc::new(DeliveryExecutor::new(
        config.clone(),
        store.clone(),
        transport,
        tickets,
        notifier.clone(),
        ChannelSerializer::new(),
    ));

    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool.clone()));
    let durable: Option<Arc<dyn SchedulingBackend>> = config.durable_queue.then(|| {
        Arc::new(DurableBackend::new(
            queue.clone(),
            config.job_attempts,
            config.backoff_base_secs,
        )) as Arc<dyn SchedulingBackend>
    });
    let fallback: Arc<dyn SchedulingBackend> = Arc::new(FallbackBackend::new(
        executor.clone(),
        config.fallback_grace,
        config.fallback_jitter_mod_ms,
    ));
    let scheduler = Arc::new(JobScheduler::new(durable, fallback));
    scheduler.probe().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handle = tokio::spawn(worker(
        queue,
        executor,
        config.clone(),
        shutdown_rx.clone(),
    ));
    let sweeper_handle = tokio::spawn(sweeper(
        store,
        scheduler,
        notifier,
        config.clone(),
        shutdown_rx,
    ));

    tracing::info!("courier started");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    shutdown_tx.send(true)?;
    worker_handle.await?;
    sweeper_handle.await?;

    Ok(())
}
