//! driftwood daemon: an agent polling one queue, or a remote worker host.

mod config;
mod demo;

use crate::config::{DaemonConfig, Role};
use driftwood_agent::{
    Agent, AgentError, MemoryStore, NatsStore, POOL_NAME, Store, TransportKind, WorkflowPool,
    WorkflowWorkerFactory, serve_remote_host,
};
use driftwood_core::{Clock, SystemClock};
use driftwood_workflow::WorkflowRegistry;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> driftwood_core::Result<(), AgentError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,async_nats=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::from_env().map_err(|e| AgentError::Config {
        details: e.to_string(),
    })?;
    config.validate()?;
    info!(role = ?config.role, transport = ?config.transport, "loaded configuration");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(demo::registry().map_err(|e| AgentError::Config {
        details: e.to_string(),
    })?);
    let client = match &config.nats_url {
        Some(url) => Some(connect(url).await?),
        None => None,
    };

    match (config.role, client) {
        (Role::Worker, Some(client)) => run_worker_host(&config, client, registry, clock).await,
        (Role::Worker, None) => Err(AgentError::Config {
            details: "the worker role needs DRIFTWOOD_NATS_URL".to_string(),
        }
        .into()),
        (Role::Agent, client) => run_agent(&config, client, registry, clock).await,
    }
}

async fn connect(url: &str) -> Result<async_nats::Client, AgentError> {
    info!(url, "connecting to NATS");
    async_nats::connect(url).await.map_err(|e| {
        AgentError::Store(driftwood_agent::StoreError::Connection {
            details: e.to_string(),
        })
    })
}

async fn run_worker_host(
    config: &DaemonConfig,
    client: async_nats::Client,
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
) -> driftwood_core::Result<(), AgentError> {
    let prefix = config.worker_subject_prefix.clone();
    tokio::select! {
        served = serve_remote_host(client, prefix, registry, clock) => {
            served.map_err(AgentError::Pool)?;
            warn!("NATS connection closed");
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted, worker host exiting"),
    }
    Ok(())
}

async fn run_agent(
    config: &DaemonConfig,
    client: Option<async_nats::Client>,
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
) -> driftwood_core::Result<(), AgentError> {
    let store: Arc<dyn Store> = match (&client, &config.nats_url) {
        (Some(client), Some(url)) => Arc::new(
            NatsStore::with_client(client.clone(), &config.buckets.store_config(url), clock.clone())
                .await
                .map_err(AgentError::Store)?,
        ),
        _ => {
            warn!("no NATS URL configured, run state will not survive a restart");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };

    let factory = match (config.transport, client) {
        (TransportKind::Thread, _) => WorkflowWorkerFactory::thread(registry.clone(), clock.clone()),
        (TransportKind::Inline, _) => WorkflowWorkerFactory::inline(registry.clone(), clock.clone()),
        (TransportKind::Remote, Some(client)) => {
            WorkflowWorkerFactory::remote(client, config.worker_subject_prefix.clone())
        }
        (TransportKind::Remote, None) => {
            return Err(AgentError::Config {
                details: "the remote transport needs DRIFTWOOD_NATS_URL".to_string(),
            }
            .into());
        }
    };
    let pool = Arc::new(WorkflowPool::new(POOL_NAME, config.pool.clone(), Arc::new(factory)));
    let prewarmed = pool.prewarm().await.map_err(AgentError::Pool)?;
    info!(prewarmed, "worker pool ready");

    let agent = Agent::builder(store, registry, pool)
        .config(config.agent.clone())
        .clock(clock)
        .build();

    if let Some(name) = &config.start_workflow {
        let kwargs: serde_json::Value = match &config.start_kwargs {
            Some(raw) => serde_json::from_str(raw).map_err(|e| AgentError::Config {
                details: format!("DRIFTWOOD_START_KWARGS is not JSON: {e}"),
            })?,
            None => serde_json::Value::Null,
        };
        let run_id = agent.workflows().start(name, kwargs).await?;
        info!(%run_id, "started configured workflow");
    }

    let (stop, stopped) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupted, draining in-flight runs"),
            Err(e) => {
                warn!(error = %e, "cannot listen for interrupts");
                // Dropping `stop` would end the polling loop.
                std::future::pending::<()>().await;
            }
        }
        let _ = stop.send(true);
    });
    agent.run(stopped).await;
    agent.shutdown().await;
    Ok(())
}
