use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use eventproc_events::{Attributes, EventRecord, ProcessingContext};
use eventproc_infra::{
    AppConfig, Component, EventProcessor, ProcessRegistry, SqliteEventTable,
};

/// Component used by the standalone server: logs every event it is handed.
#[derive(Debug, Default)]
struct LoggingComponent;

impl LoggingComponent {
    fn log(&self, ctx: &ProcessingContext, record: &EventRecord) {
        info!(
            processor = ctx.processor(),
            data_id = %record.data_id(),
            kind = %record.kind(),
            priority = %record.priority(),
            user = record.user().unwrap_or("-"),
            params = record.params().bits(),
            restored = record.is_restored(),
            "event"
        );
    }
}

impl Component for LoggingComponent {
    fn on_update(
        &self,
        ctx: &ProcessingContext,
        record: &EventRecord,
        _attributes: &Attributes,
    ) -> anyhow::Result<()> {
        self.log(ctx, record);
        Ok(())
    }

    fn on_delete(
        &self,
        ctx: &ProcessingContext,
        record: &EventRecord,
        _attributes: &Attributes,
    ) -> anyhow::Result<()> {
        self.log(ctx, record);
        Ok(())
    }
}

type ServerProcessor = EventProcessor<LoggingComponent, SqliteEventTable>;

fn start_processors(
    config: &AppConfig,
    registry: &Arc<ProcessRegistry>,
) -> anyhow::Result<Vec<ServerProcessor>> {
    let mut started = Vec::with_capacity(config.processors.len());
    for processor in &config.processors {
        let table = SqliteEventTable::connect(&config.database_url, &processor.name)
            .with_context(|| format!("failed to open event table for '{}'", processor.name))?;
        started.push(EventProcessor::start(
            processor.clone(),
            LoggingComponent,
            table,
            registry.clone(),
        )?);
    }
    Ok(started)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    eventproc_observability::init_with(config.log_format);

    let registry = ProcessRegistry::global();

    // Processors own blocking runtimes; start and stop them off the async workers.
    let processors = {
        let config = config.clone();
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || start_processors(&config, &registry)).await??
    };
    if processors.is_empty() {
        tracing::warn!("no processors configured");
    }

    let app = eventproc_api::app::build_app(registry);
    let listener = tokio::net::TcpListener::bind(&config.admin_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.admin_bind))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down processors");
    tokio::task::spawn_blocking(move || {
        for processor in &processors {
            processor.shutdown();
        }
        drop(processors);
    })
    .await?;
    Ok(())
}
