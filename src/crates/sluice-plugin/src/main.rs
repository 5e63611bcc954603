//! sluice-plugin standalone binary

mod events;
mod ingest;
mod plugin_config;
mod tracing_setup;

use anyhow::{Context, Result};
use sluice_chunking::ChunkAggregator;
use sluice_codec::Codec;
use sluice_events::{AggregationEngine, MemorySearchEngine};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    tracing_setup::init_tracing();

    let config = match plugin_config::PluginConfig::new() {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!("failed to load configuration: {err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(config: plugin_config::PluginConfig) -> Result<()> {
    let registry = Arc::new(config.netflow.field_types()?);
    let aggregator = Arc::new(ChunkAggregator::new(config.chunking.store_config()));
    let index = Arc::new(MemorySearchEngine::new(config.events.index_capacity));
    let metrics = Arc::new(ingest::IngestMetrics::default());
    let shutdown = CancellationToken::new();

    let (sink, batches) = mpsc::channel(ingest::SINK_CAPACITY);
    let ingest_service = ingest::IngestService::bind(
        &config,
        registry,
        Arc::clone(&aggregator),
        Arc::clone(&metrics),
        sink,
    )
    .await
    .context("failed to initialize listeners")?;
    let codecs = ingest_service.codecs();

    let mut background = JoinSet::new();
    background.spawn(ingest::write_messages(
        batches,
        Arc::clone(&index),
        Arc::clone(&metrics),
    ));
    background.spawn(evict_expired_state(
        Arc::clone(&aggregator),
        codecs.clone(),
        config.chunking.check_interval,
        shutdown.clone(),
    ));
    background.spawn(log_metrics(
        Arc::clone(&metrics),
        Arc::clone(&aggregator),
        codecs,
        config.metrics_interval,
        shutdown.clone(),
    ));

    let engine = AggregationEngine::new(index).with_search_timeout(config.events.search_timeout);
    for definition in config.events.definitions.iter().cloned() {
        background.spawn(events::schedule(
            engine.clone(),
            definition,
            events::StdoutConsumer,
            shutdown.clone(),
        ));
    }

    let ingest_shutdown = shutdown.clone();
    let mut ingest_task = tokio::spawn(async move { ingest_service.run(ingest_shutdown).await });

    let finished_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                tracing::error!("failed to listen for ctrl-c: {}", err);
            }
            tracing::info!("shutting down");
            None
        }
        joined = &mut ingest_task => Some(joined),
    };

    shutdown.cancel();
    let joined = match finished_early {
        Some(joined) => joined,
        None => ingest_task.await,
    };
    let result = match joined {
        Ok(outcome) => outcome.context("ingestion stopped"),
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(err).context("ingestion task failed"),
    };

    // The writer drains once every listener dropped its sender.
    while let Some(joined) = background.join_next().await {
        if let Err(err) = joined {
            if !err.is_cancelled() {
                tracing::error!("background task join error: {err}");
            }
        }
    }

    result
}

/// Expires partial chunked messages and idle per-sender codec state.
async fn evict_expired_state(
    aggregator: Arc<ChunkAggregator>,
    codecs: Vec<(String, Arc<dyn Codec>)>,
    check_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(check_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }
            _ = tick.tick() => {
                let report = aggregator.evict_expired();
                if report.messages > 0 {
                    tracing::debug!(
                        "evicted {} partial messages ({} chunks)",
                        report.messages,
                        report.chunks
                    );
                }
                for (listener, codec) in &codecs {
                    let removed = codec.evict_idle();
                    if removed > 0 {
                        tracing::debug!("listener {}: dropped {} idle sessions", listener, removed);
                    }
                }
            }
        }
    }
}

async fn log_metrics(
    metrics: Arc<ingest::IngestMetrics>,
    aggregator: Arc<ChunkAggregator>,
    codecs: Vec<(String, Arc<dyn Codec>)>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }
            _ = tick.tick() => {
                let mut stats: BTreeMap<String, u64> = metrics.snapshot().into_iter().collect();
                stats.extend(aggregator.metrics_snapshot());
                for (listener, codec) in &codecs {
                    for (name, value) in codec.metrics_snapshot() {
                        stats.insert(format!("{listener}.{name}"), value);
                    }
                }
                tracing::info!("metrics: {:?}", stats);
            }
        }
    }
}
