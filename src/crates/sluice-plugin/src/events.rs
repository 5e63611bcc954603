use async_trait::async_trait;
use chrono::Utc;
use sluice_events::{
    AggregationEngine, ConsumerError, DerivedEvent, EventConsumer, EventDefinition, TimeRange,
};
use std::io::Write;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Prints derived events as JSON lines on stdout.
#[derive(Debug, Default)]
pub(crate) struct StdoutConsumer;

#[async_trait]
impl EventConsumer for StdoutConsumer {
    async fn accept(&self, events: Vec<DerivedEvent>) -> Result<(), ConsumerError> {
        let mut stdout = std::io::stdout().lock();
        for event in &events {
            let line = serde_json::to_string(event).map_err(|e| ConsumerError(e.to_string()))?;
            writeln!(stdout, "{line}").map_err(|e| ConsumerError(e.to_string()))?;
        }
        stdout.flush().map_err(|e| ConsumerError(e.to_string()))
    }
}

/// Runs `definition` over the trailing `search_within` window every
/// `execute_every` until shutdown. Failed runs are logged, not retried.
pub(crate) async fn schedule(
    engine: AggregationEngine,
    definition: EventDefinition,
    consumer: impl EventConsumer,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(definition.execute_every());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately, before anything was ingested.
    tick.tick().await;

    tracing::info!(
        "scheduling event definition '{}' every {}",
        definition.id,
        humantime::format_duration(definition.execute_every())
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }
            _ = tick.tick() => {
                let time_range = TimeRange::ending_at(Utc::now(), definition.search_within);
                match engine.run(&definition, time_range, &consumer).await {
                    Ok(summary) if summary.events > 0 => {
                        tracing::info!(
                            "event definition '{}' produced {} events over {}",
                            definition.id,
                            summary.events,
                            time_range
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("event definition '{}' failed: {}", definition.id, err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_codec::Message;
    use sluice_events::{AggregationFunction, CollectingConsumer, MemorySearchEngine, SeriesSpec};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn scheduled_definition_runs_over_indexed_messages() {
        let index = Arc::new(MemorySearchEngine::new(16));
        let mut message = Message::new("web-1", Utc::now(), "GET /admin 403");
        message.add_field("status", 403);
        index.index(&["web".to_string()], message);

        let mut definition = EventDefinition::new("denied", "Denied", Duration::from_secs(3600));
        definition.execute_every = Some(Duration::from_secs(10));
        definition.query = "status:403".to_string();
        definition.series = vec![SeriesSpec::new("n", AggregationFunction::Count, None)];

        let consumer = Arc::new(CollectingConsumer::new());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(schedule(
            AggregationEngine::new(index),
            definition,
            ConsumerHandle(Arc::clone(&consumer)),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(11)).await;
        shutdown.cancel();
        task.await.unwrap();

        let events = consumer.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].field("aggregation_value_count"), Some(&1.into()));
    }

    struct ConsumerHandle(Arc<CollectingConsumer>);

    #[async_trait]
    impl EventConsumer for ConsumerHandle {
        async fn accept(&self, events: Vec<DerivedEvent>) -> Result<(), ConsumerError> {
            self.0.accept(events).await
        }
    }
}
