use crate::plugin_config::{ListenerConfig, PluginConfig, Transport};
use anyhow::{Context, Result};
use bytes::Bytes;
use sluice_chunking::ChunkAggregator;
use sluice_codec::{
    Codec, DecompressStage, FrameDecoder, Message, Pipeline, PipelineStatus, RawPayload,
    build_codec,
};
use sluice_events::MemorySearchEngine;
use sluice_netflow::FieldTypeRegistry;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// Decoded batches waiting for the writer; senders drop when it is full.
pub(crate) const SINK_CAPACITY: usize = 4096;

#[derive(Default)]
pub(crate) struct IngestMetrics {
    pub(crate) datagrams_received: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) connections_accepted: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) payloads_pending: AtomicU64,
    pub(crate) payloads_invalid: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) messages_decoded: AtomicU64,
    pub(crate) messages_dropped: AtomicU64,
    pub(crate) messages_written: AtomicU64,
}

impl IngestMetrics {
    pub(crate) fn snapshot(&self) -> HashMap<String, u64> {
        [
            ("datagrams_received", &self.datagrams_received),
            ("bytes_received", &self.bytes_received),
            ("connections_accepted", &self.connections_accepted),
            ("frames_received", &self.frames_received),
            ("payloads_pending", &self.payloads_pending),
            ("payloads_invalid", &self.payloads_invalid),
            ("decode_errors", &self.decode_errors),
            ("messages_decoded", &self.messages_decoded),
            ("messages_dropped", &self.messages_dropped),
            ("messages_written", &self.messages_written),
        ]
        .into_iter()
        .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
        .collect()
    }
}

/// Messages decoded from one payload, with the streams they belong to.
#[derive(Debug)]
pub(crate) struct DecodedBatch {
    pub(crate) streams: Arc<[String]>,
    pub(crate) messages: Vec<Message>,
}

/// What every receive task of one listener shares.
struct ListenerContext {
    name: String,
    pipeline: Pipeline,
    streams: Arc<[String]>,
    metrics: Arc<IngestMetrics>,
    sink: mpsc::Sender<DecodedBatch>,
}

impl ListenerContext {
    fn handle(&self, payload: RawPayload) {
        let output = match self.pipeline.process(payload) {
            Ok(output) => output,
            Err(err) => {
                self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("listener {}: failed to decode payload: {}", self.name, err);
                return;
            }
        };

        match output.status {
            PipelineStatus::Pending => {
                self.metrics.payloads_pending.fetch_add(1, Ordering::Relaxed);
            }
            PipelineStatus::Invalid => {
                self.metrics.payloads_invalid.fetch_add(1, Ordering::Relaxed);
            }
            PipelineStatus::Decoded if output.messages.is_empty() => {}
            PipelineStatus::Decoded => {
                let count = output.messages.len() as u64;
                self.metrics
                    .messages_decoded
                    .fetch_add(count, Ordering::Relaxed);
                let batch = DecodedBatch {
                    streams: Arc::clone(&self.streams),
                    messages: output.messages,
                };
                if self.sink.try_send(batch).is_err() {
                    self.metrics
                        .messages_dropped
                        .fetch_add(count, Ordering::Relaxed);
                    tracing::debug!("listener {}: writer is behind, dropped {} messages", self.name, count);
                }
            }
        }
    }
}

enum BoundSocket {
    Udp(Arc<UdpSocket>),
    Tcp(TcpListener),
}

struct Listener {
    config: ListenerConfig,
    socket: BoundSocket,
    context: Arc<ListenerContext>,
}

/// Bound listeners, ready to receive.
pub(crate) struct IngestService {
    listeners: Vec<Listener>,
    workers: usize,
}

impl IngestService {
    pub(crate) async fn bind(
        cfg: &PluginConfig,
        registry: Arc<FieldTypeRegistry>,
        aggregator: Arc<ChunkAggregator>,
        metrics: Arc<IngestMetrics>,
        sink: mpsc::Sender<DecodedBatch>,
    ) -> Result<Self> {
        let decompress = DecompressStage::new(cfg.chunking.max_decompressed_size);
        let mut listeners = Vec::with_capacity(cfg.listeners.len());

        for config in &cfg.listeners {
            let mut pipeline = Pipeline::new(build_codec(&config.codec, Arc::clone(&registry)))
                .with_decompression(decompress);
            if config.chunked {
                pipeline = pipeline.with_chunking(Arc::clone(&aggregator));
            }

            let socket = match config.transport {
                Transport::Udp => BoundSocket::Udp(Arc::new(
                    UdpSocket::bind(&config.listen)
                        .await
                        .with_context(|| format!("failed to bind udp {}", config.listen))?,
                )),
                Transport::Tcp => BoundSocket::Tcp(
                    TcpListener::bind(&config.listen)
                        .await
                        .with_context(|| format!("failed to bind tcp {}", config.listen))?,
                ),
            };
            tracing::info!(
                "listener {} on {} {} (codec {}, chunked {})",
                config.name,
                match config.transport {
                    Transport::Udp => "udp",
                    Transport::Tcp => "tcp",
                },
                config.listen,
                config.codec,
                config.chunked
            );

            let context = Arc::new(ListenerContext {
                name: config.name.clone(),
                pipeline,
                streams: config.streams().into(),
                metrics: Arc::clone(&metrics),
                sink: sink.clone(),
            });
            listeners.push(Listener {
                config: config.clone(),
                socket,
                context,
            });
        }

        Ok(Self {
            listeners,
            workers: cfg.workers,
        })
    }

    /// Codecs by listener name, for their metrics.
    pub(crate) fn codecs(&self) -> Vec<(String, Arc<dyn Codec>)> {
        self.listeners
            .iter()
            .map(|l| (l.config.name.clone(), Arc::clone(l.context.pipeline.codec())))
            .collect()
    }

    pub(crate) async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();

        for listener in self.listeners {
            match listener.socket {
                BoundSocket::Udp(socket) => {
                    for _ in 0..self.workers {
                        tasks.spawn(receive_datagrams(
                            Arc::clone(&socket),
                            Arc::clone(&listener.context),
                            listener.config.max_packet_size,
                            shutdown.clone(),
                        ));
                    }
                }
                BoundSocket::Tcp(tcp) => {
                    tasks.spawn(accept_connections(
                        tcp,
                        listener.config.clone(),
                        Arc::clone(&listener.context),
                        shutdown.clone(),
                    ));
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                if !err.is_cancelled() {
                    tracing::error!("listener task failed: {}", err);
                }
            }
        }
        Ok(())
    }
}

async fn receive_datagrams(
    socket: Arc<UdpSocket>,
    context: Arc<ListenerContext>,
    max_packet_size: usize,
    shutdown: CancellationToken,
) {
    let mut buffer = vec![0_u8; max_packet_size];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }
            recv = socket.recv_from(&mut buffer) => {
                let (received, source) = match recv {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::warn!("listener {}: udp recv error: {}", context.name, err);
                        continue;
                    }
                };
                if received == 0 {
                    continue;
                }

                context.metrics.datagrams_received.fetch_add(1, Ordering::Relaxed);
                context
                    .metrics
                    .bytes_received
                    .fetch_add(received as u64, Ordering::Relaxed);

                let bytes = Bytes::copy_from_slice(&buffer[..received]);
                context.handle(RawPayload::new(bytes, Some(source)));
            }
        }
    }
}

async fn accept_connections(
    tcp: TcpListener,
    config: ListenerConfig,
    context: Arc<ListenerContext>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }
            accepted = tcp.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("listener {}: accept failed: {}", context.name, err);
                        continue;
                    }
                };
                context.metrics.connections_accepted.fetch_add(1, Ordering::Relaxed);
                let decoder = FrameDecoder::new(config.framing, config.max_packet_size);
                tokio::spawn(read_frames(
                    stream,
                    peer,
                    decoder,
                    Arc::clone(&context),
                    shutdown.clone(),
                ));
            }
        }
    }
}

async fn read_frames(
    stream: TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder,
    context: Arc<ListenerContext>,
    shutdown: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, decoder);
    tracing::debug!("listener {}: connection from {}", context.name, peer);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                break;
            }
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    context.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                    context
                        .metrics
                        .bytes_received
                        .fetch_add(frame.len() as u64, Ordering::Relaxed);
                    context.handle(RawPayload::new(frame, Some(peer)));
                }
                Some(Err(err)) => {
                    tracing::warn!("listener {}: closing connection from {}: {}", context.name, peer, err);
                    break;
                }
                None => break,
            }
        }
    }
    tracing::debug!("listener {}: connection from {} closed", context.name, peer);
}

/// Indexes decoded messages for event definitions and prints them as JSON
/// lines on stdout.
pub(crate) async fn write_messages(
    mut batches: mpsc::Receiver<DecodedBatch>,
    index: Arc<MemorySearchEngine>,
    metrics: Arc<IngestMetrics>,
) {
    while let Some(batch) = batches.recv().await {
        let mut stdout = std::io::stdout().lock();
        for message in batch.messages {
            match serde_json::to_string(&message) {
                Ok(line) => {
                    if let Err(err) = writeln!(stdout, "{line}") {
                        tracing::warn!("failed to write message: {}", err);
                    }
                }
                Err(err) => tracing::warn!("failed to serialize message {}: {}", message.id, err),
            }
            index.index(&batch.streams, message);
            metrics.messages_written.fetch_add(1, Ordering::Relaxed);
        }
        if let Err(err) = stdout.flush() {
            tracing::warn!("failed to flush stdout: {}", err);
        }
    }
    tracing::info!("message writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_codec::CodecKind;

    fn context(kind: CodecKind, chunked: bool) -> (ListenerContext, mpsc::Receiver<DecodedBatch>) {
        let (sink, rx) = mpsc::channel(1);
        let mut pipeline = Pipeline::new(build_codec(&kind, Arc::new(FieldTypeRegistry::default())));
        if chunked {
            pipeline = pipeline.with_chunking(Arc::new(ChunkAggregator::default()));
        }
        let context = ListenerContext {
            name: "test".to_string(),
            pipeline,
            streams: vec!["test".to_string()].into(),
            metrics: Arc::new(IngestMetrics::default()),
            sink,
        };
        (context, rx)
    }

    fn counter(context: &ListenerContext, name: &str) -> u64 {
        context.metrics.snapshot()[name]
    }

    #[test]
    fn decoded_messages_reach_the_sink() {
        let (context, mut rx) = context(CodecKind::Raw, false);
        context.handle(RawPayload::new(&b"hello\n"[..], None));

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.messages[0].message, "hello");
        assert_eq!(&*batch.streams, ["test".to_string()]);
        assert_eq!(counter(&context, "messages_decoded"), 1);
    }

    #[test]
    fn full_sink_drops_and_counts() {
        let (context, _rx) = context(CodecKind::Raw, false);
        context.handle(RawPayload::new(&b"one"[..], None));
        context.handle(RawPayload::new(&b"two"[..], None));

        assert_eq!(counter(&context, "messages_decoded"), 2);
        assert_eq!(counter(&context, "messages_dropped"), 1);
    }

    #[test]
    fn pending_invalid_and_failed_payloads_are_counted() {
        let (context, mut rx) = context(CodecKind::Gelf, true);
        context.handle(RawPayload::new(
            &[0x1e, 0x0f, 1, 2, 3, 4, 5, 6, 7, 8, 0, 2, b'{'][..],
            None,
        ));
        context.handle(RawPayload::new(&b"\x00\x00garbage"[..], None));
        context.handle(RawPayload::new(&b"{\"host\":\"h\"}"[..], None));

        assert_eq!(counter(&context, "payloads_pending"), 1);
        assert_eq!(counter(&context, "payloads_invalid"), 1);
        assert_eq!(counter(&context, "decode_errors"), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn retransmitted_chunks_count_as_pending() {
        let (context, _rx) = context(CodecKind::Gelf, true);
        let chunk = [0x1e, 0x0f, 9, 9, 9, 9, 9, 9, 9, 9, 0, 2, b'{'];
        context.handle(RawPayload::new(chunk.to_vec(), None));
        context.handle(RawPayload::new(chunk.to_vec(), None));

        assert_eq!(counter(&context, "payloads_pending"), 2);
        assert_eq!(counter(&context, "payloads_invalid"), 0);
    }

    #[tokio::test]
    async fn writer_indexes_every_message() {
        let (tx, rx) = mpsc::channel(4);
        let index = Arc::new(MemorySearchEngine::new(16));
        let metrics = Arc::new(IngestMetrics::default());
        let writer = tokio::spawn(write_messages(rx, Arc::clone(&index), Arc::clone(&metrics)));

        let streams: Arc<[String]> = vec!["s".to_string()].into();
        let messages = (0..3)
            .map(|i| Message::new("h", chrono::Utc::now(), format!("m{i}")))
            .collect();
        tx.send(DecodedBatch { streams, messages }).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(metrics.snapshot()["messages_written"], 3);
    }
}
