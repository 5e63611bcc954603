use super::Codec;
use crate::error::Result;
use crate::message::{Message, RawPayload};
use chrono::DateTime;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use sluice_netflow::{
    FieldTypeRegistry, FieldValue, FlowHeader, FlowRecord, FlowRecordParser, FlowTemplateCache,
};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Exporter sessions unused for this long lose their templates.
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Template ids are scoped to one exporter and source id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionKey {
    exporter: Option<IpAddr>,
    source_id: u32,
}

struct Session {
    templates: FlowTemplateCache,
    last_seen: Instant,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            templates: FlowTemplateCache::default(),
            last_seen: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct NetflowMetrics {
    packets: AtomicU64,
    records: AtomicU64,
    template_misses: AtomicU64,
    sessions_expired: AtomicU64,
}

/// Decodes NetFlow v9 packets into one message per data record.
///
/// Fields are prefixed with `nf_`. Option records update nothing that is
/// exposed as a message and are dropped after decoding.
///
/// Each session is locked on its own while a packet is parsed, so exporters
/// never wait on each other. Sessions idle for longer than the idle timeout
/// are dropped by [`Codec::evict_idle`].
pub struct NetflowCodec {
    parser: FlowRecordParser,
    sessions: DashMap<SessionKey, Arc<Mutex<Session>>>,
    idle_timeout: Duration,
    metrics: NetflowMetrics,
}

impl NetflowCodec {
    pub fn new(registry: Arc<FieldTypeRegistry>) -> Self {
        Self {
            parser: FlowRecordParser::new(registry),
            sessions: DashMap::new(),
            idle_timeout: DEFAULT_SESSION_IDLE_TIMEOUT,
            metrics: NetflowMetrics::default(),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Number of exporter sessions with cached templates.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn session(&self, key: SessionKey) -> Arc<Mutex<Session>> {
        if let Some(session) = self.sessions.get(&key) {
            return Arc::clone(session.value());
        }
        Arc::clone(self.sessions.entry(key).or_default().value())
    }

    /// Removes sessions last used before `now - idle_timeout`. A session
    /// that is being parsed right now is kept.
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| match session.try_lock() {
            Some(session) => now.saturating_duration_since(session.last_seen) < self.idle_timeout,
            None => true,
        });
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            self.metrics
                .sessions_expired
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!("dropped {} idle netflow sessions", removed);
        }
        removed
    }
}

impl Codec for NetflowCodec {
    fn name(&self) -> &'static str {
        "netflow"
    }

    fn decode(&self, payload: RawPayload) -> Result<Vec<Message>> {
        let header = FlowHeader::from_bytes(&payload.bytes)?;
        let key = SessionKey {
            exporter: payload.remote_addr.map(|addr| addr.ip()),
            source_id: header.source_id,
        };

        let session = self.session(key);
        let packet = {
            let mut session = session.lock();
            session.last_seen = Instant::now();
            self.parser.parse(&payload.bytes, &mut session.templates)?
        };
        self.metrics.packets.fetch_add(1, Ordering::Relaxed);
        if packet.missing_template.is_some() {
            self.metrics.template_misses.fetch_add(1, Ordering::Relaxed);
        }

        let timestamp = DateTime::from_timestamp(i64::from(packet.header.unix_secs), 0)
            .unwrap_or(payload.received_at);
        let source = payload.remote_host();

        let mut messages = Vec::new();
        for record in &packet.records {
            let FlowRecord::Data { template_id, fields } = record else {
                continue;
            };

            let mut message = Message::new(source.clone(), timestamp, summary(fields))
                .with_remote_addr(payload.remote_addr);
            message.add_field("nf_version", packet.header.version);
            message.add_field("nf_source_id", packet.header.source_id);
            message.add_field("nf_flow_packet_id", packet.header.sequence);
            message.add_field("nf_template_id", *template_id);
            for (name, value) in fields {
                message.add_field(format!("nf_{name}"), json_value(value));
            }
            messages.push(message);
        }

        self.metrics
            .records
            .fetch_add(messages.len() as u64, Ordering::Relaxed);
        Ok(messages)
    }

    fn metrics_snapshot(&self) -> HashMap<String, u64> {
        let mut stats = HashMap::new();
        stats.insert(
            "netflow_packets".to_string(),
            self.metrics.packets.load(Ordering::Relaxed),
        );
        stats.insert(
            "netflow_records".to_string(),
            self.metrics.records.load(Ordering::Relaxed),
        );
        stats.insert(
            "netflow_template_misses".to_string(),
            self.metrics.template_misses.load(Ordering::Relaxed),
        );
        stats.insert(
            "netflow_sessions_expired".to_string(),
            self.metrics.sessions_expired.load(Ordering::Relaxed),
        );
        stats.insert("netflow_sessions".to_string(), self.sessions.len() as u64);
        stats
    }

    fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }
}

fn json_value(value: &FieldValue) -> Value {
    if let Some(n) = value.as_i64() {
        return Value::from(n);
    }
    if let Some(n) = value.as_u64() {
        return Value::from(n);
    }
    Value::from(value.to_string())
}

fn field_text(fields: &BTreeMap<String, FieldValue>, names: &[&str]) -> String {
    names
        .iter()
        .find_map(|name| fields.get(*name))
        .map(|value| value.to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// One-line description of a flow, e.g.
/// `NetFlowV9 10.0.0.1:443 <> 10.0.0.2:51000 proto:6 pkts:10 bytes:4096`.
fn summary(fields: &BTreeMap<String, FieldValue>) -> String {
    format!(
        "NetFlowV9 {}:{} <> {}:{} proto:{} pkts:{} bytes:{}",
        field_text(fields, &["ipv4_src_addr", "ipv6_src_addr"]),
        field_text(fields, &["l4_src_port"]),
        field_text(fields, &["ipv4_dst_addr", "ipv6_dst_addr"]),
        field_text(fields, &["l4_dst_port"]),
        field_text(fields, &["protocol"]),
        field_text(fields, &["in_pkts"]),
        field_text(fields, &["in_bytes"]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;

    fn packet(source_id: u32, flowsets: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&9_u16.to_be_bytes());
        buf.extend_from_slice(&(flowsets.len() as u16).to_be_bytes());
        buf.extend_from_slice(&0_u32.to_be_bytes());
        buf.extend_from_slice(&1_700_000_000_u32.to_be_bytes());
        buf.extend_from_slice(&3_u32.to_be_bytes());
        buf.extend_from_slice(&source_id.to_be_bytes());
        for (id, body) in flowsets {
            buf.extend_from_slice(&id.to_be_bytes());
            buf.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
            buf.extend_from_slice(body);
        }
        buf
    }

    fn template_body() -> Vec<u8> {
        // template 256: ipv4_src_addr/4, ipv4_dst_addr/4, l4_src_port/2,
        // l4_dst_port/2, protocol/1, in_pkts/4, in_bytes/4
        let mut body = vec![0x01, 0x00, 0x00, 0x07];
        for (field, length) in [(8_u16, 4_u16), (12, 4), (7, 2), (11, 2), (4, 1), (2, 4), (1, 4)] {
            body.extend_from_slice(&field.to_be_bytes());
            body.extend_from_slice(&length.to_be_bytes());
        }
        body
    }

    fn record_body() -> Vec<u8> {
        let mut body = vec![10, 0, 0, 1, 10, 0, 0, 2];
        body.extend_from_slice(&443_u16.to_be_bytes());
        body.extend_from_slice(&51000_u16.to_be_bytes());
        body.push(6);
        body.extend_from_slice(&10_u32.to_be_bytes());
        body.extend_from_slice(&4096_u32.to_be_bytes());
        body
    }

    fn codec() -> NetflowCodec {
        NetflowCodec::new(Arc::new(FieldTypeRegistry::builtin().unwrap()))
    }

    fn sent_from(addr: &str, bytes: Vec<u8>) -> RawPayload {
        RawPayload::new(bytes, Some(addr.parse().unwrap()))
    }

    #[test]
    fn data_records_become_prefixed_messages() {
        let codec = codec();
        let bytes = packet(1, &[(0, template_body()), (256, record_body())]);
        let messages = codec.decode(sent_from("192.0.2.1:2055", bytes)).unwrap();

        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(
            message.message,
            "NetFlowV9 10.0.0.1:443 <> 10.0.0.2:51000 proto:6 pkts:10 bytes:4096"
        );
        assert_eq!(message.source, "192.0.2.1");
        assert_eq!(message.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(message.field("nf_ipv4_src_addr"), Some(&Value::from("10.0.0.1")));
        assert_eq!(message.field("nf_l4_dst_port"), Some(&Value::from(51000)));
        assert_eq!(message.field("nf_in_bytes"), Some(&Value::from(4096)));
        assert_eq!(message.field("nf_source_id"), Some(&Value::from(1)));
        assert_eq!(message.field("nf_template_id"), Some(&Value::from(256)));
    }

    #[test]
    fn templates_are_scoped_per_exporter() {
        let codec = codec();
        codec
            .decode(sent_from("192.0.2.1:2055", packet(1, &[(0, template_body())])))
            .unwrap();

        let data = packet(1, &[(256, record_body())]);
        assert_eq!(codec.decode(sent_from("192.0.2.1:2055", data.clone())).unwrap().len(), 1);
        assert!(codec.decode(sent_from("192.0.2.9:2055", data)).unwrap().is_empty());

        let stats = codec.metrics_snapshot();
        assert_eq!(stats["netflow_packets"], 3);
        assert_eq!(stats["netflow_records"], 1);
        assert_eq!(stats["netflow_template_misses"], 1);
        assert_eq!(stats["netflow_sessions"], 2);
    }

    #[test]
    fn templates_are_scoped_per_source_id() {
        let codec = codec();
        codec
            .decode(sent_from("192.0.2.1:2055", packet(1, &[(0, template_body())])))
            .unwrap();

        let data = packet(2, &[(256, record_body())]);
        assert!(codec.decode(sent_from("192.0.2.1:2055", data)).unwrap().is_empty());
        assert_eq!(codec.session_count(), 2);
    }

    #[test]
    fn idle_sessions_are_dropped_with_their_templates() {
        let codec = codec().with_idle_timeout(Duration::from_secs(60));
        codec
            .decode(sent_from("192.0.2.1:2055", packet(1, &[(0, template_body())])))
            .unwrap();
        codec
            .decode(sent_from("192.0.2.2:2055", packet(1, &[(0, template_body())])))
            .unwrap();

        assert_eq!(codec.evict_idle_at(Instant::now()), 0);
        assert_eq!(codec.session_count(), 2);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(codec.evict_idle_at(later), 2);
        assert_eq!(codec.session_count(), 0);
        assert_eq!(codec.metrics_snapshot()["netflow_sessions_expired"], 2);

        let data = packet(1, &[(256, record_body())]);
        assert!(codec.decode(sent_from("192.0.2.1:2055", data)).unwrap().is_empty());
    }

    #[test]
    fn busy_sessions_survive_eviction() {
        let codec = codec().with_idle_timeout(Duration::from_secs(60));
        codec
            .decode(sent_from("192.0.2.1:2055", packet(1, &[(0, template_body())])))
            .unwrap();
        let key = SessionKey {
            exporter: Some("192.0.2.1".parse().unwrap()),
            source_id: 1,
        };

        let session = codec.session(key);
        let _parsing = session.lock();
        assert_eq!(codec.evict_idle_at(Instant::now() + Duration::from_secs(61)), 0);
        assert_eq!(codec.session_count(), 1);
    }

    #[test]
    fn wrong_version_is_an_error() {
        let mut bytes = packet(1, &[]);
        bytes[1] = 5;
        let err = codec().decode(sent_from("192.0.2.1:2055", bytes)).unwrap_err();
        assert!(matches!(err, CodecError::Netflow(_)));
    }

    #[test]
    fn large_counters_are_kept_exact() {
        assert_eq!(
            json_value(&FieldValue::Big(u64::MAX.into())),
            Value::from(u64::MAX)
        );
        let beyond = num_bigint::BigUint::from(u128::MAX);
        assert_eq!(
            json_value(&FieldValue::Big(beyond.clone())),
            Value::from(beyond.to_string())
        );
    }
}
