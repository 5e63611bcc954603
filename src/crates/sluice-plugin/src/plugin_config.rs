use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use sluice_chunking::{
    ChunkStoreConfig, DEFAULT_CHECK_INTERVAL, DEFAULT_MAX_CHUNKS, DEFAULT_VALIDITY_WINDOW,
};
use sluice_codec::{CodecKind, DEFAULT_MAX_DECOMPRESSED_SIZE, Delimiter};
use sluice_events::{DEFAULT_CAPACITY, DEFAULT_SEARCH_TIMEOUT, EventDefinition};
use sluice_netflow::FieldTypeRegistry;
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MAX_PACKET_SIZE: usize = 8192;
const DEFAULT_WORKERS: usize = 4;

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| {
        format!(
            "invalid duration '{}' (examples: '1s', '5m', '1h'): {}",
            value, e
        )
    })
}

fn parse_delimiter(value: &str) -> Result<Delimiter, String> {
    match value {
        "newline" => Ok(Delimiter::Newline),
        "nul" => Ok(Delimiter::Nul),
        other => Err(format!("invalid framing '{other}', expected 'newline' or 'nul'")),
    }
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Transport {
    #[default]
    Udp,
    Tcp,
}

/// One socket and the pipeline its input runs through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ListenerConfig {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) transport: Transport,
    pub(crate) listen: String,
    pub(crate) codec: CodecKind,
    /// Reassemble chunked datagrams (UDP only)
    #[serde(default)]
    pub(crate) chunked: bool,
    /// Frame delimiter (TCP only)
    #[serde(default)]
    pub(crate) framing: Delimiter,
    /// Largest datagram or frame accepted
    #[serde(default = "default_max_packet_size")]
    pub(crate) max_packet_size: usize,
    /// Streams messages of this listener are indexed under; defaults to
    /// the listener name.
    #[serde(default)]
    pub(crate) streams: Vec<String>,
}

impl ListenerConfig {
    pub(crate) fn streams(&self) -> Vec<String> {
        if self.streams.is_empty() {
            vec![self.name.clone()]
        } else {
            self.streams.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        let name = &self.name;
        if name.is_empty() {
            anyhow::bail!("listeners: name must not be empty");
        }
        self.listen
            .parse::<SocketAddr>()
            .with_context(|| format!("listeners.{name}: invalid listen address '{}'", self.listen))?;
        if self.max_packet_size == 0 {
            anyhow::bail!("listeners.{name}.max_packet_size must be greater than 0");
        }
        if self.chunked && self.transport != Transport::Udp {
            anyhow::bail!("listeners.{name}: chunked input is only supported over udp");
        }
        if matches!(self.codec, CodecKind::Netflow) {
            if self.transport != Transport::Udp {
                anyhow::bail!("listeners.{name}: the netflow codec only accepts udp");
            }
            if self.chunked {
                anyhow::bail!("listeners.{name}: netflow packets are never chunked");
            }
        }
        Ok(())
    }
}

/// A single listener given on the command line.
#[derive(Debug, Parser, Clone)]
pub(crate) struct ListenerArgs {
    #[arg(long = "sluice-listen", value_name = "ADDR")]
    pub(crate) listen: Option<String>,

    #[arg(long = "sluice-transport", value_enum, default_value_t = Transport::Udp)]
    pub(crate) transport: Transport,

    #[arg(long = "sluice-codec", default_value = "gelf")]
    pub(crate) codec: CodecKind,

    #[arg(long = "sluice-chunked")]
    pub(crate) chunked: bool,

    #[arg(
        long = "sluice-framing",
        default_value = "newline",
        value_parser = parse_delimiter
    )]
    pub(crate) framing: Delimiter,

    #[arg(long = "sluice-max-packet-size", default_value_t = DEFAULT_MAX_PACKET_SIZE)]
    pub(crate) max_packet_size: usize,
}

impl Default for ListenerArgs {
    fn default() -> Self {
        Self {
            listen: None,
            transport: Transport::Udp,
            codec: CodecKind::Gelf,
            chunked: false,
            framing: Delimiter::Newline,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl ListenerArgs {
    fn to_listener(&self) -> Option<ListenerConfig> {
        let listen = self.listen.clone()?;
        Some(ListenerConfig {
            name: format!("{}-{}", self.codec, self.transport_name()),
            transport: self.transport,
            listen,
            codec: self.codec.clone(),
            chunked: self.chunked,
            framing: self.framing,
            max_packet_size: self.max_packet_size,
            streams: Vec::new(),
        })
    }

    fn transport_name(&self) -> &'static str {
        match self.transport {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Parser, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ChunkingConfig {
    /// How long a partial message waits for its remaining chunks
    #[arg(
        long = "sluice-chunk-validity-window",
        default_value = "5s",
        value_parser = parse_duration
    )]
    #[serde(with = "humantime_serde")]
    pub(crate) validity_window: Duration,

    #[arg(
        long = "sluice-chunk-check-interval",
        default_value = "1s",
        value_parser = parse_duration
    )]
    #[serde(with = "humantime_serde")]
    pub(crate) check_interval: Duration,

    #[arg(long = "sluice-chunk-max-chunks", default_value_t = DEFAULT_MAX_CHUNKS)]
    pub(crate) max_chunks: usize,

    #[arg(
        long = "sluice-max-decompressed-size",
        default_value_t = DEFAULT_MAX_DECOMPRESSED_SIZE
    )]
    pub(crate) max_decompressed_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            validity_window: DEFAULT_VALIDITY_WINDOW,
            check_interval: DEFAULT_CHECK_INTERVAL,
            max_chunks: DEFAULT_MAX_CHUNKS,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
        }
    }
}

impl ChunkingConfig {
    pub(crate) fn store_config(&self) -> ChunkStoreConfig {
        ChunkStoreConfig {
            validity_window: self.validity_window,
            max_chunks: self.max_chunks,
        }
    }
}

#[derive(Debug, Parser, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct NetflowConfig {
    /// YAML field-type definitions merged over the built-in ones
    #[arg(long = "sluice-netflow-definitions", value_name = "PATH")]
    pub(crate) definitions: Option<PathBuf>,
}

impl NetflowConfig {
    pub(crate) fn field_types(&self) -> Result<FieldTypeRegistry> {
        let builtin = FieldTypeRegistry::builtin().context("failed to load built-in field types")?;
        let Some(path) = &self.definitions else {
            return Ok(builtin);
        };
        let custom = FieldTypeRegistry::from_path(path)
            .with_context(|| format!("failed to load field types from {}", path.display()))?;
        tracing::info!(
            "loaded {} netflow field types from {}",
            custom.len(),
            path.display()
        );
        Ok(builtin.merged_with(custom))
    }
}

#[derive(Debug, Parser, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct EventsConfig {
    /// Budget for the search calls of one event definition run
    #[arg(
        long = "sluice-search-timeout",
        default_value = "30s",
        value_parser = parse_duration
    )]
    #[serde(with = "humantime_serde")]
    pub(crate) search_timeout: Duration,

    /// Messages kept in memory for event definitions to search
    #[arg(long = "sluice-index-capacity", default_value_t = DEFAULT_CAPACITY)]
    pub(crate) index_capacity: usize,

    #[arg(skip)]
    pub(crate) definitions: Vec<EventDefinition>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            index_capacity: DEFAULT_CAPACITY,
            definitions: Vec::new(),
        }
    }
}

#[derive(Debug, Parser, Clone, Serialize, Deserialize)]
#[command(name = "sluice-plugin")]
#[command(about = "GELF, syslog, JSON, CSV and NetFlow v9 ingestion with event definitions")]
#[command(version = "0.1")]
#[serde(deny_unknown_fields)]
pub(crate) struct PluginConfig {
    /// Load the configuration from this YAML file instead of the flags
    #[arg(long = "config", value_name = "PATH")]
    #[serde(skip)]
    pub(crate) config: Option<PathBuf>,

    #[command(flatten)]
    #[serde(skip)]
    pub(crate) listener: ListenerArgs,

    #[arg(skip)]
    #[serde(default)]
    pub(crate) listeners: Vec<ListenerConfig>,

    /// Receive tasks per UDP listener
    #[arg(long = "sluice-workers", default_value_t = DEFAULT_WORKERS)]
    #[serde(default = "default_workers")]
    pub(crate) workers: usize,

    #[arg(
        long = "sluice-metrics-interval",
        default_value = "60s",
        value_parser = parse_duration
    )]
    #[serde(default = "default_metrics_interval", with = "humantime_serde")]
    pub(crate) metrics_interval: Duration,

    #[command(flatten)]
    #[serde(default)]
    pub(crate) chunking: ChunkingConfig,

    #[command(flatten)]
    #[serde(default)]
    pub(crate) netflow: NetflowConfig,

    #[command(flatten)]
    #[serde(default)]
    pub(crate) events: EventsConfig,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            config: None,
            listener: ListenerArgs::default(),
            listeners: Vec::new(),
            workers: DEFAULT_WORKERS,
            metrics_interval: default_metrics_interval(),
            chunking: ChunkingConfig::default(),
            netflow: NetflowConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl PluginConfig {
    pub(crate) fn new() -> Result<Self> {
        Self::from_args(Self::parse())
    }

    /// A `--config` file replaces every other flag.
    fn from_args(args: Self) -> Result<Self> {
        let mut cfg = match &args.config {
            Some(path) => Self::from_yaml_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => args.clone(),
        };
        if args.config.is_none() {
            cfg.listeners.extend(args.listener.to_listener());
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let cfg = serde_yaml::from_str::<Self>(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            anyhow::bail!("no listeners configured (use --sluice-listen or a config file)");
        }
        let mut names = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !names.insert(listener.name.as_str()) {
                anyhow::bail!("listeners: duplicate name '{}'", listener.name);
            }
        }

        if self.workers == 0 {
            anyhow::bail!("workers must be greater than 0");
        }
        if self.metrics_interval.is_zero() {
            anyhow::bail!("metrics_interval must be greater than 0");
        }

        if self.chunking.validity_window.is_zero() {
            anyhow::bail!("chunking.validity_window must be greater than 0");
        }
        if self.chunking.check_interval.is_zero() {
            anyhow::bail!("chunking.check_interval must be greater than 0");
        }
        if self.chunking.max_chunks == 0 {
            anyhow::bail!("chunking.max_chunks must be greater than 0");
        }
        if self.chunking.max_decompressed_size == 0 {
            anyhow::bail!("chunking.max_decompressed_size must be greater than 0");
        }

        if self.events.search_timeout.is_zero() {
            anyhow::bail!("events.search_timeout must be greater than 0");
        }
        if self.events.index_capacity == 0 {
            anyhow::bail!("events.index_capacity must be greater than 0");
        }
        let mut ids = HashSet::new();
        for definition in &self.events.definitions {
            definition
                .validate()
                .context("events.definitions: invalid definition")?;
            if !ids.insert(definition.id.as_str()) {
                anyhow::bail!("events.definitions: duplicate id '{}'", definition.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn udp(name: &str, codec: CodecKind) -> ListenerConfig {
        ListenerConfig {
            name: name.to_string(),
            transport: Transport::Udp,
            listen: "127.0.0.1:12201".to_string(),
            codec,
            chunked: false,
            framing: Delimiter::Newline,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            streams: Vec::new(),
        }
    }

    fn with_listener(listener: ListenerConfig) -> PluginConfig {
        PluginConfig {
            listeners: vec![listener],
            ..PluginConfig::default()
        }
    }

    #[test]
    fn flags_define_a_single_listener() {
        let args = PluginConfig::try_parse_from([
            "sluice-plugin",
            "--sluice-listen",
            "0.0.0.0:5140",
            "--sluice-transport",
            "tcp",
            "--sluice-codec",
            "syslog",
            "--sluice-workers",
            "2",
            "--sluice-chunk-validity-window",
            "10s",
        ])
        .unwrap();
        let cfg = PluginConfig::from_args(args).unwrap();

        assert_eq!(cfg.listeners.len(), 1);
        let listener = &cfg.listeners[0];
        assert_eq!(listener.name, "syslog-tcp");
        assert_eq!(listener.transport, Transport::Tcp);
        assert_eq!(listener.codec, CodecKind::Syslog);
        assert_eq!(listener.streams(), ["syslog-tcp"]);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.chunking.validity_window, Duration::from_secs(10));
        assert_eq!(cfg.events.search_timeout, DEFAULT_SEARCH_TIMEOUT);
    }

    #[test]
    fn csv_cannot_be_selected_from_flags() {
        let err = PluginConfig::try_parse_from([
            "sluice-plugin",
            "--sluice-listen",
            "0.0.0.0:5140",
            "--sluice-codec",
            "csv",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("config file"));
    }

    #[test]
    fn yaml_file_configures_listeners_and_definitions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
listeners:
  - name: gelf
    listen: 0.0.0.0:12201
    codec: {{ type: gelf }}
    chunked: true
  - name: apache
    transport: tcp
    listen: 0.0.0.0:5170
    codec: {{ type: csv, columns: [host, status, message] }}
    streams: [web]
chunking:
  validity_window: 2s
events:
  search_timeout: 5s
  definitions:
    - id: errors
      title: Server errors
      query: "status:500"
      streams: [web]
      search_within: 1m
      series: [{{ id: n, function: count }}]
      conditions: {{ expr: ">", left: {{ expr: number-ref, ref: n }}, right: {{ expr: number, value: 10 }} }}
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let args = PluginConfig::try_parse_from(["sluice-plugin", "--config", &path]).unwrap();
        let cfg = PluginConfig::from_args(args).unwrap();

        assert_eq!(cfg.listeners.len(), 2);
        assert!(cfg.listeners[0].chunked);
        assert_eq!(cfg.listeners[0].transport, Transport::Udp);
        assert_eq!(cfg.listeners[1].streams(), ["web"]);
        assert_eq!(cfg.chunking.validity_window, Duration::from_secs(2));
        assert_eq!(cfg.chunking.max_chunks, DEFAULT_MAX_CHUNKS);
        assert_eq!(cfg.events.search_timeout, Duration::from_secs(5));
        assert_eq!(cfg.events.definitions[0].search_within, Duration::from_secs(60));
        assert_eq!(cfg.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<PluginConfig>("listners: []").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn validate_requires_a_listener() {
        let err = PluginConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("no listeners configured"));
    }

    #[test]
    fn validate_rejects_bad_addresses_and_duplicates() {
        let mut listener = udp("gelf", CodecKind::Gelf);
        listener.listen = "nowhere".to_string();
        assert!(with_listener(listener).validate().is_err());

        let mut cfg = with_listener(udp("gelf", CodecKind::Gelf));
        cfg.listeners.push(udp("gelf", CodecKind::Raw));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate name 'gelf'"));
    }

    #[test]
    fn validate_rejects_chunking_where_it_cannot_happen() {
        let mut listener = udp("flows", CodecKind::Netflow);
        listener.chunked = true;
        let err = with_listener(listener).validate().unwrap_err();
        assert!(err.to_string().contains("never chunked"));

        let mut listener = udp("stream", CodecKind::Gelf);
        listener.transport = Transport::Tcp;
        listener.chunked = true;
        let err = with_listener(listener).validate().unwrap_err();
        assert!(err.to_string().contains("only supported over udp"));
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let mut cfg = with_listener(udp("gelf", CodecKind::Gelf));
        cfg.chunking.max_chunks = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = with_listener(udp("gelf", CodecKind::Gelf));
        cfg.workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_checks_event_definitions() {
        let mut cfg = with_listener(udp("gelf", CodecKind::Gelf));
        let mut definition = EventDefinition::new("d", "D", Duration::from_secs(60));
        definition.batch_size = 0;
        cfg.events.definitions.push(definition);

        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("batch_size must be greater than zero"));
    }
}
