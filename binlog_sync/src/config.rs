use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    offset::OffsetScheme,
    pipeline::{batching::BatchConfig, stores::PositionKey},
    table::{TableConfig, TableFilter},
};

const ENV_PREFIX: &str = "BINLOG_SYNC";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    MissingField(&'static str),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("unable to load settings: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

impl Settings {
    /// Reads settings from `path` (TOML, YAML or JSON, picked by extension)
    /// and overlays `BINLOG_SYNC__SECTION__FIELD` environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.host.trim().is_empty() {
            return Err(ConfigError::MissingField("source.host"));
        }
        if self.source.pos_key.trim().is_empty() {
            return Err(ConfigError::MissingField("source.pos_key"));
        }
        if self.source.reconnect_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "source.reconnect_attempts".to_string(),
                reason: "at least one connection attempt is required".to_string(),
            });
        }
        if self.dispatcher.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatcher.max_in_flight".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let mut keys = HashSet::new();
        for sink in &self.sinks {
            if sink.key.trim().is_empty() {
                return Err(ConfigError::MissingField("sinks.key"));
            }
            if !keys.insert(sink.key.as_str()) {
                return Err(ConfigError::Invalid {
                    field: format!("sinks.{}", sink.key),
                    reason: "duplicate sink key".to_string(),
                });
            }
            if sink.buffer_size == 0 {
                return Err(ConfigError::Invalid {
                    field: format!("sinks.{}.buffer_size", sink.key),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub server_id: u32,
    /// Seconds between upstream heartbeats, 0 disables them.
    pub heartbeat_secs: u64,
    pub included_databases: Vec<String>,
    pub included_tables: Vec<String>,
    pub excluded_tables: Vec<String>,
    /// Name of the position record.
    pub pos_key: String,
    /// Source id used when building a GTID resume token.
    pub offset_prefix: Option<String>,
    /// With no stored offset, replay the whole log instead of tailing it.
    pub refresh_from_start: bool,
    pub offset_scheme: OffsetScheme,
    /// Scopes the position record by the included database names.
    pub scope_by_database: bool,
    pub reconnect_attempts: usize,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            host: String::new(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            server_id: 1,
            heartbeat_secs: 30,
            included_databases: Vec::new(),
            included_tables: Vec::new(),
            excluded_tables: Vec::new(),
            pos_key: "binlog.pos".to_string(),
            offset_prefix: None,
            refresh_from_start: false,
            offset_scheme: OffsetScheme::default(),
            scope_by_database: false,
            reconnect_attempts: 3,
            reconnect_delay_ms: 1000,
            connect_timeout_ms: 3000,
        }
    }
}

impl SourceConfig {
    pub fn position_key(&self) -> PositionKey {
        let key = PositionKey::new(&self.pos_key);
        if self.scope_by_database {
            key.with_scopes(self.included_databases.iter().cloned())
        } else {
            key
        }
    }

    pub fn table_filter(&self) -> TableFilter {
        TableFilter::new(
            self.included_databases.iter().cloned(),
            self.included_tables.iter().cloned(),
            self.excluded_tables.iter().cloned(),
        )
    }

    pub fn heartbeat_period(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn offset_prefix(&self) -> Option<&str> {
        self.offset_prefix.as_deref().filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

fn default_store_root() -> PathBuf {
    PathBuf::from("/tmp/binlog")
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            root: default_store_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Dispatch units allowed between ingestion and offset persistence.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_max_in_flight() -> usize {
    64
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            max_in_flight: default_max_in_flight(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl DispatcherConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Connection name, also used as the buffer's destination identifier.
    pub key: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds between time-triggered flushes, 0 disables the trigger.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default)]
    pub max_pending: Option<usize>,
    /// Tables routed to this sink. Empty routes every admitted table.
    #[serde(default)]
    pub tables: HashMap<String, TableConfig>,
    #[serde(default)]
    pub kind: SinkKind,
}

fn default_buffer_size() -> usize {
    1000
}

fn default_tick_secs() -> u64 {
    5
}

impl SinkConfig {
    pub fn new(key: impl Into<String>, kind: SinkKind) -> Self {
        SinkConfig {
            key: key.into(),
            buffer_size: default_buffer_size(),
            tick_secs: default_tick_secs(),
            max_pending: None,
            tables: HashMap::new(),
            kind,
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        let config =
            BatchConfig::new(self.buffer_size).with_tick(Duration::from_secs(self.tick_secs));
        match self.max_pending {
            Some(max_pending) => config.with_max_pending(max_pending),
            None => config,
        }
    }

    pub fn routed_tables(&self) -> HashSet<String> {
        self.tables.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Stdout,
    Clickhouse {
        url: String,
        #[serde(default)]
        database: Option<String>,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_columnar_table")]
        table: String,
    },
    Kafka {
        brokers: String,
        #[serde(default = "default_acks")]
        acks: i32,
        #[serde(default)]
        topic_prefix: Option<String>,
    },
    Redis {
        url: String,
        #[serde(default = "default_primary_key")]
        default_primary_key: String,
    },
}

fn default_columnar_table() -> String {
    "binlog".to_string()
}

fn default_acks() -> i32 {
    1
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl SinkKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SinkKind::Stdout => "stdout",
            SinkKind::Clickhouse { .. } => "clickhouse",
            SinkKind::Kafka { .. } => "kafka",
            SinkKind::Redis { .. } => "redis",
        }
    }
}
