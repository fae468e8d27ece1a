//! Client configuration
//!
//! The full tree is serde-deserializable from YAML. Two environment
//! mechanisms compose, in order:
//!
//! 1. `${VAR}` / `${VAR:-default}` placeholders are expanded inside the
//!    file before parsing, so secrets never need to live in the file.
//! 2. `COUCHSTREAM__<UPPERCASE_DOTTED_PATH>` variables overlay the parsed
//!    document, `__` standing in for the dots — any key is overridable at
//!    deploy time with zero YAML edits, e.g.
//!    `COUCHSTREAM__DCP__GROUP__MEMBERSHIP__TOTALMEMBERS=3` or
//!    `COUCHSTREAM__LOGGING__LEVEL=debug`.
//!
//! ```yaml
//! hosts: ["couchbase-0.couchbase:11210"]
//! username: ${CB_USERNAME}
//! password: ${CB_PASSWORD}
//! bucketName: orders
//! dcp:
//!   group:
//!     name: order-indexer
//! ```
//!
//! Every key has a default unless marked required; defaults follow the
//! protocol's conventional values (20 MiB connect buffer, 20s checkpoint
//! interval, 500ms mitigation poll, ...).

use crate::error::{DcpError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

static ENV_VAR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap());

/// Prefix of override variables; the remainder is the config path,
/// uppercase, with `__` between segments
const ENV_OVERRIDE_PREFIX: &str = "COUCHSTREAM__";

/// Every serde key of the config tree. Environment paths arrive uppercase
/// and are mapped back onto these case-insensitively.
const CONFIG_KEYS: &[&str] = &[
    "hosts",
    "username",
    "password",
    "bucketName",
    "scopeName",
    "collectionNames",
    "connectionBufferSize",
    "connectionTimeoutSecs",
    "secureConnection",
    "rootCaPath",
    "dcp",
    "bufferSize",
    "listener",
    "group",
    "name",
    "membership",
    "type",
    "memberNumber",
    "totalMembers",
    "rebalanceDelaySecs",
    "leaderElection",
    "enabled",
    "config",
    "rpc",
    "port",
    "checkpoint",
    "autoReset",
    "intervalSecs",
    "timeoutSecs",
    "healthCheck",
    "disabled",
    "rollbackMitigation",
    "intervalMs",
    "configWatchIntervalSecs",
    "metadata",
    "readOnly",
    "filePath",
    "api",
    "metric",
    "path",
    "averageWindowSec",
    "logging",
    "level",
    "debug",
];

/// How the member set of a group is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum MembershipType {
    /// Self-organizing registry in the metadata store
    Couchbase,
    /// Leader-elected, followers assigned over RPC
    KubernetesHa,
    /// Ordinal parsed from the pod hostname suffix
    KubernetesStatefulSet,
    /// Fixed `(member_number, total_members)` from config
    #[default]
    Static,
}

/// Checkpoint persistence mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointType {
    /// Flush on an interval and on stop
    #[default]
    Auto,
    /// The embedding application calls flush explicitly
    Manual,
}

/// Where to start a vbucket with no saved checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutoReset {
    /// Stream from the beginning of history
    #[default]
    Earliest,
    /// Seed the offset at the current high seqno
    Latest,
}

/// Metadata store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetadataType {
    /// Same or neighbor Couchbase bucket
    #[default]
    Couchbase,
    /// Single local file, rewritten atomically
    File,
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DcpConfig {
    /// Cluster seed addresses (required)
    pub hosts: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Bucket to stream (required)
    pub bucket_name: String,
    #[serde(default = "default_scope_name")]
    pub scope_name: String,
    #[serde(default = "default_collection_names")]
    pub collection_names: Vec<String>,
    #[serde(default = "default_connection_buffer_size")]
    pub connection_buffer_size: usize,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default)]
    pub secure_connection: bool,
    #[serde(default)]
    pub root_ca_path: Option<PathBuf>,

    pub dcp: DcpSettings,
    #[serde(default)]
    pub leader_election: LeaderElectionConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub rollback_mitigation: RollbackMitigationConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metric: MetricConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Expose `/states/*` debug endpoints
    #[serde(default)]
    pub debug: bool,
}

/// DCP connection and listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DcpSettings {
    #[serde(default = "default_dcp_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_connection_buffer_size")]
    pub connection_buffer_size: usize,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default)]
    pub listener: ListenerConfig,
    pub group: GroupConfig,
}

/// Bounded queue between the DCP socket and the consumer callback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    #[serde(default = "default_listener_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self { buffer_size: default_listener_buffer_size() }
    }
}

/// Consumer group identity and membership
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    /// Group name: instances sharing it divide the vbucket space (required)
    pub name: String,
    #[serde(default)]
    pub membership: MembershipConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipConfig {
    #[serde(rename = "type", default)]
    pub membership_type: MembershipType,
    #[serde(default = "default_member_number")]
    pub member_number: u16,
    #[serde(default = "default_total_members")]
    pub total_members: u16,
    #[serde(default = "default_rebalance_delay_secs")]
    pub rebalance_delay_secs: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            membership_type: MembershipType::default(),
            member_number: default_member_number(),
            total_members: default_total_members(),
            rebalance_delay_secs: default_rebalance_delay_secs(),
        }
    }
}

impl MembershipConfig {
    pub fn rebalance_delay(&self) -> Duration {
        Duration::from_secs(self.rebalance_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type", default = "default_leader_election_type")]
    pub election_type: String,
    #[serde(default)]
    pub config: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub rpc: RpcConfig,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            election_type: default_leader_election_type(),
            config: Default::default(),
            rpc: RpcConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcConfig {
    #[serde(default = "default_rpc_port")]
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { port: default_rpc_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    #[serde(rename = "type", default)]
    pub checkpoint_type: CheckpointType,
    #[serde(default)]
    pub auto_reset: AutoReset,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_checkpoint_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_type: CheckpointType::default(),
            auto_reset: AutoReset::default(),
            interval_secs: default_checkpoint_interval_secs(),
            timeout_secs: default_checkpoint_timeout_secs(),
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_health_check_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            interval_secs: default_health_check_interval_secs(),
            timeout_secs: default_health_check_timeout_secs(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackMitigationConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_rollback_mitigation_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_config_watch_interval_secs")]
    pub config_watch_interval_secs: u64,
}

impl Default for RollbackMitigationConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            interval_ms: default_rollback_mitigation_interval_ms(),
            config_watch_interval_secs: default_config_watch_interval_secs(),
        }
    }
}

impl RollbackMitigationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn config_watch_interval(&self) -> Duration {
        Duration::from_secs(self.config_watch_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetadataConfig {
    #[serde(rename = "type", default)]
    pub metadata_type: MetadataType,
    #[serde(default)]
    pub read_only: bool,
    /// File-store location, `metadata.type = file` only
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { disabled: false, port: default_api_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricConfig {
    #[serde(default = "default_metric_path")]
    pub path: String,
    #[serde(default = "default_metric_average_window_sec")]
    pub average_window_sec: f64,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            path: default_metric_path(),
            average_window_sec: default_metric_average_window_sec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_scope_name() -> String {
    "_default".to_string()
}
fn default_collection_names() -> Vec<String> {
    vec!["_default".to_string()]
}
fn default_connection_buffer_size() -> usize {
    20 * 1024 * 1024
}
fn default_connection_timeout_secs() -> u64 {
    5
}
fn default_dcp_buffer_size() -> usize {
    16 * 1024 * 1024
}
fn default_listener_buffer_size() -> usize {
    1000
}
fn default_member_number() -> u16 {
    1
}
fn default_total_members() -> u16 {
    1
}
fn default_rebalance_delay_secs() -> u64 {
    20
}
fn default_leader_election_type() -> String {
    "kubernetes".to_string()
}
fn default_rpc_port() -> u16 {
    8081
}
fn default_checkpoint_interval_secs() -> u64 {
    20
}
fn default_checkpoint_timeout_secs() -> u64 {
    60
}
fn default_health_check_interval_secs() -> u64 {
    20
}
fn default_health_check_timeout_secs() -> u64 {
    5
}
fn default_rollback_mitigation_interval_ms() -> u64 {
    500
}
fn default_config_watch_interval_secs() -> u64 {
    2
}
fn default_api_port() -> u16 {
    8080
}
fn default_metric_path() -> String {
    "/metrics".to_string()
}
fn default_metric_average_window_sec() -> f64 {
    10.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl DcpConfig {
    /// Minimal programmatic configuration; everything else defaulted
    pub fn new(
        hosts: Vec<String>,
        bucket_name: impl Into<String>,
        group_name: impl Into<String>,
    ) -> Self {
        Self {
            hosts,
            username: String::new(),
            password: String::new(),
            bucket_name: bucket_name.into(),
            scope_name: default_scope_name(),
            collection_names: default_collection_names(),
            connection_buffer_size: default_connection_buffer_size(),
            connection_timeout_secs: default_connection_timeout_secs(),
            secure_connection: false,
            root_ca_path: None,
            dcp: DcpSettings {
                buffer_size: default_dcp_buffer_size(),
                connection_buffer_size: default_connection_buffer_size(),
                connection_timeout_secs: default_connection_timeout_secs(),
                listener: ListenerConfig::default(),
                group: GroupConfig {
                    name: group_name.into(),
                    membership: MembershipConfig::default(),
                },
            },
            leader_election: LeaderElectionConfig::default(),
            checkpoint: CheckpointConfig::default(),
            health_check: HealthCheckConfig::default(),
            rollback_mitigation: RollbackMitigationConfig::default(),
            metadata: MetadataConfig::default(),
            api: ApiConfig::default(),
            metric: MetricConfig::default(),
            logging: LoggingConfig::default(),
            debug: false,
        }
    }

    /// Load configuration from a YAML file, expanding `${VAR}` placeholders
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DcpError::config(format!("cannot read config file: {e}")))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string: expand `${VAR}` placeholders,
    /// then overlay any `COUCHSTREAM__<PATH>` environment overrides
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let mut document: serde_yaml::Value = serde_yaml::from_str(&expanded)
            .map_err(|e| DcpError::config(format!("cannot parse config: {e}")))?;
        apply_env_overrides(&mut document, std::env::vars());
        let config: Self = serde_yaml::from_value(document)
            .map_err(|e| DcpError::config(format!("cannot parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn group_name(&self) -> &str {
        &self.dcp.group.name
    }

    pub fn membership(&self) -> &MembershipConfig {
        &self.dcp.group.membership
    }

    /// Reject configurations that cannot possibly run
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(DcpError::config("hosts must not be empty"));
        }
        if self.bucket_name.is_empty() {
            return Err(DcpError::config("bucketName is required"));
        }
        if self.dcp.group.name.is_empty() {
            return Err(DcpError::config("dcp.group.name is required"));
        }
        let membership = self.membership();
        if membership.member_number == 0 || membership.total_members == 0 {
            return Err(DcpError::config("memberNumber and totalMembers are 1-based"));
        }
        if membership.member_number > membership.total_members {
            return Err(DcpError::config(format!(
                "memberNumber {} exceeds totalMembers {}",
                membership.member_number, membership.total_members
            )));
        }
        if self.checkpoint.interval_secs == 0 {
            return Err(DcpError::config("checkpoint.interval must be positive"));
        }
        if !self.rollback_mitigation.disabled && self.rollback_mitigation.interval_ms == 0 {
            return Err(DcpError::config("rollbackMitigation.interval must be positive"));
        }
        if self.metadata.metadata_type == MetadataType::File && self.metadata.file_path.is_none() {
            return Err(DcpError::config("metadata.filePath is required for the file store"));
        }
        Ok(())
    }
}

/// Expand `${VAR}` and `${VAR:-default}` placeholders from the process env
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());
            std::env::var(name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

/// Overlay `COUCHSTREAM__<PATH>` variables onto the parsed document.
///
/// Paths override any key, present in the YAML or not; segments are
/// matched onto the camelCase document keys case-insensitively. Values
/// parse as YAML scalars, so numbers, booleans and `[a, b]` lists all
/// work. Applied in sorted variable order for determinism.
fn apply_env_overrides(
    document: &mut serde_yaml::Value,
    vars: impl Iterator<Item = (String, String)>,
) {
    let mut overrides: Vec<(String, String)> = vars
        .filter(|(name, _)| name.starts_with(ENV_OVERRIDE_PREFIX))
        .collect();
    overrides.sort();

    for (name, raw) in overrides {
        let path: Vec<String> = name[ENV_OVERRIDE_PREFIX.len()..]
            .split("__")
            .map(canonical_key)
            .collect();
        if path.iter().any(|segment| segment.is_empty()) {
            continue;
        }
        let value: serde_yaml::Value = serde_yaml::from_str(&raw)
            .unwrap_or_else(|_| serde_yaml::Value::String(raw.clone()));
        set_path(document, &path, value);
    }
}

/// Map an uppercase env segment onto its camelCase config key
fn canonical_key(segment: &str) -> String {
    CONFIG_KEYS
        .iter()
        .find(|key| key.eq_ignore_ascii_case(segment))
        .map(|key| (*key).to_string())
        .unwrap_or_else(|| segment.to_ascii_lowercase())
}

/// Write `value` at `path`, creating intermediate mappings as needed.
/// Existing keys are matched case-insensitively so an override lands on
/// the key the file already spells.
fn set_path(document: &mut serde_yaml::Value, path: &[String], value: serde_yaml::Value) {
    use serde_yaml::{Mapping, Value};

    let Some((head, rest)) = path.split_first() else {
        return;
    };
    if !matches!(document, Value::Mapping(_)) {
        *document = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = document else {
        return;
    };

    let key = map
        .keys()
        .find_map(|k| {
            k.as_str()
                .filter(|existing| existing.eq_ignore_ascii_case(head))
                .map(str::to_string)
        })
        .unwrap_or_else(|| head.clone());
    let key = Value::String(key);

    if rest.is_empty() {
        map.insert(key, value);
        return;
    }
    if !map.contains_key(&key) {
        map.insert(key.clone(), Value::Mapping(Mapping::new()));
    }
    match map.get_mut(&key) {
        Some(child) => set_path(child, rest, value),
        None => unreachable!("key inserted above"),
    }
}
