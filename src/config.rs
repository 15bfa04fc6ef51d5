// src/config.rs

//! Manages controller configuration: loading, validation, and the
//! background watcher that rereads the file and fans out dynamic changes.

use crate::core::errors::ControllerError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Environment variable naming the controller config file.
pub const CONFIG_PATH_ENV: &str = "MINDIE_MS_CONTROLLER_CONFIG_FILE_PATH";
/// Environment variable naming the installation prefix.
pub const INSTALL_PATH_ENV: &str = "MIES_INSTALL_PATH";
/// Config file path relative to the installation prefix.
const DEFAULT_CONFIG_RELPATH: &str = "conf/ms_controller.json";

/// How often the background watcher rereads the config file.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Strictest permission bits allowed on mounted files (owner rw, group r).
pub const STRICT_FILE_MODE: u32 = 0o640;

/// How the fleet serves inference.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeployMode {
    SingleNode,
    #[default]
    PdSeparate,
    Flex,
}

/// Process Status File persistence settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProcessManagerConfig {
    #[serde(default)]
    pub to_file: bool,
    #[serde(default)]
    pub file_path: String,
}

/// Cluster-status observability file settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ClusterStatusConfig {
    #[serde(default)]
    pub to_file: bool,
    #[serde(default)]
    pub file_path: String,
}

/// External HA agent settings. The core controller runs without it.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CtrlBackupConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Mutual-TLS settings for the control-plane HTTP client.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
    #[serde(default)]
    pub ca_path: String,
}

/// Tunables forwarded verbatim to the role planner library.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DigsConfig {
    #[serde(default = "default_prefill_slo")]
    pub prefill_slo: f64,
    #[serde(default = "default_decode_slo")]
    pub decode_slo: f64,
    #[serde(default = "default_time_period")]
    pub time_period: u64,
    #[serde(default)]
    pub is_heterogeneous: bool,
    #[serde(default = "default_transfer_type")]
    pub transfer_type: String,
    #[serde(default = "default_pp")]
    pub pp: u32,
    #[serde(default)]
    pub is_auto_pd_role_switching: bool,
    #[serde(default)]
    pub has_flex: bool,
}

fn default_prefill_slo() -> f64 {
    600.0
}
fn default_decode_slo() -> f64 {
    50.0
}
fn default_time_period() -> u64 {
    60
}
fn default_transfer_type() -> String {
    "rdma".to_string()
}
fn default_pp() -> u32 {
    1
}

impl Default for DigsConfig {
    fn default() -> Self {
        Self {
            prefill_slo: default_prefill_slo(),
            decode_slo: default_decode_slo(),
            time_period: default_time_period(),
            is_heterogeneous: false,
            transfer_type: default_transfer_type(),
            pp: default_pp(),
            is_auto_pd_role_switching: false,
            has_flex: false,
        }
    }
}

impl DigsConfig {
    /// Flattens the tunables into the string map the planner library takes.
    pub fn to_params(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("prefill_slo".into(), self.prefill_slo.to_string()),
            ("decode_slo".into(), self.decode_slo.to_string()),
            ("time_period".into(), self.time_period.to_string()),
            (
                "is_heterogeneous".into(),
                self.is_heterogeneous.to_string(),
            ),
            ("transfer_type".into(), self.transfer_type.clone()),
            ("pp".into(), self.pp.to_string()),
            (
                "is_auto_pd_role_switching".into(),
                self.is_auto_pd_role_switching.to_string(),
            ),
            ("has_flex".into(), self.has_flex.to_string()),
        ])
    }
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    deploy_mode: DeployMode,
    #[serde(default = "default_p_rate")]
    default_p_rate: u32,
    #[serde(default = "default_d_rate")]
    default_d_rate: u32,
    #[serde(default = "default_sync_seconds")]
    cluster_synchronization_seconds: u64,
    #[serde(default = "default_online_attempts")]
    server_online_attempt_times: u32,
    #[serde(default = "default_online_wait")]
    server_online_wait_seconds: u64,
    #[serde(default = "default_http_timeout")]
    http_timeout_seconds: u64,
    #[serde(default = "default_http_retries")]
    http_retry_times: u32,
    #[serde(default = "default_switch_timeout")]
    role_switch_timeout_seconds: u64,
    #[serde(default = "default_switch_attempts")]
    max_switch_attempts: u32,
    #[serde(default)]
    max_concurrent_switches: usize,
    #[serde(default = "default_fault_threshold")]
    probe_fault_threshold: u32,
    #[serde(default = "default_delete_grace")]
    delete_grace_seconds: u64,
    #[serde(default = "default_faulty_retention")]
    faulty_retention_seconds: u64,
    #[serde(default = "default_probe_concurrency")]
    probe_concurrency: usize,
    #[serde(default = "default_check_mounted")]
    check_mounted_files: bool,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    model_config_path: String,
    #[serde(default)]
    machine_config_path: String,
    #[serde(default)]
    ctrl_backup: CtrlBackupConfig,
    #[serde(default)]
    process_manager: ProcessManagerConfig,
    #[serde(default)]
    cluster_status: ClusterStatusConfig,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    digs: DigsConfig,
}

fn default_p_rate() -> u32 {
    50
}
fn default_d_rate() -> u32 {
    50
}
fn default_sync_seconds() -> u64 {
    5
}
fn default_online_attempts() -> u32 {
    30
}
fn default_online_wait() -> u64 {
    2
}
fn default_http_timeout() -> u64 {
    10
}
fn default_http_retries() -> u32 {
    3
}
fn default_switch_timeout() -> u64 {
    120
}
fn default_switch_attempts() -> u32 {
    3
}
fn default_fault_threshold() -> u32 {
    3
}
fn default_delete_grace() -> u64 {
    30
}
fn default_faulty_retention() -> u64 {
    3600
}
fn default_probe_concurrency() -> usize {
    32
}
fn default_check_mounted() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

/// The validated controller configuration. Immutable once constructed;
/// dynamic values flow through the [`DynamicConfigWatcher`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ControllerConfig {
    pub deploy_mode: DeployMode,
    pub default_p_rate: u32,
    pub default_d_rate: u32,
    pub cluster_synchronization_seconds: u64,
    pub server_online_attempt_times: u32,
    pub server_online_wait_seconds: u64,
    pub http_timeout_seconds: u64,
    pub http_retry_times: u32,
    pub role_switch_timeout_seconds: u64,
    pub max_switch_attempts: u32,
    /// 0 resolves to the current group count at switch time.
    pub max_concurrent_switches: usize,
    pub probe_fault_threshold: u32,
    pub delete_grace_seconds: u64,
    pub faulty_retention_seconds: u64,
    pub probe_concurrency: usize,
    pub check_mounted_files: bool,
    pub log_level: String,
    pub model_config_path: String,
    pub machine_config_path: String,
    pub ctrl_backup: CtrlBackupConfig,
    pub process_manager: ProcessManagerConfig,
    pub cluster_status: ClusterStatusConfig,
    pub tls: TlsConfig,
    pub digs: DigsConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            deploy_mode: DeployMode::default(),
            default_p_rate: default_p_rate(),
            default_d_rate: default_d_rate(),
            cluster_synchronization_seconds: default_sync_seconds(),
            server_online_attempt_times: default_online_attempts(),
            server_online_wait_seconds: default_online_wait(),
            http_timeout_seconds: default_http_timeout(),
            http_retry_times: default_http_retries(),
            role_switch_timeout_seconds: default_switch_timeout(),
            max_switch_attempts: default_switch_attempts(),
            max_concurrent_switches: 0,
            probe_fault_threshold: default_fault_threshold(),
            delete_grace_seconds: default_delete_grace(),
            faulty_retention_seconds: default_faulty_retention(),
            probe_concurrency: default_probe_concurrency(),
            check_mounted_files: default_check_mounted(),
            log_level: default_log_level(),
            model_config_path: String::new(),
            machine_config_path: String::new(),
            ctrl_backup: CtrlBackupConfig::default(),
            process_manager: ProcessManagerConfig::default(),
            cluster_status: ClusterStatusConfig::default(),
            tls: TlsConfig::default(),
            digs: DigsConfig::default(),
        }
    }
}

/// Verifies that a file's permission bits do not exceed `max_mode`.
#[cfg(unix)]
pub fn check_file_mode(path: &Path, max_mode: u32) -> Result<(), ControllerError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & !max_mode != 0 {
        return Err(ControllerError::InvalidConfig(format!(
            "file '{}' has mode {:o}, which exceeds the allowed {:o}",
            path.display(),
            mode,
            max_mode
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_file_mode(_path: &Path, _max_mode: u32) -> Result<(), ControllerError> {
    Ok(())
}

impl ControllerConfig {
    /// Resolves the config path from the environment, falling back to the
    /// compiled-in default under the installation prefix.
    pub fn resolve_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        match std::env::var(INSTALL_PATH_ENV) {
            Ok(prefix) => Path::new(&prefix).join(DEFAULT_CONFIG_RELPATH),
            Err(_) => PathBuf::from(DEFAULT_CONFIG_RELPATH),
        }
    }

    /// Loads and validates the config named by the environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_file(&Self::resolve_path())
    }

    /// Loads, parses, and validates a config file.
    pub fn from_file(path: &Path) -> Result<Self, ControllerError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            ControllerError::InvalidConfig(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        let config = Self::from_json(&contents)?;
        if config.check_mounted_files {
            check_file_mode(path, STRICT_FILE_MODE)?;
        }
        Ok(config)
    }

    /// Parses and validates a config document.
    pub fn from_json(contents: &str) -> Result<Self, ControllerError> {
        let raw: RawConfig = serde_json::from_str(contents)
            .map_err(|e| ControllerError::InvalidConfig(format!("failed to parse config: {e}")))?;
        let config = ControllerConfig {
            deploy_mode: raw.deploy_mode,
            default_p_rate: raw.default_p_rate,
            default_d_rate: raw.default_d_rate,
            cluster_synchronization_seconds: raw.cluster_synchronization_seconds,
            server_online_attempt_times: raw.server_online_attempt_times,
            server_online_wait_seconds: raw.server_online_wait_seconds,
            http_timeout_seconds: raw.http_timeout_seconds,
            http_retry_times: raw.http_retry_times,
            role_switch_timeout_seconds: raw.role_switch_timeout_seconds,
            max_switch_attempts: raw.max_switch_attempts,
            max_concurrent_switches: raw.max_concurrent_switches,
            probe_fault_threshold: raw.probe_fault_threshold,
            delete_grace_seconds: raw.delete_grace_seconds,
            faulty_retention_seconds: raw.faulty_retention_seconds,
            probe_concurrency: raw.probe_concurrency,
            check_mounted_files: raw.check_mounted_files,
            log_level: raw.log_level,
            model_config_path: raw.model_config_path,
            machine_config_path: raw.machine_config_path,
            ctrl_backup: raw.ctrl_backup,
            process_manager: raw.process_manager,
            cluster_status: raw.cluster_status,
            tls: raw.tls,
            digs: raw.digs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration for logical consistency.
    fn validate(&self) -> Result<(), ControllerError> {
        let err = |msg: String| Err(ControllerError::InvalidConfig(msg));

        if self.default_p_rate > 100 || self.default_d_rate > 100 {
            return err("default_p_rate and default_d_rate must be in [0, 100]".into());
        }
        if self.default_p_rate + self.default_d_rate > 100 {
            return err(format!(
                "default_p_rate + default_d_rate must not exceed 100 (got {})",
                self.default_p_rate + self.default_d_rate
            ));
        }
        if !(1..=3600).contains(&self.cluster_synchronization_seconds) {
            return err("cluster_synchronization_seconds must be in [1, 3600]".into());
        }
        if !(1..=1000).contains(&self.server_online_attempt_times) {
            return err("server_online_attempt_times must be in [1, 1000]".into());
        }
        if !(1..=600).contains(&self.server_online_wait_seconds) {
            return err("server_online_wait_seconds must be in [1, 600]".into());
        }
        if !(1..=300).contains(&self.http_timeout_seconds) {
            return err("http_timeout_seconds must be in [1, 300]".into());
        }
        if self.http_retry_times > 10 {
            return err("http_retry_times must be in [0, 10]".into());
        }
        if !(1..=3600).contains(&self.role_switch_timeout_seconds) {
            return err("role_switch_timeout_seconds must be in [1, 3600]".into());
        }
        if !(1..=100).contains(&self.max_switch_attempts) {
            return err("max_switch_attempts must be in [1, 100]".into());
        }
        if !(1..=100).contains(&self.probe_fault_threshold) {
            return err("probe_fault_threshold must be in [1, 100]".into());
        }
        if self.delete_grace_seconds > 86400 {
            return err("delete_grace_seconds must be in [0, 86400]".into());
        }
        if self.faulty_retention_seconds > 604800 {
            return err("faulty_retention_seconds must be in [0, 604800]".into());
        }
        if !(1..=256).contains(&self.probe_concurrency) {
            return err("probe_concurrency must be in [1, 256]".into());
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return err(format!("unknown log_level '{}'", self.log_level));
        }
        if self.ctrl_backup.enabled {
            return err("ctrl_backup is handled by an external HA agent and must stay disabled".into());
        }
        if self.process_manager.to_file && self.process_manager.file_path.trim().is_empty() {
            return err("process_manager.file_path cannot be empty when to_file is set".into());
        }
        if self.cluster_status.to_file && self.cluster_status.file_path.trim().is_empty() {
            return err("cluster_status.file_path cannot be empty when to_file is set".into());
        }
        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return err("tls.cert_path cannot be empty when TLS is enabled".into());
            }
            if self.tls.key_path.trim().is_empty() {
                return err("tls.key_path cannot be empty when TLS is enabled".into());
            }
            if self.tls.ca_path.trim().is_empty() {
                return err("tls.ca_path cannot be empty when TLS is enabled".into());
            }
        }
        if self.digs.prefill_slo <= 0.0 || self.digs.decode_slo <= 0.0 {
            return err("digs SLO targets must be positive".into());
        }
        if self.digs.pp == 0 {
            return err("digs.pp cannot be 0".into());
        }
        Ok(())
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.cluster_synchronization_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

/// Callback invoked with the new JSON value at a watched dotted path.
pub type WatchCallback = Box<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Background reloader: rereads the config file every [`WATCH_INTERVAL`],
/// keeps the shared snapshot at the last valid document, and invokes
/// registered callbacks when a watched dotted path changes value.
pub struct DynamicConfigWatcher {
    path: PathBuf,
    shared: Arc<RwLock<ControllerConfig>>,
    callbacks: Vec<(String, WatchCallback)>,
    last_raw: serde_json::Value,
}

impl DynamicConfigWatcher {
    pub fn new(path: PathBuf, shared: Arc<RwLock<ControllerConfig>>) -> Self {
        let last_raw = fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null);
        Self {
            path,
            shared,
            callbacks: Vec::new(),
            last_raw,
        }
    }

    /// Registers a callback for changes at a dotted path, e.g. `log_level`
    /// or `process_manager.file_path`.
    pub fn subscribe<F>(&mut self, dotted_path: &str, callback: F)
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.callbacks
            .push((dotted_path.to_string(), Box::new(callback)));
    }

    /// Resolves a dotted path inside a JSON document.
    fn lookup<'a>(value: &'a serde_json::Value, dotted_path: &str) -> &'a serde_json::Value {
        let mut current = value;
        for segment in dotted_path.split('.') {
            current = current.get(segment).unwrap_or(&serde_json::Value::Null);
        }
        current
    }

    /// One reload pass. Exposed for tests; the run loop calls this on a timer.
    pub fn reload_once(&mut self) {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("config reload skipped, cannot read '{}': {e}", self.path.display());
                return;
            }
        };
        let raw: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("config reload skipped, invalid JSON: {e}");
                return;
            }
        };
        let config = match ControllerConfig::from_json(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("config reload skipped, keeping last valid snapshot: {e}");
                return;
            }
        };
        for (dotted_path, callback) in &self.callbacks {
            let old = Self::lookup(&self.last_raw, dotted_path);
            let new = Self::lookup(&raw, dotted_path);
            if old != new {
                info!("config path '{dotted_path}' changed, applying");
                callback(new);
            }
        }
        *self.shared.write() = config;
        self.last_raw = raw;
    }

    /// The watcher main loop.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(WATCH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup state settles.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.reload_once(),
                _ = shutdown_rx.recv() => {
                    debug!("config watcher received shutdown signal");
                    return;
                }
            }
        }
    }
}
