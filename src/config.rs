use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sources::ArtifactKind;
use crate::version::Version;

const ENV_FILE_ENV: &str = "AUTOUPDATED_ENV_FILE";
pub const CONFIG_PATH_ENV: &str = "AUTOUPDATED_CONFIG";
const INSTALL_ROOT_ENV: &str = "AUTOUPDATED_INSTALL_ROOT";
const NETWORK_ROOT_ENV: &str = "AUTOUPDATED_NETWORK_ROOT";

const INSTALL_ROOT_PLACEHOLDER: &str = "__INSTALL_ROOT__";
const NETWORK_ROOT_PLACEHOLDER: &str = "__NETWORK_ROOT__";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub check_interval_ms: u64,
    pub startup_delay_ms: u64,
    pub sources: SourcesConfig,
    pub policy: PolicyConfig,
    pub backup: BackupConfig,
    pub security: SecurityConfig,
    pub paths: PathsConfig,
    pub target: TargetConfig,
    pub retry: RetryConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
    pub self_update: SelfUpdateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_interval_ms: 5 * 60 * 1000,
            startup_delay_ms: 60_000,
            sources: SourcesConfig::default(),
            policy: PolicyConfig::default(),
            backup: BackupConfig::default(),
            security: SecurityConfig::default(),
            paths: PathsConfig::default(),
            target: TargetConfig::default(),
            retry: RetryConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
            self_update: SelfUpdateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourcesConfig {
    pub registry: RegistrySourceConfig,
    pub archive: ArchiveSourceConfig,
    pub share: ShareSourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySourceConfig {
    pub enabled: bool,
    pub api_url: Option<String>,
    pub artifact_kind: ArtifactKind,
    pub image_template: Option<String>,
    pub asset_template: Option<String>,
    pub digest_suffix: String,
    pub signature_suffix: String,
}

impl Default for RegistrySourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: None,
            artifact_kind: ArtifactKind::ContainerImage,
            image_template: None,
            asset_template: None,
            digest_suffix: ".sha256".to_string(),
            signature_suffix: ".sig".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchiveSourceConfig {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    /// Used when the archive carries no `VERSION.txt`.
    pub version: Option<String>,
    pub digest_file: Option<PathBuf>,
    pub signature_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShareSourceConfig {
    pub enabled: bool,
    pub root: Option<PathBuf>,
    pub latest_file: String,
    pub archive_template: String,
}

impl Default for ShareSourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: None,
            latest_file: "latest.txt".to_string(),
            archive_template: "package-{version}.zip".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub pinned_version: Option<String>,
    pub allow_downgrade: bool,
    /// When nothing is installed yet, skip pin filtering for the first install.
    pub bootstrap_bypasses_policy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub keep: usize,
    pub dir: Option<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep: 5,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub require_hash: bool,
    pub require_signature: bool,
    pub public_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathsConfig {
    pub install_root: Option<PathBuf>,
    pub deploy_dir: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
}

/// How the service is stopped, started and pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Controller {
    Compose,
    /// Offline installs: process control is a no-op.
    None,
}

impl std::fmt::Display for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Controller::Compose => f.write_str("compose"),
            Controller::None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetConfig {
    pub controller: Controller,
    pub docker_bin: String,
    pub compose_file: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub version_key: String,
    pub health_url: Option<String>,
    pub health_attempts: u32,
    pub health_delay_ms: u64,
    pub health_timeout_ms: u64,
    pub command_timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            controller: Controller::Compose,
            docker_bin: "docker".to_string(),
            compose_file: None,
            env_file: None,
            version_key: "APP_VERSION".to_string(),
            health_url: None,
            health_attempts: 45,
            health_delay_ms: 2000,
            health_timeout_ms: 3000,
            command_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 15,
            initial_delay_ms: 250,
            max_delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub request_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub log_file: Option<PathBuf>,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelfUpdateConfig {
    pub enabled: bool,
    pub zip_url: Option<String>,
    pub local_zip_path: Option<PathBuf>,
    pub hash_url: Option<String>,
    pub signature_url: Option<String>,
    /// The daemon's own installation directory. Required when enabled: the
    /// whole directory is renamed aside and replaced.
    pub install_dir: Option<PathBuf>,
}

impl Config {
    /// Loads `.env`, resolves the config path and decodes the document.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        load_dotenv()?;
        let path = match explicit_path {
            Some(path) => path.to_path_buf(),
            None => read_non_empty_env(CONFIG_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.json")),
        };
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed decoding config {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let install_root = default_install_root();
        let network_root = default_network_root();
        let mut value: Value = serde_json::from_str(raw).context("config is not valid JSON")?;
        substitute_placeholders(&mut value, &install_root, &network_root);
        let mut config: Config =
            serde_json::from_value(value).context("config does not match expected shape")?;
        if config.paths.install_root.is_none() {
            config.paths.install_root = Some(PathBuf::from(install_root));
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(pinned) = self.policy.pinned_version.as_deref() {
            Version::parse(pinned)
                .with_context(|| format!("policy.pinnedVersion '{}' is not a version", pinned))?;
        }
        if self.self_update.enabled && self.self_update.install_dir.is_none() {
            return Err(anyhow!(
                "selfUpdate.installDir is required when selfUpdate.enabled=true"
            ));
        }
        Ok(())
    }

    pub fn install_root(&self) -> PathBuf {
        self.paths
            .install_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(default_install_root()))
    }

    pub fn deploy_dir(&self) -> PathBuf {
        self.paths
            .deploy_dir
            .clone()
            .unwrap_or_else(|| self.install_root().join("deploy"))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.paths
            .staging_dir
            .clone()
            .unwrap_or_else(|| self.install_root().join("staging"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup
            .dir
            .clone()
            .or_else(|| self.paths.backup_dir.clone())
            .unwrap_or_else(|| self.install_root().join("backup"))
    }

    pub fn status_file(&self) -> PathBuf {
        self.paths
            .status_file
            .clone()
            .unwrap_or_else(|| self.install_root().join("logs").join("update-status.json"))
    }

    pub fn env_file(&self) -> PathBuf {
        self.target
            .env_file
            .clone()
            .unwrap_or_else(|| self.deploy_dir().join(".env"))
    }

    pub fn compose_file(&self) -> PathBuf {
        self.target
            .compose_file
            .clone()
            .unwrap_or_else(|| self.deploy_dir().join("docker-compose.yml"))
    }

    pub fn pinned_version(&self) -> Option<Version> {
        self.policy
            .pinned_version
            .as_deref()
            .and_then(Version::parse_lenient)
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let registry = &self.sources.registry;
        let mut enabled_sources = Vec::new();
        if registry.enabled {
            enabled_sources.push("registry".to_string());
        }
        if self.sources.archive.enabled {
            enabled_sources.push("archive".to_string());
        }
        if self.sources.share.enabled {
            enabled_sources.push("share".to_string());
        }

        let mut warnings = Vec::new();
        if enabled_sources.is_empty() {
            warnings.push("no update source is enabled; every cycle will report no-update".to_string());
        }
        if registry.enabled && registry.api_url.as_deref().map_or(true, str::is_empty) {
            warnings.push("sources.registry is enabled but apiUrl is missing".to_string());
        }
        if registry.enabled
            && registry.artifact_kind == ArtifactKind::ContainerImage
            && registry.image_template.is_none()
        {
            warnings.push(
                "sources.registry.artifactKind=container-image requires imageTemplate".to_string(),
            );
        }
        if self.sources.archive.enabled && self.sources.archive.path.is_none() {
            warnings.push("sources.archive is enabled but path is missing".to_string());
        }
        if self.sources.share.enabled && self.sources.share.root.is_none() {
            warnings.push("sources.share is enabled but root is missing".to_string());
        }
        if self.security.require_signature
            && self.security.public_key_file.is_none()
            && crate::verifier::embedded_public_key().is_none()
        {
            warnings.push(
                "security.requireSignature=true but no public key is embedded or configured; every signed artifact will be rejected"
                    .to_string(),
            );
        }
        if !self.security.require_hash {
            warnings.push("security.requireHash=false; archive digests are not verified".to_string());
        }
        if !self.backup.enabled {
            warnings.push(
                "backups are disabled; a failed update cannot be rolled back".to_string(),
            );
        }
        if self.backup.enabled && self.backup.keep == 0 {
            warnings.push("backup.keep=0 keeps only the backup of the running cycle".to_string());
        }
        if self
            .target
            .health_url
            .as_deref()
            .map_or(true, |url| url.trim().is_empty())
        {
            warnings.push(
                "target.healthUrl is not set; the service is assumed healthy after every restart"
                    .to_string(),
            );
        }
        if self.target.health_attempts == 0 {
            warnings.push("target.healthAttempts=0 makes every health check fail".to_string());
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            warnings.push("retry.maxDelayMs should be >= retry.initialDelayMs".to_string());
        }
        if self.self_update.enabled && self.self_update.install_dir.is_none() {
            warnings.push(
                "selfUpdate.enabled=true requires selfUpdate.installDir; self-update will not run"
                    .to_string(),
            );
        }
        if self.policy.bootstrap_bypasses_policy && self.policy.pinned_version.is_some() {
            warnings.push(
                "policy.bootstrapBypassesPolicy=true ignores pinnedVersion for the first install"
                    .to_string(),
            );
        }

        DoctorReport {
            install_root: self.install_root(),
            deploy_dir: self.deploy_dir(),
            staging_dir: self.staging_dir(),
            backup_dir: self.backup_dir(),
            status_file: self.status_file(),
            env_file: self.env_file(),
            controller: self.target.controller,
            enabled_sources,
            pinned_version: self.policy.pinned_version.clone(),
            allow_downgrade: self.policy.allow_downgrade,
            backups_enabled: self.backup.enabled,
            require_hash: self.security.require_hash,
            require_signature: self.security.require_signature,
            check_interval_ms: self.check_interval_ms,
            self_update_enabled: self.self_update.enabled,
            warnings,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub install_root: PathBuf,
    pub deploy_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub status_file: PathBuf,
    pub env_file: PathBuf,
    pub controller: Controller,
    pub enabled_sources: Vec<String>,
    pub pinned_version: Option<String>,
    pub allow_downgrade: bool,
    pub backups_enabled: bool,
    pub require_hash: bool,
    pub require_signature: bool,
    pub check_interval_ms: u64,
    pub self_update_enabled: bool,
    pub warnings: Vec<String>,
}

fn substitute_placeholders(value: &mut Value, install_root: &str, network_root: &str) {
    match value {
        Value::String(text) => {
            if text.contains(INSTALL_ROOT_PLACEHOLDER) || text.contains(NETWORK_ROOT_PLACEHOLDER) {
                *text = text
                    .replace(INSTALL_ROOT_PLACEHOLDER, install_root)
                    .replace(NETWORK_ROOT_PLACEHOLDER, network_root);
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_placeholders(item, install_root, network_root);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                substitute_placeholders(item, install_root, network_root);
            }
        }
        _ => {}
    }
}

fn default_install_root() -> String {
    read_non_empty_env(INSTALL_ROOT_ENV).unwrap_or_else(|| {
        if cfg!(windows) {
            "C:\\CustomerDashboard".to_string()
        } else {
            "/opt/customer-dashboard".to_string()
        }
    })
}

fn default_network_root() -> String {
    read_non_empty_env(NETWORK_ROOT_ENV).unwrap_or_else(|| {
        if cfg!(windows) {
            "\\\\fileserver\\releases\\customer-dashboard".to_string()
        } else {
            "/mnt/releases/customer-dashboard".to_string()
        }
    })
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
