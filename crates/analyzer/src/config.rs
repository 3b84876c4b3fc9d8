//! Analyzer configuration.
//!
//! Loaded once at startup from a JSON or YAML file and never mutated. Every
//! section has defaults, so an empty file (or no file) is a valid config.
//! Credentials are referenced by environment variable name only.

use notify::ReceiveIdType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::decision::LlmConfig;
use crate::error::AnalyzerError;
use crate::sources::{LokiConfig, PrometheusConfig};

/// Default Feishu open platform URL
const DEFAULT_FEISHU_URL: &str = "https://open.feishu.cn";

/// Upper bound for any per-call timeout
const MAX_TIMEOUT_SECS: u64 = 3600;
const MAX_ATTEMPTS: u32 = 10;
const MAX_RETRY_DELAY_MS: u64 = 60_000;
/// Loki rejects ranges beyond its retention; 30 days covers any sane setup
const MAX_WINDOW_MINS: i64 = 30 * 24 * 60;
const MAX_APPROVAL_TIMEOUT_MINS: i64 = 7 * 24 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub prometheus: PrometheusConfig,
    pub loki: LokiConfig,
    pub kubernetes: KubernetesConfig,
    pub llm: LlmConfig,
    pub feishu: FeishuConfig,
    pub workload: WorkloadBaseline,
    /// Spool directory for heal proposals whose notification failed
    pub pending_dir: PendingDir,
}

/// Cluster API settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Pod listing timeout in seconds
    #[serde(default = "default_kube_timeout")]
    pub timeout_secs: u64,
}

fn default_kube_timeout() -> u64 {
    30
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_kube_timeout(),
        }
    }
}

/// Approval card delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeishuConfig {
    #[serde(default = "default_feishu_url")]
    pub base_url: String,
    /// Environment variable holding the app ID
    #[serde(default = "default_app_id_env")]
    pub app_id_env: String,
    /// Environment variable holding the app secret
    #[serde(default = "default_app_secret_env")]
    pub app_secret_env: String,
    /// Chat, user or email receiving approval cards
    #[serde(default)]
    pub receive_id: String,
    #[serde(default = "default_receive_id_type")]
    pub receive_id_type: ReceiveIdType,
    /// Published card template
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub template_version: String,
    #[serde(default = "default_feishu_timeout")]
    pub timeout_secs: u64,
    /// How long an approval request stays open
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_mins: i64,
}

fn default_feishu_url() -> String {
    std::env::var("FEISHU_BASE_URL").unwrap_or_else(|_| DEFAULT_FEISHU_URL.to_string())
}
fn default_app_id_env() -> String {
    "FEISHU_APP_ID".to_string()
}
fn default_app_secret_env() -> String {
    "FEISHU_APP_SECRET".to_string()
}
fn default_receive_id_type() -> ReceiveIdType {
    ReceiveIdType::ChatId
}
fn default_feishu_timeout() -> u64 {
    15
}
fn default_approval_timeout() -> i64 {
    10
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            base_url: default_feishu_url(),
            app_id_env: default_app_id_env(),
            app_secret_env: default_app_secret_env(),
            receive_id: String::new(),
            receive_id_type: default_receive_id_type(),
            template_id: String::new(),
            template_version: String::new(),
            timeout_secs: default_feishu_timeout(),
            approval_timeout_mins: default_approval_timeout(),
        }
    }
}

/// Declared baseline of the workload, quoted verbatim in the request text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadBaseline {
    pub replicas: Option<u32>,
    pub cpu_limits: Option<String>,
    pub cpu_requests: Option<String>,
    pub memory_limits: Option<String>,
    pub memory_requests: Option<String>,
}

/// Newtype so the spool location has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingDir(pub PathBuf);

impl Default for PendingDir {
    fn default() -> Self {
        Self(PathBuf::from(".aiops-analyzer/pending"))
    }
}

impl AsRef<Path> for PendingDir {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl AnalyzerConfig {
    /// Load configuration from a file, choosing the format by extension.
    ///
    /// `.json` files are read as JSON, everything else as YAML.
    pub async fn load_from_path(path: &Path) -> Result<Self, AnalyzerError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| AnalyzerError::Config(format!("cannot read {}: {e}", path.display())))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&content)
                .map_err(|e| AnalyzerError::Config(format!("{}: {e}", path.display())))?
        } else if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| AnalyzerError::Config(format!("{}: {e}", path.display())))?
        };

        tracing::debug!(path = %path.display(), "Loaded analyzer config");
        Ok(config)
    }

    /// Load from `path` when given, otherwise use defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self, AnalyzerError> {
        let config = match path {
            Some(path) => Self::load_from_path(path).await?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<(), AnalyzerError> {
        let endpoints = [
            ("prometheus.base_url", &self.prometheus.base_url),
            ("loki.base_url", &self.loki.base_url),
            ("llm.base_url", &self.llm.base_url),
            ("llm.model", &self.llm.model),
            ("feishu.base_url", &self.feishu.base_url),
        ];
        for (field, value) in endpoints {
            if value.trim().is_empty() {
                return Err(AnalyzerError::Config(format!("{field} must not be empty")));
            }
        }

        let timeouts = [
            ("prometheus.timeout_secs", self.prometheus.timeout_secs),
            ("loki.timeout_secs", self.loki.timeout_secs),
            ("kubernetes.timeout_secs", self.kubernetes.timeout_secs),
            ("llm.timeout_secs", self.llm.timeout_secs),
            ("feishu.timeout_secs", self.feishu.timeout_secs),
        ];
        for (field, secs) in timeouts {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                return Err(AnalyzerError::Config(format!(
                    "{field} must be between 1 and {MAX_TIMEOUT_SECS}"
                )));
            }
        }

        if self.llm.max_attempts == 0 || self.llm.max_attempts > MAX_ATTEMPTS {
            return Err(AnalyzerError::Config(format!(
                "llm.max_attempts must be between 1 and {MAX_ATTEMPTS}"
            )));
        }
        if self.llm.retry_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(AnalyzerError::Config(format!(
                "llm.retry_delay_ms must be at most {MAX_RETRY_DELAY_MS}"
            )));
        }
        if !(1..=MAX_WINDOW_MINS).contains(&self.loki.window_mins) {
            return Err(AnalyzerError::Config(format!(
                "loki.window_mins must be between 1 and {MAX_WINDOW_MINS}"
            )));
        }
        if self.loki.limit == 0 {
            return Err(AnalyzerError::Config("loki.limit must be positive".to_string()));
        }
        if !(1..=MAX_APPROVAL_TIMEOUT_MINS).contains(&self.feishu.approval_timeout_mins) {
            return Err(AnalyzerError::Config(format!(
                "feishu.approval_timeout_mins must be between 1 and {MAX_APPROVAL_TIMEOUT_MINS}"
            )));
        }
        Ok(())
    }

    /// Settings needed before a heal proposal can be announced.
    pub fn validate_notification(&self) -> Result<(), AnalyzerError> {
        for (field, value) in [
            ("feishu.receive_id", &self.feishu.receive_id),
            ("feishu.template_id", &self.feishu.template_id),
            ("feishu.template_version", &self.feishu.template_version),
        ] {
            if value.trim().is_empty() {
                return Err(AnalyzerError::Config(format!("{field} must be set")));
            }
        }
        Ok(())
    }
}

impl KubernetesConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[tokio::test]
    async fn test_loads_yaml_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r"
loki:
  tenant_id: team-a
  window_mins: 30
feishu:
  receive_id: oc_ops
  receive_id_type: email
  template_id: AAqhGHg0Wgux8
  template_version: 0.0.9
workload:
  replicas: 1
  cpu_limits: 2000m
pending_dir: /tmp/pending
"
        )
        .unwrap();

        let config = AnalyzerConfig::load(Some(file.path())).await.unwrap();
        assert_eq!(config.loki.tenant_id.as_deref(), Some("team-a"));
        assert_eq!(config.loki.window_mins, 30);
        assert_eq!(config.loki.limit, 200);
        assert_eq!(config.feishu.receive_id_type, ReceiveIdType::Email);
        assert_eq!(config.feishu.approval_timeout_mins, 10);
        assert_eq!(config.workload.replicas, Some(1));
        assert_eq!(config.workload.memory_limits, None);
        assert_eq!(config.pending_dir.0, PathBuf::from("/tmp/pending"));
        assert!(config.validate_notification().is_ok());
    }

    #[tokio::test]
    async fn test_loads_json_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"llm": {{"model": "m", "max_attempts": 5}}}}"#).unwrap();

        let config = AnalyzerConfig::load(Some(file.path())).await.unwrap();
        assert_eq!(config.llm.model, "m");
        assert_eq!(config.llm.max_attempts, 5);
        assert_eq!(config.llm.api_key_env, "LLM_API_KEY");
    }

    #[tokio::test]
    async fn test_rejects_unknown_receive_id_type() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "feishu:\n  receive_id_type: group").unwrap();

        assert!(matches!(
            AnalyzerConfig::load(Some(file.path())).await,
            Err(AnalyzerError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = AnalyzerConfig::default();
        config.llm.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AnalyzerConfig::default();
        config.prometheus.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AnalyzerConfig::default();
        config.loki.base_url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = AnalyzerConfig::default();
        config.loki.window_mins = i64::MAX;
        assert!(matches!(config.validate(), Err(AnalyzerError::Config(_))));

        let mut config = AnalyzerConfig::default();
        config.feishu.approval_timeout_mins = i64::MAX;
        assert!(config.validate().is_err());

        let mut config = AnalyzerConfig::default();
        config.llm.timeout_secs = u64::MAX;
        config.llm.max_attempts = u32::MAX;
        assert!(config.validate().is_err());
        // never panics, even unvalidated
        assert_eq!(config.llm.total_budget(), Duration::MAX);

        let mut config = AnalyzerConfig::default();
        config.loki.window_mins = MAX_WINDOW_MINS;
        config.feishu.approval_timeout_mins = MAX_APPROVAL_TIMEOUT_MINS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_notification_settings_required_for_heal() {
        let config = AnalyzerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.validate_notification().is_err());
    }

    #[test]
    #[serial]
    fn test_endpoint_env_overrides_defaults() {
        unsafe {
            std::env::set_var("PROMETHEUS_URL", "http://prom.test:9090");
            std::env::set_var("LLM_MODEL", "env-model");
        }

        let config = AnalyzerConfig::default();
        assert_eq!(config.prometheus.base_url, "http://prom.test:9090");
        assert_eq!(config.llm.model, "env-model");

        unsafe {
            std::env::remove_var("PROMETHEUS_URL");
            std::env::remove_var("LLM_MODEL");
        }

        let config = AnalyzerConfig::default();
        assert_ne!(config.prometheus.base_url, "http://prom.test:9090");
    }
}
