//! Daemon configuration.
//!
//! Loaded from a TOML file, then overridden by `DEVFLOW_*` environment
//! variables. Every field has a default matching the cluster conventions
//! devflow is deployed with, so an empty file is a valid starting point.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidOverride { key: &'static str, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevflowConfig {
    pub server: ServerConfig,
    pub mongo: MongoConfig,
    pub log: LogConfig,
    pub repo: RepoConfig,
    pub pipeline: PipelineConfig,
    pub gitops: GitOpsConfig,
    pub kube: KubeConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    pub uri: String,
    pub db: String,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            db: "devflow".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "console" => Ok(LogFormat::Console),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Console,
        }
    }
}

/// GitOps repository holding rendered deployment manifests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub namespace: String,
    /// Pipeline definition every Manifest build runs.
    pub name: String,
    pub image_registry: String,
    pub workspace_storage_class: Option<String>,
    pub workspace_size: String,
    pub docker_config_secret: String,
    pub ssh_secret: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            namespace: "tekton-pipelines".to_string(),
            name: "devflow-ci".to_string(),
            image_registry: "registry.cn-hangzhou.aliyuncs.com/devflow".to_string(),
            workspace_storage_class: None,
            workspace_size: "1Gi".to_string(),
            docker_config_secret: "aliyun-docker-config".to_string(),
            ssh_secret: "git-ssh-secret".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitOpsConfig {
    pub namespace: String,
    pub project: String,
    pub target_revision: String,
    pub destination_server: String,
    pub destination_namespace: String,
    /// Overlay to deploy; `None` deploys the base manifests.
    pub env: Option<String>,
}

impl Default for GitOpsConfig {
    fn default() -> Self {
        Self {
            namespace: "argo-cd".to_string(),
            project: "default".to_string(),
            target_revision: "main".to_string(),
            destination_server: "https://kubernetes.default.svc".to_string(),
            destination_namespace: "apps".to_string(),
            env: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    pub api_server: String,
    pub token_file: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
    pub request_timeout_secs: u64,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_server: "https://kubernetes.default.svc".to_string(),
            token_file: Some(PathBuf::from(
                "/var/run/secrets/kubernetes.io/serviceaccount/token",
            )),
            insecure_skip_tls_verify: false,
            request_timeout_secs: 30,
        }
    }
}

fn parse_override<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride { key, value })
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl DevflowConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads `path` when given (defaults otherwise), applies process
    /// environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `DEVFLOW_*` overrides read through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("DEVFLOW_SERVER_PORT") {
            self.server.port = parse_override("DEVFLOW_SERVER_PORT", v)?;
        }
        if let Some(v) = lookup("DEVFLOW_MONGO_URI") {
            self.mongo.uri = v;
        }
        if let Some(v) = lookup("DEVFLOW_MONGO_DB") {
            self.mongo.db = v;
        }
        if let Some(v) = lookup("DEVFLOW_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = lookup("DEVFLOW_LOG_FORMAT") {
            self.log.format = parse_override("DEVFLOW_LOG_FORMAT", v)?;
        }
        if let Some(v) = lookup("DEVFLOW_REPO_ADDRESS") {
            self.repo.address = v;
        }
        if let Some(v) = lookup("DEVFLOW_PIPELINE_NAMESPACE") {
            self.pipeline.namespace = v;
        }
        if let Some(v) = lookup("DEVFLOW_PIPELINE_NAME") {
            self.pipeline.name = v;
        }
        if let Some(v) = lookup("DEVFLOW_IMAGE_REGISTRY") {
            self.pipeline.image_registry = v;
        }
        if let Some(v) = lookup("DEVFLOW_GITOPS_NAMESPACE") {
            self.gitops.namespace = v;
        }
        if let Some(v) = lookup("DEVFLOW_ENV") {
            self.gitops.env = non_empty(v);
        }
        if let Some(v) = lookup("DEVFLOW_KUBE_API_SERVER") {
            self.kube.api_server = v;
        }
        if let Some(v) = lookup("DEVFLOW_KUBE_TOKEN_FILE") {
            self.kube.token_file = non_empty(v).map(PathBuf::from);
        }
        if let Some(v) = lookup("DEVFLOW_KUBE_INSECURE") {
            self.kube.insecure_skip_tls_verify = parse_override("DEVFLOW_KUBE_INSECURE", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("mongo.uri", &self.mongo.uri),
            ("mongo.db", &self.mongo.db),
            ("pipeline.namespace", &self.pipeline.namespace),
            ("pipeline.name", &self.pipeline.name),
            ("pipeline.image_registry", &self.pipeline.image_registry),
            ("gitops.namespace", &self.gitops.namespace),
            ("kube.api_server", &self.kube.api_server),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{key} must not be empty")));
            }
        }
        if self.kube.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "kube.request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
