//! Configuration module for Graphloom.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, env-variable indirection, validation, and defaults.
//!
//! Any string field `<name>` that commonly carries a secret or
//! deployment-specific value may instead be supplied as `<name>_env`, naming
//! an environment variable to read at load time. A value given directly wins
//! over the env indirection.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Top-level configuration for Graphloom.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub neo4j: Neo4jConfig,
    pub hooks: HooksConfig,
    pub retention: RetentionConfig,
    pub query: QueryConfig,
    pub task: TaskConfig,
    pub llm: LlmConfig,
    pub embeddings: EmbeddingsConfig,
    pub atom: AtomConfig,
    pub output: OutputConfig,
    pub ontology: OntologyConfig,
    pub logging: LoggingConfig,
}

/// HTTP surface settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allow_origins: Vec<String>,
    /// Bearer token every request must present.
    pub api_key: String,
}

/// Graph database connection settings.
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    /// HTTP endpoint of the Neo4j server, e.g. `http://localhost:7474`.
    pub uri: String,
    pub username: String,
    pub password: String,
    /// Database name; `None` selects the server default (`neo4j`).
    pub database: Option<String>,
}

/// Source hook provider selection.
#[derive(Debug, Clone)]
pub struct HooksConfig {
    /// `static` or `sqlite`.
    pub provider: String,
    /// Sample paragraphs returned by the static provider on full fetch.
    pub static_full: Vec<String>,
    /// Sample paragraphs returned by the static provider on incremental fetch.
    pub static_incremental: Vec<String>,
    pub sqlite_path: Option<String>,
    pub table_name: Option<String>,
}

/// Snapshot retention settings.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Number of successful versions to keep. Zero or negative disables
    /// cleanup.
    pub max_versions: i64,
    pub enable_cleanup: bool,
}

/// Defaults and bounds for `/kg/query`.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub default_limit_nodes: usize,
    pub default_limit_edges: usize,
    pub default_depth: u32,
    pub max_depth: u32,
    pub max_seed_nodes: usize,
}

/// Task-level settings.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Advisory pipeline timeout in seconds; 0 disables it. Crash recovery
    /// at startup is the enforced backstop.
    pub timeout_s: u64,
}

/// Requests-per-minute / tokens-per-minute limits. Zero disables a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub rpm: u32,
    pub tpm: u32,
}

/// In-flight call cap for one provider. Zero disables the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencySettings {
    pub max_in_flight: usize,
}

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_s: f64,
    pub max_backoff_s: f64,
    pub backoff_multiplier: f64,
}

/// Prompt batching bounds for the throttled parser. Zero disables a bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSettings {
    pub max_elements: usize,
    pub max_tokens: usize,
    pub sleep_between_batches_s: f64,
    pub max_pending_requests: usize,
}

/// Chat-completion provider settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub api_base_url: Option<String>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    pub rate_limit: RateLimitSettings,
    pub concurrency: ConcurrencySettings,
    pub retry: RetrySettings,
    pub batch: BatchSettings,
}

/// Embedding provider settings.
#[derive(Debug, Clone)]
pub struct EmbeddingsConfig {
    pub api_key: String,
    pub api_base_url: Option<String>,
    pub model: String,
    pub rate_limit: RateLimitSettings,
    pub concurrency: ConcurrencySettings,
    pub retry: RetrySettings,
}

/// Graph construction parameters.
#[derive(Debug, Clone)]
pub struct AtomConfig {
    /// Embedding similarity required to merge two entities.
    pub ent_threshold: f32,
    /// Embedding similarity required to merge two relationships.
    pub rel_threshold: f32,
    pub entity_name_weight: f32,
    pub entity_label_weight: f32,
    /// Concurrent embedding lookups during construction.
    pub max_workers: usize,
    /// Refuse cross-label entity merges. Defaults to true when
    /// `output.entity_name_mode` is `source`.
    pub require_same_entity_label: bool,
    /// Rename merged relationships to the cluster representative. Defaults
    /// to true when `output.relation_name_mode` is not `source`.
    pub rename_relationship_by_embedding: bool,
}

/// Output shaping for extraction.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub language: String,
    /// `source` keeps entity names verbatim from the input text.
    pub entity_name_mode: String,
    pub relation_name_mode: String,
    pub relation_fallback_name: String,
}

/// Ontology constraints applied during construction.
#[derive(Debug, Clone)]
pub struct OntologyConfig {
    pub entity_label: EntityLabelConfig,
}

/// Entity label normalization rules.
#[derive(Debug, Clone)]
pub struct EntityLabelConfig {
    /// When present, labels outside the list become `unknown_label`.
    pub allowlist: Option<Vec<String>>,
    /// Label canonicalization map, applied before the allowlist.
    pub aliases: HashMap<String, String>,
    pub unknown_label: String,
    /// Drop relationships with an unknown-labeled endpoint.
    pub drop_unknown: bool,
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Raw (on-disk) shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    neo4j: RawNeo4j,
    #[serde(default)]
    hooks: RawHooks,
    #[serde(default)]
    retention: RawRetention,
    #[serde(default)]
    query: RawQuery,
    #[serde(default)]
    task: RawTask,
    #[serde(default)]
    llm: RawProvider,
    #[serde(default)]
    embeddings: RawProvider,
    #[serde(default)]
    atom: RawAtom,
    #[serde(default)]
    output: RawOutput,
    #[serde(default)]
    ontology: RawOntology,
    #[serde(default)]
    logging: RawLogging,
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    host: Option<String>,
    port: Option<u16>,
    cors_allow_origins: Option<Vec<String>>,
    api_key: Option<String>,
    api_key_env: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNeo4j {
    uri: Option<String>,
    uri_env: Option<String>,
    username: Option<String>,
    username_env: Option<String>,
    password: Option<String>,
    password_env: Option<String>,
    database: Option<String>,
    database_env: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHooks {
    provider: Option<String>,
    static_full: Option<Vec<String>>,
    static_incremental: Option<Vec<String>>,
    sqlite_path: Option<String>,
    sqlite_path_env: Option<String>,
    table_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRetention {
    max_versions: Option<i64>,
    enable_cleanup: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawQuery {
    default_limit_nodes: Option<usize>,
    default_limit_edges: Option<usize>,
    default_depth: Option<u32>,
    max_depth: Option<u32>,
    max_seed_nodes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTask {
    timeout_s: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRateLimit {
    rpm: Option<u32>,
    tpm: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConcurrency {
    max_in_flight: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRetry {
    max_retries: Option<u32>,
    initial_backoff_s: Option<f64>,
    max_backoff_s: Option<f64>,
    backoff_multiplier: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBatch {
    max_elements: Option<usize>,
    max_tokens: Option<usize>,
    sleep_between_batches_s: Option<f64>,
    max_pending_requests: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProvider {
    api_key: Option<String>,
    api_key_env: Option<String>,
    api_base_url: Option<String>,
    api_base_url_env: Option<String>,
    model: Option<String>,
    model_env: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    #[serde(default)]
    rate_limit: RawRateLimit,
    #[serde(default)]
    concurrency: RawConcurrency,
    #[serde(default)]
    retry: RawRetry,
    #[serde(default)]
    batch: RawBatch,
}

#[derive(Debug, Default, Deserialize)]
struct RawAtom {
    ent_threshold: Option<f32>,
    rel_threshold: Option<f32>,
    entity_name_weight: Option<f32>,
    entity_label_weight: Option<f32>,
    max_workers: Option<usize>,
    require_same_entity_label: Option<bool>,
    rename_relationship_by_embedding: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOutput {
    language: Option<String>,
    entity_name_mode: Option<String>,
    relation_name_mode: Option<String>,
    relation_fallback_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOntology {
    #[serde(default)]
    entity_label: RawEntityLabel,
}

#[derive(Debug, Default, Deserialize)]
struct RawEntityLabel {
    allowlist: Option<Vec<String>>,
    aliases: Option<HashMap<String, String>>,
    unknown_label: Option<String>,
    drop_unknown: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogging {
    level: Option<String>,
}

// ---------------------------------------------------------------------------
// Env indirection
// ---------------------------------------------------------------------------

/// Resolves a string field, falling back to the environment variable named by
/// its `_env` companion. Blank values count as absent.
fn resolve_str(
    value: &Option<String>,
    env_key: &Option<String>,
    field: &str,
    required: bool,
) -> anyhow::Result<Option<String>> {
    if let Some(v) = value {
        if !v.trim().is_empty() {
            return Ok(Some(v.clone()));
        }
    }
    if let Some(key) = env_key {
        if let Ok(v) = std::env::var(key) {
            if !v.trim().is_empty() {
                return Ok(Some(v));
            }
        }
    }
    if required {
        anyhow::bail!("missing config field: {field} / {field}_env");
    }
    Ok(None)
}

fn required_str(
    value: &Option<String>,
    env_key: &Option<String>,
    field: &str,
) -> anyhow::Result<String> {
    Ok(resolve_str(value, env_key, field, true)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let raw: RawConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> anyhow::Result<Self> {
        let output = OutputConfig {
            language: raw.output.language.unwrap_or_else(|| "zh".to_string()),
            entity_name_mode: raw
                .output
                .entity_name_mode
                .unwrap_or_else(|| "source".to_string()),
            relation_name_mode: raw
                .output
                .relation_name_mode
                .unwrap_or_else(|| "source".to_string()),
            relation_fallback_name: raw
                .output
                .relation_fallback_name
                .unwrap_or_else(|| "related_to".to_string()),
        };

        let atom = AtomConfig {
            ent_threshold: raw.atom.ent_threshold.unwrap_or(0.8),
            rel_threshold: raw.atom.rel_threshold.unwrap_or(0.7),
            entity_name_weight: raw.atom.entity_name_weight.unwrap_or(0.8),
            entity_label_weight: raw.atom.entity_label_weight.unwrap_or(0.2),
            max_workers: raw.atom.max_workers.unwrap_or(8),
            require_same_entity_label: raw
                .atom
                .require_same_entity_label
                .unwrap_or(output.entity_name_mode == "source"),
            rename_relationship_by_embedding: raw
                .atom
                .rename_relationship_by_embedding
                .unwrap_or(output.relation_name_mode != "source"),
        };

        Ok(Config {
            server: ServerConfig {
                host: raw.server.host.unwrap_or_else(|| "0.0.0.0".to_string()),
                port: raw.server.port.unwrap_or(8021),
                cors_allow_origins: raw
                    .server
                    .cors_allow_origins
                    .unwrap_or_else(|| vec!["*".to_string()]),
                api_key: required_str(
                    &raw.server.api_key,
                    &raw.server.api_key_env,
                    "server.api_key",
                )?,
            },
            neo4j: Neo4jConfig {
                uri: required_str(&raw.neo4j.uri, &raw.neo4j.uri_env, "neo4j.uri")?,
                username: required_str(
                    &raw.neo4j.username,
                    &raw.neo4j.username_env,
                    "neo4j.username",
                )?,
                password: required_str(
                    &raw.neo4j.password,
                    &raw.neo4j.password_env,
                    "neo4j.password",
                )?,
                database: resolve_str(
                    &raw.neo4j.database,
                    &raw.neo4j.database_env,
                    "neo4j.database",
                    false,
                )?,
            },
            hooks: HooksConfig {
                provider: raw.hooks.provider.unwrap_or_else(|| "static".to_string()),
                static_full: raw.hooks.static_full.unwrap_or_default(),
                static_incremental: raw.hooks.static_incremental.unwrap_or_default(),
                sqlite_path: resolve_str(
                    &raw.hooks.sqlite_path,
                    &raw.hooks.sqlite_path_env,
                    "hooks.sqlite_path",
                    false,
                )?,
                table_name: raw.hooks.table_name,
            },
            retention: RetentionConfig {
                max_versions: raw.retention.max_versions.unwrap_or(10),
                enable_cleanup: raw.retention.enable_cleanup.unwrap_or(true),
            },
            query: QueryConfig {
                default_limit_nodes: raw.query.default_limit_nodes.unwrap_or(500),
                default_limit_edges: raw.query.default_limit_edges.unwrap_or(1000),
                default_depth: raw.query.default_depth.unwrap_or(2),
                max_depth: raw.query.max_depth.unwrap_or(5),
                max_seed_nodes: raw.query.max_seed_nodes.unwrap_or(30),
            },
            task: TaskConfig {
                timeout_s: raw.task.timeout_s.unwrap_or(0),
            },
            llm: LlmConfig {
                api_key: required_str(&raw.llm.api_key, &raw.llm.api_key_env, "llm.api_key")?,
                api_base_url: resolve_str(
                    &raw.llm.api_base_url,
                    &raw.llm.api_base_url_env,
                    "llm.api_base_url",
                    false,
                )?,
                model: required_str(&raw.llm.model, &raw.llm.model_env, "llm.model")?,
                max_tokens: raw.llm.max_tokens,
                temperature: raw.llm.temperature.unwrap_or(0.0),
                rate_limit: read_rate_limit(&raw.llm.rate_limit),
                concurrency: read_concurrency(&raw.llm.concurrency),
                retry: read_retry(&raw.llm.retry),
                batch: read_batch(&raw.llm.batch),
            },
            embeddings: EmbeddingsConfig {
                api_key: required_str(
                    &raw.embeddings.api_key,
                    &raw.embeddings.api_key_env,
                    "embeddings.api_key",
                )?,
                api_base_url: resolve_str(
                    &raw.embeddings.api_base_url,
                    &raw.embeddings.api_base_url_env,
                    "embeddings.api_base_url",
                    false,
                )?,
                model: required_str(
                    &raw.embeddings.model,
                    &raw.embeddings.model_env,
                    "embeddings.model",
                )?,
                rate_limit: read_rate_limit(&raw.embeddings.rate_limit),
                concurrency: read_concurrency(&raw.embeddings.concurrency),
                retry: read_retry(&raw.embeddings.retry),
            },
            atom,
            output,
            ontology: OntologyConfig {
                entity_label: EntityLabelConfig {
                    allowlist: raw.ontology.entity_label.allowlist,
                    aliases: raw.ontology.entity_label.aliases.unwrap_or_default(),
                    unknown_label: raw
                        .ontology
                        .entity_label
                        .unknown_label
                        .unwrap_or_else(|| "unknown".to_string()),
                    drop_unknown: raw.ontology.entity_label.drop_unknown.unwrap_or(false),
                },
            },
            logging: LoggingConfig {
                level: raw.logging.level.unwrap_or_else(|| "info".to_string()),
            },
        })
    }
}

fn read_rate_limit(raw: &RawRateLimit) -> RateLimitSettings {
    RateLimitSettings {
        rpm: raw.rpm.unwrap_or(0),
        tpm: raw.tpm.unwrap_or(0),
    }
}

fn read_concurrency(raw: &RawConcurrency) -> ConcurrencySettings {
    ConcurrencySettings {
        max_in_flight: raw.max_in_flight.unwrap_or(0),
    }
}

fn read_retry(raw: &RawRetry) -> RetrySettings {
    RetrySettings {
        max_retries: raw.max_retries.unwrap_or(0),
        initial_backoff_s: raw.initial_backoff_s.unwrap_or(1.0),
        max_backoff_s: raw.max_backoff_s.unwrap_or(30.0),
        backoff_multiplier: raw.backoff_multiplier.unwrap_or(2.0),
    }
}

fn read_batch(raw: &RawBatch) -> BatchSettings {
    BatchSettings {
        max_elements: raw.max_elements.unwrap_or(0),
        max_tokens: raw.max_tokens.unwrap_or(0),
        sleep_between_batches_s: raw.sleep_between_batches_s.unwrap_or(0.0),
        max_pending_requests: raw.max_pending_requests.unwrap_or(0),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"query.max_depth"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `hooks.provider`.
const VALID_HOOK_PROVIDERS: &[&str] = &["static", "sqlite"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.into(),
                message,
            });
        };

        if self.server.port == 0 {
            push("server.port", "must be greater than 0".into());
        }

        if !VALID_HOOK_PROVIDERS.contains(&self.hooks.provider.as_str()) {
            push(
                "hooks.provider",
                format!(
                    "invalid provider '{}'; valid options: {}",
                    self.hooks.provider,
                    VALID_HOOK_PROVIDERS.join(", ")
                ),
            );
        }
        if self.hooks.provider == "sqlite" {
            if self.hooks.sqlite_path.as_deref().unwrap_or("").is_empty() {
                push("hooks.sqlite_path", "required for the sqlite provider".into());
            }
            if self.hooks.table_name.as_deref().unwrap_or("").is_empty() {
                push("hooks.table_name", "required for the sqlite provider".into());
            }
        }

        if self.query.default_limit_nodes == 0 {
            push("query.default_limit_nodes", "must be greater than 0".into());
        }
        if self.query.max_seed_nodes == 0 {
            push("query.max_seed_nodes", "must be greater than 0".into());
        }
        if self.query.default_depth > self.query.max_depth {
            push(
                "query.default_depth",
                format!(
                    "default_depth ({}) must not exceed max_depth ({})",
                    self.query.default_depth, self.query.max_depth
                ),
            );
        }

        for (prefix, retry) in [
            ("llm.retry", &self.llm.retry),
            ("embeddings.retry", &self.embeddings.retry),
        ] {
            if retry.initial_backoff_s < 0.0 {
                push(
                    &format!("{prefix}.initial_backoff_s"),
                    "must not be negative".into(),
                );
            }
            if retry.max_backoff_s < retry.initial_backoff_s {
                push(
                    &format!("{prefix}.max_backoff_s"),
                    "must be at least initial_backoff_s".into(),
                );
            }
            if retry.backoff_multiplier < 1.0 {
                push(
                    &format!("{prefix}.backoff_multiplier"),
                    "must be at least 1.0".into(),
                );
            }
        }

        for (field, value) in [
            ("atom.ent_threshold", self.atom.ent_threshold),
            ("atom.rel_threshold", self.atom.rel_threshold),
            ("atom.entity_name_weight", self.atom.entity_name_weight),
            ("atom.entity_label_weight", self.atom.entity_label_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                push(field, "must be in range 0.0..=1.0".into());
            }
        }
        if self.atom.entity_name_weight + self.atom.entity_label_weight <= 0.0 {
            push(
                "atom.entity_name_weight",
                "name and label weights must not both be zero".into(),
            );
        }
        if self.atom.max_workers == 0 {
            push("atom.max_workers", "must be greater than 0".into());
        }

        if self.ontology.entity_label.unknown_label.trim().is_empty() {
            push("ontology.entity_label.unknown_label", "must not be empty".into());
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level",
                format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }

        errors
    }
}
