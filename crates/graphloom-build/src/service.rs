//! Build service: triggers and pipelines
//!
//! Versions are wall-clock millisecond timestamps. Monotonicity is expected
//! but not enforced; the task-id uniqueness constraint rejects a duplicate.
//!
//! Pipeline progress milestones (by convention, not contract):
//! full build 1 → 10 → 35 → 45 → 75 → 85 → 95 → 100; incremental update
//! 1 → 10 → 20 → 45 → 55 → 78 → 88 → 95 → 100.

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{SecondsFormat, Utc};
use graphloom_atom::schema::{atomic_fact_schema, AtomicFactBlock};
use graphloom_atom::GraphBuilder;
use graphloom_core::config::{OutputConfig, RetentionConfig};
use graphloom_core::domain::{KgState, KgStatus, TaskInfo, TaskType};
use graphloom_core::ports::SourceHooks;
use graphloom_llm::ThrottledParser;
use graphloom_neo4j::{StateStore, StateStoreError, VersionedGraphStore};
use thiserror::Error;
use tracing::{error, info};

/// Current wall-clock time in milliseconds, as the decimal version string.
pub fn generate_version_ms() -> String {
    Utc::now().timestamp_millis().to_string()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Extraction directive used when the output language is Chinese and entity
/// names must stay verbatim from the source text.
fn zh_source_prompt(obs_timestamp: &str) -> String {
    format!(
        "你是一个原子事实（atomic facts）抽取器。\n\
         请基于给定的 paragraph 与 observation_date 抽取事实列表，遵守以下要求：\n\
         - 输出语言使用中文。\n\
         - 涉及到的人名/机构名/术语等专有名词，必须与原文一致：不要翻译、不要拼音化、不要改写。\n\
         - 不要添加原文未明确提及的信息；不要输出解释，只输出结构化结果需要的内容。\n\
         - 时间表达如出现相对时间（如“去年/明年/上周/本月”），请结合 observation_date 转换为绝对日期。\n\
         \n\
         observation_date: {obs_timestamp}"
    )
}

/// What a successful trigger returns to the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerResult {
    pub task_id: String,
    pub status: KgStatus,
    pub version: String,
    pub base_version: Option<String>,
}

/// Trigger-time failures.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Another task holds the build slot.
    #[error("a task is already running")]
    Conflict {
        state: KgState,
        current_task: Option<TaskInfo>,
    },

    /// The state store failed for a non-conflict reason.
    #[error(transparent)]
    Store(StateStoreError),
}

impl From<StateStoreError> for TriggerError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::TaskConflict {
                state,
                current_task,
            } => TriggerError::Conflict {
                state,
                current_task,
            },
            other => TriggerError::Store(other),
        }
    }
}

/// Orchestrates builds and updates over the stores, hooks and the parser.
pub struct BuildService {
    state_store: Arc<StateStore>,
    graph_store: Arc<VersionedGraphStore>,
    hooks: Arc<dyn SourceHooks>,
    builder: Arc<GraphBuilder>,
    parser: Arc<ThrottledParser>,
    retention: RetentionConfig,
    output: OutputConfig,
}

impl BuildService {
    pub fn new(
        state_store: Arc<StateStore>,
        graph_store: Arc<VersionedGraphStore>,
        hooks: Arc<dyn SourceHooks>,
        builder: Arc<GraphBuilder>,
        parser: Arc<ThrottledParser>,
        retention: RetentionConfig,
        output: OutputConfig,
    ) -> Self {
        Self {
            state_store,
            graph_store,
            hooks,
            builder,
            parser,
            retention,
            output,
        }
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Claims the build slot and spawns the full pipeline detached. Returns
    /// as soon as the task row exists.
    pub async fn trigger_full_build(self: &Arc<Self>) -> Result<TriggerResult, TriggerError> {
        let version = generate_version_ms();
        let task = self
            .state_store
            .try_start_task(TaskType::FullBuild, &version, None)
            .await?;

        let service = Arc::clone(self);
        let task_id = task.task_id.clone();
        let spawned_version = version.clone();
        tokio::spawn(async move {
            service.run_full_build(&task_id, &spawned_version).await;
        });

        Ok(TriggerResult {
            task_id: task.task_id,
            status: KgStatus::Building,
            version,
            base_version: None,
        })
    }

    /// Claims the build slot for an incremental update on top of
    /// `latest_ready_version` and spawns the pipeline detached.
    pub async fn trigger_incremental_update(
        self: &Arc<Self>,
        latest_ready_version: String,
    ) -> Result<TriggerResult, TriggerError> {
        let version = generate_version_ms();
        let task = self
            .state_store
            .try_start_task(
                TaskType::IncrementalUpdate,
                &version,
                Some(&latest_ready_version),
            )
            .await?;

        let service = Arc::clone(self);
        let task_id = task.task_id.clone();
        let spawned_version = version.clone();
        let base = latest_ready_version.clone();
        tokio::spawn(async move {
            service
                .run_incremental_update(&task_id, &spawned_version, &base)
                .await;
        });

        Ok(TriggerResult {
            task_id: task.task_id,
            status: KgStatus::Updating,
            version,
            base_version: Some(latest_ready_version),
        })
    }

    // ------------------------------------------------------------------
    // Fact extraction
    // ------------------------------------------------------------------

    /// Extracts atomic facts from raw paragraphs. Blank paragraphs are
    /// skipped; blank facts are dropped from the result.
    async fn extract_atomic_facts(
        &self,
        texts: &[String],
        obs_timestamp: &str,
    ) -> anyhow::Result<Vec<String>> {
        let contexts: Vec<String> = texts
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| format!("observation_date: {obs_timestamp}\n\nparagraph:\n{t}"))
            .collect();
        if contexts.is_empty() {
            return Ok(Vec::new());
        }

        let system_prompt = if self.output.language.to_lowercase().starts_with("zh")
            && self.output.entity_name_mode == "source"
        {
            Some(zh_source_prompt(obs_timestamp))
        } else {
            None
        };

        let blocks = self
            .parser
            .extract_structured(
                &atomic_fact_schema(),
                &contexts,
                system_prompt.as_deref(),
            )
            .await
            .context("atomic fact extraction failed")?;

        let mut facts = Vec::new();
        for value in blocks {
            let block: AtomicFactBlock = match serde_json::from_value(value) {
                Ok(block) => block,
                Err(_) => continue,
            };
            for fact in block.atomic_fact {
                let fact = fact.trim();
                if !fact.is_empty() {
                    facts.push(fact.to_string());
                }
            }
        }
        Ok(facts)
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    async fn progress(&self, task_id: &str, value: u8, message: &str) -> anyhow::Result<()> {
        self.state_store
            .update_task_progress(task_id, value, Some(message))
            .await?;
        Ok(())
    }

    /// The full-build pipeline. Spawned detached by the trigger; any error
    /// is recorded on the task row.
    pub async fn run_full_build(&self, task_id: &str, version: &str) {
        if let Err(e) = self.full_build_pipeline(task_id, version).await {
            error!(version, error = %format!("{e:#}"), "full build failed");
            if let Err(mark_err) = self
                .state_store
                .mark_task_failed(task_id, &format!("{e:#}"))
                .await
            {
                error!(task_id, error = %mark_err, "failed to record task failure");
            }
        }
    }

    async fn full_build_pipeline(&self, task_id: &str, version: &str) -> anyhow::Result<()> {
        self.progress(task_id, 1, "starting full build").await?;

        let hooks = Arc::clone(&self.hooks);
        let texts = tokio::task::spawn_blocking(move || hooks.get_full_data())
            .await
            .context("full data hook panicked")??;
        if texts.is_empty() {
            bail!("the source returned no documents; nothing to build");
        }
        self.progress(task_id, 10, &format!("fetched {} paragraphs", texts.len()))
            .await?;

        let obs_timestamp = now_iso();
        let facts = self.extract_atomic_facts(&texts, &obs_timestamp).await?;
        if facts.is_empty() {
            bail!("no atomic facts were extracted; cannot construct the graph");
        }
        self.progress(task_id, 35, &format!("extracted {} atomic facts", facts.len()))
            .await?;

        self.progress(task_id, 45, "constructing knowledge graph")
            .await?;
        let kg = self.builder.build_graph(&facts, &obs_timestamp, None).await?;
        self.progress(
            task_id,
            75,
            &format!(
                "constructed {} entities, {} relationships",
                kg.entities.len(),
                kg.relationships.len()
            ),
        )
        .await?;

        self.progress(task_id, 85, "writing snapshot").await?;
        self.graph_store.write_knowledge_graph(version, &kg).await?;

        self.progress(task_id, 95, "promoting version and pruning old snapshots")
            .await?;
        self.state_store.mark_task_success(task_id, version).await?;
        self.cleanup_after_success(version).await;

        info!(version, "full build complete");
        Ok(())
    }

    /// The incremental-update pipeline. Spawned detached by the trigger.
    pub async fn run_incremental_update(&self, task_id: &str, version: &str, base_version: &str) {
        if let Err(e) = self
            .incremental_pipeline(task_id, version, base_version)
            .await
        {
            error!(version, base_version, error = %format!("{e:#}"), "incremental update failed");
            if let Err(mark_err) = self
                .state_store
                .mark_task_failed(task_id, &format!("{e:#}"))
                .await
            {
                error!(task_id, error = %mark_err, "failed to record task failure");
            }
        }
    }

    async fn incremental_pipeline(
        &self,
        task_id: &str,
        version: &str,
        base_version: &str,
    ) -> anyhow::Result<()> {
        self.progress(task_id, 1, "starting incremental update").await?;

        let hooks = Arc::clone(&self.hooks);
        let base = base_version.to_string();
        let texts = tokio::task::spawn_blocking(move || hooks.get_incremental_data(&base))
            .await
            .context("incremental data hook panicked")??;
        if texts.is_empty() {
            bail!(
                "the source returned no documents since version {base_version}; nothing to update"
            );
        }
        self.progress(
            task_id,
            10,
            &format!("fetched {} incremental paragraphs", texts.len()),
        )
        .await?;

        self.progress(task_id, 20, "loading base version graph").await?;
        let base_kg = self.graph_store.load_knowledge_graph(base_version).await?;

        let obs_timestamp = now_iso();
        let facts = self.extract_atomic_facts(&texts, &obs_timestamp).await?;
        if facts.is_empty() {
            bail!("no atomic facts were extracted; cannot construct the graph");
        }
        self.progress(task_id, 45, &format!("extracted {} atomic facts", facts.len()))
            .await?;

        self.progress(task_id, 55, "constructing new graph version")
            .await?;
        let kg = self
            .builder
            .build_graph(&facts, &obs_timestamp, Some(base_kg))
            .await?;
        self.progress(
            task_id,
            78,
            &format!(
                "constructed {} entities, {} relationships",
                kg.entities.len(),
                kg.relationships.len()
            ),
        )
        .await?;

        self.progress(task_id, 88, "writing snapshot").await?;
        self.graph_store.write_knowledge_graph(version, &kg).await?;

        self.progress(task_id, 95, "promoting version and pruning old snapshots")
            .await?;
        self.state_store.mark_task_success(task_id, version).await?;
        self.cleanup_after_success(version).await;

        info!(base_version, version, "incremental update complete");
        Ok(())
    }

    /// Retention pruning runs after promotion; a pruning failure must not
    /// fail an already-successful task, so it is only logged.
    async fn cleanup_after_success(&self, version: &str) {
        if let Err(e) = self.graph_store.cleanup_old_versions(&self.retention).await {
            error!(version, error = %e, "version cleanup failed");
        }
    }
}
