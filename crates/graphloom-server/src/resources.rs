//! Shared server resources
//!
//! Wires configuration into the adapter stack once at startup. The
//! `from_parts` constructor takes the ports directly so tests can inject
//! fakes without touching the network.

use std::sync::Arc;

use graphloom_atom::{BuildParams, GraphBuilder};
use graphloom_build::BuildService;
use graphloom_core::config::Config;
use graphloom_core::ports::{ChatModel, EmbeddingModel, GraphDatabase, SourceHooks};
use graphloom_llm::parser::ParserSettings;
use graphloom_llm::{OpenAiChatModel, OpenAiEmbeddingModel, ThrottledParser};
use graphloom_neo4j::{Neo4jHttpClient, StateStore, VersionedGraphStore, GRAPH_NAME_DEFAULT};
use tracing::info;

/// Everything the request handlers need, shared behind one `Arc`.
pub struct Resources {
    pub cfg: Config,
    pub state_store: Arc<StateStore>,
    pub graph_store: Arc<VersionedGraphStore>,
    pub build_service: Arc<BuildService>,
}

impl Resources {
    /// Builds the production stack from configuration and runs the startup
    /// protocol: schema constraints, then crash recovery.
    pub async fn init(cfg: Config) -> anyhow::Result<Arc<Self>> {
        let db: Arc<dyn GraphDatabase> = Arc::new(Neo4jHttpClient::from_config(&cfg.neo4j));
        let hooks = graphloom_hooks::from_config(&cfg.hooks)?;
        let chat: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::from_config(&cfg.llm));
        let embeddings: Arc<dyn EmbeddingModel> =
            Arc::new(OpenAiEmbeddingModel::from_config(&cfg.embeddings));

        let resources = Self::from_parts(cfg, db, hooks, chat, embeddings);
        resources.state_store.ensure_schema().await?;
        resources.state_store.recover_if_interrupted().await?;
        info!("resources initialized, state recovered");
        Ok(resources)
    }

    /// Assembles the stack from explicit ports. No I/O happens here.
    pub fn from_parts(
        cfg: Config,
        db: Arc<dyn GraphDatabase>,
        hooks: Arc<dyn SourceHooks>,
        chat: Arc<dyn ChatModel>,
        embeddings: Arc<dyn EmbeddingModel>,
    ) -> Arc<Self> {
        let state_store = Arc::new(StateStore::new(Arc::clone(&db), GRAPH_NAME_DEFAULT));
        let graph_store = Arc::new(VersionedGraphStore::new(Arc::clone(&db), GRAPH_NAME_DEFAULT));

        let parser = Arc::new(ThrottledParser::new(
            chat,
            embeddings,
            ParserSettings {
                llm_rate_limit: cfg.llm.rate_limit,
                emb_rate_limit: cfg.embeddings.rate_limit,
                llm_retry: cfg.llm.retry,
                emb_retry: cfg.embeddings.retry,
                llm_max_concurrency: cfg.llm.concurrency.max_in_flight,
                emb_max_in_flight: cfg.embeddings.concurrency.max_in_flight,
                batch: cfg.llm.batch,
                token_model: cfg.llm.model.clone(),
            },
        ));
        let builder = Arc::new(GraphBuilder::new(
            Arc::clone(&parser),
            BuildParams::from_config(&cfg.atom, &cfg.output, &cfg.ontology),
        ));
        let build_service = Arc::new(BuildService::new(
            Arc::clone(&state_store),
            Arc::clone(&graph_store),
            hooks,
            builder,
            parser,
            cfg.retention.clone(),
            cfg.output.clone(),
        ));

        Arc::new(Self {
            cfg,
            state_store,
            graph_store,
            build_service,
        })
    }
}
