//! Composition root: builds every collaborator once, wires them together
//! and hands out `Arc`s. Nothing below this layer constructs its own
//! dependencies, which is what keeps the pipeline testable with in-memory
//! doubles.

use std::sync::Arc;

use tracing::info;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::handoff::HumanAgentHandler;
use crate::history::HistoryRegistry;
use crate::intent::IntentClassifier;
use crate::llm::{build_llm_client, DynLlmClient};
use crate::msg_analyzer::MessageAnalyzer;
use crate::notify::{DynBroadcaster, NoopBroadcaster};
use crate::query_handler::QueryHandler;
use crate::retrieval::{HybridRetriever, MemoryIndex, VectorIndex};
use crate::sentiment::SentimentAnalyzer;
use crate::session::SessionRegistry;
use crate::store::{MemoryStore, TurnStore};

pub struct ServiceContainer {
    pub cfg: ChatConfig,
    pub store: Arc<dyn TurnStore>,
    pub sessions: Arc<SessionRegistry>,
    pub histories: Arc<HistoryRegistry>,
    pub handoff: Arc<HumanAgentHandler>,
    pub handler: Arc<QueryHandler>,
}

impl ServiceContainer {
    pub fn builder(cfg: ChatConfig) -> ContainerBuilder {
        ContainerBuilder {
            cfg,
            llm: None,
            store: None,
            index: None,
            broadcaster: None,
        }
    }

    /// Production wiring: environment-selected LLM provider, in-process
    /// store and knowledge index.
    pub fn from_config(cfg: ChatConfig) -> Result<Self, ChatError> {
        Self::builder(cfg).build()
    }

    /// Drop all per-session state. Stored turns survive; only the live
    /// registries are emptied.
    pub fn shutdown(&self) {
        info!(
            active_sessions = self.sessions.len(),
            "clearing session registries"
        );
        self.sessions.clear();
        self.histories.clear();
    }
}

pub struct ContainerBuilder {
    cfg: ChatConfig,
    llm: Option<DynLlmClient>,
    store: Option<Arc<dyn TurnStore>>,
    index: Option<Arc<dyn VectorIndex>>,
    broadcaster: Option<DynBroadcaster>,
}

impl ContainerBuilder {
    pub fn llm(mut self, llm: DynLlmClient) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn store(mut self, store: Arc<dyn TurnStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn broadcaster(mut self, broadcaster: DynBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn build(self) -> Result<ServiceContainer, ChatError> {
        let cfg = self.cfg;
        let llm = match self.llm {
            Some(llm) => llm,
            None => build_llm_client(),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn TurnStore>);
        let index = self
            .index
            .unwrap_or_else(|| Arc::new(MemoryIndex::new()) as Arc<dyn VectorIndex>);
        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| Arc::new(NoopBroadcaster) as DynBroadcaster);

        let sessions = Arc::new(SessionRegistry::new());
        let histories = Arc::new(HistoryRegistry::new(store.clone(), broadcaster));

        let sentiment = Arc::new(SentimentAnalyzer::new(
            llm.clone(),
            cfg.llm_validate_threshold,
        ));
        let analyzer = Arc::new(MessageAnalyzer::new(&cfg, sentiment)?);
        let intent = Arc::new(IntentClassifier::new(llm.clone()));
        let retriever = Arc::new(HybridRetriever::new(
            index,
            cfg.retrieval_top_k,
            cfg.semantic_weight,
            cfg.keyword_weight,
        ));
        let handoff = Arc::new(HumanAgentHandler::new(
            llm.clone(),
            sessions.clone(),
            histories.clone(),
            cfg.max_turns_for_prompt,
        ));

        let handler = Arc::new(QueryHandler::new(
            cfg.clone(),
            llm,
            store.clone(),
            sessions.clone(),
            histories.clone(),
            analyzer,
            intent,
            retriever,
            handoff.clone(),
        ));

        info!(
            analysis_interval = cfg.analysis_interval,
            sentiment_threshold = cfg.sentiment_threshold,
            "service container ready"
        );

        Ok(ServiceContainer {
            cfg,
            store,
            sessions,
            histories,
            handoff,
            handler,
        })
    }
}
