//! Pipeline assembly.
//!
//! Wires providers, stores, the tool registry, the controller, the
//! background extraction worker, and the service surface into one value.
//! Registry validation happens here, at startup: a missing adapter is a
//! build error, not a runtime surprise.

use std::sync::Arc;

use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::controller::{AgentController, DeterministicPlanner, ModelPlanner, Planner};
use crate::extraction::ExtractionWorker;
use crate::ledger::Ledger;
use crate::providers::{CompletionConfig, EmbeddingModel, TextModel, VisionModel};
use crate::retrieval::{MemoryVectorIndex, Retriever, VectorIndex};
use crate::run::PipelineRunner;
use crate::service::AppraisalService;
use crate::store::{Datastore, MemoryObjectStore, MemoryStore, ObjectStore};
use crate::tools::{
    CompletenessTool, PhotoExtractor, RegistryError, RetrievalTool, RiskScanTool, ScoreTool,
    ToolAdapter, ToolRegistry, VisionExtractionTool,
};

/// Errors from pipeline assembly.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("missing required component: {0}")]
    Missing(&'static str),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A fully wired pipeline.
pub struct Pipeline {
    pub service: AppraisalService,
    pub runner: PipelineRunner,
    pub ledger: Ledger,
    worker: ExtractionWorker,
}

impl Pipeline {
    /// Start building a pipeline with the given configuration.
    pub fn builder(config: RuntimeConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Stop the background extraction worker.
    pub fn shutdown(self) {
        self.worker.shutdown();
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    config: RuntimeConfig,
    store: Option<Arc<dyn Datastore>>,
    objects: Option<Arc<dyn ObjectStore>>,
    index: Option<Arc<dyn VectorIndex>>,
    vision: Option<Arc<dyn VisionModel>>,
    text: Option<Arc<dyn TextModel>>,
    embedder: Option<Arc<dyn EmbeddingModel>>,
    model_planner: bool,
}

impl PipelineBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            store: None,
            objects: None,
            index: None,
            vision: None,
            text: None,
            embedder: None,
            model_planner: false,
        }
    }

    /// Set the datastore. Defaults to [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn Datastore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the object store. Defaults to [`MemoryObjectStore`].
    pub fn objects(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Set the vector index. Defaults to an in-memory cosine index.
    pub fn index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Set the vision model. Required.
    pub fn vision(mut self, vision: Arc<dyn VisionModel>) -> Self {
        self.vision = Some(vision);
        self
    }

    /// Set the text model. Required.
    pub fn text(mut self, text: Arc<dyn TextModel>) -> Self {
        self.text = Some(text);
        self
    }

    /// Set the embedding model. Required.
    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingModel>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Use model-assisted tool selection instead of the fixed order alone.
    pub fn with_model_planner(mut self) -> Self {
        self.model_planner = true;
        self
    }

    /// Assemble the pipeline, validating the tool registry.
    pub fn build(self) -> Result<Pipeline, BuildError> {
        let config = self.config;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let objects = self
            .objects
            .unwrap_or_else(|| Arc::new(MemoryObjectStore::new()));
        let index = self
            .index
            .unwrap_or_else(|| Arc::new(MemoryVectorIndex::new(config.retrieval.embedding_dim)));
        let vision = self.vision.ok_or(BuildError::Missing("vision model"))?;
        let text = self.text.ok_or(BuildError::Missing("text model"))?;
        let embedder = self.embedder.ok_or(BuildError::Missing("embedding model"))?;

        let completion = CompletionConfig {
            timeout: config.controller.tool_timeout,
            ..CompletionConfig::default()
        };

        let extractor = Arc::new(PhotoExtractor::new(vision, completion.clone()));
        let retriever = Arc::new(Retriever::new(
            embedder,
            index,
            store.clone(),
            config.retrieval.clone(),
        ));

        let adapters: Vec<Arc<dyn ToolAdapter>> = vec![
            Arc::new(VisionExtractionTool::new(
                extractor.clone(),
                store.clone(),
                objects.clone(),
                config.controller.extraction_wait,
            )),
            Arc::new(CompletenessTool::new()),
            Arc::new(RetrievalTool::new(retriever.clone())),
            Arc::new(RiskScanTool::new(text.clone(), completion.clone())),
            Arc::new(ScoreTool::new(
                config.weights.clone(),
                config.thresholds.clone(),
            )),
        ];
        let registry = ToolRegistry::new(adapters)?;

        let planner: Arc<dyn Planner> = if self.model_planner {
            Arc::new(ModelPlanner::new(text, completion))
        } else {
            Arc::new(DeterministicPlanner)
        };

        let ledger = Ledger::new(store.clone());
        let controller = Arc::new(AgentController::new(
            registry,
            planner,
            ledger.clone(),
            config.controller.clone(),
        ));

        let runner = PipelineRunner::new(
            store.clone(),
            ledger.clone(),
            controller,
            Some(retriever),
        );

        let (worker, queue) =
            ExtractionWorker::spawn(extractor, store.clone(), objects.clone(), &config.upload);

        let service = AppraisalService::new(
            store,
            objects,
            queue,
            runner.clone(),
            ledger.clone(),
            config.upload.clone(),
        );

        Ok(Pipeline {
            service,
            runner,
            ledger,
            worker,
        })
    }
}
