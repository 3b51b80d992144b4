//! # precheck-runtime
//!
//! The agentic evidence-validation pipeline: a bounded tool-calling loop
//! that extracts structured evidence from photos, checks completeness,
//! retrieves similar historical cases, scans for risk patterns, scores the
//! result deterministically, and records every step in an append-only
//! audit ledger.
//!
//! ## Architecture
//!
//! - [`providers`] - vision / text / embedding model backends behind traits
//! - [`store`] - datastore and object-store seams with in-memory impls
//! - [`ledger`] - one write-once event per tool invocation
//! - [`retrieval`] - embedding + nearest-neighbor search, always degradable
//! - [`tools`] - the closed capability registry and its five adapters
//! - [`controller`] - the bounded loop with retries and budget enforcement
//! - [`run`] - idempotent run lifecycle with CAS status transitions
//! - [`extraction`] - background vision extraction off the upload path
//! - [`service`] - the upstream surface thin callers consume
//!
//! Judgment calls - scoring, thresholds, completeness - live in
//! `precheck-core` and stay deterministic; this crate owns everything that
//! can fail, retry, or time out.

pub mod builder;
pub mod config;
pub mod controller;
pub mod extraction;
pub mod ledger;
pub mod providers;
pub mod retrieval;
pub mod run;
pub mod service;
pub mod store;
pub mod tools;

pub use builder::{BuildError, Pipeline, PipelineBuilder};
pub use config::{ControllerConfig, RetrievalConfig, RuntimeConfig, UploadConfig};
pub use controller::{
    AgentController, ControllerError, DeterministicPlanner, ModelPlanner, Planner,
};
pub use extraction::{ExtractionQueue, ExtractionWorker};
pub use ledger::{summarize, Ledger, NodeSummary, LEDGER_SCHEMA_VERSION};
pub use providers::{
    ApiCredential, ChatMessage, CompletionConfig, CompletionResponse, ContentPart,
    EmbeddingModel, OpenAiProvider, ProviderError, TextModel, VisionModel,
};
pub use retrieval::{
    build_query_text, IndexError, IndexMatch, MemoryVectorIndex, Retriever, UnavailableIndex,
    VectorIndex,
};
pub use run::{PipelineRunner, RunError, TriggerOutcome};
pub use service::{AppraisalService, RunView, ServiceError};
pub use store::{Datastore, MemoryObjectStore, MemoryStore, ObjectStore, StoreError};
pub use tools::{
    Capability, CompletenessTool, ContextUpdate, EvidenceContext, PhotoExtractor, RegistryError,
    RetrievalTool, RiskScanTool, ScoreTool, ToolAdapter, ToolError, ToolOutput, ToolRegistry,
    VisionExtractionTool, ALL_CAPABILITIES,
};
