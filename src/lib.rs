//! # vidreason - program-driven video question answering
//!
//! vidreason executes generated reasoning programs against videos. A program
//! is a small Python-like function that inspects frames through a
//! capability API, asks perception and language models for help, and returns
//! an answer with a reason and evidence.
//!
//! ## Core Concepts
//!
//! - **Program**: restricted source text, compiled and interpreted in an
//!   isolated scope per sample
//! - **Dispatch**: every model call is a message to a pool of model server
//!   threads, answered on the calling worker's own reply channel
//! - **Segment / Frame**: the capability API programs see, with a per-segment
//!   identity cache for faces
//! - **Answer selection**: chunked summarization of evidence followed by a
//!   structured decision
//! - **Orchestrator**: batches a dataset across a worker pool and persists a
//!   result table with accuracy reporting
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vidreason::{Dispatcher, EngineConfig, ModelRegistry, Orchestrator};
//!
//! let config = EngineConfig::from_json_file("vidreason.json")?;
//! let dispatcher = Dispatcher::start(&config.dispatch, registry);
//! let orchestrator = Orchestrator::new(config)?;
//! let mut programs = orchestrator.generated_programs(&dispatcher);
//! let summary = orchestrator.run(&dataset, &mut programs, &dispatcher)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod media;
pub mod metrics;
pub mod orchestrator;
pub mod program;
pub mod selector;
pub mod telemetry;
pub(crate) mod value;

pub use api::{ApiContext, Frame, IdentityCache, IdentityId, Segment};
pub use config::{
    DispatchConfig, EngineConfig, ExecutorConfig, OrchestratorConfig, ProgramCacheKey, SegmentConfig,
    SelectorConfig,
};
pub use dispatch::{
    DispatchClient, Dispatcher, FnBackend, ModelBackend, ModelCall, ModelId, ModelOutput, ModelRegistry, Payload,
};
pub use error::{
    AccuracyError, ApiError, ConfigError, DispatchError, PersistError, ProgramError, VidError, VidResult,
};
pub use executor::{ExecutionRequest, ExecutionResult, ProgramExecutor};
pub use media::{BoundingBox, FrameAnnotation, ImageCrop, Video};
pub use metrics::{accuracy_report, AccuracyReport, BinaryScores};
pub use orchestrator::{
    Dataset, GeneratedPrograms, InMemoryDataset, Orchestrator, ProgramProvider, ProvidedProgram, ResultRow,
    ResultTable, RunSummary, Sample, TablePrograms, WorkerPool,
};
pub use program::{compile, Program, ProgramOutput};
pub use selector::{AnswerSelector, Decision, TextModels};
