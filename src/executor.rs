//! Per-sample program execution with failure containment.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::ApiContext;
use crate::config::{EngineConfig, ExecutorConfig, SegmentConfig, SelectorConfig};
use crate::dispatch::DispatchClient;
use crate::error::ProgramError;
use crate::media::Video;
use crate::program::{self, Bindings};

/// One sample's program and inputs.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Sample identifier, carried into logs.
    pub sample_id: String,
    /// Program text as provided; fences and body-only forms are accepted.
    pub program: String,
    /// Frames and annotations the program sees as `video`.
    pub video: Arc<Video>,
    /// Answer options offered to the program.
    pub possible_answers: Vec<String>,
    /// The question being answered.
    pub query: String,
}

/// Outcome of one sample. At most one of the error fields is set, and
/// `answer` is `None` whenever one is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// First element the program returned, as text.
    pub answer: Option<String>,
    /// Second element, as text.
    pub reason: Option<String>,
    /// Third element converted to JSON; `null` when there is none.
    pub evidence: serde_json::Value,
    /// Set when the program did not compile; nothing ran.
    pub compile_error: Option<String>,
    /// Set when the program raised, panicked or hit a limit.
    pub runtime_error: Option<String>,
}

impl ExecutionResult {
    fn compile_failure(message: String) -> Self {
        Self {
            compile_error: Some(message),
            ..Self::default()
        }
    }

    fn runtime_failure(message: String) -> Self {
        Self {
            runtime_error: Some(message),
            ..Self::default()
        }
    }

    /// Returns true if neither error is set.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.compile_error.is_none() && self.runtime_error.is_none()
    }
}

/// Compiles and runs programs. Never fails: every fault is recorded in the
/// returned [`ExecutionResult`].
#[derive(Debug, Clone, Default)]
pub struct ProgramExecutor {
    executor: ExecutorConfig,
    segment: SegmentConfig,
    selector: SelectorConfig,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl ProgramExecutor {
    /// Executor with the interpreter, segment and selector settings of `config`.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            executor: config.executor.clone(),
            segment: config.segment.clone(),
            selector: config.selector.clone(),
        }
    }

    /// Runs `request` with API calls going through `client`.
    pub fn execute(&self, request: &ExecutionRequest, client: Arc<DispatchClient>) -> ExecutionResult {
        let started = Instant::now();
        let sample_id = request.sample_id.as_str();

        let compiled = panic::catch_unwind(AssertUnwindSafe(|| program::compile(&request.program)));
        let compiled = match compiled {
            Ok(Ok(compiled)) => compiled,
            Ok(Err(err)) => {
                warn!(sample_id, error = %err, "program failed to compile");
                return ExecutionResult::compile_failure(err.to_string());
            }
            Err(payload) => {
                let message = format!("compiler panicked: {}", panic_message(payload.as_ref()));
                warn!(sample_id, error = %message, "program failed to compile");
                return ExecutionResult::compile_failure(message);
            }
        };

        let bindings = Bindings {
            sample_id: request.sample_id.clone(),
            video: Arc::clone(&request.video),
            possible_answers: request.possible_answers.clone(),
            query: request.query.clone(),
            ctx: Arc::new(ApiContext::new(client, self.segment.clone(), self.selector.clone())),
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| compiled.run(&bindings, &self.executor)));
        drop(bindings);

        let outcome = outcome.unwrap_or_else(|payload| {
            Err(ProgramError::runtime(0, format!("interpreter panicked: {}", panic_message(payload.as_ref()))))
        });
        match outcome {
            Ok(output) => {
                debug!(
                    sample_id,
                    fingerprint = %compiled.fingerprint(),
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "program finished"
                );
                ExecutionResult {
                    answer: output.answer,
                    reason: output.reason,
                    evidence: output.evidence,
                    compile_error: None,
                    runtime_error: None,
                }
            }
            Err(err) => {
                warn!(sample_id, error = %err, "program failed at runtime");
                ExecutionResult::runtime_failure(err.to_string())
            }
        }
    }
}
