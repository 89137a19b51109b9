//! Batch orchestration over a dataset.
//!
//! One controlling thread walks the dataset in batches, obtains a program per
//! sample from a [`ProgramProvider`], executes the batch (in-process or on a
//! [`WorkerPool`]) and appends one [`ResultRow`] per sample, in dataset order.

mod dataset;
mod pool;
mod provider;
mod results;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

pub use dataset::{batch_ranges, Dataset, InMemoryDataset, Sample};
pub use pool::WorkerPool;
pub use provider::{GeneratedPrograms, ProgramProvider, ProvidedProgram, TablePrograms};
pub use results::{next_results_path, ResultRow, ResultTable};

use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::error::VidResult;
use crate::executor::{ExecutionRequest, ExecutionResult, ProgramExecutor};
use crate::metrics::AccuracyReport;

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One row per sample processed, in dataset order.
    pub table: ResultTable,
    /// Final accuracy; `None` when it could not be computed.
    pub accuracy: Option<AccuracyReport>,
    /// Where the table was written, if saving is enabled.
    pub saved_to: Option<PathBuf>,
}

/// Drives a dataset through the executor.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: EngineConfig,
    executor: ProgramExecutor,
}

impl Orchestrator {
    /// Validates `config` and builds an orchestrator over it.
    pub fn new(config: EngineConfig) -> VidResult<Self> {
        config.validate()?;
        let executor = ProgramExecutor::new(&config);
        Ok(Self { config, executor })
    }

    /// The validated configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Provider that asks the code generator for programs through the
    /// controller's reply channel, cached by `orchestrator.program_cache`.
    #[must_use]
    pub fn generated_programs(&self, dispatcher: &Dispatcher) -> GeneratedPrograms {
        GeneratedPrograms::new(dispatcher.controller_client(), self.config.orchestrator.program_cache)
    }

    /// Runs every sample of `dataset`.
    ///
    /// Per-sample failures are recorded in the table. An error from the loop
    /// itself (dataset access, program provision, the worker pool) stops the
    /// run; the rows collected so far are scored and persisted before the
    /// error is returned.
    pub fn run(
        &self,
        dataset: &dyn Dataset,
        provider: &mut dyn ProgramProvider,
        dispatcher: &Dispatcher,
    ) -> VidResult<RunSummary> {
        let o = &self.config.orchestrator;
        let started = Instant::now();
        let pool = o
            .parallel
            .then(|| WorkerPool::start(o.worker_count(), self.executor.clone(), dispatcher));
        let mut table = ResultTable::new();
        info!(
            run_id = %table.run_id,
            samples = dataset.len(),
            batch_size = o.batch_size,
            workers = pool.as_ref().map_or(0, WorkerPool::len),
            "run started"
        );

        let outcome = self.run_batches(dataset, provider, dispatcher, pool.as_ref(), &mut table);
        if let Some(pool) = pool {
            pool.shutdown();
        }

        let accuracy = match table.accuracy() {
            Ok(report) => {
                info!(
                    rows = table.len(),
                    accuracy = report.overall.accuracy,
                    f1 = report.overall.f1,
                    unparseable = report.overall.unparseable,
                    "final accuracy"
                );
                Some(report)
            }
            Err(err) => {
                warn!(error = %err, "final accuracy unavailable");
                None
            }
        };
        let saved_to = if o.save {
            match table.save(&o.results_dir, &o.split, o.save_new_results) {
                Ok(path) => Some(path),
                Err(err) if outcome.is_err() => {
                    error!(error = %err, "could not persist results of a failed run");
                    None
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            None
        };

        if let Err(err) = outcome {
            error!(rows = table.len(), error = %err, "run aborted");
            return Err(err);
        }
        info!(
            rows = table.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "run finished"
        );
        Ok(RunSummary {
            table,
            accuracy,
            saved_to,
        })
    }

    fn run_batches(
        &self,
        dataset: &dyn Dataset,
        provider: &mut dyn ProgramProvider,
        dispatcher: &Dispatcher,
        pool: Option<&WorkerPool>,
        table: &mut ResultTable,
    ) -> VidResult<()> {
        let o = &self.config.orchestrator;
        let local_client = pool.is_none().then(|| Arc::new(dispatcher.client(0)));

        for (batch, range) in batch_ranges(dataset.len(), o.batch_size).enumerate() {
            let mut samples = Vec::with_capacity(range.len());
            let mut programs = Vec::with_capacity(range.len());
            for index in range {
                let sample = dataset.get(index)?;
                programs.push(provider.program_for(&sample)?);
                samples.push(sample);
            }

            let requests: Vec<ExecutionRequest> = samples
                .iter()
                .zip(&programs)
                .map(|(sample, program)| ExecutionRequest {
                    sample_id: sample.id.clone(),
                    program: program.revised.clone().unwrap_or_else(|| program.text.clone()),
                    video: Arc::clone(&sample.video),
                    possible_answers: sample.possible_answers.clone(),
                    query: sample.query.clone(),
                })
                .collect();
            let results: Vec<ExecutionResult> = match (pool, &local_client) {
                (Some(pool), _) => pool.run_batch(requests)?,
                (None, Some(client)) => requests
                    .iter()
                    .map(|request| self.executor.execute(request, Arc::clone(client)))
                    .collect(),
                (None, None) => Vec::new(),
            };

            let failed = results.iter().filter(|r| !r.is_success()).count();
            for ((sample, program), result) in samples.iter().zip(&programs).zip(results) {
                table.push(ResultRow::new(sample, program, result));
            }
            info!(batch, rows = table.len(), failed, "batch finished");

            if o.accuracy_every.is_some_and(|every| every > 0 && (batch + 1) % every == 0) {
                match table.accuracy() {
                    Ok(report) => info!(
                        batch,
                        accuracy = report.overall.accuracy,
                        f1 = report.overall.f1,
                        scored = report.overall.scored,
                        "running accuracy"
                    ),
                    Err(err) => warn!(batch, error = %err, "running accuracy unavailable"),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use image::RgbImage;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::{OrchestratorConfig, ProgramCacheKey};
    use crate::dispatch::{FnBackend, ModelId, ModelOutput, ModelRegistry};
    use crate::error::VidError;
    use crate::media::Video;

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample {
                id: format!("s{i}"),
                video: Arc::new(Video::unannotated(vec![RgbImage::new(2, 2)])),
                query: "is it?".to_string(),
                possible_answers: vec!["yes".to_string(), "no".to_string()],
                groundtruth: if i % 2 == 0 { "yes" } else { "no" }.to_string(),
                group: Some("g".to_string()),
            })
            .collect()
    }

    fn config(parallel: bool, dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            orchestrator: OrchestratorConfig {
                batch_size: 3,
                max_workers: 2,
                parallel,
                results_dir: dir.to_path_buf(),
                ..OrchestratorConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn always_yes(_: &Sample) -> VidResult<ProvidedProgram> {
        Ok(ProvidedProgram::new("return 'yes', 'always', {}"))
    }

    #[test]
    fn sequential_and_pooled_runs_agree() {
        let dispatcher = Dispatcher::start(&crate::config::DispatchConfig::default(), ModelRegistry::new());
        let dataset = InMemoryDataset::new(samples(7));
        let dir = tempfile::tempdir().unwrap();

        let mut rows = Vec::new();
        for parallel in [false, true] {
            let orchestrator = Orchestrator::new(config(parallel, dir.path())).unwrap();
            let mut provider = always_yes;
            let summary = orchestrator.run(&dataset, &mut provider, &dispatcher).unwrap();
            assert_eq!(summary.table.len(), 7);
            let accuracy = summary.accuracy.unwrap().overall.accuracy;
            assert!((accuracy - 4.0 / 7.0).abs() < 1e-9);
            rows.push(summary.table.rows);
        }
        assert_eq!(rows[0], rows[1]);
        let ids: Vec<_> = rows[0].iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["s0", "s1", "s2", "s3", "s4", "s5", "s6"]);
    }

    #[test]
    fn loop_errors_persist_collected_rows() {
        let dispatcher = Dispatcher::start(&crate::config::DispatchConfig::default(), ModelRegistry::new());
        let dataset = InMemoryDataset::new(samples(5));
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(config(false, dir.path())).unwrap();

        let mut provider = |sample: &Sample| {
            if sample.id == "s4" {
                Err(VidError::dataset("generator unavailable"))
            } else {
                always_yes(sample)
            }
        };
        let err = orchestrator.run(&dataset, &mut provider, &dispatcher).unwrap_err();
        assert!(err.to_string().contains("generator unavailable"));

        let saved = dir.path().join("test").join("results_0.json");
        let table = ResultTable::load(&saved).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn generated_programs_follow_the_configured_cache_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = ModelRegistry::new().with(
            ModelId::CodeGenerator,
            FnBackend::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(ModelOutput::Text("return 'yes', 'always', {}".to_string()))
            }),
        );
        let dispatcher = Dispatcher::start(&crate::config::DispatchConfig::default(), registry);
        let dataset = InMemoryDataset::new(samples(4));
        let dir = tempfile::tempdir().unwrap();

        let mut expected = 0;
        for (key, generations) in [(ProgramCacheKey::Group, 1), (ProgramCacheKey::Sample, 4)] {
            let mut config = config(false, dir.path());
            config.orchestrator.program_cache = key;
            let orchestrator = Orchestrator::new(config).unwrap();
            let mut programs = orchestrator.generated_programs(&dispatcher);
            let summary = orchestrator.run(&dataset, &mut programs, &dispatcher).unwrap();
            assert!(summary.table.rows.iter().all(|r| r.answer.as_deref() == Some("yes")));
            expected += generations;
            assert_eq!(calls.load(Ordering::SeqCst), expected, "{key:?}");
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.orchestrator.batch_size = 0;
        assert!(Orchestrator::new(config).unwrap_err().is_config());
    }
}
