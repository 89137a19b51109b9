//! Where each sample's program comes from.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::config::ProgramCacheKey;
use crate::dispatch::{DispatchClient, ModelCall, ModelId};
use crate::error::{VidError, VidResult};

use super::dataset::Sample;
use super::results::ResultTable;

/// Program text for one sample, plus a revised version when one exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvidedProgram {
    /// Program as generated.
    pub text: String,
    /// Hand-revised program; executed instead of `text` when present.
    pub revised: Option<String>,
}

impl ProvidedProgram {
    /// Program with no revision.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            revised: None,
        }
    }
}

/// Supplies programs to the orchestrator, one call per sample in dataset
/// order.
pub trait ProgramProvider {
    /// Program to run for `sample`. An error stops the run.
    fn program_for(&mut self, sample: &Sample) -> VidResult<ProvidedProgram>;
}

/// Generates programs with the code-generation model.
///
/// With [`ProgramCacheKey::Group`], the first program generated for a
/// grouping key is reused by every later sample with that key. Samples
/// without a key are always generated.
pub struct GeneratedPrograms {
    client: DispatchClient,
    cache_key: ProgramCacheKey,
    cache: HashMap<String, String>,
}

impl GeneratedPrograms {
    /// Provider generating through `client`, caching under `cache_key`.
    ///
    /// [`Orchestrator::generated_programs`](super::Orchestrator::generated_programs)
    /// builds one from the engine configuration.
    #[must_use]
    pub fn new(client: DispatchClient, cache_key: ProgramCacheKey) -> Self {
        Self {
            client,
            cache_key,
            cache: HashMap::new(),
        }
    }

    /// Number of cached programs.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn generate(&self, sample: &Sample) -> VidResult<String> {
        let call = ModelCall::new(ModelId::CodeGenerator)
            .arg(sample.query.as_str())
            .kwarg("possible_answers", sample.possible_answers.clone());
        Ok(self.client.call_text(call)?)
    }
}

impl ProgramProvider for GeneratedPrograms {
    fn program_for(&mut self, sample: &Sample) -> VidResult<ProvidedProgram> {
        let key = match self.cache_key {
            ProgramCacheKey::Group => sample.group.clone(),
            ProgramCacheKey::Sample => None,
        };
        if let Some(text) = key.as_ref().and_then(|k| self.cache.get(k)) {
            debug!(sample_id = %sample.id, group = ?key, "reusing cached program");
            return Ok(ProvidedProgram::new(text.clone()));
        }
        let text = self.generate(sample)?;
        if let Some(key) = key {
            self.cache.insert(key, text.clone());
        }
        Ok(ProvidedProgram::new(text))
    }
}

impl std::fmt::Debug for GeneratedPrograms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedPrograms")
            .field("cache_key", &self.cache_key)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

/// Replays the programs of a previously persisted run, by sample id.
#[derive(Debug, Clone, Default)]
pub struct TablePrograms {
    by_id: HashMap<String, ProvidedProgram>,
}

impl TablePrograms {
    /// Programs of every row in `table`.
    #[must_use]
    pub fn from_table(table: &ResultTable) -> Self {
        let by_id = table
            .rows
            .iter()
            .map(|row| {
                let program = ProvidedProgram {
                    text: row.program.clone(),
                    revised: row.revised_program.clone(),
                };
                (row.id.clone(), program)
            })
            .collect();
        Self { by_id }
    }

    /// Programs of the result table at `path`.
    pub fn load(path: &Path) -> VidResult<Self> {
        Ok(Self::from_table(&ResultTable::load(path)?))
    }

    /// Number of samples with a program.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if the table had no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl ProgramProvider for TablePrograms {
    fn program_for(&mut self, sample: &Sample) -> VidResult<ProvidedProgram> {
        self.by_id
            .get(&sample.id)
            .cloned()
            .ok_or_else(|| VidError::dataset(format!("no stored program for sample '{}'", sample.id)))
    }
}

impl<F> ProgramProvider for F
where
    F: FnMut(&Sample) -> VidResult<ProvidedProgram>,
{
    fn program_for(&mut self, sample: &Sample) -> VidResult<ProvidedProgram> {
        self(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use image::RgbImage;

    use crate::config::DispatchConfig;
    use crate::dispatch::{Dispatcher, FnBackend, ModelOutput, ModelRegistry};
    use crate::executor::ExecutionResult;
    use crate::media::Video;
    use crate::orchestrator::results::ResultRow;

    fn sample(id: &str, group: Option<&str>) -> Sample {
        Sample {
            id: id.to_string(),
            video: Arc::new(Video::unannotated(vec![RgbImage::new(2, 2)])),
            query: format!("question {id}"),
            possible_answers: vec!["yes".to_string(), "no".to_string()],
            groundtruth: "yes".to_string(),
            group: group.map(str::to_string),
        }
    }

    fn counting_dispatcher(calls: Arc<AtomicUsize>) -> Dispatcher {
        let registry = ModelRegistry::new().with(
            ModelId::CodeGenerator,
            FnBackend::new(move |call| {
                calls.fetch_add(1, Ordering::SeqCst);
                let query = call.text_arg(0).unwrap_or_default().to_string();
                Ok(ModelOutput::Text(format!("return {query:?}, '', {{}}")))
            }),
        );
        Dispatcher::start(&DispatchConfig::default(), registry)
    }

    #[test]
    fn group_cache_reuses_programs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = counting_dispatcher(Arc::clone(&calls));
        let mut provider = GeneratedPrograms::new(dispatcher.controller_client(), ProgramCacheKey::Group);

        let first = provider.program_for(&sample("a", Some("count"))).unwrap();
        let second = provider.program_for(&sample("b", Some("count"))).unwrap();
        provider.program_for(&sample("c", None)).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.cached(), 1);
    }

    #[test]
    fn sample_key_disables_caching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = counting_dispatcher(Arc::clone(&calls));
        let mut provider = GeneratedPrograms::new(dispatcher.controller_client(), ProgramCacheKey::Sample);
        provider.program_for(&sample("a", Some("count"))).unwrap();
        provider.program_for(&sample("b", Some("count"))).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn table_programs_replay_by_id() {
        let mut table = ResultTable::new();
        let program = ProvidedProgram {
            text: "return 'no', '', {}".to_string(),
            revised: Some("return 'yes', '', {}".to_string()),
        };
        table.push(ResultRow::new(&sample("a", None), &program, ExecutionResult::default()));
        let mut provider = TablePrograms::from_table(&table);
        assert_eq!(provider.program_for(&sample("a", None)).unwrap(), program);
        assert!(provider.program_for(&sample("z", None)).is_err());
    }
}
