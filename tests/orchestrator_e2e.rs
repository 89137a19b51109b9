mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vidreason::{
    Dispatcher, EngineConfig, FnBackend, GeneratedPrograms, InMemoryDataset, ModelId, ModelOutput,
    Orchestrator, OrchestratorConfig, ProgramCacheKey, ResultTable, TablePrograms,
};

use common::{colored_video, fast_dispatch, sample, stub_registry};

/// Counting people: answers "yes" when more than one distinct face shows up.
const COUNT_PROGRAM: &str = "```python
def execute_command(video, possible_answers, query):
    segment = VideoSegment(video)
    people = set_of_faces(segment)
    return bool_to_yesno(len(people) > 1), f'{len(people)} people', {'people': len(people)}

def set_of_faces(segment):
    found = []
    for frame in segment.frame_iterator():
        person = segment.face_identify(frame)
        if person is not None and person not in found:
            found.append(person)
    return found
```";

const BROKEN_PROGRAM: &str = "def execute_command(video):\n    return undefined_name, '', {}\n";

fn dataset() -> InMemoryDataset {
    let crowd = colored_video(&[[200, 0, 0], [0, 200, 0], [0, 0, 0]]);
    let alone = colored_video(&[[200, 0, 0], [210, 5, 5]]);
    let empty = colored_video(&[[0, 0, 0]]);
    InMemoryDataset::new(vec![
        sample("v0", Arc::clone(&crowd), "yes", Some("count")),
        sample("v1", alone, "no", Some("count")),
        sample("v2", empty, "no", Some("count")),
        sample("v3", crowd, "yes", Some("broken")),
        sample("v4", colored_video(&[[9, 9, 9]]), "yes", None),
    ])
}

fn generator_dispatcher(calls: Arc<AtomicUsize>) -> Dispatcher {
    let registry = stub_registry().with(
        ModelId::CodeGenerator,
        FnBackend::new(move |call| {
            calls.fetch_add(1, Ordering::SeqCst);
            let program = if call.text_arg(0).is_some_and(|q| q.contains("v3")) {
                BROKEN_PROGRAM
            } else {
                COUNT_PROGRAM
            };
            Ok(ModelOutput::Text(program.to_string()))
        }),
    );
    Dispatcher::start(&fast_dispatch(), registry)
}

fn engine_config(dir: &std::path::Path, parallel: bool) -> EngineConfig {
    EngineConfig {
        dispatch: fast_dispatch(),
        orchestrator: OrchestratorConfig {
            batch_size: 2,
            max_workers: 4,
            parallel,
            accuracy_every: Some(1),
            program_cache: ProgramCacheKey::Group,
            results_dir: dir.to_path_buf(),
            split: "val".to_string(),
            save: true,
            save_new_results: true,
        },
        ..EngineConfig::default()
    }
}

#[test]
fn generated_programs_run_score_and_persist() {
    let _ = vidreason::telemetry::try_init();
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = generator_dispatcher(Arc::clone(&calls));
    let orchestrator = Orchestrator::new(engine_config(dir.path(), true)).unwrap();
    let mut programs = orchestrator.generated_programs(&dispatcher);

    let summary = orchestrator.run(&dataset(), &mut programs, &dispatcher).unwrap();
    let rows = &summary.table.rows;
    let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["v0", "v1", "v2", "v3", "v4"]);

    // One generation per group plus one for the ungrouped sample.
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    assert_eq!(rows[0].answer.as_deref(), Some("yes"));
    assert_eq!(rows[0].reason.as_deref(), Some("2 people"));
    assert_eq!(rows[1].answer.as_deref(), Some("no"));
    assert_eq!(rows[2].answer.as_deref(), Some("no"));
    assert!(rows[3].answer.is_none());
    assert!(rows[3].runtime_error.as_deref().is_some_and(|e| e.contains("NameError")));
    assert_eq!(rows[4].answer.as_deref(), Some("no"));
    assert!(rows[0].evidence.contains("\"people\": 2"));

    let accuracy = summary.accuracy.unwrap();
    assert_eq!(accuracy.overall.scored, 4);
    assert_eq!(accuracy.overall.unparseable, 1);
    assert!((accuracy.overall.accuracy - 0.75).abs() < 1e-9);
    assert!((accuracy.per_group["count"].accuracy - 1.0).abs() < 1e-9);

    let saved = summary.saved_to.unwrap();
    assert_eq!(saved, dir.path().join("val").join("results_0.json"));
    assert_eq!(ResultTable::load(&saved).unwrap().rows, summary.table.rows);
}

#[test]
fn persisted_programs_can_be_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatcher = generator_dispatcher(Arc::clone(&calls));

    let first = Orchestrator::new(engine_config(dir.path(), false))
        .unwrap()
        .run(
            &dataset(),
            &mut GeneratedPrograms::new(dispatcher.controller_client(), ProgramCacheKey::Sample),
            &dispatcher,
        )
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let mut replay = TablePrograms::load(&first.saved_to.unwrap()).unwrap();
    assert_eq!(replay.len(), 5);
    let second = Orchestrator::new(engine_config(dir.path(), true))
        .unwrap()
        .run(&dataset(), &mut replay, &dispatcher)
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(second.saved_to, Some(dir.path().join("val").join("results_1.json")));
    let answers = |table: &ResultTable| table.rows.iter().map(|r| r.answer.clone()).collect::<Vec<_>>();
    assert_eq!(answers(&first.table), answers(&second.table));
}
