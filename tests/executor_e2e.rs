mod common;

use std::sync::Arc;

use vidreason::{ExecutionRequest, ProgramExecutor};

use common::{colored_video, stub_dispatcher, subtitled_video};

fn request(program: &str, video: Arc<vidreason::Video>) -> ExecutionRequest {
    ExecutionRequest {
        sample_id: "e2e".to_string(),
        program: program.to_string(),
        video,
        possible_answers: vec!["yes".to_string(), "no".to_string()],
        query: "Does the same person appear twice?".to_string(),
    }
}

#[test]
fn full_program_collects_evidence_and_selects_an_answer() {
    let dispatcher = stub_dispatcher();
    let program = r#"
```python
def execute_command(video, possible_answers, query):
    segment = VideoSegment(video)
    seen = {}
    notes = []
    for frame in segment.frame_iterator():
        person = segment.face_identify(frame)
        if person is None:
            continue
        seen[person] = seen.get(person, 0) + 1
        notes.append(f"frame {frame.index}: {frame.simple_query('Who is there?')}")
    info = {"faces": len(seen), "notes": notes, "repeat": max(seen.values()) > 1}
    answer, reason = segment.select_answer(info, query, possible_answers)
    return answer, reason, info
```
"#;
    let video = colored_video(&[[200, 0, 0], [0, 0, 0], [0, 0, 200], [200, 0, 0]]);
    let result = ProgramExecutor::default().execute(&request(program, video), Arc::new(dispatcher.client(0)));

    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.answer.as_deref(), Some("yes"));
    assert_eq!(result.reason.as_deref(), Some("seen in the notes"));
    assert_eq!(result.evidence["faces"], 2);
    assert_eq!(result.evidence["repeat"], true);
    assert_eq!(result.evidence["notes"].as_array().map(Vec::len), Some(3));
}

#[test]
fn body_only_program_reads_subtitles() {
    let dispatcher = stub_dispatcher();
    let program = "\
clip = VideoSegment(video, start=1, end=3)
lines = [line for f in clip.frame_iterator() for line in f.get_subtitles()]
return bool_to_yesno(len(lines) == 2), ' / '.join(lines), {'lines': lines}
";
    let result = ProgramExecutor::default()
        .execute(&request(program, subtitled_video(5)), Arc::new(dispatcher.client(0)));
    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.answer.as_deref(), Some("yes"));
    assert_eq!(result.reason.as_deref(), Some("line 1 / line 2"));
}

#[test]
fn each_failure_kind_lands_in_its_own_field() {
    let dispatcher = stub_dispatcher();
    let executor = ProgramExecutor::default();
    let video = colored_video(&[[1, 2, 3]]);

    let compile = executor.execute(&request("def execute_command(video:\n", Arc::clone(&video)), Arc::new(dispatcher.client(0)));
    assert!(compile.compile_error.is_some());
    assert!(compile.runtime_error.is_none());
    assert!(compile.answer.is_none());

    let runtime = executor.execute(
        &request("def execute_command(video):\n    return [][3], '', {}\n", Arc::clone(&video)),
        Arc::new(dispatcher.client(0)),
    );
    assert!(runtime.compile_error.is_none());
    assert!(runtime.runtime_error.as_deref().is_some_and(|e| e.contains("IndexError")));
    assert!(runtime.answer.is_none());

    // Perception calls to models with no backend fail only this sample.
    let missing = executor.execute(
        &request(
            "def execute_command(video):\n    f = VideoSegment(video).frame_from_index(0)\n    return f.exists('dog'), '', {}\n",
            video,
        ),
        Arc::new(dispatcher.client(0)),
    );
    assert!(missing.runtime_error.as_deref().is_some_and(|e| e.contains("object_detector")));
}

#[test]
fn runaway_programs_hit_the_step_limit() {
    let dispatcher = stub_dispatcher();
    let config = vidreason::EngineConfig {
        executor: vidreason::ExecutorConfig {
            step_limit: 5_000,
            ..vidreason::ExecutorConfig::default()
        },
        ..vidreason::EngineConfig::default()
    };
    let result = ProgramExecutor::new(&config).execute(
        &request("def execute_command(video):\n    while True:\n        pass\n", colored_video(&[[1, 1, 1]])),
        Arc::new(dispatcher.client(0)),
    );
    assert!(result.runtime_error.as_deref().is_some_and(|e| e.contains("step limit")));
}
