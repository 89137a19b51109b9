mod common;

use std::thread;
use std::time::{Duration, Instant};

use vidreason::dispatch::BreakerState;
use vidreason::{
    DispatchConfig, DispatchError, Dispatcher, ExecutionRequest, FnBackend, ModelCall, ModelId, ModelOutput,
    ModelRegistry, ProgramExecutor, WorkerPool,
};

use common::{colored_video, fast_dispatch, stub_dispatcher};

fn wait_program(millis: u64) -> String {
    format!("def execute_command(video):\n    reply = llm_query('wait {millis}')\n    return reply, '', {{'waited': {millis}}}\n")
}

#[test]
fn pooled_replies_keep_input_order() {
    let dispatcher = stub_dispatcher();
    let pool = WorkerPool::start(3, ProgramExecutor::default(), &dispatcher);
    let requests = [30, 5, 15]
        .into_iter()
        .enumerate()
        .map(|(i, millis)| ExecutionRequest {
            sample_id: format!("r{i}"),
            program: wait_program(millis),
            video: colored_video(&[[10, 10, 10]]),
            possible_answers: Vec::new(),
            query: String::new(),
        })
        .collect();

    let results = pool.run_batch(requests).unwrap();
    let waited: Vec<_> = results.iter().map(|r| r.evidence["waited"].as_u64()).collect();
    assert_eq!(waited, [Some(30), Some(5), Some(15)]);
    for (result, millis) in results.iter().zip([30, 5, 15]) {
        assert_eq!(result.answer.as_deref(), Some(format!("Yes. wait {millis}").as_str()));
    }
}

#[test]
fn concurrent_workers_only_see_their_own_replies() {
    let dispatcher = stub_dispatcher();
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let client = dispatcher.client(worker);
            thread::spawn(move || {
                (0..10)
                    .map(|i| {
                        let question = format!("wait {} from {worker}-{i}", (worker + i) % 3);
                        let reply = client.call_text(ModelCall::new(ModelId::Llm).arg(question.as_str())).unwrap();
                        (question, reply)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    for handle in handles {
        for (question, reply) in handle.join().unwrap() {
            assert_eq!(reply, format!("Yes. {question}"));
        }
    }
}

#[test]
fn slow_models_time_out_and_open_the_circuit() {
    let config = DispatchConfig {
        servers: 2,
        request_timeout_ms: 20,
        max_retries: 0,
        breaker_threshold: 2,
        breaker_cooldown_ms: 60_000,
        ..fast_dispatch()
    };
    let registry = ModelRegistry::new().with(
        ModelId::Llm,
        FnBackend::new(|_| {
            thread::sleep(Duration::from_millis(100));
            Ok(ModelOutput::Text("late".to_string()))
        }),
    );
    let dispatcher = Dispatcher::start(&config, registry);
    let client = dispatcher.client(0);

    for _ in 0..2 {
        let started = Instant::now();
        let err = client.call_text(ModelCall::new(ModelId::Llm).arg("q")).unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_millis(90));
    }
    assert!(matches!(dispatcher.breakers().state(ModelId::Llm), BreakerState::Open { .. }));
    let err = client.call_text(ModelCall::new(ModelId::Llm).arg("q")).unwrap_err();
    assert!(matches!(err, DispatchError::CircuitOpen { .. }));
}

#[test]
fn backend_errors_and_wrong_shapes_are_reported() {
    let registry = ModelRegistry::new()
        .with(ModelId::Vqa, FnBackend::new(|_| Err("out of memory".to_string())))
        .with(ModelId::ImageMatch, FnBackend::new(|_| Ok(ModelOutput::Text("0".to_string()))));
    let dispatcher = Dispatcher::start(&fast_dispatch(), registry);
    let client = dispatcher.client(1);

    let err = client.call_text(ModelCall::new(ModelId::Vqa).arg("q")).unwrap_err();
    assert!(matches!(err, DispatchError::ModelFailed { .. }));
    assert!(err.to_string().contains("out of memory"));

    let err = client.image_match(Vec::new(), vec!["a dog".to_string()]).unwrap_err();
    assert!(matches!(err, DispatchError::UnexpectedOutput { .. }));
}
