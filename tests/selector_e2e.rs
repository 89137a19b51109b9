mod common;

use vidreason::{AnswerSelector, SelectorConfig};

use common::stub_dispatcher;

fn evidence(entries: usize, chars: usize) -> serde_json::Value {
    let map = (0..entries)
        .map(|i| (format!("frame {i:02}"), serde_json::Value::String("x".repeat(chars))))
        .collect();
    serde_json::Value::Object(map)
}

#[test]
fn large_evidence_is_reduced_through_the_summarizer() {
    let dispatcher = stub_dispatcher();
    let client = dispatcher.client(0);
    let config = SelectorConfig {
        prompt_budget: 20_000,
        chunk_limit: 10_000,
        ..SelectorConfig::default()
    };

    let reduction = AnswerSelector::new(&config, &client).reduce(&evidence(25, 1000)).unwrap();
    assert!(!reduction.rounds.is_empty());
    assert!(reduction.rounds[0].chunks <= 3, "{:?}", reduction.rounds);
    assert!(reduction.rounds.len() <= 2, "{:?}", reduction.rounds);
    assert!(reduction.text.chars().count() <= config.text_budget());
    for round in &reduction.rounds {
        assert!(round.output_chars <= round.input_chars, "{round:?}");
    }
}

#[test]
fn small_evidence_needs_one_round() {
    let dispatcher = stub_dispatcher();
    let client = dispatcher.client(2);
    let config = SelectorConfig::default();
    let reduction = AnswerSelector::new(&config, &client).reduce(&evidence(3, 10)).unwrap();
    assert_eq!(reduction.rounds.len(), 1);
    assert_eq!(reduction.rounds[0].chunks, 1);
    assert!(reduction.text.starts_with("{\"frame 00\""));
}

#[test]
fn selection_returns_the_parsed_decision() {
    let dispatcher = stub_dispatcher();
    let client = dispatcher.client(1);
    let config = SelectorConfig::default();
    let options = vec!["yes".to_string(), "no".to_string()];
    let decision = AnswerSelector::new(&config, &client)
        .select(&evidence(25, 1000), "Is anything there?", &options)
        .unwrap();
    assert_eq!(decision.answer.as_deref(), Some("yes"));
    assert!(!decision.rounds.is_empty());
}
