//! Answer selection over unbounded evidence.
//!
//! Evidence collected by a program can be arbitrarily large while the
//! decision model accepts a fixed prompt budget. [`AnswerSelector`] reduces
//! the evidence by chunked summarization until it fits, then asks the
//! decision model for a JSON `{"answer", "reason"}` reply.
//!
//! Reduction works in rounds:
//!
//! 1. Evidence entries are serialized in insertion order and packed into
//!    chunks no longer than `chunk_limit` characters. Each chunk is
//!    summarized and the summaries are joined with newlines.
//! 2. While the result exceeds the text budget (prompt budget minus template
//!    length), the flat text is split by character offset and summarized
//!    again.
//!
//! A round that does not shrink its input is replaced by truncating that
//! input to the budget, and reduction stops after `max_rounds`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SelectorConfig;
use crate::dispatch::{DispatchClient, ModelCall, ModelId};
use crate::error::DispatchError;

/// The two text models the selector needs.
pub trait TextModels {
    /// Summarizes one chunk of text.
    fn summarize(&self, text: &str) -> Result<String, DispatchError>;

    /// Runs the decision prompt and returns the raw reply.
    fn decide(&self, prompt: &str) -> Result<String, DispatchError>;
}

impl TextModels for DispatchClient {
    fn summarize(&self, text: &str) -> Result<String, DispatchError> {
        self.call_text(ModelCall::new(ModelId::Summarizer).arg(text))
    }

    fn decide(&self, prompt: &str) -> Result<String, DispatchError> {
        self.call_text(ModelCall::new(ModelId::Decision).arg(prompt).kwarg("to_json", true))
    }
}

/// What one reduction round did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundStats {
    /// Round number, starting at 1.
    pub round: usize,
    /// Chunks sent to the summarizer.
    pub chunks: usize,
    /// Characters fed into the round.
    pub input_chars: usize,
    /// Characters the round produced.
    pub output_chars: usize,
    /// The round's output was replaced by a hard truncation.
    pub truncated: bool,
}

/// Reduced evidence text plus the per-round trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reduction {
    /// Text that fits the budget.
    pub text: String,
    /// One entry per round, in order.
    pub rounds: Vec<RoundStats>,
}

/// Outcome of answer selection.
///
/// `answer` is `None` when the decision reply could not be parsed; `reason`
/// then holds the raw reply verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// One of the offered options, or `None`.
    pub answer: Option<String>,
    /// Model's reason, or the raw reply.
    pub reason: String,
    /// Reduction rounds run before the decision.
    pub rounds: Vec<RoundStats>,
}

#[derive(Deserialize)]
struct DecisionReply {
    answer: String,
    reason: String,
}

/// Chunked summarizer and decision caller.
pub struct AnswerSelector<'a, M: ?Sized> {
    config: &'a SelectorConfig,
    models: &'a M,
}

impl<'a, M: TextModels + ?Sized> AnswerSelector<'a, M> {
    /// Selector that calls `models` within the limits of `config`.
    #[must_use]
    pub const fn new(config: &'a SelectorConfig, models: &'a M) -> Self {
        Self { config, models }
    }

    /// Reduces `evidence` until it fits the text budget.
    ///
    /// Empty evidence reduces to an empty string without any model call.
    pub fn reduce(&self, evidence: &Value) -> Result<Reduction, DispatchError> {
        let budget = self.config.text_budget();
        let limit = self.config.chunk_limit.max(1);
        let mut rounds = Vec::new();

        let chunks = evidence_chunks(evidence, limit);
        if chunks.is_empty() {
            return Ok(Reduction {
                text: String::new(),
                rounds,
            });
        }

        let mut text = self.summarize_round(1, &chunks, budget, &mut rounds)?;
        while char_len(&text) > budget {
            let round = rounds.len() + 1;
            if round > self.config.max_rounds {
                let input_chars = char_len(&text);
                text = truncate_chars(&text, budget);
                warn!(round, input_chars, budget, "round cap reached, truncating evidence");
                rounds.push(RoundStats {
                    round,
                    chunks: 0,
                    input_chars,
                    output_chars: char_len(&text),
                    truncated: true,
                });
                break;
            }
            let chunks = split_chars(&text, limit);
            text = self.summarize_round(round, &chunks, budget, &mut rounds)?;
        }

        Ok(Reduction { text, rounds })
    }

    fn summarize_round(
        &self,
        round: usize,
        chunks: &[String],
        budget: usize,
        rounds: &mut Vec<RoundStats>,
    ) -> Result<String, DispatchError> {
        let input_chars: usize = chunks.iter().map(|c| char_len(c)).sum();
        let summaries = chunks
            .iter()
            .map(|chunk| self.models.summarize(chunk))
            .collect::<Result<Vec<_>, _>>()?;
        let output = summaries.join("\n");
        let output_chars = char_len(&output);

        if output_chars >= input_chars {
            let truncated = truncate_chars(&chunks.concat(), budget);
            warn!(round, input_chars, output_chars, "summaries did not shrink, truncating instead");
            rounds.push(RoundStats {
                round,
                chunks: chunks.len(),
                input_chars,
                output_chars: char_len(&truncated),
                truncated: true,
            });
            return Ok(truncated);
        }

        debug!(round, chunks = chunks.len(), input_chars, output_chars, "summarization round");
        rounds.push(RoundStats {
            round,
            chunks: chunks.len(),
            input_chars,
            output_chars,
            truncated: false,
        });
        Ok(output)
    }

    /// Reduces `evidence`, fills the template and asks the decision model.
    ///
    /// Only dispatch failures are errors; an unparseable reply is a
    /// [`Decision`] with no answer.
    pub fn select(&self, evidence: &Value, question: &str, options: &[String]) -> Result<Decision, DispatchError> {
        let reduction = self.reduce(evidence)?;
        let prompt = fill_template(&self.config.template, &reduction.text, question, options);
        let reply = self.models.decide(&prompt)?;
        let (answer, reason) = parse_decision(&reply);
        if answer.is_none() {
            warn!(reply_chars = char_len(&reply), "decision reply was not a valid answer object");
        }
        Ok(Decision {
            answer,
            reason,
            rounds: reduction.rounds,
        })
    }
}

/// Serializes evidence entries in insertion order and packs them into
/// `{...}` chunks of at most `limit` characters. A single entry longer than
/// the limit is split by character offset.
fn evidence_chunks(evidence: &Value, limit: usize) -> Vec<String> {
    let entries: Vec<String> = match evidence {
        Value::Null => return Vec::new(),
        Value::String(s) if s.is_empty() => return Vec::new(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| format!("{}:{value}", Value::String(key.clone())))
            .collect(),
        other => return split_chars(&other.to_string(), limit),
    };

    let render = |parts: &[&str]| format!("{{{}}}", parts.join(","));
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 2;
    for entry in &entries {
        let len = char_len(entry);
        if !current.is_empty() && current_len + 1 + len > limit {
            chunks.push(render(&current));
            current.clear();
            current_len = 2;
        }
        current_len += len + usize::from(!current.is_empty());
        current.push(entry);
    }
    if !current.is_empty() {
        chunks.push(render(&current));
    }

    chunks
        .into_iter()
        .flat_map(|chunk| {
            if char_len(&chunk) > limit {
                split_chars(&chunk, limit)
            } else {
                vec![chunk]
            }
        })
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn split_chars(text: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(limit.max(1)).map(|c| c.iter().collect()).collect()
}

/// Substitutes `{info}`, `{question}` and `{options}` in one pass. Other
/// braces are kept, and placeholders inside substituted text are not
/// expanded again. Options render as a JSON array.
#[must_use]
pub fn fill_template(template: &str, info: &str, question: &str, options: &[String]) -> String {
    let options = Value::from(options.to_vec()).to_string();
    let slots = [("{info}", info), ("{question}", question), ("{options}", options.as_str())];

    let mut out = String::with_capacity(template.len() + info.len() + question.len() + options.len());
    let mut rest = template;
    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match slots.iter().find(|(name, _)| tail.starts_with(name)) {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn fence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").ok())
        .as_ref()
}

fn object_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").ok()).as_ref()
}

/// Parses a decision reply into `(answer, reason)`.
///
/// The reply must hold a JSON object with string `answer` and `reason`,
/// either on its own, wrapped in a markdown fence, or as the outermost
/// braces of surrounding prose. Anything else yields `(None, reply)`.
#[must_use]
pub fn parse_decision(reply: &str) -> (Option<String>, String) {
    let body = fence_regex()
        .and_then(|re| re.captures(reply))
        .and_then(|caps| caps.get(1))
        .map_or_else(|| reply.trim(), |m| m.as_str());

    let parsed = serde_json::from_str::<DecisionReply>(body).ok().or_else(|| {
        let object = object_regex()?.find(body)?;
        serde_json::from_str::<DecisionReply>(object.as_str()).ok()
    });
    match parsed {
        Some(parsed) => (Some(parsed.answer), parsed.reason),
        None => (None, reply.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::{Cell, RefCell};

    use serde_json::json;

    struct StubModels<F: Fn(&str) -> String> {
        summarize: F,
        calls: Cell<usize>,
        prompts: RefCell<Vec<String>>,
        reply: String,
    }

    impl<F: Fn(&str) -> String> StubModels<F> {
        fn new(summarize: F, reply: &str) -> Self {
            Self {
                summarize,
                calls: Cell::new(0),
                prompts: RefCell::new(Vec::new()),
                reply: reply.to_string(),
            }
        }
    }

    impl<F: Fn(&str) -> String> TextModels for StubModels<F> {
        fn summarize(&self, text: &str) -> Result<String, DispatchError> {
            self.calls.set(self.calls.get() + 1);
            Ok((self.summarize)(text))
        }

        fn decide(&self, prompt: &str) -> Result<String, DispatchError> {
            self.prompts.borrow_mut().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    fn halve(text: &str) -> String {
        truncate_chars(text, char_len(text) / 2)
    }

    fn evidence(entries: usize, chars: usize) -> Value {
        let mut map = serde_json::Map::new();
        for i in 0..entries {
            map.insert(format!("k{i:02}"), Value::String("x".repeat(chars)));
        }
        Value::Object(map)
    }

    fn assert_rounds_shrink(rounds: &[RoundStats]) {
        for stats in rounds {
            assert!(stats.output_chars <= stats.input_chars, "{stats:?}");
        }
    }

    #[test]
    fn empty_evidence_makes_no_calls() {
        let config = SelectorConfig::default();
        let models = StubModels::new(halve, "{}");
        let reduction = AnswerSelector::new(&config, &models).reduce(&json!({})).unwrap();
        assert_eq!(reduction.text, "");
        assert!(reduction.rounds.is_empty());
        assert_eq!(models.calls.get(), 0);
    }

    #[test]
    fn large_evidence_fits_after_first_round() {
        let config = SelectorConfig::default();
        let models = StubModels::new(halve, "{}");
        let reduction = AnswerSelector::new(&config, &models).reduce(&evidence(25, 1000)).unwrap();

        assert!(reduction.rounds[0].chunks <= 3);
        assert!(reduction.rounds.len() <= 2);
        assert!(char_len(&reduction.text) <= config.text_budget());
        assert_rounds_shrink(&reduction.rounds);
    }

    #[test]
    fn chunks_respect_limit_and_order() {
        let chunks = evidence_chunks(&json!({"a": "1111", "b": "2222", "c": "3333"}), 20);
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(char_len(chunk) <= 20, "{chunk}");
        }
        assert_eq!(chunks[0], r#"{"a":"1111"}"#);
        assert_eq!(chunks.concat(), r#"{"a":"1111"}{"b":"2222"}{"c":"3333"}"#);

        let packed = evidence_chunks(&json!({"a": "1", "b": "2", "c": "3"}), 20);
        assert_eq!(packed, vec![r#"{"a":"1","b":"2"}"#.to_string(), r#"{"c":"3"}"#.to_string()]);
    }

    #[test]
    fn oversized_entry_is_split() {
        let chunks = evidence_chunks(&json!({"big": "y".repeat(50)}), 16);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| char_len(c) <= 16));
    }

    #[test]
    fn non_shrinking_summarizer_is_truncated() {
        let config = SelectorConfig {
            prompt_budget: 300,
            chunk_limit: 100,
            max_rounds: 4,
            template: "{info}".to_string(),
        };
        let models = StubModels::new(|text: &str| format!("{text} and more"), "{}");
        let reduction = AnswerSelector::new(&config, &models).reduce(&evidence(10, 40)).unwrap();
        assert_eq!(reduction.rounds.len(), 1);
        assert!(reduction.rounds[0].truncated);
        assert!(char_len(&reduction.text) <= config.text_budget());
        assert_rounds_shrink(&reduction.rounds);
    }

    #[test]
    fn round_cap_forces_truncation() {
        let config = SelectorConfig {
            prompt_budget: 400,
            chunk_limit: 100,
            max_rounds: 2,
            template: "{info}|{question}|{options}".to_string(),
        };
        // Shrinks by a single character per chunk.
        let models = StubModels::new(
            |text: &str| truncate_chars(text, char_len(text).saturating_sub(1)),
            "{}",
        );
        let reduction = AnswerSelector::new(&config, &models).reduce(&evidence(50, 50)).unwrap();

        assert_eq!(reduction.rounds.len(), 3);
        assert!(!reduction.rounds[1].truncated);
        assert!(reduction.rounds[2].truncated);
        assert!(char_len(&reduction.text) <= config.text_budget());
        assert_rounds_shrink(&reduction.rounds);
    }

    #[test]
    fn select_fills_template_and_parses_reply() {
        let config = SelectorConfig::default();
        let models = StubModels::new(halve, r#"{"answer": "yes", "reason": "the villain appears"}"#);
        let options = vec!["yes".to_string(), "no".to_string()];
        let decision = AnswerSelector::new(&config, &models)
            .select(&json!({"frame 0": "a villain"}), "Is there a villain?", &options)
            .unwrap();

        assert_eq!(decision.answer.as_deref(), Some("yes"));
        assert_eq!(decision.reason, "the villain appears");
        let prompts = models.prompts.borrow();
        assert!(prompts[0].contains("Question: Is there a villain?"));
        assert!(prompts[0].contains(r#"Options: ["yes","no"]"#));
    }

    #[test]
    fn fill_template_is_single_pass() {
        let filled = fill_template("{info} / {question} / {options} / {other}", "{question}", "q", &[]);
        assert_eq!(filled, "{question} / q / [] / {other}");
    }

    #[test]
    fn parse_decision_accepts_fenced_json() {
        let reply = "```json\n{\"answer\": \"no\", \"reason\": \"nothing happens\"}\n```";
        assert_eq!(
            parse_decision(reply),
            (Some("no".to_string()), "nothing happens".to_string())
        );
    }

    #[test]
    fn parse_decision_extracts_object_from_prose() {
        let reply = "Sure. {\"answer\": \"yes\", \"reason\": \"a dog\"} Hope that helps.";
        assert_eq!(parse_decision(reply), (Some("yes".to_string()), "a dog".to_string()));
    }

    #[test]
    fn parse_decision_keeps_raw_reply_on_failure() {
        for reply in ["yes, definitely", r#"{"answer": "yes"}"#, "{'answer': 'yes', 'reason': 'x'}"] {
            assert_eq!(parse_decision(reply), (None, reply.to_string()));
        }
    }
}
