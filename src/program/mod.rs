//! Reasoning programs: compilation and sandboxed evaluation.
//!
//! A program is Python-like text produced by a code-generation model. It
//! is parsed into a syntax tree once per sample and evaluated by a
//! tree-walking interpreter whose only reachable names are a fixed builtin
//! table and the capability bindings of that sample. Nothing outside
//! [`Bindings`] is reachable from program text.

pub(crate) mod ast;
pub(crate) mod builtins;
pub(crate) mod capabilities;
pub(crate) mod interp;
pub(crate) mod lexer;
pub(crate) mod parser;

use std::rc::Rc;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::ExecutorConfig;
use crate::error::ProgramError;
use crate::value::Value;

use self::ast::{Block, FunctionDef, Param, ParamKind, StmtKind};
use self::interp::{CallArgs, Exec, Fault, Interpreter};

pub use self::capabilities::Bindings;

/// Name of the function a program defines as its entry point.
pub const ENTRY_POINT: &str = "execute_command";

/// Parameters of the entry point when a program is body-only.
pub const PARAMETERS: [&str; 4] = ["video", "annotation", "possible_answers", "query"];

fn fence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[ \t]*(?:python|py)?[ \t]*\r?\n(.*?)(?:```|\z)").ok())
        .as_ref()
}

/// Strips a markdown fence (first fenced block wins) and common indentation.
#[must_use]
pub fn normalize(text: &str) -> String {
    let body = fence_regex()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map_or(text, |m| m.as_str());
    dedent(body)
}

fn dedent(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\t', "    ");
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches(' ').len())
        .min()
        .unwrap_or(0);
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        out.push_str(line.get(indent..).unwrap_or_else(|| line.trim_start()));
        out.push('\n');
    }
    out
}

/// A compiled program, ready to run against any sample.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    fingerprint: blake3::Hash,
    prelude: Block,
    entry: Rc<FunctionDef>,
}

/// What a program returned, converted out of interpreter values.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramOutput {
/// Answer, if the program returned one.
    pub answer: Option<String>,
/// The program's explanation.
    pub reason: Option<String>,
/// Evidence dictionary as JSON.
    pub evidence: serde_json::Value,
}

/// Compiles program text.
///
/// A top-level `def execute_command...` is the entry point and everything
/// else at top level runs first as a prelude. Text without such a `def`
/// is treated as the entry point's body under the standard parameters.
pub fn compile(text: &str) -> Result<Program, ProgramError> {
    let source = normalize(text);
    let mut module = parser::parse_module(&source)?;

    let entry_at = module.iter().rposition(|stmt| {
        matches!(&stmt.kind, StmtKind::FunctionDef(def) if def.name.starts_with(ENTRY_POINT))
    });
    let entry = entry_at.and_then(|i| match module.remove(i).kind {
        StmtKind::FunctionDef(def) => Some(def),
        _ => None,
    });
    let (prelude, entry) = match entry {
        Some(def) => (module, def),
        None => {
            let params = PARAMETERS
                .iter()
                .map(|name| Param {
                    name: (*name).to_string(),
                    default: None,
                    kind: ParamKind::Normal,
                })
                .collect();
            let def = FunctionDef {
                name: ENTRY_POINT.to_string(),
                params,
                body: module,
                line: 1,
                is_lambda: false,
            };
            (Vec::new(), Rc::new(def))
        }
    };

    for param in &entry.params {
        if param.kind == ParamKind::Normal && param.default.is_none() && !Bindings::is_bindable(&param.name) {
            return Err(ProgramError::compile(
                entry.line,
                1,
                format!("parameter '{}' of {} cannot be bound", param.name, entry.name),
            ));
        }
    }

    Ok(Program {
        fingerprint: blake3::hash(source.as_bytes()),
        source,
        prelude,
        entry,
    })
}

impl Program {
    /// Normalized program text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Hex digest of the normalized text.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.fingerprint.to_hex().to_string()
    }

    /// Runs the program in a fresh interpreter. All interpreter state is
    /// gone by the time this returns.
    pub fn run(&self, bindings: &Bindings, config: &ExecutorConfig) -> Result<ProgramOutput, ProgramError> {
        let interp = Interpreter::new(bindings, config);
        let output = self.invoke(&interp, bindings).map_err(Fault::into_program_error);
        drop(interp);
        output
    }

    fn invoke(&self, interp: &Interpreter<'_>, bindings: &Bindings) -> Exec<ProgramOutput> {
        interp.run_module(&self.prelude)?;
        let entry = interp.define(&self.entry).map_err(|f| f.at(self.entry.line))?;
        let keywords = self
            .entry
            .params
            .iter()
            .filter(|p| p.kind == ParamKind::Normal)
            .filter_map(|p| bindings.argument(&p.name).map(|v| (p.name.clone(), v)))
            .collect();
        let args = CallArgs {
            positional: Vec::new(),
            keywords,
        };
        let returned = interp.call_value(&entry, args).map_err(|f| f.at(self.entry.line))?;
        unpack(&returned).map_err(|f| f.at(self.entry.line))
    }
}

fn optional_text(value: &Value) -> Option<String> {
    match value {
        Value::None => None,
        other => Some(other.to_str()),
    }
}

/// `(answer, reason, evidence)`, or `(answer, evidence)` with no reason.
fn unpack(value: &Value) -> Exec<ProgramOutput> {
    let items: Vec<Value> = match value {
        Value::Tuple(items) => items.to_vec(),
        Value::List(items) => items.borrow().clone(),
        other => {
            return Err(Fault::type_error(format!(
                "{ENTRY_POINT} must return (answer, reason, evidence), got {}",
                other.type_name()
            )))
        }
    };
    match items.as_slice() {
        [answer, reason, evidence] => Ok(ProgramOutput {
            answer: optional_text(answer),
            reason: optional_text(reason),
            evidence: evidence.to_json(),
        }),
        [answer, evidence] => Ok(ProgramOutput {
            answer: optional_text(answer),
            reason: None,
            evidence: evidence.to_json(),
        }),
        other => Err(Fault::type_error(format!(
            "{ENTRY_POINT} must return (answer, reason, evidence), got {} values",
            other.len()
        ))),
    }
}
