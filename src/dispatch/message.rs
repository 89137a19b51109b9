//! Dispatch wire types: model identifiers, payloads, requests and replies.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::media::{BoundingBox, ImageCrop};

/// The fixed registry of models the engine can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelId {
    /// Open-vocabulary object localization. Replies with boxes.
    ObjectDetector,
    /// Visual question answering over a crop. Replies with text.
    Vqa,
    /// Picks the option that best describes a crop. Replies with text.
    TextMatch,
    /// Picks the crop that best matches a description. Replies with an index.
    ImageMatch,
    /// Text-only question answering. Replies with text.
    Llm,
    /// Face identity embedding. Replies with an optional embedding.
    FaceEmbedding,
    /// Evidence summarization. Replies with text.
    Summarizer,
    /// Final answer selection. Replies with text holding a JSON object.
    Decision,
    /// Reasoning program generation. Replies with program text.
    CodeGenerator,
}

impl ModelId {
    /// All registered identifiers.
    pub const ALL: [Self; 9] = [
        Self::ObjectDetector,
        Self::Vqa,
        Self::TextMatch,
        Self::ImageMatch,
        Self::Llm,
        Self::FaceEmbedding,
        Self::Summarizer,
        Self::Decision,
        Self::CodeGenerator,
    ];

    /// Wire name of the model.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectDetector => "object_detector",
            Self::Vqa => "vqa",
            Self::TextMatch => "text_match",
            Self::ImageMatch => "image_match",
            Self::Llm => "llm",
            Self::FaceEmbedding => "face_embedding",
            Self::Summarizer => "summarizer",
            Self::Decision => "decision",
            Self::CodeGenerator => "code_generator",
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown model '{s}'"))
    }
}

/// One positional or keyword argument of a model call.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Text, numbers, lists and other JSON-shaped data.
    Json(serde_json::Value),
    /// A single frame crop.
    Image(ImageCrop),
    /// Several crops, e.g. candidates to match against.
    Images(Vec<ImageCrop>),
}

impl Payload {
    /// The payload as a string, if it is one.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The payload as a JSON boolean, if it is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Json(serde_json::Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// String items of a JSON array payload.
    #[must_use]
    pub fn as_text_list(&self) -> Option<Vec<&str>> {
        match self {
            Self::Json(serde_json::Value::Array(items)) => items.iter().map(serde_json::Value::as_str).collect(),
            _ => None,
        }
    }

    /// The single crop, if this is one.
    #[must_use]
    pub const fn as_image(&self) -> Option<&ImageCrop> {
        match self {
            Self::Image(crop) => Some(crop),
            _ => None,
        }
    }

    /// The crop list, if this is one.
    #[must_use]
    pub fn as_images(&self) -> Option<&[ImageCrop]> {
        match self {
            Self::Images(crops) => Some(crops),
            _ => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Self::Json(serde_json::Value::String(v.to_string()))
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Self::Json(serde_json::Value::String(v))
    }
}

impl From<bool> for Payload {
    fn from(v: bool) -> Self {
        Self::Json(serde_json::Value::Bool(v))
    }
}

impl From<Vec<String>> for Payload {
    fn from(v: Vec<String>) -> Self {
        Self::Json(serde_json::Value::Array(
            v.into_iter().map(serde_json::Value::String).collect(),
        ))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<ImageCrop> for Payload {
    fn from(v: ImageCrop) -> Self {
        Self::Image(v)
    }
}

impl From<Vec<ImageCrop>> for Payload {
    fn from(v: Vec<ImageCrop>) -> Self {
        Self::Images(v)
    }
}

/// A model invocation: identifier plus positional and keyword payload.
#[derive(Debug, Clone)]
pub struct ModelCall {
    /// Model to invoke.
    pub model: ModelId,
    /// Positional arguments, in order.
    pub args: Vec<Payload>,
    /// Keyword arguments.
    pub kwargs: BTreeMap<String, Payload>,
}

impl ModelCall {
    /// Call with no arguments.
    #[must_use]
    pub fn new(model: ModelId) -> Self {
        Self {
            model,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Payload>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Sets a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Payload>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Positional argument `index` as text.
    #[must_use]
    pub fn text_arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Payload::as_text)
    }

    /// Keyword argument `name` as text.
    #[must_use]
    pub fn text_kwarg(&self, name: &str) -> Option<&str> {
        self.kwargs.get(name).and_then(Payload::as_text)
    }

    /// First image among the positional arguments.
    #[must_use]
    pub fn image_arg(&self) -> Option<&ImageCrop> {
        self.args.iter().find_map(Payload::as_image)
    }
}

/// Result of a model call. The variant is fixed per [`ModelId`].
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    /// Free text: answers, summaries, generated code.
    Text(String),
    /// Yes/no verdicts.
    Bool(bool),
    /// Boxes relative to the crop that was sent.
    Boxes(Vec<BoundingBox>),
    /// Face embedding; `None` when no face was found.
    Embedding(Option<Vec<f32>>),
    /// Chosen candidate; `None` when nothing matched.
    Index(Option<usize>),
}

impl ModelOutput {
    /// Variant name used in shape errors.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Bool(_) => "bool",
            Self::Boxes(_) => "boxes",
            Self::Embedding(_) => "embedding",
            Self::Index(_) => "index",
        }
    }

    /// Unwraps text, or reports that `model` answered with another shape.
    pub fn into_text(self, model: ModelId) -> Result<String, DispatchError> {
        match self {
            Self::Text(s) => Ok(s),
            other => Err(unexpected(model, "text", &other)),
        }
    }

    /// Unwraps a boolean; a text reply of `yes` or `true` also counts.
    pub fn into_bool(self, model: ModelId) -> Result<bool, DispatchError> {
        match self {
            Self::Bool(b) => Ok(b),
            Self::Text(s) => Ok(s.trim().eq_ignore_ascii_case("yes") || s.trim().eq_ignore_ascii_case("true")),
            other => Err(unexpected(model, "bool", &other)),
        }
    }

    /// Unwraps detected boxes.
    pub fn into_boxes(self, model: ModelId) -> Result<Vec<BoundingBox>, DispatchError> {
        match self {
            Self::Boxes(b) => Ok(b),
            other => Err(unexpected(model, "boxes", &other)),
        }
    }

    /// Unwraps an embedding.
    pub fn into_embedding(self, model: ModelId) -> Result<Option<Vec<f32>>, DispatchError> {
        match self {
            Self::Embedding(e) => Ok(e),
            other => Err(unexpected(model, "embedding", &other)),
        }
    }

    /// Unwraps a match index.
    pub fn into_index(self, model: ModelId) -> Result<Option<usize>, DispatchError> {
        match self {
            Self::Index(i) => Ok(i),
            other => Err(unexpected(model, "index", &other)),
        }
    }
}

fn unexpected(model: ModelId, expected: &'static str, actual: &ModelOutput) -> DispatchError {
    DispatchError::UnexpectedOutput {
        model,
        expected,
        actual: actual.type_name(),
    }
}

/// A request on the shared channel. `id` correlates the reply.
#[derive(Debug)]
pub struct ModelRequest {
    /// Correlation id, unique on the reply channel.
    pub id: u64,
    /// What to run.
    pub call: ModelCall,
    /// Where the server sends the answer.
    pub reply: Sender<ModelReply>,
}

/// A reply on a worker's reply channel.
#[derive(Debug, Clone)]
pub struct ModelReply {
    /// Id of the request this answers.
    pub id: u64,
    /// Model output or the backend's failure.
    pub result: Result<ModelOutput, DispatchError>,
}

/// Messages consumed by model servers.
#[derive(Debug)]
pub enum ServerMsg {
    /// Run a call and reply on its channel.
    Request(ModelRequest),
    /// Stop the server loop.
    Shutdown,
}
