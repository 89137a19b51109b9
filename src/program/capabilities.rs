//! Binds the frame/segment API into the interpreter.
//!
//! Programs see frames as `ImagePatch` values and segments as
//! `VideoSegment` values. Every method here validates its arguments,
//! forwards to [`crate::api`] and turns [`ApiError`]s into catchable
//! program exceptions.

use std::rc::Rc;
use std::sync::Arc;

use crate::api::{self, ApiContext, Frame, Segment};
use crate::error::ApiError;
use crate::media::Video;
use crate::value::{DictKey, DictMap, ExcKind, Value};

use super::builtins::{expect_str, Builtin};
use super::interp::{CallArgs, Exec, Fault, Interpreter};

/// Names a program's entry function may take as parameters.
pub const BINDABLE: [&str; 6] = ["video", "image", "visual_input", "annotation", "possible_answers", "query"];

const FRAME_METHODS: &[&str] = &[
    "find",
    "exists",
    "best_text_match",
    "simple_query",
    "llm_query",
    "crop",
    "overlaps_with",
    "overlaps",
    "get_subtitles",
];
const SEGMENT_METHODS: &[&str] = &["frame_iterator", "trim", "frame_from_index", "face_identify", "select_answer"];

/// One sample's inputs plus the context the sample's frames and segments
/// dispatch through.
pub struct Bindings {
    /// Identifier used in log lines.
    pub sample_id: String,
    /// Frames the program reads.
    pub video: Arc<Video>,
    /// Answer options, in dataset order.
    pub possible_answers: Vec<String>,
    /// The question being answered.
    pub query: String,
    /// Model access shared by every segment the program opens.
    pub ctx: Arc<ApiContext>,
}

impl Bindings {
    #[must_use]
    pub(crate) fn is_bindable(name: &str) -> bool {
        BINDABLE.contains(&name)
    }

    /// Value bound to an entry parameter called `name`.
    #[must_use]
    pub(crate) fn argument(&self, name: &str) -> Option<Value> {
        match name {
            "video" | "image" | "visual_input" => Some(Value::Video(Arc::clone(&self.video))),
            "annotation" => Some(self.annotation_value()),
            "possible_answers" => Some(Value::from(self.possible_answers.clone())),
            "query" => Some(Value::str(self.query.as_str())),
            _ => None,
        }
    }

    /// Per-frame annotation as `[{"bboxes": [[l, lo, r, u]], "subtitles": [...]}]`.
    fn annotation_value(&self) -> Value {
        let frames = (0..self.video.len())
            .map(|i| {
                let mut entry = DictMap::new();
                let (boxes, subtitles) = self.video.annotation(i).map_or_else(
                    || (Vec::new(), Vec::new()),
                    |a| {
                        let boxes = a
                            .bboxes
                            .iter()
                            .map(|b| {
                                Value::list(
                                    [b.left, b.lower, b.right, b.upper]
                                        .into_iter()
                                        .map(|c| Value::Int(i64::from(c)))
                                        .collect(),
                                )
                            })
                            .collect();
                        (boxes, a.subtitles.clone())
                    },
                );
                entry.insert(DictKey::Str("bboxes".into()), Value::list(boxes));
                entry.insert(DictKey::Str("subtitles".into()), Value::from(subtitles));
                Value::dict(entry)
            })
            .collect();
        Value::list(frames)
    }
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("sample_id", &self.sample_id)
            .field("frames", &self.video.len())
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

fn api_fault(err: ApiError) -> Fault {
    let kind = match err {
        ApiError::Dispatch(_) => ExcKind::RuntimeError,
        _ => ExcKind::ValueError,
    };
    Fault::raise(kind, err.to_string())
}

fn coordinate(value: &Value, func: &str) -> Exec<i64> {
    match value {
        #[allow(clippy::cast_possible_truncation)]
        Value::Float(v) if v.is_finite() => Ok(v.trunc() as i64),
        v => v.as_int().ok_or_else(|| {
            Fault::type_error(format!("{func}() coordinates must be numbers, not {}", v.type_name()))
        }),
    }
}

fn coordinates(args: &CallArgs, func: &str, offset: usize) -> Exec<Option<[i64; 4]>> {
    let names = ["left", "lower", "right", "upper"];
    let given: Vec<Option<&Value>> = names
        .iter()
        .enumerate()
        .map(|(i, name)| args.arg(offset + i, name).filter(|v| !v.is_none()))
        .collect();
    if given.iter().all(Option::is_none) {
        return Ok(None);
    }
    let mut out = [0i64; 4];
    for ((slot, value), name) in out.iter_mut().zip(given).zip(names) {
        let value = value.ok_or_else(|| Fault::type_error(format!("{func}() missing required argument: '{name}'")))?;
        *slot = coordinate(value, func)?;
    }
    Ok(Some(out))
}

fn optional_int(args: &CallArgs, index: usize, name: &str, func: &str) -> Exec<Option<i64>> {
    match args.arg(index, name) {
        None | Some(Value::None) => Ok(None),
        Some(v) => coordinate(v, func).map(Some),
    }
}

fn string_list(interp: &Interpreter<'_>, value: &Value, func: &str) -> Exec<Vec<String>> {
    if let Value::Str(s) = value {
        return Ok(vec![s.to_string()]);
    }
    interp
        .iterate(value)?
        .map(|item| expect_str(&item, func).map(str::to_string))
        .collect()
}

fn frame_arg<'v>(value: &'v Value, func: &str) -> Exec<&'v Rc<Frame>> {
    match value {
        Value::Frame(frame) => Ok(frame),
        other => Err(Fault::type_error(format!(
            "{func}() expected an ImagePatch, got {}",
            other.type_name()
        ))),
    }
}

fn frame_value(frame: Frame) -> Value {
    Value::Frame(Rc::new(frame))
}

/// `video[i]` as a full-frame patch.
#[must_use]
pub fn video_frame(interp: &Interpreter<'_>, video: &Arc<Video>, index: usize) -> Value {
    let image = video.frame(index).cloned().unwrap_or_default();
    let annotation = video.annotation(index).cloned().unwrap_or_default();
    frame_value(Frame::new(image, annotation, index, Arc::clone(&interp.bindings().ctx)))
}

#[must_use]
pub fn has_method(value: &Value, name: &str) -> bool {
    match value {
        Value::Frame(_) => FRAME_METHODS.contains(&name),
        Value::Segment(_) => SEGMENT_METHODS.contains(&name),
        _ => false,
    }
}

#[must_use]
pub fn frame_property(frame: &Rc<Frame>, name: &str) -> Option<Value> {
    Some(match name {
        "left" => Value::Int(i64::from(frame.left())),
        "lower" => Value::Int(i64::from(frame.lower())),
        "right" => Value::Int(i64::from(frame.right())),
        "upper" => Value::Int(i64::from(frame.upper())),
        "width" => Value::Int(i64::from(frame.width())),
        "height" => Value::Int(i64::from(frame.height())),
        "horizontal_center" => Value::Float(frame.horizontal_center()),
        "vertical_center" => Value::Float(frame.vertical_center()),
        "index" => Value::from(frame.index()),
        _ => return None,
    })
}

#[must_use]
pub fn segment_property(segment: &Rc<Segment>, name: &str) -> Option<Value> {
    Some(match name {
        "start" => Value::from(segment.start()),
        "end" => Value::from(segment.end()),
        "num_frames" => Value::from(segment.num_frames()),
        _ => return None,
    })
}

pub fn frame_method(interp: &Interpreter<'_>, frame: &Rc<Frame>, name: &str, args: CallArgs) -> Exec<Value> {
    let method = format!("ImagePatch.{name}");
    let method = method.as_str();
    match name {
        "find" | "exists" => {
            args.check(method, &["object_name"])?;
            let object = expect_str(args.required(method, 0, "object_name")?, method)?;
            if name == "exists" {
                return frame.exists(object).map(Value::Bool).map_err(api_fault);
            }
            let found = frame.find(object).map_err(api_fault)?;
            Ok(Value::list(found.into_iter().map(frame_value).collect()))
        }
        "best_text_match" => {
            args.check(method, &["option_list", "prefix"])?;
            let options = string_list(interp, args.required(method, 0, "option_list")?, method)?;
            let prefix = match args.arg(1, "prefix") {
                None | Some(Value::None) => None,
                Some(v) => Some(expect_str(v, method)?),
            };
            frame.best_text_match(&options, prefix).map(Value::from).map_err(api_fault)
        }
        "simple_query" => {
            args.check(method, &["question", "to_yesno"])?;
            let question = match args.arg(0, "question") {
                None | Some(Value::None) => None,
                Some(v) => Some(expect_str(v, method)?),
            };
            let to_yesno = args.arg(1, "to_yesno").is_some_and(Value::truthy);
            frame.simple_query(question, to_yesno).map(Value::from).map_err(api_fault)
        }
        "llm_query" => {
            args.check(method, &["question", "to_yesno"])?;
            let question = expect_str(args.required(method, 0, "question")?, method)?;
            let to_yesno = args.arg(1, "to_yesno").is_some_and(Value::truthy);
            frame.llm_query(question, to_yesno).map(Value::from).map_err(api_fault)
        }
        "crop" | "overlaps_with" => {
            args.check(method, &["left", "lower", "right", "upper"])?;
            let [left, lower, right, upper] = coordinates(&args, method, 0)?
                .ok_or_else(|| Fault::type_error(format!("{method}() missing required argument: 'left'")))?;
            if name == "overlaps_with" {
                return Ok(Value::Bool(frame.overlaps_with(left, lower, right, upper)));
            }
            frame.crop(left, lower, right, upper).map(frame_value).map_err(api_fault)
        }
        "overlaps" => {
            args.check(method, &["other"])?;
            let other = frame_arg(args.required(method, 0, "other")?, method)?;
            Ok(Value::Bool(frame.overlaps(other)))
        }
        "get_subtitles" => {
            args.check(method, &[])?;
            Ok(Value::from(frame.get_subtitles().to_vec()))
        }
        _ => Err(Fault::attribute_error(&Value::Frame(Rc::clone(frame)), name)),
    }
}

pub fn segment_method(interp: &Interpreter<'_>, segment: &Rc<Segment>, name: &str, args: CallArgs) -> Exec<Value> {
    let method = format!("VideoSegment.{name}");
    let method = method.as_str();
    match name {
        "frame_iterator" => {
            args.check(method, &[])?;
            Ok(Value::iter(segment.frame_iterator().map(frame_value)))
        }
        "trim" => {
            args.check(method, &["start", "end"])?;
            let start = optional_int(&args, 0, "start", method)?;
            let end = optional_int(&args, 1, "end", method)?;
            let trimmed = segment.trim(start, end).map_err(api_fault)?;
            Ok(Value::Segment(Rc::new(trimmed)))
        }
        "frame_from_index" => {
            args.check(method, &["index"])?;
            let index = coordinate(args.required(method, 0, "index")?, method)?;
            Ok(frame_value(segment.frame_from_index(index)))
        }
        "face_identify" => {
            args.check(method, &["image"])?;
            let frame = frame_arg(args.required(method, 0, "image")?, method)?;
            let id = segment.face_identify(frame).map_err(api_fault)?;
            Ok(id.map_or(Value::None, |id| Value::str(id.to_string())))
        }
        "select_answer" => {
            args.check(method, &["info", "question", "options"])?;
            let info = args.required(method, 0, "info")?.to_json();
            let question = expect_str(args.required(method, 1, "question")?, method)?;
            let options = match args.arg(2, "options") {
                None | Some(Value::None) => interp.bindings().possible_answers.clone(),
                Some(v) => string_list(interp, v, method)?,
            };
            let decision = segment.select_answer(&info, question, &options).map_err(api_fault)?;
            Ok(Value::tuple(vec![
                Value::from(decision.answer),
                Value::str(decision.reason.as_str()),
            ]))
        }
        _ => Err(Fault::attribute_error(&Value::Segment(Rc::clone(segment)), name)),
    }
}

/// Calls one of the API builtins (`VideoSegment`, `ImagePatch`, helpers).
pub fn call_capability(interp: &Interpreter<'_>, builtin: Builtin, args: CallArgs) -> Exec<Value> {
    let name = builtin.name();
    let ctx = &interp.bindings().ctx;
    match builtin {
        Builtin::VideoSegment => {
            args.check(name, &["video", "annotation", "start", "end"])?;
            let base = match args.required(name, 0, "video")? {
                Value::Segment(segment) => Rc::clone(segment),
                Value::Video(video) => {
                    Rc::new(Segment::new(Arc::clone(video), Arc::clone(ctx)).map_err(api_fault)?)
                }
                other => {
                    return Err(Fault::type_error(format!(
                        "VideoSegment() expected a video, got {}",
                        other.type_name()
                    )))
                }
            };
            let start = optional_int(&args, 2, "start", name)?;
            let end = optional_int(&args, 3, "end", name)?;
            if start.is_none() && end.is_none() {
                return Ok(Value::Segment(base));
            }
            let trimmed = base.trim(start, end).map_err(api_fault)?;
            Ok(Value::Segment(Rc::new(trimmed)))
        }
        Builtin::ImagePatch => {
            args.check(name, &["image", "left", "lower", "right", "upper"])?;
            let frame = frame_arg(args.required(name, 0, "image")?, name)?;
            match coordinates(&args, name, 1)? {
                None => Ok(Value::Frame(Rc::clone(frame))),
                Some([left, lower, right, upper]) => {
                    frame.crop(left, lower, right, upper).map(frame_value).map_err(api_fault)
                }
            }
        }
        Builtin::BoolToYesno => {
            args.check(name, &["bool_answer"])?;
            let answer = args.required(name, 0, "bool_answer")?.truthy();
            Ok(Value::str(api::bool_to_yesno(answer)))
        }
        Builtin::LlmQuery => {
            args.check(name, &["question", "to_yesno"])?;
            let question = expect_str(args.required(name, 0, "question")?, name)?;
            let to_yesno = args.arg(1, "to_yesno").is_some_and(Value::truthy);
            api::llm_query(&ctx.client, question, to_yesno).map(Value::from).map_err(api_fault)
        }
        Builtin::BestImageMatch => {
            args.check(name, &["list_patches", "content", "return_index"])?;
            let patches: Vec<Value> = interp.iterate(args.required(name, 0, "list_patches")?)?.collect();
            let frames = patches
                .iter()
                .map(|v| frame_arg(v, name).map(|f| Frame::clone(f)))
                .collect::<Exec<Vec<Frame>>>()?;
            let content = string_list(interp, args.required(name, 1, "content")?, name)?;
            let return_index = args.arg(2, "return_index").is_some_and(Value::truthy);
            let best = api::best_image_match(&frames, content).map_err(api_fault)?;
            Ok(match best {
                None => Value::None,
                Some(i) if return_index => Value::from(i),
                Some(i) => patches[i].clone(),
            })
        }
        Builtin::Distance => {
            args.check(name, &["patch_a", "patch_b"])?;
            let a = frame_arg(args.required(name, 0, "patch_a")?, name)?;
            let b = frame_arg(args.required(name, 1, "patch_b")?, name)?;
            Ok(Value::Float(api::distance(a, b)))
        }
        Builtin::CoerceToNumeric => {
            args.check(name, &["string"])?;
            let value = args.required(name, 0, "string")?;
            match value {
                Value::Int(_) | Value::Float(_) => Ok(value.clone()),
                other => {
                    let text = other.to_str();
                    api::coerce_to_numeric(&text).map(Value::Float).ok_or_else(|| {
                        Fault::value_error(format!("no number found in {}", other.repr()))
                    })
                }
            }
        }
        other => Err(Fault::type_error(format!("{}() is not an API builtin", other.name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindable_parameter_names() {
        assert!(Bindings::is_bindable("video"));
        assert!(Bindings::is_bindable("possible_answers"));
        assert!(!Bindings::is_bindable("self"));
    }

    #[test]
    fn coordinates_accept_numbers() {
        assert_eq!(coordinate(&Value::Int(4), "crop").unwrap(), 4);
        assert_eq!(coordinate(&Value::Float(4.9), "crop").unwrap(), 4);
        assert_eq!(coordinate(&Value::Bool(true), "crop").unwrap(), 1);
        assert!(coordinate(&Value::str("4"), "crop").is_err());
    }

    #[test]
    fn partial_coordinates_are_rejected() {
        let args = CallArgs::positional(vec![Value::Int(0), Value::Int(1)]);
        assert!(coordinates(&args, "crop", 0).is_err());
        let none = CallArgs::positional(Vec::new());
        assert!(coordinates(&none, "crop", 0).unwrap().is_none());
    }

    #[test]
    fn api_errors_map_to_exception_kinds() {
        let fault = api_fault(ApiError::EmptySegment { start: 2, end: 2 });
        assert!(matches!(fault, Fault::Raised { kind: ExcKind::ValueError, .. }));
    }
}
