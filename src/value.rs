//! Runtime values of the program interpreter.
//!
//! Programs manipulate a small dynamic value model: scalars, strings,
//! shared mutable lists and dicts, immutable tuples, lazy iterators,
//! callables, and handles on API objects (frames, segments, the video).
//! Dicts keep insertion order, which is the order evidence is serialized in.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::api::{Frame, Segment};
use crate::media::Video;
use crate::program::builtins::Builtin;
use crate::program::interp::Closure;

/// Nesting beyond which `str`/`repr` stop descending into containers.
const MAX_RENDER_DEPTH: usize = 32;

/// Nesting beyond which equality, ordering and hashing stop descending.
pub const MAX_COMPARE_DEPTH: usize = 1_000;

/// A lazy, single-pass iterator.
pub type ValueIter = Box<dyn Iterator<Item = Value>>;


/// Exception classes programs can raise and catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    Exception,
    LookupError,
    ValueError,
    TypeError,
    KeyError,
    IndexError,
    ZeroDivisionError,
    NameError,
    AttributeError,
    RuntimeError,
    AssertionError,
    StopIteration,
    NotImplementedError,
}

impl ExcKind {
    pub const ALL: [Self; 13] = [
        Self::Exception,
        Self::LookupError,
        Self::ValueError,
        Self::TypeError,
        Self::KeyError,
        Self::IndexError,
        Self::ZeroDivisionError,
        Self::NameError,
        Self::AttributeError,
        Self::RuntimeError,
        Self::AssertionError,
        Self::StopIteration,
        Self::NotImplementedError,
    ];

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Exception => "Exception",
            Self::LookupError => "LookupError",
            Self::ValueError => "ValueError",
            Self::TypeError => "TypeError",
            Self::KeyError => "KeyError",
            Self::IndexError => "IndexError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::NameError => "NameError",
            Self::AttributeError => "AttributeError",
            Self::RuntimeError => "RuntimeError",
            Self::AssertionError => "AssertionError",
            Self::StopIteration => "StopIteration",
            Self::NotImplementedError => "NotImplementedError",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Returns true if an `except <handler>` clause catches this kind.
    #[must_use]
    pub fn is_caught_by(self, handler: Self) -> bool {
        self == handler
            || handler == Self::Exception
            || (handler == Self::LookupError && matches!(self, Self::KeyError | Self::IndexError))
    }
}

/// An exception instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub kind: ExcKind,
    pub message: String,
}

/// A method looked up on a receiver but not yet called.
#[derive(Debug, Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

/// A dynamically typed interpreter value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Items>>),
    Tuple(Rc<Items>),
    Dict(Rc<RefCell<DictMap>>),
    Iter(Rc<RefCell<ValueIter>>),
    Function(Rc<Closure>),
    Builtin(Builtin),
    Method(Rc<BoundMethod>),
    ExcType(ExcKind),
    Exception(Rc<Exception>),
    Frame(Rc<Frame>),
    Segment(Rc<Segment>),
    Video(Arc<Video>),
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Self::Str(s.into())
    }

    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(RefCell::new(Items::from(items))))
    }

    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(Rc::new(Items::from(items)))
    }

    #[must_use]
    pub fn dict(map: DictMap) -> Self {
        Self::Dict(Rc::new(RefCell::new(map)))
    }

    pub fn iter(it: impl Iterator<Item = Self> + 'static) -> Self {
        Self::Iter(Rc::new(RefCell::new(Box::new(it))))
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Integer value of ints and bools.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Float value of any number.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Python type name, used in error messages and `isinstance`.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Iter(_) => "iterator",
            Self::Function(_) => "function",
            Self::Builtin(_) => "builtin_function_or_method",
            Self::Method(_) => "method",
            Self::ExcType(_) => "type",
            Self::Exception(_) => "exception",
            Self::Frame(_) => "ImagePatch",
            Self::Segment(_) => "VideoSegment",
            Self::Video(_) => "video",
        }
    }

    /// Python truthiness.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.borrow().is_empty(),
            Self::Tuple(items) => !items.is_empty(),
            Self::Dict(map) => !map.borrow().is_empty(),
            Self::Video(video) => !video.is_empty(),
            _ => true,
        }
    }

    /// Python `str()`.
    #[must_use]
    pub fn to_str(&self) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            Self::Exception(exc) => exc.message.clone(),
            other => other.render(false, 0),
        }
    }

    /// Python `repr()`.
    #[must_use]
    pub fn repr(&self) -> String {
        self.render(true, 0)
    }

    fn render(&self, quoted: bool, depth: usize) -> String {
        if depth > MAX_RENDER_DEPTH {
            return "...".to_string();
        }
        let items = |values: &[Self]| {
            values
                .iter()
                .map(|v| v.render(true, depth + 1))
                .collect::<Vec<_>>()
        };
        match self {
            Self::None => "None".to_string(),
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => format_float(*v),
            Self::Str(s) if quoted => quote_str(s),
            Self::Str(s) => s.to_string(),
            Self::List(values) => format!("[{}]", items(&values.borrow()[..]).join(", ")),
            Self::Tuple(values) if values.len() == 1 => format!("({},)", items(&values[..]).join("")),
            Self::Tuple(values) => format!("({})", items(&values[..]).join(", ")),
            Self::Dict(map) => {
                let entries: Vec<String> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.to_value().render(true, depth + 1), v.render(true, depth + 1)))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Self::Iter(_) => "<iterator>".to_string(),
            Self::Function(closure) => format!("<function {}>", closure.name()),
            Self::Builtin(builtin) => format!("<built-in function {}>", builtin.name()),
            Self::Method(method) => format!("<bound method {} of {}>", method.name, method.receiver.type_name()),
            Self::ExcType(kind) => format!("<class '{}'>", kind.name()),
            Self::Exception(exc) if quoted => format!("{}({})", exc.kind.name(), quote_str(&exc.message)),
            Self::Exception(exc) => exc.message.clone(),
            Self::Frame(frame) => frame.to_string(),
            Self::Segment(segment) => segment.to_string(),
            Self::Video(video) => format!("<video with {} frames>", video.len()),
        }
    }

    /// Python `==`.
    #[must_use]
    pub fn py_eq(&self, other: &Self) -> bool {
        self.eq_at(other, 0)
    }

    fn eq_at(&self, other: &Self, depth: usize) -> bool {
        if depth > MAX_COMPARE_DEPTH {
            return self.is_same(other);
        }
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Float(_), _) | (_, Self::Float(_)) => match (self.as_float(), other.as_float()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            (Self::Int(_) | Self::Bool(_), Self::Int(_) | Self::Bool(_)) => self.as_int() == other.as_int(),
            (Self::List(a), Self::List(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow(), depth)
            }
            (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b) || seq_eq(a, b, depth),
            (Self::Dict(a), Self::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.eq_at(w, depth + 1)))
            }
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            (Self::Exception(a), Self::Exception(b)) => a == b,
            _ => self.is_same(other),
        }
    }

    /// Python `is`.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => Rc::ptr_eq(a, b),
            (Self::Iter(a), Self::Iter(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Method(a), Self::Method(b)) => Rc::ptr_eq(a, b),
            (Self::Frame(a), Self::Frame(b)) => Rc::ptr_eq(a, b),
            (Self::Segment(a), Self::Segment(b)) => Rc::ptr_eq(a, b),
            (Self::Video(a), Self::Video(b)) => Arc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            _ => false,
        }
    }

    /// Python ordering; `None` when the two values are not comparable.
    #[must_use]
    pub fn py_cmp(&self, other: &Self) -> Option<Ordering> {
        self.cmp_at(other, 0)
    }

    fn cmp_at(&self, other: &Self, depth: usize) -> Option<Ordering> {
        if depth > MAX_COMPARE_DEPTH {
            return None;
        }
        match (self, other) {
            (Self::Int(_) | Self::Bool(_), Self::Int(_) | Self::Bool(_)) => {
                Some(self.as_int()?.cmp(&other.as_int()?))
            }
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::List(a), Self::List(b)) => seq_cmp(&a.borrow(), &b.borrow(), depth),
            (Self::Tuple(a), Self::Tuple(b)) => seq_cmp(a, b, depth),
            _ => self.as_float()?.partial_cmp(&other.as_float()?),
        }
    }

    /// JSON rendering used for evidence and results. Dict keys become
    /// strings; API handles and callables become their `str()` text.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_at(0)
    }

    fn to_json_at(&self, depth: usize) -> serde_json::Value {
        use serde_json::Value as Json;

        if depth > MAX_RENDER_DEPTH {
            return Json::String("...".to_string());
        }
        match self {
            Self::None => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(v) => Json::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v).map_or(Json::Null, Json::Number),
            Self::Str(s) => Json::String(s.to_string()),
            Self::List(items) => Json::Array(items.borrow().iter().map(|v| v.to_json_at(depth + 1)).collect()),
            Self::Tuple(items) => Json::Array(items.iter().map(|v| v.to_json_at(depth + 1)).collect()),
            Self::Dict(map) => Json::Object(
                map.borrow()
                    .iter()
                    .map(|(k, v)| (k.to_json_key(), v.to_json_at(depth + 1)))
                    .collect(),
            ),
            other => Json::String(other.to_str()),
        }
    }

    /// Converts JSON into interpreter values.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Self::None,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            Json::String(s) => Self::str(s.as_str()),
            Json::Array(items) => Self::list(items.iter().map(Self::from_json).collect()),
            Json::Object(map) => Self::dict(
                map.iter()
                    .map(|(k, v)| (DictKey::Str(k.as_str().into()), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::str(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::str(v)
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        v.map_or(Self::None, Self::from)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Self::list(v.into_iter().map(Self::from).collect())
    }
}

fn seq_eq(a: &[Value], b: &[Value], depth: usize) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_at(y, depth + 1))
}

fn seq_cmp(a: &[Value], b: &[Value], depth: usize) -> Option<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if !x.eq_at(y, depth + 1) {
            return x.cmp_at(y, depth + 1);
        }
    }
    Some(a.len().cmp(&b.len()))
}

/// Element storage of lists and tuples.
///
/// Dropping the last handle on a deeply nested structure releases it from
/// a work list instead of recursing, so nesting depth is bounded by memory
/// rather than by the native stack.
#[derive(Default)]
pub struct Items(Vec<Value>);

impl From<Vec<Value>> for Items {
    fn from(items: Vec<Value>) -> Self {
        Self(items)
    }
}

impl Deref for Items {
    type Target = Vec<Value>;

    fn deref(&self) -> &Vec<Value> {
        &self.0
    }
}

impl DerefMut for Items {
    fn deref_mut(&mut self) -> &mut Vec<Value> {
        &mut self.0
    }
}

impl<'a> IntoIterator for &'a Items {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Debug for Items {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.0).finish()
    }
}

impl Drop for Items {
    fn drop(&mut self) {
        release(std::mem::take(&mut self.0));
    }
}

/// Dict storage: insertion-ordered, released like [`Items`] on drop.
#[derive(Clone, Default)]
pub struct DictMap(IndexMap<DictKey, Value>);

impl DictMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self(IndexMap::with_capacity(capacity))
    }
}

impl Deref for DictMap {
    type Target = IndexMap<DictKey, Value>;

    fn deref(&self) -> &IndexMap<DictKey, Value> {
        &self.0
    }
}

impl DerefMut for DictMap {
    fn deref_mut(&mut self) -> &mut IndexMap<DictKey, Value> {
        &mut self.0
    }
}

impl FromIterator<(DictKey, Value)> for DictMap {
    fn from_iter<I: IntoIterator<Item = (DictKey, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for DictMap {
    type Item = (DictKey, Value);
    type IntoIter = indexmap::map::IntoIter<DictKey, Value>;

    fn into_iter(mut self) -> Self::IntoIter {
        std::mem::take(&mut self.0).into_iter()
    }
}

impl<'a> IntoIterator for &'a DictMap {
    type Item = (&'a DictKey, &'a Value);
    type IntoIter = indexmap::map::Iter<'a, DictKey, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Debug for DictMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl Drop for DictMap {
    fn drop(&mut self) {
        release(self.0.drain(..).map(|(_, value)| value).collect());
    }
}

/// Drops `pending`, unpacking containers this is the last owner of onto
/// the same work list.
fn release(mut pending: Vec<Value>) {
    while let Some(value) = pending.pop() {
        match value {
            Value::List(cell) => {
                if let Ok(cell) = Rc::try_unwrap(cell) {
                    pending.append(&mut cell.into_inner());
                }
            }
            Value::Tuple(items) => {
                if let Ok(mut items) = Rc::try_unwrap(items) {
                    pending.append(&mut items);
                }
            }
            Value::Dict(map) => {
                if let Ok(map) = Rc::try_unwrap(map) {
                    pending.extend(map.into_inner().into_iter().map(|(_, value)| value));
                }
            }
            Value::Method(method) => {
                if let Ok(method) = Rc::try_unwrap(method) {
                    pending.push(method.receiver);
                }
            }
            Value::Function(closure) => {
                if let Ok(mut closure) = Rc::try_unwrap(closure) {
                    pending.extend(closure.take_defaults());
                }
            }
            _ => {}
        }
    }
}

/// Float text in Python style: integral values keep a trailing `.0`.
#[must_use]
pub fn format_float(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    format!("{v:?}")
}

/// Single-quoted string literal, switching to double quotes when the text
/// holds a single quote and no double quote.
#[must_use]
pub fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Hashable dict key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    None,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
    Tuple(Vec<DictKey>),
}

impl DictKey {
    /// Key for `value`, or `None` if the value is unhashable. Integral
    /// floats key like the equal int.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        Self::from_value_at(value, 0)
    }

    fn from_value_at(value: &Value, depth: usize) -> Option<Self> {
        if depth > MAX_COMPARE_DEPTH {
            return None;
        }
        match value {
            Value::None => Some(Self::None),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Int(v) => Some(Self::Int(*v)),
            #[allow(clippy::cast_possible_truncation)]
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(Self::Int(*v as i64)),
            Value::Str(s) => Some(Self::Str(Rc::clone(s))),
            Value::Tuple(items) => items
                .iter()
                .map(|item| Self::from_value_at(item, depth + 1))
                .collect::<Option<Vec<_>>>()
                .map(Self::Tuple),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::None => Value::None,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(v) => Value::Int(*v),
            Self::Str(s) => Value::Str(Rc::clone(s)),
            Self::Tuple(items) => Value::tuple(items.iter().map(Self::to_value).collect()),
        }
    }

    /// Text used when the key becomes a JSON object key.
    #[must_use]
    pub fn to_json_key(&self) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            other => other.to_value().to_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::dict(
            entries
                .into_iter()
                .map(|(k, v)| (DictKey::Str(k.into()), v))
                .collect(),
        )
    }

    #[test]
    fn truthiness_follows_python() {
        assert!(!Value::None.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::str("").truthy());
        assert!(!Value::list(Vec::new()).truthy());
        assert!(Value::str("no").truthy());
        assert!(Value::Float(0.1).truthy());
    }

    #[test]
    fn str_and_repr() {
        assert_eq!(Value::Float(1.0).to_str(), "1.0");
        assert_eq!(Value::Float(0.25).to_str(), "0.25");
        assert_eq!(Value::Bool(true).to_str(), "True");
        assert_eq!(Value::str("it's").repr(), "\"it's\"");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::str("a"), Value::None]).to_str(),
            "[1, 'a', None]"
        );
        assert_eq!(Value::tuple(vec![Value::Int(1)]).to_str(), "(1,)");
        assert_eq!(dict(vec![("k", Value::Int(2))]).to_str(), "{'k': 2}");
    }

    #[test]
    fn numeric_equality_crosses_types() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::str("1").py_eq(&Value::Int(1)));
        assert_eq!(Value::Int(2).py_cmp(&Value::Float(2.5)), Some(Ordering::Less));
        assert_eq!(Value::str("a").py_cmp(&Value::Int(1)), None);
    }

    #[test]
    fn sequences_compare_lexicographically() {
        let a = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::tuple(vec![Value::Int(1), Value::Int(3)]);
        let c = Value::tuple(vec![Value::Int(1)]);
        assert_eq!(a.py_cmp(&b), Some(Ordering::Less));
        assert_eq!(c.py_cmp(&a), Some(Ordering::Less));
    }

    #[test]
    fn json_keeps_insertion_order() {
        let value = dict(vec![
            ("zeta", Value::Int(1)),
            ("alpha", Value::list(vec![Value::Float(0.5), Value::None])),
        ]);
        let json = value.to_json();
        assert_eq!(json.to_string(), r#"{"zeta":1,"alpha":[0.5,null]}"#);
        assert!(Value::from_json(&json).py_eq(&value));
    }

    #[test]
    fn dict_keys_normalize_integral_floats() {
        assert_eq!(DictKey::from_value(&Value::Float(3.0)), Some(DictKey::Int(3)));
        assert_eq!(DictKey::from_value(&Value::list(Vec::new())), None);
        assert_eq!(DictKey::Int(7).to_json_key(), "7");
    }

    #[test]
    fn deep_nesting_is_released_and_compared_without_recursing() {
        let mut list = Value::list(Vec::new());
        let mut map = Value::dict(DictMap::new());
        for _ in 0..200_000 {
            list = Value::list(vec![list]);
            map = dict(vec![("next", map)]);
        }
        let wrapped = Value::list(vec![list.clone()]);
        assert!(!list.py_eq(&wrapped));
        assert_eq!(list.py_cmp(&wrapped), None);
        assert!(list.py_eq(&list.clone()));

        let key = (0..2 * MAX_COMPARE_DEPTH).fold(Value::tuple(Vec::new()), |t, _| Value::tuple(vec![t]));
        assert_eq!(DictKey::from_value(&key), None);
        drop((list, wrapped, map, key));
    }

    #[test]
    fn exception_matching() {
        assert!(ExcKind::KeyError.is_caught_by(ExcKind::LookupError));
        assert!(ExcKind::ValueError.is_caught_by(ExcKind::Exception));
        assert!(!ExcKind::ValueError.is_caught_by(ExcKind::KeyError));
        assert_eq!(ExcKind::from_name("IndexError"), Some(ExcKind::IndexError));
    }
}
