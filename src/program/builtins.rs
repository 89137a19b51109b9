//! Builtin functions and methods of the core value types.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use tracing::debug;

use crate::value::{format_float, DictKey, DictMap, ExcKind, Items, Value};

use super::capabilities;
use super::interp::{hash_key, sequence_index, CallArgs, Exec, Fault, Interpreter};

/// Functions resolvable by name from any program scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Len,
    Range,
    Enumerate,
    Zip,
    List,
    Dict,
    Str,
    Int,
    Float,
    Bool,
    Tuple,
    Min,
    Max,
    Sum,
    Sorted,
    Reversed,
    Any,
    All,
    Abs,
    Round,
    Print,
    Isinstance,
    Map,
    Filter,
    Repr,
    VideoSegment,
    ImagePatch,
    BoolToYesno,
    LlmQuery,
    BestImageMatch,
    Distance,
    CoerceToNumeric,
}

impl Builtin {
    pub const ALL: [Self; 32] = [
        Self::Len,
        Self::Range,
        Self::Enumerate,
        Self::Zip,
        Self::List,
        Self::Dict,
        Self::Str,
        Self::Int,
        Self::Float,
        Self::Bool,
        Self::Tuple,
        Self::Min,
        Self::Max,
        Self::Sum,
        Self::Sorted,
        Self::Reversed,
        Self::Any,
        Self::All,
        Self::Abs,
        Self::Round,
        Self::Print,
        Self::Isinstance,
        Self::Map,
        Self::Filter,
        Self::Repr,
        Self::VideoSegment,
        Self::ImagePatch,
        Self::BoolToYesno,
        Self::LlmQuery,
        Self::BestImageMatch,
        Self::Distance,
        Self::CoerceToNumeric,
    ];

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Len => "len",
            Self::Range => "range",
            Self::Enumerate => "enumerate",
            Self::Zip => "zip",
            Self::List => "list",
            Self::Dict => "dict",
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Tuple => "tuple",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
            Self::Sorted => "sorted",
            Self::Reversed => "reversed",
            Self::Any => "any",
            Self::All => "all",
            Self::Abs => "abs",
            Self::Round => "round",
            Self::Print => "print",
            Self::Isinstance => "isinstance",
            Self::Map => "map",
            Self::Filter => "filter",
            Self::Repr => "repr",
            Self::VideoSegment => "VideoSegment",
            Self::ImagePatch => "ImagePatch",
            Self::BoolToYesno => "bool_to_yesno",
            Self::LlmQuery => "llm_query",
            Self::BestImageMatch => "best_image_match",
            Self::Distance => "distance",
            Self::CoerceToNumeric => "coerce_to_numeric",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    /// Builtins that reach the frame/segment API.
    #[must_use]
    pub const fn is_capability(&self) -> bool {
        matches!(
            self,
            Self::VideoSegment
                | Self::ImagePatch
                | Self::BoolToYesno
                | Self::LlmQuery
                | Self::BestImageMatch
                | Self::Distance
                | Self::CoerceToNumeric
        )
    }
}

/// Resolves a name that is not bound in any program scope.
#[must_use]
pub fn global(name: &str) -> Option<Value> {
    Builtin::from_name(name)
        .map(Value::Builtin)
        .or_else(|| ExcKind::from_name(name).map(Value::ExcType))
}

const STR_METHODS: &[&str] = &[
    "lower", "upper", "strip", "lstrip", "rstrip", "split", "join", "replace", "startswith", "endswith", "find",
    "index", "count", "format", "title", "capitalize", "isdigit", "isalpha", "isalnum", "isspace", "splitlines",
];
const LIST_METHODS: &[&str] = &[
    "append", "extend", "insert", "pop", "remove", "index", "count", "sort", "reverse", "copy", "clear",
];
const DICT_METHODS: &[&str] = &["get", "keys", "values", "items", "update", "pop", "setdefault", "copy", "clear"];
const TUPLE_METHODS: &[&str] = &["index", "count"];

#[must_use]
pub fn has_method(value: &Value, name: &str) -> bool {
    let table = match value {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        _ => return false,
    };
    table.contains(&name)
}

pub fn expect_str<'v>(value: &'v Value, func: &str) -> Exec<&'v str> {
    value
        .as_str()
        .ok_or_else(|| Fault::type_error(format!("{func}() argument must be str, not {}", value.type_name())))
}

pub fn expect_int(value: &Value, func: &str) -> Exec<i64> {
    value.as_int().ok_or_else(|| {
        Fault::type_error(format!(
            "{func}() argument must be an integer, not {}",
            value.type_name()
        ))
    })
}

fn flag(args: &CallArgs, index: usize, name: &str) -> bool {
    args.arg(index, name).is_some_and(Value::truthy)
}

pub fn call(interp: &Interpreter<'_>, builtin: Builtin, args: CallArgs) -> Exec<Value> {
    if builtin.is_capability() {
        return capabilities::call_capability(interp, builtin, args);
    }
    let name = builtin.name();
    match builtin {
        Builtin::Len => {
            args.check(name, &["obj"])?;
            let value = args.required(name, 0, "obj")?;
            let len = match value {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.borrow().len(),
                Value::Tuple(items) => items.len(),
                Value::Dict(map) => map.borrow().len(),
                Value::Video(video) => video.len(),
                other => {
                    return Err(Fault::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::from(len))
        }
        Builtin::Range => range(&args),
        Builtin::Enumerate => {
            args.check(name, &["iterable", "start"])?;
            let items = interp.iterate(args.required(name, 0, "iterable")?)?;
            let start = args.arg(1, "start").map(|v| expect_int(v, name)).transpose()?.unwrap_or(0);
            Ok(Value::iter(items.zip(start..).map(|(v, i)| Value::tuple(vec![Value::Int(i), v]))))
        }
        Builtin::Zip => {
            let mut iters = args
                .positional
                .iter()
                .map(|v| interp.iterate(v))
                .collect::<Exec<Vec<_>>>()?;
            if iters.is_empty() {
                return Ok(Value::iter(std::iter::empty()));
            }
            Ok(Value::iter(std::iter::from_fn(move || {
                iters
                    .iter_mut()
                    .map(Iterator::next)
                    .collect::<Option<Vec<_>>>()
                    .map(Value::tuple)
            })))
        }
        Builtin::List => {
            args.check(name, &["iterable"])?;
            match args.arg(0, "iterable") {
                Some(v) => Ok(Value::list(interp.iterate(v)?.collect())),
                None => Ok(Value::list(Vec::new())),
            }
        }
        Builtin::Tuple => {
            args.check(name, &["iterable"])?;
            match args.arg(0, "iterable") {
                Some(v) => Ok(Value::tuple(interp.iterate(v)?.collect())),
                None => Ok(Value::tuple(Vec::new())),
            }
        }
        Builtin::Dict => {
            if args.positional.len() > 1 {
                return Err(Fault::type_error("dict expected at most 1 argument"));
            }
            let mut map = DictMap::new();
            if let Some(source) = args.positional.first() {
                extend_dict(interp, &mut map, source)?;
            }
            for (key, value) in &args.keywords {
                map.insert(DictKey::Str(key.as_str().into()), value.clone());
            }
            Ok(Value::dict(map))
        }
        Builtin::Str => {
            args.check(name, &["object"])?;
            Ok(Value::str(args.arg(0, "object").map(Value::to_str).unwrap_or_default()))
        }
        Builtin::Repr => {
            args.check(name, &["obj"])?;
            Ok(Value::str(args.required(name, 0, "obj")?.repr()))
        }
        Builtin::Bool => {
            args.check(name, &["x"])?;
            Ok(Value::Bool(args.arg(0, "x").is_some_and(Value::truthy)))
        }
        Builtin::Int => {
            args.check(name, &["x", "base"])?;
            let base = args.arg(1, "base").map(|v| expect_int(v, name)).transpose()?;
            args.arg(0, "x").map_or(Ok(Value::Int(0)), |v| to_int(v, base))
        }
        Builtin::Float => {
            args.check(name, &["x"])?;
            args.arg(0, "x").map_or(Ok(Value::Float(0.0)), to_float)
        }
        Builtin::Min => extreme(interp, &args, Ordering::Less, name),
        Builtin::Max => extreme(interp, &args, Ordering::Greater, name),
        Builtin::Sum => {
            args.check(name, &["iterable", "start"])?;
            let mut total = args.arg(1, "start").cloned().unwrap_or(Value::Int(0));
            for item in interp.iterate(args.required(name, 0, "iterable")?)? {
                total = super::interp::binary_op(super::ast::BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        Builtin::Sorted => {
            args.check(name, &["iterable", "key", "reverse"])?;
            if args.positional.len() > 1 {
                return Err(Fault::type_error("sorted expected 1 argument"));
            }
            let values = interp.iterate(args.required(name, 0, "iterable")?)?.collect();
            let key = args.keyword("key");
            let reverse = args.keyword("reverse").is_some_and(Value::truthy);
            Ok(Value::list(sort_values(interp, values, key, reverse)?))
        }
        Builtin::Reversed => {
            args.check(name, &["sequence"])?;
            let mut values: Vec<Value> = interp.iterate(args.required(name, 0, "sequence")?)?.collect();
            values.reverse();
            Ok(Value::iter(values.into_iter()))
        }
        Builtin::Any | Builtin::All => {
            args.check(name, &["iterable"])?;
            let want = builtin == Builtin::Any;
            for item in interp.iterate(args.required(name, 0, "iterable")?)? {
                if item.truthy() == want {
                    return Ok(Value::Bool(want));
                }
            }
            Ok(Value::Bool(!want))
        }
        Builtin::Abs => {
            args.check(name, &["x"])?;
            match args.required(name, 0, "x")? {
                Value::Float(v) => Ok(Value::Float(v.abs())),
                v => v
                    .as_int()
                    .ok_or_else(|| Fault::type_error(format!("bad operand type for abs(): '{}'", v.type_name())))?
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| Fault::raise(ExcKind::RuntimeError, "integer overflow")),
            }
        }
        Builtin::Round => {
            args.check(name, &["number", "ndigits"])?;
            let number = args.required(name, 0, "number")?;
            let ndigits = match args.arg(1, "ndigits") {
                None | Some(Value::None) => None,
                Some(v) => Some(expect_int(v, name)?),
            };
            round(number, ndigits)
        }
        Builtin::Print => {
            let sep = args.keyword("sep").map_or_else(|| " ".to_string(), Value::to_str);
            let line = args.positional.iter().map(Value::to_str).collect::<Vec<_>>().join(&sep);
            debug!(sample_id = %interp.bindings().sample_id, output = %line, "program print");
            Ok(Value::None)
        }
        Builtin::Isinstance => {
            args.check(name, &["obj", "class_or_tuple"])?;
            let obj = args.required(name, 0, "obj")?;
            let class = args.required(name, 1, "class_or_tuple")?;
            is_instance(obj, class).map(Value::Bool)
        }
        Builtin::Map => {
            let Some((func, iterables)) = args.positional.split_first() else {
                return Err(Fault::type_error("map() must have at least two arguments."));
            };
            if iterables.is_empty() {
                return Err(Fault::type_error("map() must have at least two arguments."));
            }
            let mut iters = iterables.iter().map(|v| interp.iterate(v)).collect::<Exec<Vec<_>>>()?;
            let mut out = Vec::new();
            while let Some(row) = iters.iter_mut().map(Iterator::next).collect::<Option<Vec<_>>>() {
                out.push(interp.call_value(func, CallArgs::positional(row))?);
            }
            Ok(Value::iter(out.into_iter()))
        }
        Builtin::Filter => {
            args.check(name, &["function", "iterable"])?;
            let func = args.required(name, 0, "function")?;
            let mut out = Vec::new();
            for item in interp.iterate(args.required(name, 1, "iterable")?)? {
                let keep = if func.is_none() {
                    item.truthy()
                } else {
                    interp.call1(func, item.clone())?.truthy()
                };
                if keep {
                    out.push(item);
                }
            }
            Ok(Value::iter(out.into_iter()))
        }
        _ => Err(Fault::type_error(format!("{name}() is not callable here"))),
    }
}

fn range(args: &CallArgs) -> Exec<Value> {
    if !args.keywords.is_empty() {
        return Err(Fault::type_error("range() takes no keyword arguments"));
    }
    let ints = args
        .positional
        .iter()
        .map(|v| expect_int(v, "range"))
        .collect::<Exec<Vec<_>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(Fault::type_error(format!("range expected 1 to 3 arguments, got {}", ints.len()))),
    };
    if step == 0 {
        return Err(Fault::value_error("range() arg 3 must not be zero"));
    }
    let mut current = start;
    let mut done = false;
    Ok(Value::iter(std::iter::from_fn(move || {
        let more = if step > 0 { current < stop } else { current > stop };
        if done || !more {
            return None;
        }
        let value = current;
        match current.checked_add(step) {
            Some(next) => current = next,
            None => done = true,
        }
        Some(Value::Int(value))
    })))
}

fn extend_dict(interp: &Interpreter<'_>, map: &mut DictMap, source: &Value) -> Exec<()> {
    if let Value::Dict(other) = source {
        let entries: Vec<(DictKey, Value)> = other.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        map.extend(entries);
        return Ok(());
    }
    for (i, item) in interp.iterate(source)?.enumerate() {
        let pair: Vec<Value> = interp.iterate(&item)?.collect();
        let [key, value] = <[Value; 2]>::try_from(pair).map_err(|pair| {
            Fault::value_error(format!(
                "dictionary update sequence element #{i} has length {}; 2 is required",
                pair.len()
            ))
        })?;
        map.insert(hash_key(&key)?, value);
    }
    Ok(())
}

/// 2^63; every float at or above it overflows `i64`.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

fn to_int(value: &Value, base: Option<i64>) -> Exec<Value> {
    match value {
        Value::Str(s) => {
            let radix = u32::try_from(base.unwrap_or(10)).unwrap_or(0);
            if !(2..=36).contains(&radix) {
                return Err(Fault::value_error("int() base must be >= 2 and <= 36"));
            }
            let cleaned = s.trim().replace('_', "");
            i64::from_str_radix(&cleaned, radix).map(Value::Int).map_err(|_| {
                Fault::value_error(format!(
                    "invalid literal for int() with base {radix}: {}",
                    value.repr()
                ))
            })
        }
        _ if base.is_some() => Err(Fault::type_error("int() can't convert non-string with explicit base")),
        Value::Float(v) => {
            if !v.is_finite() {
                return Err(Fault::value_error(format!("cannot convert float {} to integer", format_float(*v))));
            }
            let truncated = v.trunc();
            if truncated.abs() >= I64_LIMIT {
                return Err(Fault::raise(ExcKind::RuntimeError, "integer overflow"));
            }
            #[allow(clippy::cast_possible_truncation)]
            let int = truncated as i64;
            Ok(Value::Int(int))
        }
        v => v.as_int().map(Value::Int).ok_or_else(|| {
            Fault::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                v.type_name()
            ))
        }),
    }
}

fn to_float(value: &Value) -> Exec<Value> {
    match value {
        Value::Str(s) => {
            let cleaned = s.trim().replace('_', "");
            cleaned
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| Fault::value_error(format!("could not convert string to float: {}", value.repr())))
        }
        v => v.as_float().map(Value::Float).ok_or_else(|| {
            Fault::type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                v.type_name()
            ))
        }),
    }
}

fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}

fn round(number: &Value, ndigits: Option<i64>) -> Exec<Value> {
    match (number, ndigits) {
        (Value::Float(v), None) => {
            let rounded = round_half_even(*v);
            to_int(&Value::Float(rounded), None)
        }
        (Value::Float(v), Some(n)) => {
            let n = i32::try_from(n.clamp(-308, 308)).unwrap_or(0);
            let scale = 10f64.powi(n);
            Ok(Value::Float(round_half_even(v * scale) / scale))
        }
        (v, _) => v
            .as_int()
            .map(Value::Int)
            .ok_or_else(|| Fault::type_error(format!("type {} doesn't define __round__ method", v.type_name()))),
    }
}

fn is_instance(obj: &Value, class: &Value) -> Exec<bool> {
    match class {
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if is_instance(obj, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Builtin(builtin) => Ok(match builtin {
            Builtin::Int => matches!(obj, Value::Int(_) | Value::Bool(_)),
            Builtin::Float => matches!(obj, Value::Float(_)),
            Builtin::Bool => matches!(obj, Value::Bool(_)),
            Builtin::Str => matches!(obj, Value::Str(_)),
            Builtin::List => matches!(obj, Value::List(_)),
            Builtin::Tuple => matches!(obj, Value::Tuple(_)),
            Builtin::Dict => matches!(obj, Value::Dict(_)),
            Builtin::ImagePatch => matches!(obj, Value::Frame(_)),
            Builtin::VideoSegment => matches!(obj, Value::Segment(_)),
            other => {
                return Err(Fault::type_error(format!(
                    "isinstance() arg 2 must be a type, not {}",
                    other.name()
                )))
            }
        }),
        Value::ExcType(kind) => Ok(matches!(obj, Value::Exception(exc) if exc.kind.is_caught_by(*kind))),
        other => Err(Fault::type_error(format!(
            "isinstance() arg 2 must be a type or tuple of types, not {}",
            other.type_name()
        ))),
    }
}

fn extreme(interp: &Interpreter<'_>, args: &CallArgs, want: Ordering, func: &str) -> Exec<Value> {
    for (k, _) in &args.keywords {
        if k != "key" && k != "default" {
            return Err(Fault::type_error(format!("{func}() got an unexpected keyword argument '{k}'")));
        }
    }
    let key = args.keyword("key").filter(|k| !k.is_none());
    let candidates: Vec<Value> = match args.positional.as_slice() {
        [] => return Err(Fault::type_error(format!("{func} expected at least 1 argument, got 0"))),
        [single] => interp.iterate(single)?.collect(),
        many => many.to_vec(),
    };
    let mut best: Option<(Value, Value)> = None;
    for candidate in candidates {
        let rank = match key {
            Some(f) => interp.call1(f, candidate.clone())?,
            None => candidate.clone(),
        };
        let better = match &best {
            None => true,
            Some((_, best_rank)) => match rank.py_cmp(best_rank) {
                Some(ordering) => ordering == want,
                None if rank.as_float().is_some() && best_rank.as_float().is_some() => false,
                None => {
                    return Err(Fault::type_error(format!(
                        "'{}' not supported between instances of '{}' and '{}'",
                        if want == Ordering::Less { "<" } else { ">" },
                        rank.type_name(),
                        best_rank.type_name()
                    )))
                }
            },
        };
        if better {
            best = Some((candidate, rank));
        }
    }
    best.map(|(value, _)| value)
        .or_else(|| args.keyword("default").cloned())
        .ok_or_else(|| Fault::value_error(format!("{func}() arg is an empty sequence")))
}

/// Stable sort by Python ordering, optionally through a key function.
pub fn sort_values(
    interp: &Interpreter<'_>,
    values: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> Exec<Vec<Value>> {
    let keys: Vec<Value> = match key.filter(|k| !k.is_none()) {
        Some(f) => values.iter().map(|v| interp.call1(f, v.clone())).collect::<Exec<_>>()?,
        None => values.clone(),
    };
    let mut order: Vec<usize> = (0..values.len()).collect();
    let mut failure = None;
    order.sort_by(|&a, &b| {
        let ordering = keys[a].py_cmp(&keys[b]).unwrap_or_else(|| {
            let numeric = keys[a].as_float().is_some() && keys[b].as_float().is_some();
            if !numeric && failure.is_none() {
                failure = Some(Fault::type_error(format!(
                    "'<' not supported between instances of '{}' and '{}'",
                    keys[a].type_name(),
                    keys[b].type_name()
                )));
            }
            Ordering::Equal
        });
        if reverse {
            ordering.reverse()
        } else {
            ordering
        }
    });
    if let Some(fault) = failure {
        return Err(fault);
    }
    let mut slots: Vec<Option<Value>> = values.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

// ---- methods ----

pub fn str_method(interp: &Interpreter<'_>, s: &Rc<str>, name: &str, args: CallArgs) -> Exec<Value> {
    let text: &str = s;
    let method = format!("str.{name}");
    let method = method.as_str();
    let strip_set = |args: &CallArgs| -> Exec<Option<Vec<char>>> {
        args.check(method, &["chars"])?;
        match args.arg(0, "chars") {
            None | Some(Value::None) => Ok(None),
            Some(v) => Ok(Some(expect_str(v, method)?.chars().collect())),
        }
    };
    match name {
        "lower" | "upper" | "title" | "capitalize" | "isdigit" | "isalpha" | "isalnum" | "isspace"
        | "splitlines" => {
            args.check(method, &[])?;
            Ok(match name {
                "lower" => Value::str(text.to_lowercase()),
                "upper" => Value::str(text.to_uppercase()),
                "title" => Value::str(title_case(text)),
                "capitalize" => {
                    let mut chars = text.chars();
                    let out: String = match chars.next() {
                        Some(first) => {
                            let rest = chars.as_str().to_lowercase();
                            first.to_uppercase().chain(rest.chars()).collect()
                        }
                        None => String::new(),
                    };
                    Value::str(out)
                }
                "isdigit" => Value::Bool(!text.is_empty() && text.chars().all(|c| c.is_ascii_digit())),
                "isalpha" => Value::Bool(!text.is_empty() && text.chars().all(char::is_alphabetic)),
                "isalnum" => Value::Bool(!text.is_empty() && text.chars().all(char::is_alphanumeric)),
                "isspace" => Value::Bool(!text.is_empty() && text.chars().all(char::is_whitespace)),
                _ => Value::from(text.lines().map(str::to_string).collect::<Vec<_>>()),
            })
        }
        "strip" => Ok(Value::str(match strip_set(&args)? {
            None => text.trim(),
            Some(set) => text.trim_matches(|c| set.contains(&c)),
        })),
        "lstrip" => Ok(Value::str(match strip_set(&args)? {
            None => text.trim_start(),
            Some(set) => text.trim_start_matches(|c| set.contains(&c)),
        })),
        "rstrip" => Ok(Value::str(match strip_set(&args)? {
            None => text.trim_end(),
            Some(set) => text.trim_end_matches(|c| set.contains(&c)),
        })),
        "split" => {
            args.check(method, &["sep", "maxsplit"])?;
            let maxsplit = args.arg(1, "maxsplit").map(|v| expect_int(v, method)).transpose()?.unwrap_or(-1);
            let parts = match args.arg(0, "sep") {
                None | Some(Value::None) => split_whitespace(text, maxsplit),
                Some(sep) => {
                    let sep = expect_str(sep, method)?;
                    if sep.is_empty() {
                        return Err(Fault::value_error("empty separator"));
                    }
                    match usize::try_from(maxsplit) {
                        Ok(n) => text.splitn(n + 1, sep).map(str::to_string).collect(),
                        Err(_) => text.split(sep).map(str::to_string).collect(),
                    }
                }
            };
            Ok(Value::from(parts))
        }
        "join" => {
            args.check(method, &["iterable"])?;
            let mut pieces = Vec::new();
            for (i, item) in interp.iterate(args.required(method, 0, "iterable")?)?.enumerate() {
                match item {
                    Value::Str(piece) => pieces.push(piece),
                    other => {
                        return Err(Fault::type_error(format!(
                            "sequence item {i}: expected str instance, {} found",
                            other.type_name()
                        )))
                    }
                }
            }
            let joined = pieces.iter().map(|p| &**p).collect::<Vec<&str>>().join(text);
            Ok(Value::str(joined))
        }
        "replace" => {
            args.check(method, &["old", "new", "count"])?;
            let old = expect_str(args.required(method, 0, "old")?, method)?;
            let new = expect_str(args.required(method, 1, "new")?, method)?;
            let count = args.arg(2, "count").map(|v| expect_int(v, method)).transpose()?.unwrap_or(-1);
            Ok(Value::str(match usize::try_from(count) {
                Ok(n) => text.replacen(old, new, n),
                Err(_) => text.replace(old, new),
            }))
        }
        "startswith" | "endswith" => {
            args.check(method, &["prefix"])?;
            let affix = args.required(method, 0, "prefix")?;
            let test = |candidate: &str| {
                if name == "startswith" {
                    text.starts_with(candidate)
                } else {
                    text.ends_with(candidate)
                }
            };
            match affix {
                Value::Tuple(options) => {
                    for option in options.iter() {
                        if test(expect_str(option, method)?) {
                            return Ok(Value::Bool(true));
                        }
                    }
                    Ok(Value::Bool(false))
                }
                other => Ok(Value::Bool(test(expect_str(other, method)?))),
            }
        }
        "find" | "index" => {
            args.check(method, &["sub"])?;
            let sub = expect_str(args.required(method, 0, "sub")?, method)?;
            match text.find(sub) {
                Some(byte) => Ok(Value::from(text[..byte].chars().count())),
                None if name == "find" => Ok(Value::Int(-1)),
                None => Err(Fault::value_error("substring not found")),
            }
        }
        "count" => {
            args.check(method, &["sub"])?;
            let sub = expect_str(args.required(method, 0, "sub")?, method)?;
            let n = if sub.is_empty() {
                text.chars().count() + 1
            } else {
                text.matches(sub).count()
            };
            Ok(Value::from(n))
        }
        "format" => format_template(text, &args).map(Value::str),
        _ => Err(Fault::attribute_error(&Value::Str(Rc::clone(s)), name)),
    }
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

fn split_whitespace(text: &str, maxsplit: i64) -> Vec<String> {
    let Ok(limit) = usize::try_from(maxsplit) else {
        return text.split_whitespace().map(str::to_string).collect();
    };
    let mut parts = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() && parts.len() < limit {
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(rest[..end].to_string());
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(rest.to_string());
                rest = "";
            }
        }
    }
    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

pub fn list_method(
    interp: &Interpreter<'_>,
    items: &Rc<RefCell<Items>>,
    name: &str,
    args: CallArgs,
) -> Exec<Value> {
    let method = format!("list.{name}");
    let method = method.as_str();
    match name {
        "append" => {
            args.check(method, &["object"])?;
            let value = args.required(method, 0, "object")?.clone();
            items.borrow_mut().push(value);
            Ok(Value::None)
        }
        "extend" => {
            args.check(method, &["iterable"])?;
            let extra: Vec<Value> = interp.iterate(args.required(method, 0, "iterable")?)?.collect();
            items.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        "insert" => {
            args.check(method, &["index", "object"])?;
            let index = expect_int(args.required(method, 0, "index")?, method)?;
            let value = args.required(method, 1, "object")?.clone();
            let mut items = items.borrow_mut();
            let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
            let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(usize::try_from(at).unwrap_or(0), value);
            Ok(Value::None)
        }
        "pop" => {
            args.check(method, &["index"])?;
            let len = items.borrow().len();
            if len == 0 {
                return Err(Fault::index_error("pop from empty list"));
            }
            let index = match args.arg(0, "index") {
                Some(v) => sequence_index(v, len, "pop")?,
                None => len - 1,
            };
            Ok(items.borrow_mut().remove(index))
        }
        "remove" => {
            args.check(method, &["value"])?;
            let value = args.required(method, 0, "value")?;
            let position = items.borrow().iter().position(|v| v.py_eq(value));
            match position {
                Some(i) => {
                    let removed = items.borrow_mut().remove(i);
                    drop(removed);
                    Ok(Value::None)
                }
                None => Err(Fault::value_error("list.remove(x): x not in list")),
            }
        }
        "index" => {
            args.check(method, &["value"])?;
            let value = args.required(method, 0, "value")?;
            let position = items.borrow().iter().position(|v| v.py_eq(value));
            position
                .map(Value::from)
                .ok_or_else(|| Fault::value_error(format!("{} is not in list", value.repr())))
        }
        "count" => {
            args.check(method, &["value"])?;
            let value = args.required(method, 0, "value")?;
            let n = items.borrow().iter().filter(|v| v.py_eq(value)).count();
            Ok(Value::from(n))
        }
        "sort" => {
            args.check(method, &["key", "reverse"])?;
            if !args.positional.is_empty() {
                return Err(Fault::type_error("sort() takes no positional arguments"));
            }
            let values = items.borrow().clone();
            let key = args.keyword("key");
            let reverse = args.keyword("reverse").is_some_and(Value::truthy);
            let sorted = sort_values(interp, values, key, reverse)?;
            let old = std::mem::replace(&mut *items.borrow_mut(), Items::from(sorted));
            drop(old);
            Ok(Value::None)
        }
        "reverse" => {
            args.check(method, &[])?;
            items.borrow_mut().reverse();
            Ok(Value::None)
        }
        "copy" => {
            args.check(method, &[])?;
            Ok(Value::list(items.borrow().clone()))
        }
        "clear" => {
            args.check(method, &[])?;
            let old = std::mem::take(&mut *items.borrow_mut());
            drop(old);
            Ok(Value::None)
        }
        _ => Err(Fault::attribute_error(&Value::List(Rc::clone(items)), name)),
    }
}

pub fn dict_method(
    interp: &Interpreter<'_>,
    map: &Rc<RefCell<DictMap>>,
    name: &str,
    args: CallArgs,
) -> Exec<Value> {
    let method = format!("dict.{name}");
    let method = method.as_str();
    match name {
        "get" => {
            args.check(method, &["key", "default"])?;
            let key = hash_key(args.required(method, 0, "key")?)?;
            let found = map.borrow().get(&key).cloned();
            Ok(found.unwrap_or_else(|| args.arg(1, "default").cloned().unwrap_or_default()))
        }
        "keys" => {
            args.check(method, &[])?;
            Ok(Value::list(map.borrow().keys().map(DictKey::to_value).collect()))
        }
        "values" => {
            args.check(method, &[])?;
            Ok(Value::list(map.borrow().values().cloned().collect()))
        }
        "items" => {
            args.check(method, &[])?;
            Ok(Value::list(
                map.borrow()
                    .iter()
                    .map(|(k, v)| Value::tuple(vec![k.to_value(), v.clone()]))
                    .collect(),
            ))
        }
        "update" => {
            let mut incoming = DictMap::new();
            if args.positional.len() > 1 {
                return Err(Fault::type_error("update expected at most 1 argument"));
            }
            if let Some(source) = args.positional.first() {
                extend_dict(interp, &mut incoming, source)?;
            }
            for (key, value) in &args.keywords {
                incoming.insert(DictKey::Str(key.as_str().into()), value.clone());
            }
            map.borrow_mut().extend(incoming);
            Ok(Value::None)
        }
        "pop" => {
            args.check(method, &["key", "default"])?;
            let raw = args.required(method, 0, "key")?;
            let key = hash_key(raw)?;
            let removed = map.borrow_mut().shift_remove(&key);
            match (removed, args.arg(1, "default")) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(Fault::raise(ExcKind::KeyError, raw.repr())),
            }
        }
        "setdefault" => {
            args.check(method, &["key", "default"])?;
            let key = hash_key(args.required(method, 0, "key")?)?;
            let default = args.arg(1, "default").cloned().unwrap_or_default();
            let value = map.borrow_mut().entry(key).or_insert(default).clone();
            Ok(value)
        }
        "copy" => {
            args.check(method, &[])?;
            Ok(Value::dict(map.borrow().clone()))
        }
        "clear" => {
            args.check(method, &[])?;
            let old = std::mem::take(&mut *map.borrow_mut());
            drop(old);
            Ok(Value::None)
        }
        _ => Err(Fault::attribute_error(&Value::Dict(Rc::clone(map)), name)),
    }
}

pub fn tuple_method(items: &Rc<Items>, name: &str, args: CallArgs) -> Exec<Value> {
    let method = format!("tuple.{name}");
    let method = method.as_str();
    args.check(method, &["value"])?;
    let value = args.required(method, 0, "value")?;
    match name {
        "index" => items
            .iter()
            .position(|v| v.py_eq(value))
            .map(Value::from)
            .ok_or_else(|| Fault::value_error("tuple.index(x): x not in tuple")),
        "count" => Ok(Value::from(items.iter().filter(|v| v.py_eq(value)).count())),
        _ => Err(Fault::attribute_error(&Value::Tuple(Rc::clone(items)), name)),
    }
}

// ---- formatting ----

#[derive(Debug, Clone, PartialEq, Eq)]
struct FormatSpec {
    fill: char,
    align: Option<char>,
    sign: char,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

impl FormatSpec {
    fn parse(spec: &str) -> Exec<Self> {
        let invalid = || Fault::value_error(format!("Invalid format specifier '{spec}'"));
        let chars: Vec<char> = spec.chars().collect();
        let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
        let mut parsed = Self {
            fill: ' ',
            align: None,
            sign: '-',
            zero: false,
            width: 0,
            grouping: None,
            precision: None,
            kind: None,
        };
        let mut i = 0;
        if chars.len() >= 2 && is_align(chars[1]) {
            parsed.fill = chars[0];
            parsed.align = Some(chars[1]);
            i = 2;
        } else if chars.first().copied().is_some_and(is_align) {
            parsed.align = Some(chars[0]);
            i = 1;
        }
        if let Some(&c @ ('+' | '-' | ' ')) = chars.get(i) {
            parsed.sign = c;
            i += 1;
        }
        if chars.get(i) == Some(&'#') {
            i += 1;
        }
        if chars.get(i) == Some(&'0') {
            parsed.zero = true;
            i += 1;
        }
        let digits = |i: &mut usize| {
            let start = *i;
            while chars.get(*i).is_some_and(char::is_ascii_digit) {
                *i += 1;
            }
            chars[start..*i].iter().collect::<String>()
        };
        let width = digits(&mut i);
        if !width.is_empty() {
            parsed.width = width.parse().map_err(|_| invalid())?;
        }
        if let Some(&c @ (',' | '_')) = chars.get(i) {
            parsed.grouping = Some(c);
            i += 1;
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            let precision = digits(&mut i);
            if precision.is_empty() {
                return Err(Fault::value_error("Format specifier missing precision"));
            }
            parsed.precision = Some(precision.parse().map_err(|_| invalid())?);
        }
        if let Some(&c) = chars.get(i) {
            parsed.kind = Some(c);
            i += 1;
        }
        if i != chars.len() {
            return Err(invalid());
        }
        Ok(parsed)
    }

    fn pad(&self, sign: &str, body: &str, default_align: char) -> String {
        let (fill, align) = match self.align {
            Some(align) => (self.fill, align),
            None if self.zero => ('0', '='),
            None => (self.fill, default_align),
        };
        let len = sign.chars().count() + body.chars().count();
        let missing = self.width.saturating_sub(len);
        let fill_n = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
        match align {
            '<' => format!("{sign}{body}{}", fill_n(missing)),
            '^' => format!("{}{sign}{body}{}", fill_n(missing / 2), fill_n(missing - missing / 2)),
            '=' => format!("{sign}{}{body}", fill_n(missing)),
            _ => format!("{}{sign}{body}", fill_n(missing)),
        }
    }
}

/// Python `format(value, spec)`.
pub fn format_value(value: &Value, spec: &str) -> Exec<String> {
    if spec.is_empty() {
        return Ok(value.to_str());
    }
    let spec = FormatSpec::parse(spec)?;
    let numeric = match value {
        Value::Int(_) | Value::Float(_) => true,
        Value::Bool(_) => spec.kind.is_some_and(|k| k != 's'),
        _ => false,
    };
    if !numeric {
        if let Some(kind) = spec.kind.filter(|k| *k != 's') {
            return Err(Fault::value_error(format!(
                "Unknown format code '{kind}' for object of type '{}'",
                value.type_name()
            )));
        }
        let mut text = value.to_str();
        if let Some(precision) = spec.precision {
            text = text.chars().take(precision).collect();
        }
        return Ok(spec.pad("", &text, '<'));
    }

    let float_kind = matches!(spec.kind, Some('f' | 'F' | 'e' | 'E' | 'g' | 'G' | '%'));
    let (negative, body) = match (value.as_int(), float_kind) {
        (Some(v), false) => {
            let magnitude = v.unsigned_abs();
            let body = match spec.kind {
                None | Some('d' | 'n') => group_digits(&magnitude.to_string(), spec.grouping),
                Some('x') => format!("{magnitude:x}"),
                Some('X') => format!("{magnitude:X}"),
                Some('o') => format!("{magnitude:o}"),
                Some('b') => format!("{magnitude:b}"),
                Some(kind) => {
                    return Err(Fault::value_error(format!(
                        "Unknown format code '{kind}' for object of type 'int'"
                    )))
                }
            };
            (v < 0, body)
        }
        _ => {
            let v = value.as_float().unwrap_or_default();
            if let Some(kind @ ('d' | 'n' | 'x' | 'X' | 'o' | 'b' | 'c')) = spec.kind {
                return Err(Fault::value_error(format!(
                    "Unknown format code '{kind}' for object of type 'float'"
                )));
            }
            let body = float_body(v.abs(), spec.kind, spec.precision)?;
            (v.is_sign_negative() && !v.is_nan(), group_digits(&body, spec.grouping))
        }
    };
    let sign = match (negative, spec.sign) {
        (true, _) => "-",
        (false, '+') => "+",
        (false, ' ') => " ",
        _ => "",
    };
    Ok(spec.pad(sign, &body, '>'))
}

fn float_body(x: f64, kind: Option<char>, precision: Option<usize>) -> Exec<String> {
    let upper = kind.is_some_and(|k| k.is_ascii_uppercase());
    if !x.is_finite() {
        let text = if x.is_nan() { "nan" } else { "inf" };
        let text = if upper { text.to_uppercase() } else { text.to_string() };
        return Ok(if kind == Some('%') { format!("{text}%") } else { text });
    }
    Ok(match kind {
        Some('f' | 'F') => {
            let digits = precision.unwrap_or(6);
            format!("{x:.digits$}")
        }
        Some('%') => format!("{:.*}%", precision.unwrap_or(6), x * 100.0),
        Some('e' | 'E') => exponent_form(x, precision.unwrap_or(6), upper),
        Some('g' | 'G') => general_form(x, precision.unwrap_or(6), upper),
        None => match precision {
            Some(p) => general_form(x, p, false),
            None => format_float(x),
        },
        Some(other) => {
            return Err(Fault::value_error(format!(
                "Unknown format code '{other}' for object of type 'float'"
            )))
        }
    })
}

fn exponent_form(x: f64, precision: usize, upper: bool) -> String {
    let raw = format!("{x:.precision$e}");
    let (mantissa, exp) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let e = if upper { 'E' } else { 'e' };
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}{e}{sign}{:02}", exp.unsigned_abs())
}

fn general_form(x: f64, precision: usize, upper: bool) -> String {
    let precision = precision.max(1);
    if x == 0.0 {
        return "0".to_string();
    }
    let digits = precision - 1;
    let scientific = format!("{x:.digits$e}");
    let exp: i64 = scientific.split_once('e').and_then(|(_, e)| e.parse().ok()).unwrap_or(0);
    let limit = i64::try_from(precision).unwrap_or(i64::MAX);
    if (-4..limit).contains(&exp) {
        let decimals = usize::try_from(limit - 1 - exp).unwrap_or(0);
        strip_zeros(&format!("{x:.decimals$}"))
    } else {
        let text = exponent_form(x, precision - 1, upper);
        let e = if upper { 'E' } else { 'e' };
        match text.split_once(e) {
            Some((mantissa, exp)) => format!("{}{e}{exp}", strip_zeros(mantissa)),
            None => text,
        }
    }
}

fn strip_zeros(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

fn group_digits(body: &str, separator: Option<char>) -> String {
    let Some(separator) = separator else {
        return body.to_string();
    };
    let split = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
    let (int_part, rest) = body.split_at(split);
    let mut grouped = String::with_capacity(body.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(separator);
        }
        grouped.push(c);
    }
    grouped.push_str(rest);
    grouped
}

/// `str.format`: `{}`, `{0}`, `{name}`, conversions and format specs.
pub fn format_template(template: &str, args: &CallArgs) -> Exec<String> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut auto_index = 0usize;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '}' => return Err(Fault::value_error("Single '}' encountered in format string")),
            '{' => {
                let start = i + 1;
                let mut depth = 1;
                let mut end = start;
                while end < chars.len() {
                    match chars[end] {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(Fault::value_error("expected '}' before end of string"));
                }
                let field: String = chars[start..end].iter().collect();
                i = end + 1;

                let (head, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                let (name, conversion) = match head.split_once('!') {
                    Some((name, conv)) => (name, conv.chars().next()),
                    None => (head, None),
                };
                let value = if name.is_empty() {
                    let value = args.positional.get(auto_index);
                    auto_index += 1;
                    value.ok_or_else(|| {
                        Fault::index_error(format!("Replacement index {} out of range", auto_index - 1))
                    })?
                } else if let Ok(index) = name.parse::<usize>() {
                    args.positional
                        .get(index)
                        .ok_or_else(|| Fault::index_error(format!("Replacement index {index} out of range")))?
                } else {
                    args.keyword(name)
                        .ok_or_else(|| Fault::raise(ExcKind::KeyError, format!("'{name}'")))?
                };
                let converted = match conversion {
                    Some('r' | 'a') => Value::str(value.repr()),
                    Some('s') => Value::str(value.to_str()),
                    Some(other) => {
                        return Err(Fault::value_error(format!(
                            "Unknown conversion specifier {other}"
                        )))
                    }
                    None => value.clone(),
                };
                out.push_str(&format_value(&converted, spec)?);
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Python `template % args`.
pub fn percent_format(template: &str, args: &Value) -> Exec<String> {
    let mapping = match args {
        Value::Dict(map) => Some(map),
        _ => None,
    };
    let items: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    let incomplete = || Fault::value_error("incomplete format");
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut next = 0usize;
    let mut i = 0;
    let take = |next: &mut usize| -> Exec<Value> {
        let value = items
            .get(*next)
            .cloned()
            .ok_or_else(|| Fault::type_error("not enough arguments for format string"))?;
        *next += 1;
        Ok(value)
    };

    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        if chars.get(i) == Some(&'%') {
            out.push('%');
            i += 1;
            continue;
        }
        let mut key = None;
        if chars.get(i) == Some(&'(') {
            let close = chars[i..].iter().position(|&c| c == ')').ok_or_else(incomplete)?;
            key = Some(chars[i + 1..i + close].iter().collect::<String>());
            i += close + 1;
        }
        let mut flags = String::new();
        while let Some(&c @ ('-' | '+' | ' ' | '0' | '#')) = chars.get(i) {
            flags.push(c);
            i += 1;
        }
        let mut width = String::new();
        if chars.get(i) == Some(&'*') {
            width = expect_int(&take(&mut next)?, "%")?.to_string();
            i += 1;
        }
        while let Some(&c) = chars.get(i).filter(|c| c.is_ascii_digit()) {
            width.push(c);
            i += 1;
        }
        let mut precision = None;
        if chars.get(i) == Some(&'.') {
            i += 1;
            let mut digits = String::new();
            while let Some(&c) = chars.get(i).filter(|c| c.is_ascii_digit()) {
                digits.push(c);
                i += 1;
            }
            precision = Some(if digits.is_empty() { "0".to_string() } else { digits });
        }
        let conversion = *chars.get(i).ok_or_else(incomplete)?;
        i += 1;

        let value = match (&key, mapping) {
            (Some(key), Some(map)) => map
                .borrow()
                .get(&DictKey::Str(key.as_str().into()))
                .cloned()
                .ok_or_else(|| Fault::raise(ExcKind::KeyError, format!("'{key}'")))?,
            (Some(_), None) => return Err(Fault::type_error("format requires a mapping")),
            (None, _) => take(&mut next)?,
        };
        let (value, kind) = match conversion {
            's' => (Value::str(value.to_str()), None),
            'r' | 'a' => (Value::str(value.repr()), None),
            'd' | 'i' | 'u' => match &value {
                Value::Float(v) => (to_int(&Value::Float(*v), None)?, Some('d')),
                v if v.as_int().is_some() => (Value::Int(v.as_int().unwrap_or_default()), Some('d')),
                v => {
                    return Err(Fault::type_error(format!(
                        "%{conversion} format: a real number is required, not {}",
                        v.type_name()
                    )))
                }
            },
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'x' | 'X' | 'o' => (value, Some(conversion)),
            other => {
                return Err(Fault::value_error(format!(
                    "unsupported format character '{other}'"
                )))
            }
        };
        let mut spec = String::new();
        if flags.contains('-') {
            spec.push('<');
        }
        if flags.contains('+') {
            spec.push('+');
        } else if flags.contains(' ') {
            spec.push(' ');
        }
        if flags.contains('0') && !flags.contains('-') && kind.is_some() {
            spec.push('0');
        }
        spec.push_str(&width);
        if let Some(precision) = &precision {
            spec.push('.');
            spec.push_str(precision);
        }
        if let Some(kind) = kind {
            spec.push(kind);
        }
        if kind.is_none() && !flags.contains('-') && !width.is_empty() {
            spec.insert(0, '>');
        }
        out.push_str(&format_value(&value, &spec)?);
    }
    if mapping.is_none() && next < items.len() {
        return Err(Fault::type_error("not all arguments converted during string formatting"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(value: Value, spec: &str) -> String {
        format_value(&value, spec).unwrap()
    }

    #[test]
    fn builtin_names_round_trip() {
        for builtin in Builtin::ALL {
            assert_eq!(Builtin::from_name(builtin.name()), Some(builtin));
        }
        assert!(global("ValueError").is_some());
        assert!(global("open").is_none());
    }

    #[test]
    fn format_spec_numbers() {
        assert_eq!(fmt(Value::Float(3.14159), ".2f"), "3.14");
        assert_eq!(fmt(Value::Int(42), "05d"), "00042");
        assert_eq!(fmt(Value::Int(-42), "05d"), "-0042");
        assert_eq!(fmt(Value::Int(1_234_567), ","), "1,234,567");
        assert_eq!(fmt(Value::Float(0.25), ".1%"), "25.0%");
        assert_eq!(fmt(Value::Float(1500.0), ".2e"), "1.50e+03");
        assert_eq!(fmt(Value::Float(0.000_123_4), "g"), "0.0001234");
        assert_eq!(fmt(Value::Int(255), "x"), "ff");
        assert_eq!(fmt(Value::Int(5), "+d"), "+5");
    }

    #[test]
    fn format_spec_alignment() {
        assert_eq!(fmt(Value::str("ab"), "<5"), "ab   ");
        assert_eq!(fmt(Value::str("ab"), ">5"), "   ab");
        assert_eq!(fmt(Value::str("ab"), "*^6"), "**ab**");
        assert_eq!(fmt(Value::Int(7), "3"), "  7");
        assert_eq!(fmt(Value::str("abcdef"), ".3"), "abc");
        assert!(format_value(&Value::str("a"), "d").is_err());
    }

    #[test]
    fn percent_formatting() {
        let args = Value::tuple(vec![Value::str("cat"), Value::Int(3), Value::Float(0.5)]);
        assert_eq!(percent_format("%s has %d lives, %.2f%%", &args).unwrap(), "cat has 3 lives, 0.50%");
        assert_eq!(percent_format("[%5s]", &Value::str("ab")).unwrap(), "[   ab]");
        assert_eq!(percent_format("[%-4d]", &Value::Int(7)).unwrap(), "[7   ]");
        assert!(percent_format("%s %s", &Value::str("one")).is_err());
        assert!(percent_format("%s", &Value::tuple(vec![Value::Int(1), Value::Int(2)])).is_err());
    }

    #[test]
    fn str_format_fields() {
        let args = CallArgs {
            positional: vec![Value::str("a"), Value::Int(2)],
            keywords: vec![("who".to_string(), Value::str("bob"))],
        };
        assert_eq!(format_template("{} {} {who!r} {{x}} {1:03d}", &args).unwrap(), "a 2 'bob' {x} 002");
        assert!(format_template("{5}", &args).is_err());
    }

    #[test]
    fn whitespace_split_with_limit() {
        assert_eq!(split_whitespace("  a b  c ", -1), vec!["a", "b", "c"]);
        assert_eq!(split_whitespace("a b  c ", 1), vec!["a", "b  c "]);
        assert!(split_whitespace("   ", -1).is_empty());
    }

    #[test]
    fn rounding_is_half_even() {
        assert!(round(&Value::Float(2.5), None).unwrap().py_eq(&Value::Int(2)));
        assert!(round(&Value::Float(3.5), None).unwrap().py_eq(&Value::Int(4)));
        assert!(round(&Value::Float(-0.4), None).unwrap().py_eq(&Value::Int(0)));
        assert!(round(&Value::Float(1.2345), Some(2)).unwrap().py_eq(&Value::Float(1.23)));
    }

    #[test]
    fn numeric_conversions() {
        assert!(to_int(&Value::str(" 42 "), None).unwrap().py_eq(&Value::Int(42)));
        assert!(to_int(&Value::str("ff"), Some(16)).unwrap().py_eq(&Value::Int(255)));
        assert!(to_int(&Value::Float(-3.9), None).unwrap().py_eq(&Value::Int(-3)));
        assert!(to_int(&Value::str("3.5"), None).is_err());
        assert!(to_float(&Value::str("2.5")).unwrap().py_eq(&Value::Float(2.5)));
        assert!(to_float(&Value::str("abc")).is_err());
    }

    #[test]
    fn title_and_groups() {
        assert_eq!(title_case("hello wORLD-x"), "Hello World-X");
        assert_eq!(group_digits("1234567.89", Some(',')), "1,234,567.89");
        assert_eq!(group_digits("123", Some('_')), "123");
    }
}
