//! Tree-walking evaluator.
//!
//! One [`Interpreter`] is built per program invocation. It owns the
//! invocation's global scope; dropping it clears every scope it created so
//! closures that reference their own defining scope do not outlive the run.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::config::ExecutorConfig;
use crate::error::ProgramError;
use crate::value::{BoundMethod, DictKey, DictMap, ExcKind, Exception, Value, ValueIter};

use super::ast::{
    Arg, BinOp, Block, BoolOp, CmpOp, Comprehension, Constant, Expr, ExprKind, FStringPart, FunctionDef, Handler,
    ParamKind, Stmt, StmtKind, Target, UnaryOp,
};
use super::builtins;
use super::capabilities::{self, Bindings};

pub type Exec<T> = Result<T, Fault>;

/// Abnormal completion of an evaluation.
#[derive(Debug, Clone)]
pub enum Fault {
    /// A program-level exception; `try/except` can catch it. A line of 0
    /// is filled in by the statement it propagates through.
    Raised {
        kind: ExcKind,
        message: String,
        line: usize,
    },
    /// Resource limits; never catchable.
    Fatal(ProgramError),
}

impl Fault {
    pub fn raise(kind: ExcKind, message: impl Into<String>) -> Self {
        Self::Raised {
            kind,
            message: message.into(),
            line: 0,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::raise(ExcKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::raise(ExcKind::ValueError, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::raise(ExcKind::IndexError, message)
    }

    pub fn attribute_error(value: &Value, name: &str) -> Self {
        Self::raise(
            ExcKind::AttributeError,
            format!("'{}' object has no attribute '{name}'", value.type_name()),
        )
    }

    #[must_use]
    pub fn at(self, line: usize) -> Self {
        match self {
            Self::Raised { kind, message, line: 0 } => Self::Raised { kind, message, line },
            other => other,
        }
    }

    /// Converts an uncaught fault into the error recorded for the sample.
    #[must_use]
    pub fn into_program_error(self) -> ProgramError {
        match self {
            Self::Raised { kind, message, line } if message.is_empty() => ProgramError::runtime(line, kind.name()),
            Self::Raised { kind, message, line } => ProgramError::runtime(line, format!("{}: {message}", kind.name())),
            Self::Fatal(err) => err,
        }
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl CallArgs {
    #[must_use]
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            keywords: Vec::new(),
        }
    }

    /// The argument at `index`, or passed as keyword `name`.
    #[must_use]
    pub fn arg(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.keyword(name))
    }

    #[must_use]
    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn required(&self, func: &str, index: usize, name: &str) -> Exec<&Value> {
        self.arg(index, name)
            .ok_or_else(|| Fault::type_error(format!("{func}() missing required argument: '{name}'")))
    }

    /// Rejects surplus positionals, unknown keywords, and parameters given
    /// both ways. `params` lists the accepted parameter names in order.
    pub fn check(&self, func: &str, params: &[&str]) -> Exec<()> {
        if self.positional.len() > params.len() {
            return Err(Fault::type_error(format!(
                "{func}() takes at most {} arguments ({} given)",
                params.len(),
                self.positional.len()
            )));
        }
        for (name, _) in &self.keywords {
            match params.iter().position(|p| p == name) {
                None => {
                    return Err(Fault::type_error(format!(
                        "{func}() got an unexpected keyword argument '{name}'"
                    )))
                }
                Some(i) if i < self.positional.len() => {
                    return Err(Fault::type_error(format!(
                        "{func}() got multiple values for argument '{name}'"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// A variable scope. Lookups walk to the parent; writes stay local.
#[derive(Default)]
pub struct Env {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Env>>,
}

impl Env {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    pub fn set(&self, name: &str, value: Value) {
        let old = self.vars.borrow_mut().insert(name.to_string(), value);
        drop(old);
    }

    fn remove(&self, name: &str) -> Option<Value> {
        self.vars.borrow_mut().remove(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.lookup(name)
    }
}

/// A user-defined function and the scope it closes over.
pub struct Closure {
    pub def: Rc<FunctionDef>,
    env: Rc<Env>,
    defaults: Vec<Option<Value>>,
}

impl Closure {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub(crate) fn take_defaults(&mut self) -> impl Iterator<Item = Value> + '_ {
        self.defaults.drain(..).flatten()
    }
}

pub struct Interpreter<'a> {
    bindings: &'a Bindings,
    globals: Rc<Env>,
    step_limit: u64,
    max_depth: usize,
    steps: Cell<u64>,
    depth: Cell<usize>,
    line: Cell<usize>,
    handling: RefCell<Vec<Exception>>,
    scopes: RefCell<Vec<Weak<Env>>>,
}

impl<'a> Interpreter<'a> {
    #[must_use]
    pub fn new(bindings: &'a Bindings, config: &ExecutorConfig) -> Self {
        let globals = Rc::new(Env::default());
        let scopes = RefCell::new(vec![Rc::downgrade(&globals)]);
        Self {
            bindings,
            globals,
            step_limit: config.step_limit,
            max_depth: config.max_call_depth,
            steps: Cell::new(0),
            depth: Cell::new(0),
            line: Cell::new(0),
            handling: RefCell::new(Vec::new()),
            scopes,
        }
    }

    #[must_use]
    pub const fn bindings(&self) -> &Bindings {
        self.bindings
    }

    #[must_use]
    pub const fn globals(&self) -> &Rc<Env> {
        &self.globals
    }

    /// Steps taken so far.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps.get()
    }

    fn scope(&self, parent: &Rc<Env>) -> Rc<Env> {
        let env = Rc::new(Env {
            vars: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
        });
        let mut scopes = self.scopes.borrow_mut();
        if scopes.len() >= 64 && scopes.len().is_power_of_two() {
            scopes.retain(|w| w.strong_count() > 0);
        }
        scopes.push(Rc::downgrade(&env));
        env
    }

    fn tick(&self) -> Exec<()> {
        let steps = self.steps.get() + 1;
        self.steps.set(steps);
        if steps > self.step_limit {
            return Err(Fault::Fatal(ProgramError::StepLimit { limit: self.step_limit }));
        }
        Ok(())
    }

    /// Runs module-level statements in the global scope.
    pub fn run_module(&self, body: &Block) -> Exec<()> {
        self.exec_block(body, &self.globals).map(|_| ())
    }

    /// Binds `def` in the global scope and returns the function value.
    pub fn define(&self, def: &Rc<FunctionDef>) -> Exec<Value> {
        let function = self.make_closure(def, &self.globals)?;
        self.globals.set(&def.name, function.clone());
        Ok(function)
    }

    // ---- statements ----

    fn exec_block(&self, block: &Block, env: &Rc<Env>) -> Exec<Flow> {
        for stmt in block {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&self, stmt: &Stmt, env: &Rc<Env>) -> Exec<Flow> {
        self.tick()?;
        self.line.set(stmt.line);
        self.exec_kind(&stmt.kind, env).map_err(|fault| fault.at(stmt.line))
    }

    fn exec_kind(&self, kind: &StmtKind, env: &Rc<Env>) -> Exec<Flow> {
        match kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, env)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, env)?;
                for target in targets {
                    self.assign(target, value.clone(), env)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value, env)?,
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test, env)?.truthy() {
                        return self.exec_block(body, env);
                    }
                }
                if let Some(body) = orelse {
                    return self.exec_block(body, env);
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter, env)?;
                for item in self.iterate(&iterable)? {
                    self.tick()?;
                    self.assign(target, item, env)?;
                    match self.exec_block(body, env)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                if let Some(body) = orelse {
                    return self.exec_block(body, env);
                }
            }
            StmtKind::While { test, body, orelse } => {
                loop {
                    self.tick()?;
                    if !self.eval(test, env)?.truthy() {
                        break;
                    }
                    match self.exec_block(body, env)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                if let Some(body) = orelse {
                    return self.exec_block(body, env);
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::FunctionDef(def) => {
                let function = self.make_closure(def, env)?;
                env.set(&def.name, function);
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finally,
            } => {
                let outcome = self.exec_try(body, handlers, orelse.as_ref(), env);
                if let Some(finally) = finally {
                    if !matches!(outcome, Err(Fault::Fatal(_))) {
                        match self.exec_block(finally, env)? {
                            Flow::Normal => {}
                            flow => return Ok(flow),
                        }
                    }
                }
                return outcome;
            }
            StmtKind::Raise(exc) => return Err(self.raise(exc.as_ref(), env)?),
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, env)?.truthy() {
                    let message = match msg {
                        Some(msg) => self.eval(msg, env)?.to_str(),
                        None => String::new(),
                    };
                    return Err(Fault::raise(ExcKind::AssertionError, message));
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(target, env)?;
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &self,
        body: &Block,
        handlers: &[Handler],
        orelse: Option<&Block>,
        env: &Rc<Env>,
    ) -> Exec<Flow> {
        match self.exec_block(body, env) {
            Ok(Flow::Normal) => match orelse {
                Some(block) => self.exec_block(block, env),
                None => Ok(Flow::Normal),
            },
            Ok(flow) => Ok(flow),
            Err(Fault::Raised { kind, message, line }) => {
                for handler in handlers {
                    let caught = match &handler.kind {
                        None => true,
                        Some(expr) => {
                            let class = self.eval(expr, env).map_err(|f| f.at(handler.line))?;
                            exception_matches(kind, &class).map_err(|f| f.at(handler.line))?
                        }
                    };
                    if !caught {
                        continue;
                    }
                    let exception = Exception { kind, message };
                    if let Some(name) = &handler.name {
                        env.set(name, Value::Exception(Rc::new(exception.clone())));
                    }
                    self.handling.borrow_mut().push(exception);
                    let result = self.exec_block(&handler.body, env);
                    self.handling.borrow_mut().pop();
                    return result;
                }
                Err(Fault::Raised { kind, message, line })
            }
            Err(fatal) => Err(fatal),
        }
    }

    fn raise(&self, exc: Option<&Expr>, env: &Rc<Env>) -> Exec<Fault> {
        let Some(expr) = exc else {
            return Ok(match self.handling.borrow().last() {
                Some(active) => Fault::raise(active.kind, active.message.clone()),
                None => Fault::raise(ExcKind::RuntimeError, "No active exception to reraise"),
            });
        };
        Ok(match self.eval(expr, env)? {
            Value::ExcType(kind) => Fault::raise(kind, ""),
            Value::Exception(exc) => Fault::raise(exc.kind, exc.message.clone()),
            other => Fault::type_error(format!(
                "exceptions must derive from BaseException, not '{}'",
                other.type_name()
            )),
        })
    }

    fn aug_assign(&self, target: &Target, op: BinOp, value: &Expr, env: &Rc<Env>) -> Exec<()> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name, env)?;
                let rhs = self.eval(value, env)?;
                let updated = self.inplace_op(op, &current, &rhs)?;
                env.set(name, updated);
            }
            Target::Subscript { value: object, index } => {
                let object = self.eval(object, env)?;
                let index = self.eval(index, env)?;
                let current = self.get_item(&object, &index)?;
                let rhs = self.eval(value, env)?;
                let updated = self.inplace_op(op, &current, &rhs)?;
                self.set_item(&object, &index, updated)?;
            }
            Target::Attribute { value: object, name } => {
                let object = self.eval(object, env)?;
                return Err(Fault::attribute_error(&object, name));
            }
            Target::Tuple(_) => {
                return Err(Fault::type_error("illegal expression for augmented assignment"));
            }
        }
        Ok(())
    }

    fn inplace_op(&self, op: BinOp, current: &Value, rhs: &Value) -> Exec<Value> {
        if let (BinOp::Add, Value::List(items)) = (op, current) {
            let extra: Vec<Value> = self.iterate(rhs)?.collect();
            items.borrow_mut().extend(extra);
            return Ok(current.clone());
        }
        binary_op(op, current, rhs)
    }

    fn assign(&self, target: &Target, value: Value, env: &Rc<Env>) -> Exec<()> {
        match target {
            Target::Name(name) => env.set(name, value),
            Target::Subscript { value: object, index } => {
                let object = self.eval(object, env)?;
                if matches!(index.kind, ExprKind::Slice { .. }) {
                    return Err(Fault::type_error("slice assignment is not supported"));
                }
                let index = self.eval(index, env)?;
                self.set_item(&object, &index, value)?;
            }
            Target::Attribute { value: object, name } => {
                let object = self.eval(object, env)?;
                return Err(Fault::attribute_error(&object, name));
            }
            Target::Tuple(targets) => {
                let items: Vec<Value> = self.iterate(&value)?.collect();
                if items.len() != targets.len() {
                    let message = if items.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    };
                    return Err(Fault::value_error(message));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, env)?;
                }
            }
        }
        Ok(())
    }

    fn delete(&self, target: &Target, env: &Rc<Env>) -> Exec<()> {
        match target {
            Target::Name(name) => {
                if env.remove(name).is_none() {
                    return Err(Fault::raise(ExcKind::NameError, format!("name '{name}' is not defined")));
                }
            }
            Target::Subscript { value, index } => {
                let object = self.eval(value, env)?;
                let index = self.eval(index, env)?;
                match &object {
                    Value::List(items) => {
                        let len = items.borrow().len();
                        let i = sequence_index(&index, len, "list")?;
                        let removed = items.borrow_mut().remove(i);
                        drop(removed);
                    }
                    Value::Dict(map) => {
                        let key = hash_key(&index)?;
                        let removed = map.borrow_mut().shift_remove(&key);
                        if removed.is_none() {
                            return Err(Fault::raise(ExcKind::KeyError, index.repr()));
                        }
                    }
                    other => {
                        return Err(Fault::type_error(format!(
                            "'{}' object doesn't support item deletion",
                            other.type_name()
                        )))
                    }
                }
            }
            Target::Attribute { value, name } => {
                let object = self.eval(value, env)?;
                return Err(Fault::attribute_error(&object, name));
            }
            Target::Tuple(targets) => {
                for target in targets {
                    self.delete(target, env)?;
                }
            }
        }
        Ok(())
    }

    // ---- expressions ----

    fn lookup(&self, name: &str, env: &Rc<Env>) -> Exec<Value> {
        if let Some(value) = env.lookup(name) {
            return Ok(value);
        }
        builtins::global(name)
            .ok_or_else(|| Fault::raise(ExcKind::NameError, format!("name '{name}' is not defined")))
    }

    fn eval(&self, expr: &Expr, env: &Rc<Env>) -> Exec<Value> {
        match &expr.kind {
            ExprKind::Constant(constant) => Ok(match constant {
                Constant::None => Value::None,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(v) => Value::Int(*v),
                Constant::Float(v) => Value::Float(*v),
                Constant::Str(s) => Value::Str(Rc::clone(s)),
            }),
            ExprKind::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(text) => out.push_str(text),
                        FStringPart::Field {
                            expr,
                            conversion,
                            spec,
                        } => {
                            let mut value = self.eval(expr, env)?;
                            match conversion {
                                Some('r' | 'a') => value = Value::str(value.repr()),
                                Some(_) => value = Value::str(value.to_str()),
                                None => {}
                            }
                            out.push_str(&builtins::format_value(&value, spec.as_deref().unwrap_or(""))?);
                        }
                    }
                }
                Ok(Value::str(out))
            }
            ExprKind::Name(name) => self.lookup(name, env),
            ExprKind::List(items) => Ok(Value::list(self.eval_all(items, env)?)),
            ExprKind::Tuple(items) => Ok(Value::tuple(self.eval_all(items, env)?)),
            ExprKind::Dict(pairs) => {
                let mut map = DictMap::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = hash_key(&self.eval(key, env)?)?;
                    let value = self.eval(value, env)?;
                    map.insert(key, value);
                }
                Ok(Value::dict(map))
            }
            ExprKind::Attribute { value, name } => {
                let object = self.eval(value, env)?;
                self.get_attr(&object, name)
            }
            ExprKind::Subscript { value, index } => {
                let object = self.eval(value, env)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let bound = |e: &Option<Box<Expr>>| -> Exec<Option<i64>> {
                        match e {
                            None => Ok(None),
                            Some(e) => match self.eval(e, env)? {
                                Value::None => Ok(None),
                                v => v
                                    .as_int()
                                    .map(Some)
                                    .ok_or_else(|| Fault::type_error("slice indices must be integers or None")),
                            },
                        }
                    };
                    let (lower, upper, step) = (bound(lower)?, bound(upper)?, bound(step)?);
                    return slice(&object, lower, upper, step);
                }
                let index = self.eval(index, env)?;
                self.get_item(&object, &index)
            }
            ExprKind::Slice { .. } => Err(Fault::type_error("slice used outside of a subscript")),
            ExprKind::Call { func, args } => {
                if let ExprKind::Attribute { value, name } = &func.kind {
                    let receiver = self.eval(value, env)?;
                    let args = self.eval_args(args, env)?;
                    return self.call_method(&receiver, name, args);
                }
                let func = self.eval(func, env)?;
                let args = self.eval_args(args, env)?;
                self.call_value(&func, args)
            }
            ExprKind::BinOp { op, left, right } => {
                let left = self.eval(left, env)?;
                let right = self.eval(right, env)?;
                binary_op(*op, &left, &right)
            }
            ExprKind::UnaryOp { op, operand } => {
                let value = self.eval(operand, env)?;
                unary_op(*op, &value)
            }
            ExprKind::BoolOp { op, left, right } => {
                let left = self.eval(left, env)?;
                match (op, left.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(left),
                    _ => self.eval(right, env),
                }
            }
            ExprKind::Compare { left, ops } => {
                let mut left = self.eval(left, env)?;
                for (op, right) in ops {
                    let right = self.eval(right, env)?;
                    if !self.compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::IfExp { test, body, orelse } => {
                if self.eval(test, env)?.truthy() {
                    self.eval(body, env)
                } else {
                    self.eval(orelse, env)
                }
            }
            ExprKind::Lambda(def) => self.make_closure(def, env),
            ExprKind::ListComp { elt, generators } => {
                let scope = self.scope(env);
                let mut out = Vec::new();
                self.comprehend(generators, &scope, &mut |scope: &Rc<Env>| {
                    out.push(self.eval(elt, scope)?);
                    Ok(())
                })?;
                Ok(Value::list(out))
            }
            ExprKind::DictComp { key, value, generators } => {
                let scope = self.scope(env);
                let mut map = DictMap::new();
                self.comprehend(generators, &scope, &mut |scope: &Rc<Env>| {
                    let k = hash_key(&self.eval(key, scope)?)?;
                    let v = self.eval(value, scope)?;
                    map.insert(k, v);
                    Ok(())
                })?;
                Ok(Value::dict(map))
            }
        }
    }

    fn eval_all(&self, exprs: &[Expr], env: &Rc<Env>) -> Exec<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e, env)).collect()
    }

    fn comprehend(
        &self,
        generators: &[Comprehension],
        env: &Rc<Env>,
        emit: &mut dyn FnMut(&Rc<Env>) -> Exec<()>,
    ) -> Exec<()> {
        let Some((first, rest)) = generators.split_first() else {
            return emit(env);
        };
        let iterable = self.eval(&first.iter, env)?;
        'items: for item in self.iterate(&iterable)? {
            self.tick()?;
            self.assign(&first.target, item, env)?;
            for condition in &first.ifs {
                if !self.eval(condition, env)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehend(rest, env, emit)?;
        }
        Ok(())
    }

    fn eval_args(&self, args: &[Arg], env: &Rc<Env>) -> Exec<CallArgs> {
        let mut call = CallArgs::default();
        let push_keyword = |call: &mut CallArgs, name: String, value: Value| {
            if call.keywords.iter().any(|(k, _)| *k == name) {
                return Err(Fault::type_error(format!("keyword argument repeated: {name}")));
            }
            call.keywords.push((name, value));
            Ok(())
        };
        for arg in args {
            match arg {
                Arg::Positional(expr) => call.positional.push(self.eval(expr, env)?),
                Arg::Keyword(name, expr) => {
                    let value = self.eval(expr, env)?;
                    push_keyword(&mut call, name.clone(), value)?;
                }
                Arg::Star(expr) => {
                    let value = self.eval(expr, env)?;
                    call.positional.extend(self.iterate(&value)?);
                }
                Arg::DoubleStar(expr) => {
                    let Value::Dict(map) = self.eval(expr, env)? else {
                        return Err(Fault::type_error("argument after ** must be a mapping"));
                    };
                    let entries: Vec<(DictKey, Value)> =
                        map.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    for (key, value) in entries {
                        let DictKey::Str(name) = key else {
                            return Err(Fault::type_error("keywords must be strings"));
                        };
                        push_keyword(&mut call, name.to_string(), value)?;
                    }
                }
            }
        }
        Ok(call)
    }

    // ---- calls ----

    fn make_closure(&self, def: &Rc<FunctionDef>, env: &Rc<Env>) -> Exec<Value> {
        let defaults = def
            .params
            .iter()
            .map(|p| p.default.as_ref().map(|d| self.eval(d, env)).transpose())
            .collect::<Exec<Vec<_>>>()?;
        Ok(Value::Function(Rc::new(Closure {
            def: Rc::clone(def),
            env: Rc::clone(env),
            defaults,
        })))
    }

    /// Calls any callable value.
    pub fn call_value(&self, func: &Value, args: CallArgs) -> Exec<Value> {
        match func {
            Value::Function(closure) => self.call_closure(closure, args),
            Value::Builtin(builtin) => builtins::call(self, *builtin, args),
            Value::Method(method) => self.call_method(&method.receiver, &method.name, args),
            Value::ExcType(kind) => {
                let message = match args.positional.as_slice() {
                    [] => String::new(),
                    [single] => single.to_str(),
                    many => Value::tuple(many.to_vec()).to_str(),
                };
                Ok(Value::Exception(Rc::new(Exception { kind: *kind, message })))
            }
            other => Err(Fault::type_error(format!("'{}' object is not callable", other.type_name()))),
        }
    }

    /// Convenience for callbacks such as sort keys.
    pub fn call1(&self, func: &Value, arg: Value) -> Exec<Value> {
        self.call_value(func, CallArgs::positional(vec![arg]))
    }

    fn call_closure(&self, closure: &Closure, args: CallArgs) -> Exec<Value> {
        self.tick()?;
        let depth = self.depth.get() + 1;
        if depth > self.max_depth {
            return Err(Fault::Fatal(ProgramError::runtime(
                self.line.get(),
                format!("maximum call depth of {} exceeded", self.max_depth),
            )));
        }
        let env = self.scope(&closure.env);
        self.bind_params(closure, args, &env)?;
        self.depth.set(depth);
        let result = self.exec_block(&closure.def.body, &env);
        self.depth.set(depth - 1);
        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }

    fn bind_params(&self, closure: &Closure, args: CallArgs, env: &Env) -> Exec<()> {
        let func = closure.name();
        let mut keywords = args.keywords;
        let mut positional = args.positional.into_iter();
        let mut after_varargs = false;
        let mut kwargs_name = None;

        for (param, default) in closure.def.params.iter().zip(&closure.defaults) {
            match param.kind {
                ParamKind::Normal => {
                    let by_position = if after_varargs { None } else { positional.next() };
                    let by_keyword = keywords
                        .iter()
                        .position(|(k, _)| *k == param.name)
                        .map(|i| keywords.remove(i).1);
                    let value = match (by_position, by_keyword) {
                        (Some(_), Some(_)) => {
                            return Err(Fault::type_error(format!(
                                "{func}() got multiple values for argument '{}'",
                                param.name
                            )))
                        }
                        (Some(v), None) | (None, Some(v)) => v,
                        (None, None) => default.clone().ok_or_else(|| {
                            Fault::type_error(format!("{func}() missing required argument: '{}'", param.name))
                        })?,
                    };
                    env.set(&param.name, value);
                }
                ParamKind::VarArgs => {
                    after_varargs = true;
                    env.set(&param.name, Value::tuple(positional.by_ref().collect()));
                }
                ParamKind::KwArgs => kwargs_name = Some(param.name.as_str()),
            }
        }

        let surplus = positional.count();
        if surplus > 0 {
            return Err(Fault::type_error(format!(
                "{func}() got {surplus} more positional argument(s) than it accepts"
            )));
        }
        match kwargs_name {
            Some(name) => {
                let map = keywords
                    .into_iter()
                    .map(|(k, v)| (DictKey::Str(k.into()), v))
                    .collect();
                env.set(name, Value::dict(map));
            }
            None => {
                if let Some((k, _)) = keywords.first() {
                    return Err(Fault::type_error(format!("{func}() got an unexpected keyword argument '{k}'")));
                }
            }
        }
        Ok(())
    }

    /// `receiver.name(args)`.
    pub fn call_method(&self, receiver: &Value, name: &str, args: CallArgs) -> Exec<Value> {
        match receiver {
            Value::Str(s) => builtins::str_method(self, s, name, args),
            Value::List(items) => builtins::list_method(self, items, name, args),
            Value::Dict(map) => builtins::dict_method(self, map, name, args),
            Value::Tuple(items) => builtins::tuple_method(items, name, args),
            Value::Frame(frame) => capabilities::frame_method(self, frame, name, args),
            Value::Segment(segment) => capabilities::segment_method(self, segment, name, args),
            other => {
                let attr = self.get_attr(other, name)?;
                self.call_value(&attr, args)
            }
        }
    }

    /// `value.name`.
    pub fn get_attr(&self, value: &Value, name: &str) -> Exec<Value> {
        let property = match value {
            Value::Frame(frame) => capabilities::frame_property(frame, name),
            Value::Segment(segment) => capabilities::segment_property(segment, name),
            Value::Exception(exc) if name == "args" => Some(Value::tuple(vec![Value::str(exc.message.as_str())])),
            _ => None,
        };
        if let Some(property) = property {
            return Ok(property);
        }
        if builtins::has_method(value, name) || capabilities::has_method(value, name) {
            return Ok(Value::Method(Rc::new(BoundMethod {
                receiver: value.clone(),
                name: name.to_string(),
            })));
        }
        Err(Fault::attribute_error(value, name))
    }

    // ---- containers ----

    /// Iterates any iterable value. Lists and dicts are snapshotted.
    pub fn iterate(&self, value: &Value) -> Exec<ValueIter> {
        Ok(match value {
            Value::List(items) => Box::new(items.borrow().clone().into_iter()),
            Value::Tuple(items) => Box::new(items.to_vec().into_iter()),
            Value::Str(s) => Box::new(
                s.chars()
                    .map(|c| Value::str(c.to_string()))
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
            Value::Dict(map) => Box::new(map.borrow().keys().map(DictKey::to_value).collect::<Vec<_>>().into_iter()),
            Value::Iter(it) => {
                let it = Rc::clone(it);
                Box::new(std::iter::from_fn(move || it.borrow_mut().next()))
            }
            other => return Err(Fault::type_error(format!("'{}' object is not iterable", other.type_name()))),
        })
    }

    pub fn get_item(&self, object: &Value, index: &Value) -> Exec<Value> {
        match object {
            Value::List(items) => {
                let items = items.borrow();
                let i = sequence_index(index, items.len(), "list")?;
                Ok(items[i].clone())
            }
            Value::Tuple(items) => {
                let i = sequence_index(index, items.len(), "tuple")?;
                Ok(items[i].clone())
            }
            Value::Str(s) => {
                let count = s.chars().count();
                let i = sequence_index(index, count, "string")?;
                Ok(s.chars().nth(i).map_or(Value::None, |c| Value::str(c.to_string())))
            }
            Value::Dict(map) => {
                let key = hash_key(index)?;
                map.borrow()
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| Fault::raise(ExcKind::KeyError, index.repr()))
            }
            Value::Video(video) => {
                let i = sequence_index(index, video.len(), "video")?;
                Ok(capabilities::video_frame(self, video, i))
            }
            other => Err(Fault::type_error(format!("'{}' object is not subscriptable", other.type_name()))),
        }
    }

    fn set_item(&self, object: &Value, index: &Value, value: Value) -> Exec<()> {
        match object {
            Value::List(items) => {
                let len = items.borrow().len();
                let i = sequence_index(index, len, "list assignment")?;
                let old = std::mem::replace(&mut items.borrow_mut()[i], value);
                drop(old);
                Ok(())
            }
            Value::Dict(map) => {
                let key = hash_key(index)?;
                let old = map.borrow_mut().insert(key, value);
                drop(old);
                Ok(())
            }
            other => Err(Fault::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn compare(&self, op: CmpOp, left: &Value, right: &Value) -> Exec<bool> {
        Ok(match op {
            CmpOp::Eq => left.py_eq(right),
            CmpOp::NotEq => !left.py_eq(right),
            CmpOp::Is => left.is_same(right),
            CmpOp::IsNot => !left.is_same(right),
            CmpOp::In => self.contains(right, left)?,
            CmpOp::NotIn => !self.contains(right, left)?,
            CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
                let Some(ordering) = left.py_cmp(right) else {
                    if left.as_float().is_some() && right.as_float().is_some() {
                        return Ok(false);
                    }
                    let symbol = match op {
                        CmpOp::Lt => "<",
                        CmpOp::LtE => "<=",
                        CmpOp::Gt => ">",
                        _ => ">=",
                    };
                    return Err(Fault::type_error(format!(
                        "'{symbol}' not supported between instances of '{}' and '{}'",
                        left.type_name(),
                        right.type_name()
                    )));
                };
                match op {
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::LtE => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }
            }
        })
    }

    /// Python `item in container`.
    pub fn contains(&self, container: &Value, item: &Value) -> Exec<bool> {
        match container {
            Value::Str(haystack) => match item {
                Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
                other => Err(Fault::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::List(items) => Ok(items.borrow().iter().any(|v| v.py_eq(item))),
            Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
            Value::Dict(map) => Ok(map.borrow().contains_key(&hash_key(item)?)),
            Value::Iter(_) => {
                for value in self.iterate(container)? {
                    self.tick()?;
                    if value.py_eq(item) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            other => Err(Fault::type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }
}

impl Drop for Interpreter<'_> {
    fn drop(&mut self) {
        for scope in self.scopes.get_mut().drain(..) {
            if let Some(env) = scope.upgrade() {
                let vars = std::mem::take(&mut *env.vars.borrow_mut());
                drop(vars);
            }
        }
    }
}

fn exception_matches(kind: ExcKind, class: &Value) -> Exec<bool> {
    match class {
        Value::ExcType(handler) => Ok(kind.is_caught_by(*handler)),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if exception_matches(kind, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Fault::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

/// Dict key for `value`, or `TypeError` if it is unhashable.
pub fn hash_key(value: &Value) -> Exec<DictKey> {
    DictKey::from_value(value).ok_or_else(|| Fault::type_error(format!("unhashable type: '{}'", value.type_name())))
}

/// Resolves a possibly negative index into `0..len`.
pub fn sequence_index(index: &Value, len: usize, what: &str) -> Exec<usize> {
    let Some(raw) = index.as_int() else {
        return Err(Fault::type_error(format!(
            "{what} indices must be integers, not {}",
            index.type_name()
        )));
    };
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if raw < 0 { raw + len_i } else { raw };
    if resolved < 0 || resolved >= len_i {
        return Err(Fault::index_error(format!("{what} index out of range")));
    }
    usize::try_from(resolved).map_err(|_| Fault::index_error(format!("{what} index out of range")))
}

/// Positions selected by a Python slice over a sequence of `len` items.
#[must_use]
pub fn slice_positions(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let mut positions = Vec::new();
    if step > 0 {
        let clamp = |v: i64| if v < 0 { (v + len).max(0) } else { v.min(len) };
        let mut i = lower.map_or(0, clamp);
        let stop = upper.map_or(len, clamp);
        while i < stop {
            positions.push(i);
            i += step;
        }
    } else {
        let clamp = |v: i64| if v < 0 { (v + len).max(-1) } else { v.min(len - 1) };
        let mut i = lower.map_or(len - 1, clamp);
        let stop = upper.map_or(-1, clamp);
        while i > stop {
            positions.push(i);
            i += step;
        }
    }
    positions.into_iter().filter_map(|i| usize::try_from(i).ok()).collect()
}

fn slice(object: &Value, lower: Option<i64>, upper: Option<i64>, step: Option<i64>) -> Exec<Value> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Fault::value_error("slice step cannot be zero"));
    }
    match object {
        Value::List(items) => {
            let items = items.borrow();
            let picked = slice_positions(items.len(), lower, upper, step);
            Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Tuple(items) => {
            let picked = slice_positions(items.len(), lower, upper, step);
            Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let picked = slice_positions(chars.len(), lower, upper, step);
            Ok(Value::str(picked.into_iter().map(|i| chars[i]).collect::<String>()))
        }
        other => Err(Fault::type_error(format!("'{}' object is not subscriptable", other.type_name()))),
    }
}

fn unary_op(op: UnaryOp, value: &Value) -> Exec<Value> {
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Float(v)) => Ok(Value::Float(-v)),
        (UnaryOp::Pos, Value::Float(v)) => Ok(Value::Float(*v)),
        (UnaryOp::Neg, v) if v.as_int().is_some() => v
            .as_int()
            .and_then(i64::checked_neg)
            .map(Value::Int)
            .ok_or_else(overflow),
        (UnaryOp::Pos, v) if v.as_int().is_some() => Ok(Value::Int(v.as_int().unwrap_or_default())),
        (_, v) => Err(Fault::type_error(format!(
            "bad operand type for unary {}: '{}'",
            if op == UnaryOp::Neg { "-" } else { "+" },
            v.type_name()
        ))),
    }
}

fn overflow() -> Fault {
    Fault::raise(ExcKind::RuntimeError, "integer overflow")
}

/// Python binary arithmetic.
pub fn binary_op(op: BinOp, left: &Value, right: &Value) -> Exec<Value> {
    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        return int_op(op, a, b);
    }
    if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
        return float_op(op, a, b);
    }
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            let mut out = String::with_capacity(a.len() + b.len());
            out.push_str(a);
            out.push_str(b);
            Ok(Value::str(out))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut out = a.borrow().clone();
            out.extend(b.borrow().iter().cloned());
            Ok(Value::list(out))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect())),
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            let times = repeat_count(n, s.len())?;
            Ok(Value::str(s.repeat(times)))
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items)) if n.as_int().is_some() => {
            let items = items.borrow();
            let times = repeat_count(n, items.len())?;
            Ok(Value::list(items.iter().cloned().cycle().take(items.len() * times).collect()))
        }
        (BinOp::Mul, Value::Tuple(items), n) | (BinOp::Mul, n, Value::Tuple(items)) if n.as_int().is_some() => {
            let times = repeat_count(n, items.len())?;
            Ok(Value::tuple(items.iter().cloned().cycle().take(items.len() * times).collect()))
        }
        (BinOp::Mod, Value::Str(template), args) => builtins::percent_format(template, args).map(Value::str),
        _ => Err(Fault::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

const MAX_REPEAT_ITEMS: usize = 1 << 26;

fn repeat_count(n: &Value, unit: usize) -> Exec<usize> {
    let times = usize::try_from(n.as_int().unwrap_or(0).max(0)).unwrap_or(0);
    if unit.saturating_mul(times) > MAX_REPEAT_ITEMS {
        return Err(Fault::raise(ExcKind::RuntimeError, "repeated sequence is too long"));
    }
    Ok(times)
}

fn int_op(op: BinOp, a: i64, b: i64) -> Exec<Value> {
    let zero = |what: &str| Fault::raise(ExcKind::ZeroDivisionError, what.to_string());
    match op {
        BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Div => {
            if b == 0 {
                return Err(zero("division by zero"));
            }
            Ok(Value::Float(to_float(a) / to_float(b)))
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(zero("integer division or modulo by zero"));
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            let adjust = a % b != 0 && ((a < 0) != (b < 0));
            Ok(Value::Int(if adjust { q - 1 } else { q }))
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero("integer division or modulo by zero"));
            }
            let r = a.checked_rem(b).ok_or_else(overflow)?;
            Ok(Value::Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }))
        }
        BinOp::Pow => {
            if b < 0 {
                return float_op(op, to_float(a), to_float(b));
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
        }
    }
}

#[allow(clippy::cast_precision_loss)]
const fn to_float(v: i64) -> f64 {
    v as f64
}

fn float_op(op: BinOp, a: f64, b: f64) -> Exec<Value> {
    let zero = |what: &str| Fault::raise(ExcKind::ZeroDivisionError, what.to_string());
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(zero("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(zero("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(zero("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(zero("0.0 cannot be raised to a negative power"));
            }
            a.powf(b)
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_division_and_modulo_follow_python() {
        assert!(int_op(BinOp::FloorDiv, -7, 2).unwrap().py_eq(&Value::Int(-4)));
        assert!(int_op(BinOp::Mod, -7, 2).unwrap().py_eq(&Value::Int(1)));
        assert!(int_op(BinOp::Mod, 7, -2).unwrap().py_eq(&Value::Int(-1)));
        assert!(int_op(BinOp::Div, 1, 2).unwrap().py_eq(&Value::Float(0.5)));
        assert!(float_op(BinOp::FloorDiv, -7.0, 2.0).unwrap().py_eq(&Value::Float(-4.0)));
    }

    #[test]
    fn division_by_zero_raises() {
        let err = int_op(BinOp::Div, 1, 0).unwrap_err();
        assert!(matches!(err, Fault::Raised { kind: ExcKind::ZeroDivisionError, .. }));
    }

    #[test]
    fn overflow_is_an_error_not_a_panic() {
        assert!(int_op(BinOp::Mul, i64::MAX, 2).is_err());
        assert!(int_op(BinOp::Pow, 10, 40).is_err());
        assert!(unary_op(UnaryOp::Neg, &Value::Int(i64::MIN)).is_err());
    }

    #[test]
    fn slices_match_python() {
        assert_eq!(slice_positions(5, Some(1), Some(-1), 1), vec![1, 2, 3]);
        assert_eq!(slice_positions(5, None, None, -1), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_positions(5, None, None, 2), vec![0, 2, 4]);
        assert_eq!(slice_positions(5, Some(-2), None, 1), vec![3, 4]);
        assert_eq!(slice_positions(5, Some(10), None, 1), Vec::<usize>::new());
        assert_eq!(slice_positions(0, None, None, -1), Vec::<usize>::new());
    }

    #[test]
    fn sequence_index_wraps_negative() {
        assert_eq!(sequence_index(&Value::Int(-1), 3, "list").unwrap(), 2);
        assert!(sequence_index(&Value::Int(3), 3, "list").is_err());
        assert!(sequence_index(&Value::str("a"), 3, "list").is_err());
    }

    #[test]
    fn mixed_operands() {
        let s = binary_op(BinOp::Mul, &Value::str("ab"), &Value::Int(3)).unwrap();
        assert_eq!(s.to_str(), "ababab");
        let joined = binary_op(
            BinOp::Add,
            &Value::list(vec![Value::Int(1)]),
            &Value::list(vec![Value::Int(2)]),
        )
        .unwrap();
        assert_eq!(joined.to_str(), "[1, 2]");
        assert!(binary_op(BinOp::Add, &Value::str("a"), &Value::Int(1)).is_err());
        assert!(binary_op(BinOp::Add, &Value::Bool(true), &Value::Float(0.5))
            .unwrap()
            .py_eq(&Value::Float(1.5)));
    }

    #[test]
    fn uncaught_fault_becomes_runtime_error() {
        let err = Fault::raise(ExcKind::KeyError, "'x'").at(7).into_program_error();
        assert_eq!(err, ProgramError::runtime(7, "KeyError: 'x'"));
        let bare = Fault::raise(ExcKind::StopIteration, "").at(2).into_program_error();
        assert_eq!(bare, ProgramError::runtime(2, "StopIteration"));
    }
}
