//! Process-wide registry of functions, methods, classes, and restore hooks
//!
//! The registry is initialized once (idempotent, guarded) and is read-only
//! on the hot path. It holds:
//!
//! - global functions and per-receiver-type methods with their parameter
//!   lists, flags, and implementations,
//! - declared class shapes (needed to restore instances),
//! - named frame-resume functions (terminal drivers re-enter through
//!   these),
//! - checkpoint restore factories for iterators and callbacks.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::checkpoint::CheckpointReader;
use crate::error::{RunResult, RuntimeError, SourceLoc};
use crate::num;
use crate::object::ClassShape;
use crate::suspend::{Callback, Continuation, StepResult, ValueIter};
use crate::value::{Value, ValueMap};

/// Declared type of a parameter, for argument coercion
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParamType {
    /// No coercion
    Any,
    /// Boolean (coerced by truthiness)
    Bool,
    /// 32-bit integer
    Int,
    /// 64-bit integer (accepts Int)
    Long,
    /// Float (accepts Int/Long)
    Float,
    /// Decimal (accepts any numeric)
    Decimal,
    /// String
    Str,
    /// List (accepts arrays)
    List,
    /// Map
    Map,
    /// Function value
    Function,
    /// Iterator value
    Iterator,
}

/// One declared parameter
#[derive(Debug, Clone)]
pub struct ParamDef {
    /// Parameter name (used by named-argument binding)
    pub name: &'static str,
    /// Declared type
    pub ty: ParamType,
    /// Whether the parameter is mandatory
    pub required: bool,
    /// Default for optional parameters (null if absent)
    pub default: Option<Value>,
}

impl ParamDef {
    /// A mandatory parameter
    pub fn required(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            required: true,
            default: None,
        }
    }

    /// An optional parameter with a default
    pub fn optional(name: &'static str, ty: ParamType, default: Value) -> Self {
        Self {
            name,
            ty,
            required: false,
            default: Some(default),
        }
    }
}

/// Behavioural flags for a registered function
#[derive(Debug, Clone, Default)]
pub struct FunctionFlags {
    /// The receiver may be suspendable (instance methods on iterators)
    pub async_instance: bool,
    /// Indices of parameters whose async-ness infects the call
    pub async_params: &'static [usize],
    /// The implementation wants the call-site source location
    pub needs_location: bool,
    /// The last parameter collects trailing arguments
    pub var_args: bool,
}

impl FunctionFlags {
    /// No flags set
    pub const NONE: FunctionFlags = FunctionFlags {
        async_instance: false,
        async_params: &[],
        needs_location: false,
        var_args: false,
    };
}

/// A bound call ready to execute
pub struct Invocation {
    /// Receiver for methods, None for global functions
    pub receiver: Option<Value>,
    /// Arguments after binding and coercion, parallel to the params
    pub args: Vec<Value>,
    /// Call-site location
    pub loc: SourceLoc,
}

/// Function implementation: may suspend
pub type FnImpl = Arc<dyn Fn(Invocation) -> StepResult<Value> + Send + Sync>;

/// Resume entry for a named continuation frame
pub type FrameResumeFn = fn(Continuation, Value) -> StepResult<Value>;

/// Restore factory for a checkpointed iterator kind
pub type IterReaderFn =
    Arc<dyn Fn(&mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> + Send + Sync>;

/// Restore factory for a checkpointed callback
pub type CallbackFactoryFn =
    Arc<dyn Fn(&mut CheckpointReader<'_>) -> RunResult<Box<dyn Callback>> + Send + Sync>;

/// A registered function or method
pub struct FunctionDef {
    /// Function name
    pub name: String,
    /// Receiver type name for methods, None for global functions
    pub receiver: Option<&'static str>,
    /// Declared parameters
    pub params: Vec<ParamDef>,
    /// Behavioural flags
    pub flags: FunctionFlags,
    /// Implementation
    pub imp: FnImpl,
}

impl FunctionDef {
    /// Bind arguments and invoke
    pub fn invoke(
        &self,
        receiver: Option<Value>,
        args: Args,
        loc: SourceLoc,
    ) -> StepResult<Value> {
        let bound = bind_args(self, args, &loc)?;
        (self.imp)(Invocation {
            receiver,
            args: bound,
            loc,
        })
    }
}

/// Call arguments, before binding
pub enum Args {
    /// Ordered argument list
    Positional(Vec<Value>),
    /// Single map of parameter name to value
    Named(ValueMap),
}

/// Bind call arguments to a function's declared parameters.
///
/// Positional rule: a single list argument binds directly when the
/// function has exactly one parameter (or exactly one mandatory one);
/// otherwise the list explodes into positional arguments. Named rule:
/// unknown names and missing mandatory names error. The trailing varargs
/// parameter collects leftover positionals (or accepts a list/array when
/// named).
pub fn bind_args(def: &FunctionDef, args: Args, loc: &SourceLoc) -> RunResult<Vec<Value>> {
    match args {
        Args::Positional(given) => bind_positional(def, given, loc),
        Args::Named(given) => bind_named(def, given, loc),
    }
}

fn bind_positional(def: &FunctionDef, mut given: Vec<Value>, loc: &SourceLoc) -> RunResult<Vec<Value>> {
    if given.len() == 1 {
        if let Value::List(l) = &given[0] {
            let mandatory = def.params.iter().filter(|p| p.required).count();
            let single_target = def.params.len() == 1 || mandatory == 1;
            if !single_target {
                // Explode the list into positional arguments
                let exploded = l.lock().clone();
                given = exploded;
            }
        }
    }

    let mut bound = Vec::with_capacity(def.params.len());
    let mut rest = given.into_iter();
    for (i, param) in def.params.iter().enumerate() {
        let is_vararg = def.flags.var_args && i == def.params.len() - 1;
        if is_vararg {
            let collected: Vec<Value> = rest.by_ref().collect();
            bound.push(Value::list(
                collected
                    .into_iter()
                    .map(|v| coerce(v, param.ty, loc))
                    .collect::<RunResult<Vec<_>>>()?,
            ));
            break;
        }
        match rest.next() {
            Some(v) => bound.push(coerce(v, param.ty, loc)?),
            None if param.required => {
                return Err(RuntimeError::new(
                    format!("Missing mandatory argument '{}' for {}", param.name, def.name),
                    loc.clone(),
                ))
            }
            None => bound.push(param.default.clone().unwrap_or(Value::Null)),
        }
    }
    let leftover = rest.count();
    if leftover > 0 {
        return Err(RuntimeError::new(
            format!(
                "Too many arguments for {}: expected at most {}, got {}",
                def.name,
                def.params.len(),
                def.params.len() + leftover
            ),
            loc.clone(),
        ));
    }
    Ok(bound)
}

fn bind_named(def: &FunctionDef, given: ValueMap, loc: &SourceLoc) -> RunResult<Vec<Value>> {
    for key in given.keys() {
        if !def.params.iter().any(|p| p.name == key) {
            return Err(RuntimeError::new(
                format!("No such parameter '{}' for {}", key, def.name),
                loc.clone(),
            ));
        }
    }
    let mut bound = Vec::with_capacity(def.params.len());
    for (i, param) in def.params.iter().enumerate() {
        let is_vararg = def.flags.var_args && i == def.params.len() - 1;
        match given.get(param.name) {
            Some(v) if is_vararg => {
                // Trailing varargs accept a list or array
                let items = match v {
                    Value::List(l) => l.lock().clone(),
                    Value::Array(a) => a.lock().to_values(),
                    other => {
                        return Err(RuntimeError::new(
                            format!(
                                "Parameter '{}' of {} expects a list or array, got {}",
                                param.name,
                                def.name,
                                other.type_name()
                            ),
                            loc.clone(),
                        ))
                    }
                };
                bound.push(Value::list(
                    items
                        .into_iter()
                        .map(|v| coerce(v, param.ty, loc))
                        .collect::<RunResult<Vec<_>>>()?,
                ));
            }
            Some(v) => bound.push(coerce(v.clone(), param.ty, loc)?),
            None if param.required => {
                return Err(RuntimeError::new(
                    format!("Missing mandatory argument '{}' for {}", param.name, def.name),
                    loc.clone(),
                ))
            }
            None => bound.push(param.default.clone().unwrap_or(Value::Null)),
        }
    }
    Ok(bound)
}

/// Coerce an argument to a declared parameter type
pub fn coerce(v: Value, ty: ParamType, loc: &SourceLoc) -> RunResult<Value> {
    if v.is_null() || ty == ParamType::Any {
        return Ok(v);
    }
    let mismatch = |v: &Value| {
        RuntimeError::new(
            format!("Cannot convert {} to {:?}", v.type_name(), ty),
            loc.clone(),
        )
    };
    match ty {
        ParamType::Any => Ok(v),
        ParamType::Bool => Ok(Value::Bool(v.is_truthy())),
        ParamType::Int => match v {
            Value::Int(_) => Ok(v),
            _ => Err(mismatch(&v)),
        },
        ParamType::Long => match v {
            Value::Int(i) => Ok(Value::Long(i as i64)),
            Value::Long(_) => Ok(v),
            _ => Err(mismatch(&v)),
        },
        ParamType::Float => match v {
            Value::Int(_) | Value::Long(_) => Ok(Value::Float(v.as_float().unwrap())),
            Value::Float(_) => Ok(v),
            _ => Err(mismatch(&v)),
        },
        ParamType::Decimal => match num::to_decimal(&v) {
            Some(d) => Ok(Value::decimal(d)),
            None => Err(mismatch(&v)),
        },
        ParamType::Str => match v {
            Value::Str(_) => Ok(v),
            _ => Err(mismatch(&v)),
        },
        ParamType::List => match v {
            Value::List(_) => Ok(v),
            Value::Array(a) => Ok(Value::list(a.lock().to_values())),
            _ => Err(mismatch(&v)),
        },
        ParamType::Map => match v {
            Value::Map(_) => Ok(v),
            _ => Err(mismatch(&v)),
        },
        ParamType::Function => match v {
            Value::Function(_) => Ok(v),
            _ => Err(mismatch(&v)),
        },
        ParamType::Iterator => match v {
            Value::Iterator(_) => Ok(v),
            _ => Err(mismatch(&v)),
        },
    }
}

// ============================================================================
// Global registry
// ============================================================================

#[derive(Default)]
struct Registry {
    functions: FxHashMap<String, Arc<FunctionDef>>,
    methods: FxHashMap<(String, String), Arc<FunctionDef>>,
    classes: FxHashMap<String, Arc<ClassShape>>,
    resume_fns: FxHashMap<String, FrameResumeFn>,
    iter_readers: FxHashMap<String, IterReaderFn>,
    callback_factories: FxHashMap<String, CallbackFactoryFn>,
}

static GLOBAL: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::default()));
static INIT_KEYS: Lazy<Mutex<FxHashSet<&'static str>>> =
    Lazy::new(|| Mutex::new(FxHashSet::default()));

/// Run an initialization block exactly once per process, keyed by name.
/// Re-running with the same key is a no-op.
pub fn init_once(key: &'static str, f: impl FnOnce()) {
    let mut keys = INIT_KEYS.lock();
    if keys.insert(key) {
        f();
    }
}

/// Register a global function
pub fn register_function(def: FunctionDef) {
    let mut reg = GLOBAL.write();
    reg.functions.insert(def.name.clone(), Arc::new(def));
}

/// Register a method on a receiver type ("list", "map", "iterable", ...)
pub fn register_method(def: FunctionDef) {
    let receiver = def
        .receiver
        .expect("register_method requires a receiver type");
    let mut reg = GLOBAL.write();
    reg.methods
        .insert((receiver.to_string(), def.name.clone()), Arc::new(def));
}

/// Look up a global function
pub fn lookup_function(name: &str) -> RunResult<Arc<FunctionDef>> {
    GLOBAL
        .read()
        .functions
        .get(name)
        .cloned()
        .ok_or_else(|| RuntimeError::msg(format!("No such function '{}'", name)))
}

/// Look up a method by receiver type, falling back to the `iterable`
/// pseudo-receiver for iterable values and then to `any`
pub fn lookup_method_on(receiver: &Value, name: &str) -> RunResult<Arc<FunctionDef>> {
    let reg = GLOBAL.read();
    if let Some(def) = reg
        .methods
        .get(&(receiver.type_name().to_string(), name.to_string()))
    {
        return Ok(def.clone());
    }
    let iterable = matches!(
        receiver,
        Value::List(_) | Value::Map(_) | Value::Array(_) | Value::Iterator(_)
    );
    if iterable {
        if let Some(def) = reg.methods.get(&("iterable".to_string(), name.to_string())) {
            return Ok(def.clone());
        }
    }
    if let Some(def) = reg.methods.get(&("any".to_string(), name.to_string())) {
        return Ok(def.clone());
    }
    Err(RuntimeError::msg(format!(
        "No such method '{}' on {}",
        name,
        receiver.type_name()
    )))
}

/// Look up a method handle by name alone (first registration wins)
pub fn lookup_method(name: &str) -> Option<Arc<FunctionDef>> {
    let reg = GLOBAL.read();
    reg.methods
        .iter()
        .find(|((_, m), _)| m.as_str() == name)
        .map(|(_, def)| def.clone())
}

/// Bind and invoke a method on a receiver
pub fn call_method(receiver: &Value, name: &str, args: Args, loc: SourceLoc) -> StepResult<Value> {
    let def = lookup_method_on(receiver, name).map_err(|mut e| {
        e.loc = Some(loc.clone());
        e
    })?;
    def.invoke(Some(receiver.clone()), args, loc)
}

/// Bind and invoke a global function
pub fn call_function(name: &str, args: Args, loc: SourceLoc) -> StepResult<Value> {
    let def = lookup_function(name).map_err(|mut e| {
        e.loc = Some(loc.clone());
        e
    })?;
    def.invoke(None, args, loc)
}

/// Register a class shape
pub fn register_class(shape: Arc<ClassShape>) {
    let mut reg = GLOBAL.write();
    reg.classes.insert(shape.name.to_string(), shape);
}

/// Look up a class shape by name (checkpoint restore)
pub fn lookup_class(name: &str) -> RunResult<Arc<ClassShape>> {
    GLOBAL
        .read()
        .classes
        .get(name)
        .cloned()
        .ok_or_else(|| RuntimeError::msg(format!("No such class '{}'", name)))
}

/// Register a named frame-resume function
pub fn register_resume_fn(name: &str, f: FrameResumeFn) {
    let mut reg = GLOBAL.write();
    reg.resume_fns.insert(name.to_string(), f);
}

/// Look up a named frame-resume function
pub fn lookup_resume_fn(name: &str) -> RunResult<FrameResumeFn> {
    GLOBAL
        .read()
        .resume_fns
        .get(name)
        .copied()
        .ok_or_else(|| RuntimeError::msg(format!("No resume entry registered for '{}'", name)))
}

/// Register a checkpoint restore factory for an iterator kind
pub fn register_iter_reader(kind: &str, f: IterReaderFn) {
    let mut reg = GLOBAL.write();
    reg.iter_readers.insert(kind.to_string(), f);
}

/// Look up an iterator restore factory
pub fn lookup_iter_reader(kind: &str) -> RunResult<IterReaderFn> {
    GLOBAL
        .read()
        .iter_readers
        .get(kind)
        .cloned()
        .ok_or_else(|| RuntimeError::msg(format!("No reader registered for iterator kind '{}'", kind)))
}

/// Register a checkpoint restore factory for a callback name
pub fn register_callback_factory(name: &str, f: CallbackFactoryFn) {
    let mut reg = GLOBAL.write();
    reg.callback_factories.insert(name.to_string(), f);
}

/// Look up a callback restore factory
pub fn lookup_callback_factory(name: &str) -> RunResult<CallbackFactoryFn> {
    GLOBAL
        .read()
        .callback_factories
        .get(name)
        .cloned()
        .ok_or_else(|| {
            RuntimeError::msg(format!("No factory registered for function '{}'", name))
        })
}
