use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use exlens_ir::{Const, Procedure};
use indexmap::IndexMap;

use crate::exception::{ExcKind, Exception};
use crate::Vm;

pub type NativeFn = dyn Fn(&mut Vm, Vec<Value>) -> Result<Value, Exception>;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<IndexMap<DictKey, Value>>>),
    Function(Rc<FunctionValue>),
    Class(Rc<ClassValue>),
    Instance(Rc<InstanceValue>),
    Object(Rc<BareObject>),
    BoundMethod(Rc<BoundMethod>),
    Native(Rc<NativeFunction>),
    Code(Rc<Procedure>),
}

pub struct FunctionValue {
    pub procedure: Rc<Procedure>,
    pub globals: Rc<Namespace>,
    /// Values of enclosing locals, copied when the function was made.
    pub captured: Vec<(String, Value)>,
}

pub struct ClassValue {
    pub name: String,
    pub module: String,
    pub attrs: RefCell<IndexMap<String, Value>>,
}

impl ClassValue {
    pub fn qualified_name(&self) -> String {
        if self.module.is_empty() || self.module == "builtins" {
            self.name.clone()
        } else {
            format!("{}.{}", self.module, self.name)
        }
    }
}

pub struct InstanceValue {
    pub class: Rc<ClassValue>,
    pub attrs: RefCell<IndexMap<String, Value>>,
}

/// Featureless instance returned by `object()`.
pub struct BareObject;

pub struct BoundMethod {
    pub receiver: Value,
    pub method: Method,
}

pub enum Method {
    Function(Rc<FunctionValue>),
    Native(Rc<NativeFunction>),
    /// Method of a builtin type, dispatched by name.
    Builtin(&'static str),
}

pub struct NativeFunction {
    pub name: String,
    /// Callable this native forwards to, when it is a wrapper.
    pub wraps: Option<Value>,
    pub func: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut Vm, Vec<Value>) -> Result<Value, Exception> + 'static,
    {
        Self {
            name: name.into(),
            wraps: None,
            func: Box::new(func),
        }
    }

    pub fn wrapping(mut self, inner: Value) -> Self {
        self.wraps = Some(inner);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceId(u64);

impl NamespaceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        NamespaceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Global variables of one module.
pub struct Namespace {
    pub id: NamespaceId,
    pub name: String,
    pub filename: Option<String>,
    pub globals: RefCell<IndexMap<String, Value>>,
}

impl Namespace {
    pub fn new(name: impl Into<String>, filename: Option<String>) -> Self {
        let name = name.into();
        let mut globals = IndexMap::new();
        globals.insert("__name__".to_string(), Value::from(name.as_str()));
        if let Some(file) = &filename {
            globals.insert("__file__".to_string(), Value::from(file.as_str()));
        }
        Self {
            id: NamespaceId::next(),
            name,
            filename,
            globals: RefCell::new(globals),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.globals.borrow_mut().insert(name.into(), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.globals.borrow_mut().shift_remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.globals.borrow().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.globals.borrow().keys().cloned().collect()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("filename", &self.filename)
            .field("globals", &self.names())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    None,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<DictKey>),
}

impl DictKey {
    pub fn try_from_value(value: &Value) -> Result<Self, Exception> {
        match value {
            Value::None => Ok(DictKey::None),
            Value::Bool(v) => Ok(DictKey::Bool(*v)),
            Value::Int(v) => Ok(DictKey::Int(*v)),
            Value::Float(v) => Ok(DictKey::Float(v.to_bits())),
            Value::Str(v) => Ok(DictKey::Str(v.clone())),
            Value::Tuple(items) => {
                let mut converted = Vec::with_capacity(items.len());
                for item in items.iter() {
                    converted.push(DictKey::try_from_value(item)?);
                }
                Ok(DictKey::Tuple(converted))
            }
            _ => Err(Exception::new(
                ExcKind::TypeError,
                format!("unhashable type: '{}'", value.type_name()),
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DictKey::None => Value::None,
            DictKey::Bool(v) => Value::Bool(*v),
            DictKey::Int(v) => Value::Int(*v),
            DictKey::Float(bits) => Value::Float(f64::from_bits(*bits)),
            DictKey::Str(v) => Value::Str(v.clone()),
            DictKey::Tuple(items) => {
                Value::Tuple(Rc::new(items.iter().map(DictKey::to_value).collect()))
            }
        }
    }
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict<I>(entries: I) -> Result<Self, Exception>
    where
        I: IntoIterator<Item = (Value, Value)>,
    {
        let mut map = IndexMap::new();
        for (key, value) in entries {
            map.insert(DictKey::try_from_value(&key)?, value);
        }
        Ok(Value::Dict(Rc::new(RefCell::new(map))))
    }

    pub fn from_const(constant: &Const) -> Self {
        match constant {
            Const::None => Value::None,
            Const::Bool(v) => Value::Bool(*v),
            Const::Int(v) => Value::Int(*v),
            Const::Float(v) => Value::Float(*v),
            Const::Str(v) => Value::from(v.as_str()),
            Const::Code(procedure) => Value::Code(Rc::new(procedure.as_ref().clone())),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(text) => Some(text),
            _ => None,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Str(_) => "str".to_string(),
            Value::List(_) => "list".to_string(),
            Value::Tuple(_) => "tuple".to_string(),
            Value::Dict(_) => "dict".to_string(),
            Value::Function(_) => "function".to_string(),
            Value::Class(_) => "type".to_string(),
            Value::Instance(instance) => instance.class.name.clone(),
            Value::Object(_) => "object".to_string(),
            Value::BoundMethod(_) => "method".to_string(),
            Value::Native(_) => "builtin_function_or_method".to_string(),
            Value::Code(_) => "code".to_string(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(v) => *v,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(v) => !v.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            _ => true,
        }
    }

    /// Length of sized values; `None` for everything without a length.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Str(text) => Some(text.chars().count()),
            Value::List(items) => Some(items.borrow().len()),
            Value::Tuple(items) => Some(items.len()),
            Value::Dict(entries) => Some(entries.borrow().len()),
            _ => None,
        }
    }

    pub fn repr(&self) -> String {
        let mut seen = Vec::new();
        self.repr_guarded(&mut seen)
    }

    fn repr_guarded(&self, seen: &mut Vec<usize>) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => format_float(*v),
            Value::Str(text) => repr_str(text),
            Value::List(items) => {
                let id = Rc::as_ptr(items) as *const () as usize;
                if seen.contains(&id) {
                    return "[...]".to_string();
                }
                seen.push(id);
                let parts = items
                    .borrow()
                    .iter()
                    .map(|item| item.repr_guarded(seen))
                    .collect::<Vec<_>>();
                seen.pop();
                format!("[{}]", parts.join(", "))
            }
            Value::Tuple(items) => {
                let parts = items
                    .iter()
                    .map(|item| item.repr_guarded(seen))
                    .collect::<Vec<_>>();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Value::Dict(entries) => {
                let id = Rc::as_ptr(entries) as *const () as usize;
                if seen.contains(&id) {
                    return "{...}".to_string();
                }
                seen.push(id);
                let parts = entries
                    .borrow()
                    .iter()
                    .map(|(key, value)| {
                        format!(
                            "{}: {}",
                            key.to_value().repr_guarded(seen),
                            value.repr_guarded(seen)
                        )
                    })
                    .collect::<Vec<_>>();
                seen.pop();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Function(function) => format!("<function {}>", function.procedure.qualname),
            Value::Class(class) => format!("<class '{}'>", class.qualified_name()),
            Value::Instance(instance) => {
                format!("<{} object>", instance.class.qualified_name())
            }
            Value::Object(_) => "<object object>".to_string(),
            Value::BoundMethod(bound) => match &bound.method {
                Method::Function(function) => format!(
                    "<bound method {} of {}>",
                    function.procedure.qualname,
                    bound.receiver.repr_guarded(seen)
                ),
                Method::Native(native) => format!(
                    "<bound method {} of {}>",
                    native.name,
                    bound.receiver.repr_guarded(seen)
                ),
                Method::Builtin(name) => format!(
                    "<built-in method {} of {} object>",
                    name,
                    bound.receiver.type_name()
                ),
            },
            Value::Native(native) => format!("<built-in function {}>", native.name),
            Value::Code(procedure) => procedure.to_string(),
        }
    }

    /// Identity of shared objects; `None` for immediate values.
    pub fn identity(&self) -> Option<usize> {
        let id = match self {
            Value::List(v) => Rc::as_ptr(v) as *const () as usize,
            Value::Tuple(v) => Rc::as_ptr(v) as *const () as usize,
            Value::Dict(v) => Rc::as_ptr(v) as *const () as usize,
            Value::Function(v) => Rc::as_ptr(v) as *const () as usize,
            Value::Class(v) => Rc::as_ptr(v) as *const () as usize,
            Value::Instance(v) => Rc::as_ptr(v) as *const () as usize,
            Value::Object(v) => Rc::as_ptr(v) as *const () as usize,
            Value::BoundMethod(v) => Rc::as_ptr(v) as *const () as usize,
            Value::Native(v) => Rc::as_ptr(v) as *const () as usize,
            Value::Code(v) => Rc::as_ptr(v) as *const () as usize,
            _ => return None,
        };
        Some(id)
    }

    pub fn is(&self, other: &Value) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self == other,
            _ => false,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x == y,
                _ => match (a.identity(), b.identity()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                },
            },
        }
    }
}

/// `str()` form.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(text) => f.write_str(text),
            other => f.write_str(&other.repr()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(Rc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Rc::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        (if value > 0.0 { "inf" } else { "-inf" }).to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

pub fn repr_str(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}
