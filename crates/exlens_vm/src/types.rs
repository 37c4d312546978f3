use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use crate::value::{ClassValue, Value};

const OBJECT_ATTRIBUTES: &[&str] = &[
    "__class__",
    "__delattr__",
    "__dir__",
    "__doc__",
    "__eq__",
    "__format__",
    "__ge__",
    "__getattribute__",
    "__gt__",
    "__hash__",
    "__init__",
    "__le__",
    "__lt__",
    "__ne__",
    "__new__",
    "__reduce__",
    "__reduce_ex__",
    "__repr__",
    "__setattr__",
    "__sizeof__",
    "__str__",
    "__subclasshook__",
];

const CLASS_ATTRIBUTES: &[&str] = &["__dict__", "__module__", "__weakref__"];

pub(crate) const STR_METHODS: &[&str] = &[
    "capitalize",
    "count",
    "endswith",
    "find",
    "isdigit",
    "islower",
    "isupper",
    "join",
    "lower",
    "lstrip",
    "replace",
    "rstrip",
    "split",
    "startswith",
    "strip",
    "title",
    "upper",
];

pub(crate) const LIST_METHODS: &[&str] = &[
    "append", "count", "extend", "index", "insert", "pop", "remove", "reverse",
];

pub(crate) const DICT_METHODS: &[&str] = &[
    "get",
    "items",
    "keys",
    "pop",
    "setdefault",
    "update",
    "values",
];

const STR_DUNDERS: &[&str] = &[
    "__add__",
    "__contains__",
    "__getitem__",
    "__iter__",
    "__len__",
    "__mod__",
    "__mul__",
    "__rmod__",
    "__rmul__",
];

const SEQUENCE_DUNDERS: &[&str] = &[
    "__add__",
    "__contains__",
    "__delitem__",
    "__getitem__",
    "__iter__",
    "__len__",
    "__setitem__",
];

const NUMBER_DUNDERS: &[&str] = &[
    "__abs__",
    "__add__",
    "__bool__",
    "__floordiv__",
    "__mod__",
    "__mul__",
    "__neg__",
    "__sub__",
    "__truediv__",
];

const CALLABLE_DUNDERS: &[&str] = &["__call__", "__name__", "__qualname__"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinType {
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    List,
    Tuple,
    Dict,
    Object,
    Function,
    Type,
    Method,
    BuiltinFunction,
    Code,
}

impl BuiltinType {
    pub const ALL: [BuiltinType; 14] = [
        BuiltinType::Object,
        BuiltinType::Type,
        BuiltinType::NoneType,
        BuiltinType::Bool,
        BuiltinType::Int,
        BuiltinType::Float,
        BuiltinType::Str,
        BuiltinType::List,
        BuiltinType::Tuple,
        BuiltinType::Dict,
        BuiltinType::Function,
        BuiltinType::Method,
        BuiltinType::BuiltinFunction,
        BuiltinType::Code,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinType::NoneType => "NoneType",
            BuiltinType::Bool => "bool",
            BuiltinType::Int => "int",
            BuiltinType::Float => "float",
            BuiltinType::Str => "str",
            BuiltinType::List => "list",
            BuiltinType::Tuple => "tuple",
            BuiltinType::Dict => "dict",
            BuiltinType::Object => "object",
            BuiltinType::Function => "function",
            BuiltinType::Type => "type",
            BuiltinType::Method => "method",
            BuiltinType::BuiltinFunction => "builtin_function_or_method",
            BuiltinType::Code => "code",
        }
    }

    pub fn of(value: &Value) -> Option<Self> {
        let ty = match value {
            Value::None => BuiltinType::NoneType,
            Value::Bool(_) => BuiltinType::Bool,
            Value::Int(_) => BuiltinType::Int,
            Value::Float(_) => BuiltinType::Float,
            Value::Str(_) => BuiltinType::Str,
            Value::List(_) => BuiltinType::List,
            Value::Tuple(_) => BuiltinType::Tuple,
            Value::Dict(_) => BuiltinType::Dict,
            Value::Object(_) => BuiltinType::Object,
            Value::Function(_) => BuiltinType::Function,
            Value::Class(_) => BuiltinType::Type,
            Value::BoundMethod(_) => BuiltinType::Method,
            Value::Native(_) => BuiltinType::BuiltinFunction,
            Value::Code(_) => BuiltinType::Code,
            Value::Instance(_) => return None,
        };
        Some(ty)
    }

    /// Names callable as methods on values of this type.
    pub fn methods(self) -> &'static [&'static str] {
        match self {
            BuiltinType::Str => STR_METHODS,
            BuiltinType::List => LIST_METHODS,
            BuiltinType::Dict => DICT_METHODS,
            _ => &[],
        }
    }

    /// Sorted attribute listing, as `dir()` reports it.
    pub fn dir(self) -> Vec<String> {
        let extra: &[&str] = match self {
            BuiltinType::Str => STR_DUNDERS,
            BuiltinType::List | BuiltinType::Tuple | BuiltinType::Dict => SEQUENCE_DUNDERS,
            BuiltinType::Bool | BuiltinType::Int | BuiltinType::Float => NUMBER_DUNDERS,
            BuiltinType::Function
            | BuiltinType::Method
            | BuiltinType::BuiltinFunction
            | BuiltinType::Type => CALLABLE_DUNDERS,
            _ => &[],
        };
        sorted_names(
            OBJECT_ATTRIBUTES
                .iter()
                .chain(extra)
                .chain(self.methods())
                .map(|name| name.to_string()),
        )
    }
}

/// A type as the registry hands it out.
#[derive(Clone)]
pub enum TypeRef {
    Builtin(BuiltinType),
    Class(Rc<ClassValue>),
}

impl TypeRef {
    pub fn name(&self) -> String {
        match self {
            TypeRef::Builtin(ty) => ty.name().to_string(),
            TypeRef::Class(class) => class.name.clone(),
        }
    }

    /// `<class 'name'>` form.
    pub fn display(&self) -> String {
        match self {
            TypeRef::Builtin(ty) => format!("<class '{}'>", ty.name()),
            TypeRef::Class(class) => format!("<class '{}'>", class.qualified_name()),
        }
    }

    pub fn dir(&self) -> Vec<String> {
        match self {
            TypeRef::Builtin(ty) => ty.dir(),
            TypeRef::Class(class) => class_dir(class),
        }
    }
}

impl std::fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

pub(crate) fn class_dir(class: &ClassValue) -> Vec<String> {
    let attrs = class.attrs.borrow();
    sorted_names(
        OBJECT_ATTRIBUTES
            .iter()
            .chain(CLASS_ATTRIBUTES)
            .map(|name| name.to_string())
            .chain(attrs.keys().cloned()),
    )
}

pub(crate) fn sorted_names(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut names: Vec<String> = names.collect();
    names.sort();
    names.dedup();
    names
}

/// Types resolvable by bare name.
///
/// Builtins are registered first; a class name already present keeps its
/// first registration.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: IndexMap<String, TypeRef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for ty in BuiltinType::ALL {
            registry.register(ty.name(), TypeRef::Builtin(ty));
        }
        registry
    }

    /// Returns false when `name` was already taken.
    pub fn register(&mut self, name: impl Into<String>, ty: TypeRef) -> bool {
        let name = name.into();
        if self.types.contains_key(&name) {
            return false;
        }
        self.types.insert(name, ty);
        true
    }

    pub fn register_class(&mut self, class: Rc<ClassValue>) -> bool {
        let name = class.name.clone();
        let added = self.register(name.clone(), TypeRef::Class(class));
        if !added {
            debug!(class = %name, "type name already registered; keeping first");
        }
        added
    }

    pub fn lookup(&self, name: &str) -> Option<&TypeRef> {
        self.types.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
