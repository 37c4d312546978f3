use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::value::{Namespace, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExcKind {
    IndexError,
    KeyError,
    /// Key error whose string form is its message verbatim.
    KeyMessage,
    AttributeError,
    NameError,
    TypeError,
    ValueError,
    ZeroDivisionError,
    RecursionError,
    RuntimeError,
}

impl ExcKind {
    pub fn name(self) -> &'static str {
        match self {
            ExcKind::IndexError => "IndexError",
            ExcKind::KeyError | ExcKind::KeyMessage => "KeyError",
            ExcKind::AttributeError => "AttributeError",
            ExcKind::NameError => "NameError",
            ExcKind::TypeError => "TypeError",
            ExcKind::ValueError => "ValueError",
            ExcKind::ZeroDivisionError => "ZeroDivisionError",
            ExcKind::RecursionError => "RecursionError",
            ExcKind::RuntimeError => "RuntimeError",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "IndexError" => ExcKind::IndexError,
            "KeyError" => ExcKind::KeyError,
            "AttributeError" => ExcKind::AttributeError,
            "NameError" => ExcKind::NameError,
            "TypeError" => ExcKind::TypeError,
            "ValueError" => ExcKind::ValueError,
            "ZeroDivisionError" => ExcKind::ZeroDivisionError,
            "RecursionError" => ExcKind::RecursionError,
            "RuntimeError" => ExcKind::RuntimeError,
            _ => return None,
        };
        Some(kind)
    }

    /// True when a handler for `other` would catch this kind.
    pub fn is_a(self, other: ExcKind) -> bool {
        self == other || (self == ExcKind::KeyMessage && other == ExcKind::KeyError)
    }
}

impl fmt::Display for ExcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Facts the runtime knows when it raises, so callers need not parse text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExcDetail {
    MissingAttribute { type_name: String, attribute: String },
    UndefinedName { name: String },
}

/// One activation a failure unwound through.
#[derive(Debug, Clone, Serialize)]
pub struct StackFrame {
    pub name: String,
    pub qualname: String,
    pub filename: Option<String>,
    pub line: Option<u32>,
    pub local_names: Vec<String>,
    #[serde(skip)]
    pub namespace: Rc<Namespace>,
}

#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: ExcKind,
    pub args: Vec<Value>,
    pub detail: Option<ExcDetail>,
    /// Outermost activation first.
    pub traceback: Vec<StackFrame>,
    pub enriched: bool,
}

impl Exception {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self::with_args(kind, vec![Value::from(message.into())])
    }

    pub fn with_args(kind: ExcKind, args: Vec<Value>) -> Self {
        Self {
            kind,
            args,
            detail: None,
            traceback: Vec::new(),
            enriched: false,
        }
    }

    pub fn with_detail(mut self, detail: ExcDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn missing_attribute(type_name: &str, attribute: &str, message: String) -> Self {
        Exception::new(ExcKind::AttributeError, message).with_detail(ExcDetail::MissingAttribute {
            type_name: type_name.to_string(),
            attribute: attribute.to_string(),
        })
    }

    pub fn undefined_name(name: &str) -> Self {
        Exception::new(ExcKind::NameError, format!("name '{name}' is not defined"))
            .with_detail(ExcDetail::UndefinedName {
                name: name.to_string(),
            })
    }

    /// String form of the failure, without the kind prefix.
    pub fn message(&self) -> String {
        match self.args.as_slice() {
            [] => String::new(),
            [single] if self.kind == ExcKind::KeyError => single.repr(),
            [single] => single.to_string(),
            many => Value::tuple(many.to_vec()).repr(),
        }
    }

    pub fn render_traceback(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in &self.traceback {
            let file = frame.filename.as_deref().unwrap_or("<unknown>");
            match frame.line {
                Some(line) => out.push_str(&format!(
                    "  File \"{file}\", line {line}, in {}\n",
                    frame.name
                )),
                None => out.push_str(&format!("  File \"{file}\", in {}\n", frame.name)),
            }
        }
        out.push_str(&self.to_string());
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message();
        if message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, message)
        }
    }
}

impl std::error::Error for Exception {}
