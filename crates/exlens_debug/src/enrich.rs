use std::rc::Rc;
use std::sync::OnceLock;

use exlens_vm::scratch::{self, SlotPair};
use exlens_vm::{repr_str, ExcDetail, ExcKind, Exception, NativeFunction, Value, Vm};
use regex::Regex;
use tracing::{trace, warn};

use crate::similarity::suggestions;
use crate::{EnrichConfig, FailureClass};

const ATTRIBUTE_MESSAGE: &str =
    r"^(')?(?P<type>[a-zA-Z0-9_]*)(')? (.*) has no attribute '(?P<attribute>[a-zA-Z0-9_]*)'";
const BARE_ATTRIBUTE: &str = r"^(?P<attribute>[a-zA-Z0-9_]*)";
const NAME_MESSAGE: &str = r"^(?:global )?name '(?P<name>[a-zA-Z0-9_]*)' is not defined";

fn attribute_message() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(ATTRIBUTE_MESSAGE).ok()).as_ref()
}

fn bare_attribute() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(BARE_ATTRIBUTE).ok()).as_ref()
}

fn name_message() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(NAME_MESSAGE).ok()).as_ref()
}

/// Wraps `callable` with the default enrichment settings.
pub fn wrap(callable: Value) -> Value {
    Enricher::default().wrap(callable)
}

#[derive(Debug, Clone, Default)]
pub struct Enricher {
    config: EnrichConfig,
}

impl Enricher {
    pub fn new(config: EnrichConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    /// Returns a callable that forwards to `callable` and enriches whatever it raises.
    pub fn wrap(&self, callable: Value) -> Value {
        let name = callable_name(&callable);
        let enricher = self.clone();
        let inner = callable.clone();
        let native = NativeFunction::new(name, move |vm: &mut Vm, args: Vec<Value>| {
            enricher.call(vm, &inner, args)
        })
        .wrapping(callable);
        Value::Native(Rc::new(native))
    }

    pub fn call(&self, vm: &mut Vm, callable: &Value, args: Vec<Value>) -> Result<Value, Exception> {
        vm.call(callable, args).map_err(|exc| self.enrich(vm, exc))
    }

    /// Rebuilds the message of `exc` from the scratch slots left along its traceback.
    pub fn enrich(&self, vm: &Vm, mut exc: Exception) -> Exception {
        if exc.enriched {
            trace!(kind = %exc.kind, "failure already enriched");
            return exc;
        }
        let class = FailureClass::of(exc.kind);
        let slots = consume_slots(&exc);
        trace!(
            kind = %exc.kind,
            ?class,
            attr = slots.attr.is_some(),
            index = slots.index.is_some(),
            "enriching failure"
        );
        let message = match class {
            FailureClass::OutOfRange => self.out_of_range(&exc, &slots),
            FailureClass::MissingKey => {
                let message = self.missing_key(&exc, &slots);
                exc.kind = ExcKind::KeyMessage;
                Some(message)
            }
            FailureClass::MissingAttribute => self.missing_attribute(vm, &exc, slots.attr),
            FailureClass::UndefinedName => self.undefined_name(&exc),
            FailureClass::Other => return exc,
        };
        if let Some(message) = message {
            exc.args = vec![Value::from(message)];
        }
        exc.enriched = true;
        exc
    }

    fn out_of_range(&self, exc: &Exception, slots: &SlotPair) -> Option<String> {
        let (Some(subject), Some(index)) = (&slots.attr, &slots.index) else {
            return None;
        };
        if !self.config.debug_block {
            return None;
        }
        let mut message = format!("{}\nDebug info:\n\tObject: {subject}", exc.message());
        if let Some(len) = subject.len() {
            message.push_str(&format!("\n\tObject len: {len}"));
        }
        message.push_str(&format!("\n\tIndex: {index}"));
        Some(message)
    }

    fn missing_key(&self, exc: &Exception, slots: &SlotPair) -> String {
        let mut message = exc.message();
        if let (Some(subject), Some(key), true) = (&slots.attr, &slots.index, self.config.debug_block)
        {
            message.push_str(&format!(
                "\nDebug info:\n\tObject: {subject}\n\tKey: {}",
                key.repr()
            ));
        }
        message
    }

    fn missing_attribute(&self, vm: &Vm, exc: &Exception, subject: Option<Value>) -> Option<String> {
        let Some(failure) = parse_attribute_failure(exc) else {
            warn!(message = %exc.message(), "attribute failure without a recognizable message");
            return None;
        };
        let ty = match &subject {
            Some(subject) => Some(vm.type_of(subject)),
            None => failure
                .type_name
                .as_deref()
                .and_then(|name| vm.registry().lookup(name).cloned()),
        };
        let Some(ty) = ty else {
            warn!(
                attribute = %failure.attribute,
                type_name = ?failure.type_name,
                "attribute failure without a resolvable type"
            );
            return None;
        };
        let attributes = match &subject {
            Some(subject) => vm.dir(subject),
            None => ty.dir(),
        };

        let mut message = exc.message();
        if !failure.attribute.is_empty() {
            let hints = self.suggest(&failure.attribute, &attributes);
            if !hints.is_empty() {
                message.push_str(&format!(". Did you mean {}?", quoted(&hints)));
            }
        }
        if self.config.debug_block {
            message.push_str("\nDebug info:");
            if let Some(subject) = &subject {
                message.push_str(&format!("\n\tObject: {}", subject.repr()));
            }
            message.push_str(&format!(
                "\n\tType: {}\n\tAttributes: {}",
                ty.display(),
                list_repr(&attributes)
            ));
        }
        Some(message)
    }

    fn undefined_name(&self, exc: &Exception) -> Option<String> {
        let name = match &exc.detail {
            Some(ExcDetail::UndefinedName { name }) => Some(name.clone()),
            _ => {
                let message = exc.message();
                name_message()
                    .and_then(|pattern| pattern.captures(&message))
                    .and_then(|caps| caps.name("name"))
                    .map(|found| found.as_str().to_string())
            }
        };
        let Some(name) = name else {
            warn!(message = %exc.message(), "name failure without a recognizable message");
            return None;
        };
        // the activation directly below the wrapper
        let frame = exc.traceback.first()?;
        let candidates: Vec<String> = frame
            .local_names
            .iter()
            .cloned()
            .chain(frame.namespace.names())
            .collect();
        let hints = self.suggest(&name, &candidates);
        if hints.is_empty() {
            return None;
        }
        Some(format!("{}. Did you mean {}?", exc.message(), quoted(&hints)))
    }

    fn suggest(&self, name: &str, candidates: &[String]) -> Vec<String> {
        suggestions(
            name,
            candidates,
            self.config.similarity_threshold,
            self.config.max_suggestions,
        )
    }
}

/// Takes both slots of the innermost traceback namespace that has any set.
fn consume_slots(exc: &Exception) -> SlotPair {
    exc.traceback
        .iter()
        .rev()
        .find(|frame| scratch::is_set(frame.namespace.id))
        .map(|frame| scratch::take_pair(frame.namespace.id))
        .unwrap_or_default()
}

#[derive(Debug, PartialEq)]
struct AttributeFailure {
    type_name: Option<String>,
    attribute: String,
}

fn parse_attribute_failure(exc: &Exception) -> Option<AttributeFailure> {
    if let Some(ExcDetail::MissingAttribute {
        type_name,
        attribute,
    }) = &exc.detail
    {
        return Some(AttributeFailure {
            type_name: Some(type_name.clone()),
            attribute: attribute.clone(),
        });
    }
    let message = exc.message();
    if let Some(caps) = attribute_message().and_then(|pattern| pattern.captures(&message)) {
        return Some(AttributeFailure {
            type_name: caps.name("type").map(|found| found.as_str().to_string()),
            attribute: caps
                .name("attribute")
                .map(|found| found.as_str().to_string())
                .unwrap_or_default(),
        });
    }
    let caps = bare_attribute()?.captures(&message)?;
    Some(AttributeFailure {
        type_name: None,
        attribute: caps.name("attribute")?.as_str().to_string(),
    })
}

fn callable_name(callable: &Value) -> String {
    match callable {
        Value::Function(function) => function.procedure.name.clone(),
        Value::Native(native) => native.name.clone(),
        Value::Class(class) => class.name.clone(),
        _ => "wrapper".to_string(),
    }
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn list_repr(names: &[String]) -> String {
    let items: Vec<String> = names.iter().map(|name| repr_str(name)).collect();
    format!("[{}]", items.join(", "))
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use exlens_asm::assemble;
    use exlens_ir::instrument;
    use exlens_vm::{scratch, ExcKind, Exception, Namespace, Value, Vm};

    use super::{parse_attribute_failure, wrap, AttributeFailure, Enricher};
    use crate::EnrichConfig;

    fn load(vm: &mut Vm, source: &str, instrumented: bool) -> Rc<Namespace> {
        let mut procedure = assemble(source).expect("assemble");
        if instrumented {
            procedure = instrument(procedure);
        }
        let namespace = vm.new_namespace("test_data", procedure.filename.clone());
        vm.exec_module(&procedure, &namespace).expect("exec module");
        namespace
    }

    fn call_wrapped(vm: &mut Vm, namespace: &Namespace, name: &str) -> Result<Value, Exception> {
        let wrapped = wrap(namespace.get(name).expect("function defined"));
        vm.call(&wrapped, Vec::new())
    }

    const OUT_OF_RANGE: &str = r#"
proc <module> file=index.exa
  LOAD_CONST proc f
    LOAD_CONST 1
    LOAD_CONST 2
    BUILD_LIST 2
    STORE_FAST a
    LOAD_FAST a
    LOAD_CONST 2
    BINARY_SUBSCR
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#;

    #[test]
    fn out_of_range_lists_object_length_and_index() {
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, OUT_OF_RANGE, true);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("index error");
        assert_eq!(err.kind, ExcKind::IndexError);
        assert_eq!(
            err.message(),
            "list index out of range\nDebug info:\n\tObject: [1, 2]\n\tObject len: 2\n\tIndex: 2"
        );
        assert!(err.enriched);
        assert!(!scratch::is_set(ns.id));
    }

    #[test]
    fn wrapper_is_not_a_visible_activation() {
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, OUT_OF_RANGE, true);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("index error");
        assert_eq!(err.traceback.len(), 1);
        assert_eq!(err.traceback[0].name, "f");
        assert_eq!(err.traceback[0].filename.as_deref(), Some("index.exa"));
    }

    #[test]
    fn uninstrumented_failures_keep_their_message() {
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, OUT_OF_RANGE, false);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("index error");
        assert_eq!(err.to_string(), "IndexError: list index out of range");
    }

    #[test]
    fn missing_key_shows_object_and_key() {
        let source = r#"
proc <module>
  LOAD_CONST proc f
    BUILD_MAP 0
    STORE_FAST d
    LOAD_FAST d
    LOAD_CONST 'bla'
    BINARY_SUBSCR
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#;
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, true);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("key error");
        assert_eq!(err.kind, ExcKind::KeyMessage);
        assert!(err.kind.is_a(ExcKind::KeyError));
        assert_eq!(err.message(), "'bla'\nDebug info:\n\tObject: {}\n\tKey: 'bla'");
        assert_eq!(
            err.to_string(),
            "KeyError: 'bla'\nDebug info:\n\tObject: {}\n\tKey: 'bla'"
        );

        let mut vm = Vm::new();
        let ns = load(&mut vm, source, false);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("key error");
        assert_eq!(err.kind, ExcKind::KeyMessage);
        assert_eq!(err.to_string(), "KeyError: 'bla'");
    }

    #[test]
    fn deleting_a_missing_key_reports_the_dict() {
        let source = r#"
proc <module>
  LOAD_CONST proc f
    LOAD_CONST 'a'
    LOAD_CONST 'b'
    BUILD_MAP 1
    STORE_FAST d
    LOAD_FAST d
    LOAD_CONST '1'
    DELETE_SUBSCR
    LOAD_CONST None
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#;
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, true);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("key error");
        assert_eq!(
            err.message(),
            "'1'\nDebug info:\n\tObject: {'a': 'b'}\n\tKey: '1'"
        );
    }

    #[test]
    fn failures_in_nested_calls_report_the_innermost_operands() {
        let source = r#"
proc <module> file=nested.exa
  LOAD_CONST proc outer
    LOAD_CONST 7
    BUILD_LIST 1
    STORE_FAST xs
    LOAD_CONST proc inner params=i
      LOAD_FAST xs
      LOAD_FAST i
      BINARY_SUBSCR
      RETURN_VALUE
    end
    MAKE_FUNCTION xs
    STORE_FAST inner
    LOAD_FAST inner
    LOAD_CONST 0
    CALL_FUNCTION 1
    LOAD_FAST inner
    LOAD_CONST 3
    CALL_FUNCTION 1
    BUILD_TUPLE 2
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME outer
end
"#;
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, true);
        let err = call_wrapped(&mut vm, &ns, "outer").expect_err("index error");
        assert_eq!(
            err.message(),
            "list index out of range\nDebug info:\n\tObject: [7]\n\tObject len: 1\n\tIndex: 3"
        );
        let names: Vec<&str> = err.traceback.iter().map(|frame| frame.name.as_str()).collect();
        assert_eq!(names, vec!["outer", "inner"]);
    }

    #[test]
    fn recursive_failure_reports_the_innermost_operands() {
        let source = r#"
proc <module> file=chain.exa
  LOAD_CONST proc f params=n
    LOAD_FAST n
    LOAD_CONST 0
    COMPARE_OP ==
    POP_JUMP_IF_FALSE deeper
    LOAD_CONST 9
    BUILD_LIST 1
    LOAD_CONST 5
    BINARY_SUBSCR
    RETURN_VALUE
  deeper:
    LOAD_GLOBAL f
    LOAD_FAST n
    LOAD_CONST 1
    BINARY_SUBTRACT
    CALL_FUNCTION 1
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#;
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, true);
        let wrapped = wrap(ns.get("f").expect("f"));
        let err = vm
            .call(&wrapped, vec![Value::Int(2)])
            .expect_err("index error");
        assert_eq!(
            err.message(),
            "list index out of range\nDebug info:\n\tObject: [9]\n\tObject len: 1\n\tIndex: 5"
        );
        assert_eq!(err.traceback.len(), 3);
        assert!(!scratch::is_set(ns.id));
    }

    #[test]
    fn unbounded_recursion_under_default_limits_is_a_plain_failure() {
        let source = r#"
proc <module> file=rec.exa
  LOAD_CONST proc f
    LOAD_GLOBAL f
    CALL_FUNCTION 0
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#;
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, true);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("recursion");
        assert_eq!(err.kind, ExcKind::RecursionError);
        assert_eq!(err.message(), "maximum recursion depth exceeded");
        assert!(!err.enriched);
        assert_eq!(err.traceback[0].name, "f");
    }

    const LOWER: &str = r#"
proc <module>
  LOAD_CONST proc f
    LOAD_CONST ''
    LOAD_ATTR Lower
    CALL_FUNCTION 0
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#;

    #[test]
    fn missing_attribute_suggests_and_describes_the_object() {
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, LOWER, true);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("attribute error");
        let message = err.message();
        assert!(message.starts_with(
            "'str' object has no attribute 'Lower'. Did you mean 'islower', 'lower'?"
        ));
        assert!(message.contains(
            "Debug info:\n\tObject: ''\n\tType: <class 'str'>\n\tAttributes: ['__add__', "
        ));
        assert!(message.ends_with("'upper']"));
    }

    #[test]
    fn missing_attribute_without_slots_falls_back_to_the_type() {
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, LOWER, false);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("attribute error");
        let message = err.message();
        assert!(message.contains("Did you mean 'islower', 'lower'"));
        assert!(message.contains("Debug info:\n\tType: <class 'str'>\n\tAttributes: "));
        assert!(!message.contains("Object:"));
    }

    #[test]
    fn raised_attribute_messages_are_parsed() {
        let source = r#"
proc <module>
  LOAD_CONST proc f
    LOAD_CONST "'str' object has no attribute 'Lower'"
    RAISE AttributeError
  end
  MAKE_FUNCTION
  STORE_NAME f
  LOAD_CONST proc g
    LOAD_CONST 'something odd'
    RAISE AttributeError
  end
  MAKE_FUNCTION
  STORE_NAME g
end
"#;
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, true);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("attribute error");
        assert!(err.message().contains("Did you mean 'islower', 'lower'?"));
        assert!(err.message().contains("\n\tType: <class 'str'>"));

        let err = call_wrapped(&mut vm, &ns, "g").expect_err("attribute error");
        assert_eq!(err.message(), "something odd");
    }

    #[test]
    fn undefined_names_suggest_locals_and_globals() {
        let source = r#"
proc <module>
  LOAD_CONST 1
  STORE_NAME unittest
  LOAD_CONST proc f
    LOAD_CONST ''
    STORE_FAST var
    LOAD_GLOBAL vari
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
  LOAD_CONST proc g
    LOAD_GLOBAL unittest2
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME g
  LOAD_CONST proc h
    LOAD_GLOBAL qqq
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME h
end
"#;
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, true);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("name error");
        assert_eq!(
            err.to_string(),
            "NameError: name 'vari' is not defined. Did you mean 'var'?"
        );
        let err = call_wrapped(&mut vm, &ns, "g").expect_err("name error");
        assert_eq!(
            err.message(),
            "name 'unittest2' is not defined. Did you mean 'unittest'?"
        );
        let err = call_wrapped(&mut vm, &ns, "h").expect_err("name error");
        assert_eq!(err.message(), "name 'qqq' is not defined");
    }

    #[test]
    fn nested_wrappers_enrich_once() {
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, OUT_OF_RANGE, true);
        let twice = wrap(wrap(ns.get("f").expect("f")));
        let err = vm.call(&twice, Vec::new()).expect_err("index error");
        assert_eq!(err.message().matches("Debug info:").count(), 1);
    }

    #[test]
    fn successful_calls_pass_results_through() {
        let source = r#"
proc <module>
  LOAD_CONST proc ident params=x
    LOAD_FAST x
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME ident
end
"#;
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, true);
        let wrapped = wrap(ns.get("ident").expect("ident"));
        assert_eq!(
            vm.call(&wrapped, vec![Value::Int(5)]).expect("call"),
            Value::Int(5)
        );
        let err = vm.call(&wrapped, Vec::new()).expect_err("arity");
        assert_eq!(err.kind, ExcKind::TypeError);
        assert_eq!(err.message(), "ident() takes 1 positional argument but 0 were given");
    }

    #[test]
    fn config_limits_output() {
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, LOWER, true);
        let enricher = Enricher::new(EnrichConfig {
            max_suggestions: Some(1),
            debug_block: false,
            ..EnrichConfig::default()
        });
        let wrapped = enricher.wrap(ns.get("f").expect("f"));
        let err = vm.call(&wrapped, Vec::new()).expect_err("attribute error");
        assert_eq!(
            err.message(),
            "'str' object has no attribute 'Lower'. Did you mean 'islower'?"
        );
        assert!(!scratch::is_set(ns.id));
    }

    #[test]
    fn other_failures_are_untouched() {
        let source = r#"
proc <module>
  LOAD_CONST proc f
    LOAD_CONST 1
    LOAD_CONST 0
    BINARY_TRUE_DIVIDE
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#;
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, true);
        let err = call_wrapped(&mut vm, &ns, "f").expect_err("zero division");
        assert_eq!(err.kind, ExcKind::ZeroDivisionError);
        assert!(!err.enriched);
    }

    #[test]
    fn attribute_messages_parse_with_and_without_type() {
        let parsed = parse_attribute_failure(&Exception::new(
            ExcKind::AttributeError,
            "type object 'Foo' has no attribute 'bar'",
        ));
        assert_eq!(
            parsed,
            Some(AttributeFailure {
                type_name: Some("type".to_string()),
                attribute: "bar".to_string(),
            })
        );
        let parsed = parse_attribute_failure(&Exception::new(ExcKind::AttributeError, "bar"));
        assert_eq!(
            parsed,
            Some(AttributeFailure {
                type_name: None,
                attribute: "bar".to_string(),
            })
        );
    }
}
