use exlens_vm::{ExcKind, Exception, Value, Vm};
use tracing::debug;

use crate::Enricher;

/// True for callables produced by [`Enricher::wrap`].
pub fn is_wrapped(value: &Value) -> bool {
    matches!(value, Value::Native(native) if native.wraps.is_some())
}

/// Replaces the named methods of `class` with enriching wrappers.
///
/// Methods that are already wrapped are left alone. Returns the names that
/// were wrapped by this call.
pub fn decorate_class(
    vm: &mut Vm,
    class: &Value,
    methods: &[&str],
    enricher: &Enricher,
) -> Result<Vec<String>, Exception> {
    let Value::Class(target) = class else {
        return Err(Exception::new(
            ExcKind::TypeError,
            format!("can only decorate classes, not '{}'", class.type_name()),
        ));
    };
    let mut wrapped = Vec::new();
    for &name in methods {
        let method = vm.get_attr(class, name)?;
        if is_wrapped(&method) {
            continue;
        }
        target
            .attrs
            .borrow_mut()
            .insert(name.to_string(), enricher.wrap(method));
        wrapped.push(name.to_string());
    }
    debug!(class = %target.name, methods = ?wrapped, "decorated class");
    Ok(wrapped)
}

/// Wraps every function defined on `class`.
pub fn decorate_all(vm: &mut Vm, class: &Value, enricher: &Enricher) -> Result<Vec<String>, Exception> {
    let names: Vec<String> = match class {
        Value::Class(target) => target
            .attrs
            .borrow()
            .iter()
            .filter(|(_, value)| matches!(value, Value::Function(_)))
            .map(|(name, _)| name.clone())
            .collect(),
        _ => Vec::new(),
    };
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    decorate_class(vm, class, &names, enricher)
}
