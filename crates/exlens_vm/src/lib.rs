use std::cell::RefCell;
use std::rc::Rc;

use exlens_ir::{BinOp, CmpOp, Op, Procedure};
use indexmap::IndexMap;
use tracing::{debug, trace};

mod builtins;
mod exception;
pub mod scratch;
mod types;
mod value;

pub use exception::{ExcDetail, ExcKind, Exception, StackFrame};
pub use types::{BuiltinType, TypeRef, TypeRegistry};
pub use value::{
    format_float, repr_str, BareObject, BoundMethod, ClassValue, DictKey, FunctionValue,
    InstanceValue, Method, Namespace, NamespaceId, NativeFn, NativeFunction, Value,
};

pub const DEFAULT_MAX_FRAMES: usize = 1000;

/// Guest calls run on an explicit frame stack; only calls that pass through
/// native code (wrappers, `__init__`) re-enter the dispatch loop on the Rust
/// stack, and those re-entries are bounded separately.
pub const MAX_NATIVE_REENTRY: usize = 64;

pub struct Vm {
    builtins: IndexMap<String, Value>,
    registry: TypeRegistry,
    modules: IndexMap<String, Rc<Namespace>>,
    depth: usize,
    reentry: usize,
    instruction_count: usize,
    max_instructions: Option<usize>,
    max_frames: usize,
    output_buffer: Option<Vec<String>>,
}

struct Activation {
    procedure: Rc<Procedure>,
    globals: Rc<Namespace>,
    /// `None` at module level, where locals are the globals.
    locals: Option<IndexMap<String, Value>>,
    stack: Vec<Value>,
    ip: usize,
}

enum Flow {
    Return(Value),
    Enter(Activation),
}

enum PendingCall {
    Enter(Activation),
    Done(Value),
}

impl Activation {
    fn stack_frame(&self) -> StackFrame {
        StackFrame {
            name: self.procedure.name.clone(),
            qualname: self.procedure.qualname.clone(),
            filename: self
                .procedure
                .filename
                .clone()
                .or_else(|| self.globals.filename.clone()),
            line: self.procedure.line_at(self.ip),
            local_names: self
                .locals
                .as_ref()
                .map(|locals| locals.keys().cloned().collect())
                .unwrap_or_default(),
            namespace: self.globals.clone(),
        }
    }

    fn pop(&mut self) -> Result<Value, Exception> {
        self.stack
            .pop()
            .ok_or_else(|| Exception::new(ExcKind::RuntimeError, "stack underflow"))
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, Exception> {
        if count > self.stack.len() {
            return Err(Exception::new(ExcKind::RuntimeError, "stack underflow"));
        }
        let at = self.stack.len() - count;
        Ok(self.stack.split_off(at))
    }

    fn load_local(&self, name: &str) -> Option<Value> {
        match &self.locals {
            Some(locals) => locals.get(name).cloned(),
            None => self.globals.get(name),
        }
    }

    fn store_local(&mut self, name: &str, value: Value) {
        match &mut self.locals {
            Some(locals) => {
                locals.insert(name.to_string(), value);
            }
            None => self.globals.set(name, value),
        }
    }

    fn delete_local(&mut self, name: &str) -> Option<Value> {
        match &mut self.locals {
            Some(locals) => locals.shift_remove(name),
            None => self.globals.remove(name),
        }
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut builtins = IndexMap::new();
        builtins::install(&mut builtins);
        Self {
            builtins,
            registry: TypeRegistry::with_builtins(),
            modules: IndexMap::new(),
            depth: 0,
            reentry: 0,
            instruction_count: 0,
            max_instructions: None,
            max_frames: DEFAULT_MAX_FRAMES,
            output_buffer: None,
        }
    }

    pub fn with_limits(max_instructions: usize, max_frames: usize) -> Self {
        let mut vm = Vm::new();
        vm.max_instructions = Some(max_instructions);
        vm.max_frames = max_frames;
        vm
    }

    /// Collects `print` output instead of writing it to stdout.
    pub fn with_output_capture() -> Self {
        let mut vm = Vm::new();
        vm.output_buffer = Some(Vec::new());
        vm
    }

    pub fn take_output(&mut self) -> Vec<String> {
        self.output_buffer
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn builtin(&self, name: &str) -> Option<Value> {
        self.builtins.get(name).cloned()
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    pub fn new_namespace(&self, name: &str, filename: Option<String>) -> Rc<Namespace> {
        Rc::new(Namespace::new(name, filename))
    }

    pub fn register_module(&mut self, name: &str, namespace: Rc<Namespace>) {
        debug!(module = name, "registered module");
        self.modules.insert(name.to_string(), namespace);
    }

    pub fn module(&self, name: &str) -> Option<Rc<Namespace>> {
        self.modules.get(name).cloned()
    }

    pub fn remove_module(&mut self, name: &str) -> Option<Rc<Namespace>> {
        self.modules.shift_remove(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = (&str, &Rc<Namespace>)> {
        self.modules.iter().map(|(name, ns)| (name.as_str(), ns))
    }

    /// Runs a module body with `namespace` as both locals and globals.
    pub fn exec_module(
        &mut self,
        procedure: &Procedure,
        namespace: &Rc<Namespace>,
    ) -> Result<Value, Exception> {
        self.run_frame(Activation {
            procedure: Rc::new(procedure.clone()),
            globals: namespace.clone(),
            locals: None,
            stack: Vec::new(),
            ip: 0,
        })
    }

    pub fn call(&mut self, callable: &Value, args: Vec<Value>) -> Result<Value, Exception> {
        match self.prepare_call(callable, args)? {
            PendingCall::Enter(activation) => self.run_frame(activation),
            PendingCall::Done(value) => Ok(value),
        }
    }

    /// Guest functions come back as an activation to push; everything else
    /// is called right away.
    fn prepare_call(
        &mut self,
        callable: &Value,
        args: Vec<Value>,
    ) -> Result<PendingCall, Exception> {
        match callable {
            Value::Function(function) => function_activation(function, args).map(PendingCall::Enter),
            Value::Native(native) => {
                let native = native.clone();
                (native.func)(self, args).map(PendingCall::Done)
            }
            Value::BoundMethod(bound) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(bound.receiver.clone());
                match &bound.method {
                    Method::Function(function) => {
                        full.extend(args);
                        function_activation(function, full).map(PendingCall::Enter)
                    }
                    Method::Native(native) => {
                        full.extend(args);
                        let native = native.clone();
                        (native.func)(self, full).map(PendingCall::Done)
                    }
                    Method::Builtin(name) => {
                        builtins::call_method(&bound.receiver, *name, args).map(PendingCall::Done)
                    }
                }
            }
            Value::Class(class) => self.instantiate(class, args).map(PendingCall::Done),
            other => Err(Exception::new(
                ExcKind::TypeError,
                format!("'{}' object is not callable", other.type_name()),
            )),
        }
    }

    fn instantiate(&mut self, class: &Rc<ClassValue>, args: Vec<Value>) -> Result<Value, Exception> {
        let instance = Value::Instance(Rc::new(InstanceValue {
            class: class.clone(),
            attrs: RefCell::new(IndexMap::new()),
        }));
        let init = class.attrs.borrow().get("__init__").cloned();
        match init {
            Some(init) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(instance.clone());
                full.extend(args);
                let result = self.call(&init, full)?;
                if result != Value::None {
                    return Err(Exception::new(
                        ExcKind::TypeError,
                        format!(
                            "__init__() should return None, not '{}'",
                            result.type_name()
                        ),
                    ));
                }
            }
            None if !args.is_empty() => {
                return Err(Exception::new(
                    ExcKind::TypeError,
                    format!("{}() takes no arguments", class.name),
                ))
            }
            None => {}
        }
        Ok(instance)
    }

    fn run_frame(&mut self, activation: Activation) -> Result<Value, Exception> {
        if self.reentry >= MAX_NATIVE_REENTRY {
            return Err(recursion_error());
        }
        self.reentry += 1;
        let base = self.depth;
        let result = self.run_frames(activation);
        self.depth = base;
        self.reentry -= 1;
        result
    }

    fn push_frame(
        &mut self,
        frames: &mut Vec<Activation>,
        activation: Activation,
    ) -> Result<(), Exception> {
        if self.depth >= self.max_frames {
            return Err(recursion_error());
        }
        self.depth += 1;
        trace!(procedure = %activation.procedure.qualname, depth = self.depth, "enter");
        frames.push(activation);
        Ok(())
    }

    fn run_frames(&mut self, activation: Activation) -> Result<Value, Exception> {
        let mut frames = Vec::new();
        self.push_frame(&mut frames, activation)?;
        loop {
            let Some(frame) = frames.last_mut() else {
                return Ok(Value::None);
            };
            let flow = match self.dispatch(frame) {
                Ok(flow) => flow,
                Err(exc) => return Err(unwind(&frames, exc)),
            };
            match flow {
                Flow::Enter(callee) => {
                    if let Err(exc) = self.push_frame(&mut frames, callee) {
                        return Err(unwind(&frames, exc));
                    }
                }
                Flow::Return(value) => {
                    frames.pop();
                    self.depth -= 1;
                    let Some(caller) = frames.last_mut() else {
                        return Ok(value);
                    };
                    caller.stack.push(value);
                    caller.ip += 1;
                }
            }
        }
    }

    /// Runs `frame` until it returns or calls a guest function. On a call
    /// the frame's `ip` stays on the call instruction.
    fn dispatch(&mut self, frame: &mut Activation) -> Result<Flow, Exception> {
        let procedure = frame.procedure.clone();
        let code = &procedure.code;
        loop {
            let Some(op) = code.get(frame.ip) else {
                return Ok(Flow::Return(Value::None));
            };
            if let Some(max) = self.max_instructions {
                if self.instruction_count >= max {
                    return Err(Exception::new(
                        ExcKind::RuntimeError,
                        format!("execution limit exceeded: {max} instructions"),
                    ));
                }
            }
            self.instruction_count += 1;
            let mut next = frame.ip + 1;

            match op {
                Op::Nop => {}
                Op::LoadConst(constant) => frame.stack.push(Value::from_const(constant)),
                Op::LoadFast(name) => {
                    let value = frame
                        .load_local(name)
                        .ok_or_else(|| Exception::undefined_name(name))?;
                    frame.stack.push(value);
                }
                Op::StoreFast(name) | Op::StoreName(name) => {
                    let value = frame.pop()?;
                    frame.store_local(name, value);
                }
                Op::DeleteFast(name) | Op::DeleteName(name) => {
                    frame
                        .delete_local(name)
                        .ok_or_else(|| Exception::undefined_name(name))?;
                }
                Op::LoadGlobal(name) => {
                    let value = frame
                        .globals
                        .get(name)
                        .or_else(|| self.builtin(name))
                        .ok_or_else(|| Exception::undefined_name(name))?;
                    frame.stack.push(value);
                }
                Op::StoreGlobal(name) => {
                    let value = frame.pop()?;
                    frame.globals.set(name.as_str(), value);
                }
                Op::DeleteGlobal(name) => {
                    frame
                        .globals
                        .remove(name)
                        .ok_or_else(|| Exception::undefined_name(name))?;
                }
                Op::LoadName(name) => {
                    let value = frame
                        .load_local(name)
                        .or_else(|| frame.globals.get(name))
                        .or_else(|| self.builtin(name))
                        .ok_or_else(|| Exception::undefined_name(name))?;
                    frame.stack.push(value);
                }
                Op::LoadAttr(name) => {
                    let object = frame.pop()?;
                    let value = self.get_attr(&object, name)?;
                    frame.stack.push(value);
                }
                Op::StoreAttr(name) => {
                    let object = frame.pop()?;
                    let value = frame.pop()?;
                    self.set_attr(&object, name, value)?;
                }
                Op::DeleteAttr(name) => {
                    let object = frame.pop()?;
                    self.del_attr(&object, name)?;
                }
                Op::BinarySubscr => {
                    let key = frame.pop()?;
                    let object = frame.pop()?;
                    frame.stack.push(self.get_item(&object, &key)?);
                }
                Op::StoreSubscr => {
                    let key = frame.pop()?;
                    let object = frame.pop()?;
                    let value = frame.pop()?;
                    self.set_item(&object, key, value)?;
                }
                Op::DeleteSubscr => {
                    let key = frame.pop()?;
                    let object = frame.pop()?;
                    self.del_item(&object, &key)?;
                }
                Op::DupTop => {
                    let top = frame
                        .stack
                        .last()
                        .cloned()
                        .ok_or_else(|| Exception::new(ExcKind::RuntimeError, "stack underflow"))?;
                    frame.stack.push(top);
                }
                Op::DupTopN(count) => {
                    if *count > frame.stack.len() {
                        return Err(Exception::new(ExcKind::RuntimeError, "stack underflow"));
                    }
                    let start = frame.stack.len() - count;
                    let copies = frame.stack[start..].to_vec();
                    frame.stack.extend(copies);
                }
                Op::PopTop => {
                    frame.pop()?;
                }
                Op::RotTwo => {
                    let first = frame.pop()?;
                    let second = frame.pop()?;
                    frame.stack.push(first);
                    frame.stack.push(second);
                }
                Op::BuildList(count) => {
                    let items = frame.pop_n(*count)?;
                    frame.stack.push(Value::list(items));
                }
                Op::BuildTuple(count) => {
                    let items = frame.pop_n(*count)?;
                    frame.stack.push(Value::tuple(items));
                }
                Op::BuildMap(count) => {
                    let flat = frame.pop_n(count * 2)?;
                    let mut pairs = Vec::with_capacity(*count);
                    let mut iter = flat.into_iter();
                    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                        pairs.push((key, value));
                    }
                    frame.stack.push(Value::dict(pairs)?);
                }
                Op::BuildClass(name) => {
                    let body = frame.pop()?;
                    let class = self.build_class(name, &body, &frame.globals)?;
                    frame.stack.push(class);
                }
                Op::MakeFunction(captures) => {
                    let code = match frame.pop()? {
                        Value::Code(code) => code,
                        other => {
                            return Err(Exception::new(
                                ExcKind::TypeError,
                                format!("expected code object, got '{}'", other.type_name()),
                            ))
                        }
                    };
                    let mut captured = Vec::with_capacity(captures.len());
                    for name in captures {
                        let value = frame
                            .load_local(name)
                            .ok_or_else(|| Exception::undefined_name(name))?;
                        captured.push((name.clone(), value));
                    }
                    frame.stack.push(Value::Function(Rc::new(FunctionValue {
                        procedure: code,
                        globals: frame.globals.clone(),
                        captured,
                    })));
                }
                Op::CallFunction(count) => {
                    let args = frame.pop_n(*count)?;
                    let callable = frame.pop()?;
                    match self.prepare_call(&callable, args)? {
                        PendingCall::Enter(callee) => return Ok(Flow::Enter(callee)),
                        PendingCall::Done(result) => frame.stack.push(result),
                    }
                }
                Op::BinaryOp(op) => {
                    let right = frame.pop()?;
                    let left = frame.pop()?;
                    frame.stack.push(binary_op(*op, &left, &right)?);
                }
                Op::CompareOp(op) => {
                    let right = frame.pop()?;
                    let left = frame.pop()?;
                    frame.stack.push(compare_op(*op, &left, &right)?);
                }
                Op::UnaryNot => {
                    let value = frame.pop()?;
                    frame.stack.push(Value::Bool(!value.is_truthy()));
                }
                Op::Jump(target) => next = *target,
                Op::PopJumpIfFalse(target) => {
                    if !frame.pop()?.is_truthy() {
                        next = *target;
                    }
                }
                Op::PopJumpIfTrue(target) => {
                    if frame.pop()?.is_truthy() {
                        next = *target;
                    }
                }
                Op::Raise(kind) => {
                    let message = frame.pop()?;
                    let Some(kind) = ExcKind::from_name(kind) else {
                        return Err(Exception::new(
                            ExcKind::TypeError,
                            format!("unknown exception kind '{kind}'"),
                        ));
                    };
                    let args = match message {
                        Value::None => Vec::new(),
                        Value::Tuple(items) => items.as_ref().clone(),
                        other => vec![other],
                    };
                    return Err(Exception::with_args(kind, args));
                }
                Op::ReturnValue => return frame.pop().map(Flow::Return),
                Op::StoreScratch(slot) => {
                    let value = frame.pop()?;
                    scratch::store(frame.globals.id, *slot, value);
                }
                Op::ClearScratch(slot) => scratch::clear(frame.globals.id, *slot),
            }

            if next > code.len() {
                return Err(Exception::new(
                    ExcKind::RuntimeError,
                    format!("jump target {next} out of range"),
                ));
            }
            frame.ip = next;
        }
    }

    fn build_class(
        &mut self,
        name: &str,
        body: &Value,
        globals: &Rc<Namespace>,
    ) -> Result<Value, Exception> {
        let Value::Dict(entries) = body else {
            return Err(Exception::new(
                ExcKind::TypeError,
                format!("class body must be a dict, not '{}'", body.type_name()),
            ));
        };
        let mut attrs = IndexMap::new();
        for (key, value) in entries.borrow().iter() {
            match key {
                DictKey::Str(attr) => {
                    attrs.insert(attr.to_string(), value.clone());
                }
                other => {
                    return Err(Exception::new(
                        ExcKind::TypeError,
                        format!(
                            "class attribute names must be str, not '{}'",
                            other.to_value().type_name()
                        ),
                    ))
                }
            }
        }
        let module = globals
            .get("__name__")
            .map(|value| value.to_string())
            .unwrap_or_else(|| globals.name.clone());
        let class = Rc::new(ClassValue {
            name: name.to_string(),
            module,
            attrs: RefCell::new(attrs),
        });
        self.registry.register_class(class.clone());
        Ok(Value::Class(class))
    }

    pub fn type_of(&self, value: &Value) -> TypeRef {
        match value {
            Value::Instance(instance) => TypeRef::Class(instance.class.clone()),
            other => TypeRef::Builtin(BuiltinType::of(other).unwrap_or(BuiltinType::Object)),
        }
    }

    /// Sorted attribute names of a value.
    pub fn dir(&self, value: &Value) -> Vec<String> {
        match value {
            Value::Instance(instance) => types::sorted_names(
                types::class_dir(&instance.class)
                    .into_iter()
                    .chain(instance.attrs.borrow().keys().cloned()),
            ),
            Value::Class(class) => types::class_dir(class),
            other => self.type_of(other).dir(),
        }
    }

    pub fn len_of(&self, value: &Value) -> Option<usize> {
        value.len()
    }

    pub fn get_attr(&mut self, object: &Value, name: &str) -> Result<Value, Exception> {
        match object {
            Value::Instance(instance) => {
                if let Some(value) = instance.attrs.borrow().get(name) {
                    return Ok(value.clone());
                }
                let class_attr = instance.class.attrs.borrow().get(name).cloned();
                match class_attr {
                    Some(Value::Function(function)) => Ok(bind(object, Method::Function(function))),
                    Some(Value::Native(native)) => Ok(bind(object, Method::Native(native))),
                    Some(other) => Ok(other),
                    None => Err(missing_attribute(&instance.class.name, name)),
                }
            }
            Value::Class(class) => class.attrs.borrow().get(name).cloned().ok_or_else(|| {
                Exception::missing_attribute(
                    "type",
                    name,
                    format!("type object '{}' has no attribute '{name}'", class.name),
                )
            }),
            Value::Function(function) => match name {
                "__name__" => Ok(Value::from(function.procedure.name.as_str())),
                "__qualname__" => Ok(Value::from(function.procedure.qualname.as_str())),
                _ => Err(missing_attribute("function", name)),
            },
            Value::Native(native) if name == "__name__" => Ok(Value::from(native.name.as_str())),
            other => {
                let type_name = other.type_name();
                BuiltinType::of(other)
                    .and_then(|ty| builtins::method_name(ty, name))
                    .map(|method| bind(other, Method::Builtin(method)))
                    .ok_or_else(|| missing_attribute(&type_name, name))
            }
        }
    }

    pub fn set_attr(&mut self, object: &Value, name: &str, value: Value) -> Result<(), Exception> {
        match object {
            Value::Instance(instance) => {
                instance.attrs.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            Value::Class(class) => {
                class.attrs.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            other => {
                let type_name = other.type_name();
                let is_method = BuiltinType::of(other)
                    .and_then(|ty| builtins::method_name(ty, name))
                    .is_some();
                if is_method {
                    Err(Exception::new(
                        ExcKind::AttributeError,
                        format!("'{type_name}' object attribute '{name}' is read-only"),
                    ))
                } else {
                    Err(missing_attribute(&type_name, name))
                }
            }
        }
    }

    pub fn del_attr(&mut self, object: &Value, name: &str) -> Result<(), Exception> {
        match object {
            Value::Instance(instance) => instance
                .attrs
                .borrow_mut()
                .shift_remove(name)
                .map(|_| ())
                .ok_or_else(|| missing_attribute(&instance.class.name, name)),
            Value::Class(class) => class
                .attrs
                .borrow_mut()
                .shift_remove(name)
                .map(|_| ())
                .ok_or_else(|| {
                    Exception::missing_attribute(
                        "type",
                        name,
                        format!("type object '{}' has no attribute '{name}'", class.name),
                    )
                }),
            other => Err(missing_attribute(&other.type_name(), name)),
        }
    }

    pub fn get_item(&mut self, object: &Value, key: &Value) -> Result<Value, Exception> {
        match object {
            Value::List(items) => {
                let items = items.borrow();
                let found = sequence_index("list", key, items.len())?
                    .and_then(|index| items.get(index).cloned());
                found.ok_or_else(|| Exception::new(ExcKind::IndexError, "list index out of range"))
            }
            Value::Tuple(items) => {
                let found = sequence_index("tuple", key, items.len())?
                    .and_then(|index| items.get(index).cloned());
                found.ok_or_else(|| Exception::new(ExcKind::IndexError, "tuple index out of range"))
            }
            Value::Str(text) => {
                let len = text.chars().count();
                let (Value::Int(_) | Value::Bool(_)) = key else {
                    return Err(Exception::new(
                        ExcKind::TypeError,
                        format!("string indices must be integers, not '{}'", key.type_name()),
                    ));
                };
                sequence_index("string", key, len)?
                    .and_then(|index| text.chars().nth(index))
                    .map(|ch| Value::from(ch.to_string()))
                    .ok_or_else(|| Exception::new(ExcKind::IndexError, "string index out of range"))
            }
            Value::Dict(entries) => {
                let dict_key = DictKey::try_from_value(key)?;
                entries
                    .borrow()
                    .get(&dict_key)
                    .cloned()
                    .ok_or_else(|| Exception::with_args(ExcKind::KeyError, vec![key.clone()]))
            }
            other => Err(Exception::new(
                ExcKind::TypeError,
                format!("'{}' object is not subscriptable", other.type_name()),
            )),
        }
    }

    pub fn set_item(&mut self, object: &Value, key: Value, value: Value) -> Result<(), Exception> {
        match object {
            Value::List(items) => {
                let len = items.borrow().len();
                let index = sequence_index("list", &key, len)?.ok_or_else(|| {
                    Exception::new(ExcKind::IndexError, "list assignment index out of range")
                })?;
                items.borrow_mut()[index] = value;
                Ok(())
            }
            Value::Dict(entries) => {
                let dict_key = DictKey::try_from_value(&key)?;
                entries.borrow_mut().insert(dict_key, value);
                Ok(())
            }
            other => Err(Exception::new(
                ExcKind::TypeError,
                format!(
                    "'{}' object does not support item assignment",
                    other.type_name()
                ),
            )),
        }
    }

    pub fn del_item(&mut self, object: &Value, key: &Value) -> Result<(), Exception> {
        match object {
            Value::List(items) => {
                let len = items.borrow().len();
                let index = sequence_index("list", key, len)?.ok_or_else(|| {
                    Exception::new(ExcKind::IndexError, "list assignment index out of range")
                })?;
                items.borrow_mut().remove(index);
                Ok(())
            }
            Value::Dict(entries) => {
                let dict_key = DictKey::try_from_value(key)?;
                entries
                    .borrow_mut()
                    .shift_remove(&dict_key)
                    .map(|_| ())
                    .ok_or_else(|| Exception::with_args(ExcKind::KeyError, vec![key.clone()]))
            }
            other => Err(Exception::new(
                ExcKind::TypeError,
                format!(
                    "'{}' object doesn't support item deletion",
                    other.type_name()
                ),
            )),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn function_activation(
    function: &Rc<FunctionValue>,
    args: Vec<Value>,
) -> Result<Activation, Exception> {
    let params = &function.procedure.params;
    if args.len() != params.len() {
        return Err(Exception::new(
            ExcKind::TypeError,
            format!(
                "{}() takes {} positional argument{} but {} {} given",
                function.procedure.name,
                params.len(),
                if params.len() == 1 { "" } else { "s" },
                args.len(),
                if args.len() == 1 { "was" } else { "were" }
            ),
        ));
    }
    let mut locals = IndexMap::with_capacity(function.captured.len() + params.len());
    for (name, value) in &function.captured {
        locals.insert(name.clone(), value.clone());
    }
    for (name, value) in params.iter().zip(args) {
        locals.insert(name.clone(), value);
    }
    Ok(Activation {
        procedure: function.procedure.clone(),
        globals: function.globals.clone(),
        locals: Some(locals),
        stack: Vec::new(),
        ip: 0,
    })
}

fn recursion_error() -> Exception {
    Exception::new(ExcKind::RecursionError, "maximum recursion depth exceeded")
}

/// Adds the live frames to a failure's traceback, outermost first.
fn unwind(frames: &[Activation], mut exc: Exception) -> Exception {
    for frame in frames.iter().rev() {
        exc.traceback.insert(0, frame.stack_frame());
    }
    exc
}

fn bind(receiver: &Value, method: Method) -> Value {
    Value::BoundMethod(Rc::new(BoundMethod {
        receiver: receiver.clone(),
        method,
    }))
}

fn missing_attribute(type_name: &str, attribute: &str) -> Exception {
    Exception::missing_attribute(
        type_name,
        attribute,
        format!("'{type_name}' object has no attribute '{attribute}'"),
    )
}

/// Resolves a possibly negative index; `Ok(None)` when out of range.
fn sequence_index(kind: &str, key: &Value, len: usize) -> Result<Option<usize>, Exception> {
    let index = match key {
        Value::Int(index) => *index,
        Value::Bool(flag) => i64::from(*flag),
        other => {
            return Err(Exception::new(
                ExcKind::TypeError,
                format!(
                    "{kind} indices must be integers or slices, not {}",
                    other.type_name()
                ),
            ))
        }
    };
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    Ok((0..len).contains(&index).then_some(index as usize))
}

fn unsupported(symbol: &str, left: &Value, right: &Value) -> Exception {
    Exception::new(
        ExcKind::TypeError,
        format!(
            "unsupported operand type(s) for {symbol}: '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ),
    )
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(*v),
        Value::Bool(v) => Some(i64::from(*v)),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Float(v) => Some(*v),
        other => as_int(other).map(|v| v as f64),
    }
}

fn overflow() -> Exception {
    Exception::new(ExcKind::RuntimeError, "integer overflow")
}

fn repeat(items: &[Value], times: i64) -> Vec<Value> {
    let times = times.max(0) as usize;
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend(items.iter().cloned());
    }
    out
}

fn binary_op(op: BinOp, left: &Value, right: &Value) -> Result<Value, Exception> {
    let symbol = match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::TrueDiv => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
    };
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => return Ok(Value::from(format!("{a}{b}"))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            return Ok(Value::list(items));
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = a.as_ref().clone();
            items.extend(b.iter().cloned());
            return Ok(Value::tuple(items));
        }
        (BinOp::Mul, Value::Str(text), count) | (BinOp::Mul, count, Value::Str(text))
            if as_int(count).is_some() =>
        {
            let times = as_int(count).unwrap_or(0).max(0) as usize;
            return Ok(Value::from(text.repeat(times)));
        }
        (BinOp::Mul, Value::List(items), count) | (BinOp::Mul, count, Value::List(items))
            if as_int(count).is_some() =>
        {
            let repeated = repeat(&items.borrow(), as_int(count).unwrap_or(0));
            return Ok(Value::list(repeated));
        }
        _ => {}
    }

    if let (Some(a), Some(b)) = (as_int(left), as_int(right)) {
        let value = match op {
            BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
            BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
            BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
            BinOp::TrueDiv => {
                if b == 0 {
                    return Err(Exception::new(ExcKind::ZeroDivisionError, "division by zero"));
                }
                return Ok(Value::Float(a as f64 / b as f64));
            }
            BinOp::FloorDiv => {
                if b == 0 {
                    return Err(Exception::new(
                        ExcKind::ZeroDivisionError,
                        "integer division or modulo by zero",
                    ));
                }
                let quotient = a.checked_div(b).ok_or_else(overflow)?;
                if (a % b != 0) && ((a < 0) != (b < 0)) {
                    quotient - 1
                } else {
                    quotient
                }
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(Exception::new(
                        ExcKind::ZeroDivisionError,
                        "integer modulo by zero",
                    ));
                }
                let remainder = a.checked_rem(b).ok_or_else(overflow)?;
                if remainder != 0 && ((remainder < 0) != (b < 0)) {
                    remainder + b
                } else {
                    remainder
                }
            }
        };
        return Ok(Value::Int(value));
    }

    let (Some(a), Some(b)) = (as_float(left), as_float(right)) else {
        return Err(unsupported(symbol, left, right));
    };
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::TrueDiv | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => {
            return Err(Exception::new(
                ExcKind::ZeroDivisionError,
                "float division by zero",
            ))
        }
        BinOp::TrueDiv => a / b,
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Mod => a - b * (a / b).floor(),
    };
    Ok(Value::Float(value))
}

fn contains(container: &Value, item: &Value) -> Result<bool, Exception> {
    match container {
        Value::Str(text) => match item.as_str() {
            Some(needle) => Ok(text.contains(needle)),
            None => Err(Exception::new(
                ExcKind::TypeError,
                format!(
                    "'in <string>' requires string as left operand, not {}",
                    item.type_name()
                ),
            )),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|candidate| candidate == item)),
        Value::Tuple(items) => Ok(items.iter().any(|candidate| candidate == item)),
        Value::Dict(entries) => {
            let key = DictKey::try_from_value(item)?;
            Ok(entries.borrow().contains_key(&key))
        }
        other => Err(Exception::new(
            ExcKind::TypeError,
            format!("argument of type '{}' is not iterable", other.type_name()),
        )),
    }
}

fn compare_op(op: CmpOp, left: &Value, right: &Value) -> Result<Value, Exception> {
    let result = match op {
        CmpOp::Eq => left == right,
        CmpOp::Ne => left != right,
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left, right) {
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => match (as_float(left), as_float(right)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => {
                        return Err(Exception::new(
                            ExcKind::TypeError,
                            format!(
                                "'{}' not supported between instances of '{}' and '{}'",
                                op.symbol(),
                                left.type_name(),
                                right.type_name()
                            ),
                        ))
                    }
                },
            };
            match ordering {
                Some(ordering) => match op {
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                },
                None => false,
            }
        }
    };
    Ok(Value::Bool(result))
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use exlens_asm::assemble;
    use exlens_ir::{instrument, ScratchSlot};
    use proptest::prelude::*;

    use super::{
        scratch, ExcDetail, ExcKind, Exception, Namespace, NativeFunction, Value, Vm,
        DEFAULT_MAX_FRAMES, MAX_NATIVE_REENTRY,
    };

    fn load(vm: &mut Vm, source: &str, instrumented: bool) -> Rc<Namespace> {
        let mut procedure = assemble(source).expect("assemble");
        if instrumented {
            procedure = instrument(procedure);
        }
        let namespace = vm.new_namespace("foo_data", procedure.filename.clone());
        vm.exec_module(&procedure, &namespace).expect("exec module");
        namespace
    }

    fn call(vm: &mut Vm, namespace: &Namespace, name: &str) -> Result<Value, Exception> {
        let callable = namespace.get(name).expect("function defined");
        vm.call(&callable, Vec::new())
    }

    const FOO_DATA: &str = r#"
proc <module> file=foo_data.exa
  LOAD_CONST proc __init__ params=self
    LOAD_CONST 'Foo'
    LOAD_FAST self
    STORE_ATTR name
    LOAD_CONST None
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME __init__
  LOAD_CONST '__init__'
  LOAD_NAME __init__
  BUILD_MAP 1
  BUILD_CLASS Foo
  STORE_NAME Foo

  LOAD_CONST proc subscr_binary
    BUILD_LIST 0
    STORE_FAST a
    LOAD_FAST a
    LOAD_CONST 0
    BINARY_SUBSCR
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME subscr_binary

  LOAD_CONST proc subscr_store
    BUILD_LIST 0
    STORE_FAST a
    LOAD_CONST 1
    LOAD_FAST a
    LOAD_CONST 0
    STORE_SUBSCR
    LOAD_CONST None
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME subscr_store

  LOAD_CONST proc attr_load
    LOAD_GLOBAL Foo
    CALL_FUNCTION 0
    STORE_FAST o
    LOAD_FAST o
    LOAD_ATTR names
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME attr_load

  LOAD_CONST proc ok
    LOAD_CONST 'a'
    LOAD_CONST 1
    BUILD_MAP 1
    STORE_FAST d
    LOAD_FAST d
    LOAD_CONST 'a'
    BINARY_SUBSCR
    LOAD_GLOBAL Foo
    CALL_FUNCTION 0
    LOAD_ATTR name
    BUILD_TUPLE 2
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME ok
  LOAD_CONST None
  RETURN_VALUE
end
"#;

    #[test]
    fn raises_scripting_style_failures() {
        let mut vm = Vm::new();
        let ns = load(&mut vm, FOO_DATA, false);

        let err = call(&mut vm, &ns, "subscr_binary").expect_err("index error");
        assert_eq!(err.to_string(), "IndexError: list index out of range");
        assert_eq!(err.traceback.len(), 1);
        assert_eq!(err.traceback[0].name, "subscr_binary");
        assert_eq!(err.traceback[0].filename.as_deref(), Some("foo_data.exa"));
        assert_eq!(err.traceback[0].line, Some(23));

        let err = call(&mut vm, &ns, "subscr_store").expect_err("index error");
        assert_eq!(err.message(), "list assignment index out of range");

        let err = call(&mut vm, &ns, "attr_load").expect_err("attribute error");
        assert_eq!(err.message(), "'Foo' object has no attribute 'names'");
        assert_eq!(
            err.detail,
            Some(ExcDetail::MissingAttribute {
                type_name: "Foo".to_string(),
                attribute: "names".to_string(),
            })
        );
    }

    #[test]
    fn failing_instrumented_operation_leaves_its_operands_in_scratch() {
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, FOO_DATA, true);

        let err = call(&mut vm, &ns, "subscr_binary").expect_err("index error");
        assert_eq!(err.kind, ExcKind::IndexError);
        assert_eq!(scratch::peek(ns.id, ScratchSlot::Attr), Some(Value::list(Vec::new())));
        assert_eq!(scratch::peek(ns.id, ScratchSlot::Index), Some(Value::Int(0)));

        scratch::reset();
        call(&mut vm, &ns, "attr_load").expect_err("attribute error");
        let subject = scratch::peek(ns.id, ScratchSlot::Attr).expect("subject stored");
        assert_eq!(subject.type_name(), "Foo");
        assert!(scratch::peek(ns.id, ScratchSlot::Index).is_none());
    }

    #[test]
    fn successful_instrumented_code_clears_scratch() {
        scratch::reset();
        let mut vm = Vm::new();
        let ns = load(&mut vm, FOO_DATA, true);
        let result = call(&mut vm, &ns, "ok").expect("ok");
        assert_eq!(result.repr(), "(1, 'Foo')");
        assert!(!scratch::is_set(ns.id));
    }

    #[test]
    fn loops_survive_instrumentation() {
        let source = r#"
proc <module> file=loop.exa
  LOAD_CONST proc total params=items
    LOAD_CONST 0
    STORE_FAST i
    LOAD_CONST 0
    STORE_FAST acc
  top:
    LOAD_FAST i
    LOAD_GLOBAL len
    LOAD_FAST items
    CALL_FUNCTION 1
    COMPARE_OP <
    POP_JUMP_IF_FALSE done
    LOAD_FAST acc
    LOAD_FAST items
    LOAD_FAST i
    BINARY_SUBSCR
    BINARY_ADD
    STORE_FAST acc
    LOAD_FAST i
    LOAD_CONST 1
    BINARY_ADD
    STORE_FAST i
    JUMP_ABSOLUTE top
  done:
    LOAD_FAST acc
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME total
end
"#;
        for instrumented in [false, true] {
            let mut vm = Vm::new();
            let ns = load(&mut vm, source, instrumented);
            let total = ns.get("total").expect("total");
            let items = Value::list((1..=4).map(Value::Int).collect());
            assert_eq!(vm.call(&total, vec![items]).expect("call"), Value::Int(10));
        }
    }

    #[test]
    fn name_errors_carry_structured_detail() {
        let source = r#"
proc <module>
  LOAD_CONST proc f
    LOAD_CONST ''
    STORE_FAST var
    LOAD_GLOBAL vari
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#;
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, false);
        let err = call(&mut vm, &ns, "f").expect_err("name error");
        assert_eq!(err.to_string(), "NameError: name 'vari' is not defined");
        assert_eq!(err.traceback[0].local_names, vec!["var".to_string()]);
        assert!(matches!(err.detail, Some(ExcDetail::UndefinedName { ref name }) if name == "vari"));
    }

    #[test]
    fn key_errors_and_builtin_attribute_errors() {
        let mut vm = Vm::new();
        let dict = Value::dict(Vec::new()).expect("dict");
        let err = vm.get_item(&dict, &Value::from("bla")).expect_err("key error");
        assert_eq!(err.to_string(), "KeyError: 'bla'");

        let err = vm.get_attr(&Value::from(""), "Lower").expect_err("attribute");
        assert_eq!(err.message(), "'str' object has no attribute 'Lower'");
        let lower = vm.get_attr(&Value::from("AB"), "lower").expect("method");
        assert_eq!(vm.call(&lower, Vec::new()).expect("call"), Value::from("ab"));

        let object_type = vm.builtin("object").expect("object");
        let object = vm.call(&object_type, Vec::new()).expect("object()");
        let err = vm
            .set_attr(&object, "name", Value::from("bla"))
            .expect_err("bare object");
        assert_eq!(err.message(), "'object' object has no attribute 'name'");
        let err = vm.get_item(&Value::Int(3), &Value::Int(0)).expect_err("subscript");
        assert_eq!(err.message(), "'int' object is not subscriptable");
    }

    #[test]
    fn string_indexing_accepts_integers_only() {
        let mut vm = Vm::new();
        let text = Value::from("ab");
        assert_eq!(vm.get_item(&text, &Value::Int(-1)).expect("last"), Value::from("b"));
        assert_eq!(vm.get_item(&text, &Value::Bool(false)).expect("first"), Value::from("a"));
        let err = vm.get_item(&text, &Value::Int(2)).expect_err("out of range");
        assert_eq!(err.to_string(), "IndexError: string index out of range");
        let err = vm.get_item(&text, &Value::from("a")).expect_err("str key");
        assert_eq!(err.message(), "string indices must be integers, not 'str'");
    }

    #[test]
    fn recursion_is_bounded() {
        let source = r#"
proc <module>
  LOAD_CONST proc f
    LOAD_GLOBAL f
    CALL_FUNCTION 0
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#;
        let mut vm = Vm::with_limits(1_000_000, 50);
        let ns = load(&mut vm, source, false);
        let err = call(&mut vm, &ns, "f").expect_err("recursion");
        assert_eq!(err.kind, ExcKind::RecursionError);
        assert_eq!(err.traceback.len(), 50);
    }

    const SELF_CALL: &str = r#"
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

    #[test]
    fn default_frame_limit_raises_instead_of_overflowing() {
        let mut vm = Vm::new();
        let ns = load(&mut vm, SELF_CALL, true);
        let err = call(&mut vm, &ns, "f").expect_err("recursion");
        assert_eq!(err.to_string(), "RecursionError: maximum recursion depth exceeded");
        assert_eq!(err.traceback.len(), DEFAULT_MAX_FRAMES);
        assert!(err.traceback.iter().all(|frame| frame.line == Some(5)));

        // The frame stack is usable again afterwards.
        let source = "proc <module>\n  LOAD_CONST 7\n  RETURN_VALUE\nend\n";
        let procedure = assemble(source).expect("assemble");
        let again = vm.new_namespace("again", None);
        assert_eq!(vm.exec_module(&procedure, &again).expect("exec"), Value::Int(7));
    }

    #[test]
    fn recursion_through_native_calls_is_bounded() {
        let source = r#"
proc <module>
  LOAD_CONST proc f
    LOAD_GLOBAL bounce
    CALL_FUNCTION 0
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#;
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, false);
        let target = ns.clone();
        let bounce = NativeFunction::new("bounce", move |vm: &mut Vm, _args: Vec<Value>| {
            let f = target.get("f").ok_or_else(|| Exception::undefined_name("f"))?;
            vm.call(&f, Vec::new())
        });
        ns.set("bounce", Value::Native(Rc::new(bounce)));
        let err = call(&mut vm, &ns, "f").expect_err("recursion");
        assert_eq!(err.kind, ExcKind::RecursionError);
        assert_eq!(err.traceback.len(), MAX_NATIVE_REENTRY);
    }

    #[test]
    fn instruction_limit_stops_infinite_loops() {
        let source = "proc <module>\nspin:\n  JUMP_ABSOLUTE spin\nend\n";
        let procedure = assemble(source).expect("assemble");
        let mut vm = Vm::with_limits(100, 10);
        let ns = vm.new_namespace("spin", None);
        let err = vm.exec_module(&procedure, &ns).expect_err("limit");
        assert_eq!(err.message(), "execution limit exceeded: 100 instructions");
    }

    #[test]
    fn closures_capture_by_value() {
        let source = r#"
proc <module>
  LOAD_CONST proc outer
    LOAD_CONST 'seen'
    STORE_FAST x
    LOAD_CONST proc inner
      LOAD_FAST x
      RETURN_VALUE
    end
    MAKE_FUNCTION x
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME outer
end
"#;
        let mut vm = Vm::new();
        let ns = load(&mut vm, source, false);
        let inner = call(&mut vm, &ns, "outer").expect("outer");
        assert_eq!(vm.call(&inner, Vec::new()).expect("inner"), Value::from("seen"));
    }

    #[test]
    fn print_output_can_be_captured() {
        let source = "proc <module>\n  LOAD_NAME print\n  LOAD_CONST 'hi'\n  LOAD_CONST 3\n  CALL_FUNCTION 2\n  POP_TOP\nend\n";
        let mut vm = Vm::with_output_capture();
        load(&mut vm, source, false);
        assert_eq!(vm.take_output(), vec!["hi 3".to_string()]);
    }

    fn arithmetic_listing(a: i64, b: i64) -> String {
        format!(
            r#"
proc <module>
  LOAD_CONST proc f
    LOAD_CONST {a}
    LOAD_CONST {b}
    BUILD_LIST 2
    STORE_FAST xs
    LOAD_FAST xs
    LOAD_CONST 0
    BINARY_SUBSCR
    LOAD_FAST xs
    LOAD_CONST 1
    BINARY_SUBSCR
    BINARY_MODULO
    LOAD_FAST xs
    LOAD_CONST 2
    LOAD_CONST {b}
    COMPARE_OP >
    POP_JUMP_IF_FALSE skip
    LOAD_CONST 0
    BINARY_SUBSCR
    JUMP_ABSOLUTE out
  skip:
    LOAD_CONST 1
    BINARY_SUBSCR
  out:
    BUILD_TUPLE 2
    RETURN_VALUE
  end
  MAKE_FUNCTION
  STORE_NAME f
end
"#
        )
    }

    fn outcome(result: Result<Value, Exception>) -> String {
        match result {
            Ok(value) => value.repr(),
            Err(err) => err.to_string(),
        }
    }

    proptest! {
        #[test]
        fn instrumentation_is_transparent(a in -1000i64..1000, b in -5i64..5) {
            let source = arithmetic_listing(a, b);
            let mut plain = Vm::new();
            let plain_ns = load(&mut plain, &source, false);
            let mut traced = Vm::new();
            let traced_ns = load(&mut traced, &source, true);
            let expected = outcome(call(&mut plain, &plain_ns, "f"));
            let actual = outcome(call(&mut traced, &traced_ns, "f"));
            prop_assert_eq!(expected, actual);
        }
    }
}
