use std::rc::Rc;

use indexmap::IndexMap;

use crate::exception::{ExcKind, Exception};
use crate::types::BuiltinType;
use crate::value::{BareObject, DictKey, NativeFunction, Value};
use crate::Vm;

pub(crate) fn install(builtins: &mut IndexMap<String, Value>) {
    let mut add = |name: &str, native: NativeFunction| {
        builtins.insert(name.to_string(), Value::Native(Rc::new(native)));
    };

    add(
        "len",
        NativeFunction::new("len", |_vm, args| {
            let [value] = exact_args::<1>("len", args)?;
            value.len().map(|len| Value::Int(len as i64)).ok_or_else(|| {
                Exception::new(
                    ExcKind::TypeError,
                    format!("object of type '{}' has no len()", value.type_name()),
                )
            })
        }),
    );
    add(
        "object",
        NativeFunction::new("object", |_vm, args| {
            let [] = exact_args::<0>("object", args)?;
            Ok(Value::Object(Rc::new(BareObject)))
        }),
    );
    add(
        "repr",
        NativeFunction::new("repr", |_vm, args| {
            let [value] = exact_args::<1>("repr", args)?;
            Ok(Value::from(value.repr()))
        }),
    );
    add(
        "str",
        NativeFunction::new("str", |_vm, args| match args.as_slice() {
            [] => Ok(Value::from("")),
            [value] => Ok(Value::from(value.to_string())),
            _ => Err(arity_error("str", "at most 1 argument", args.len())),
        }),
    );
    add(
        "dir",
        NativeFunction::new("dir", |vm, args| {
            let [value] = exact_args::<1>("dir", args)?;
            Ok(Value::list(
                vm.dir(&value).into_iter().map(Value::from).collect(),
            ))
        }),
    );
    add(
        "print",
        NativeFunction::new("print", |vm, args| {
            let line = args
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            vm.write_output(line);
            Ok(Value::None)
        }),
    );
}

fn arity_error(name: &str, expected: &str, given: usize) -> Exception {
    Exception::new(
        ExcKind::TypeError,
        format!("{name}() takes {expected} ({given} given)"),
    )
}

fn exact_args<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], Exception> {
    let given = args.len();
    args.try_into().map_err(|_| {
        let expected = match N {
            0 => "no arguments".to_string(),
            1 => "exactly one argument".to_string(),
            n => format!("exactly {n} arguments"),
        };
        arity_error(name, &expected, given)
    })
}

fn args_between(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), Exception> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {min} argument{}", if min == 1 { "" } else { "s" })
        } else {
            format!("from {min} to {max} arguments")
        };
        return Err(arity_error(name, &expected, args.len()));
    }
    Ok(())
}

/// Interned name of a builtin method, if `ty` has one called `name`.
pub(crate) fn method_name(ty: BuiltinType, name: &str) -> Option<&'static str> {
    ty.methods().iter().copied().find(|method| *method == name)
}

pub(crate) fn call_method(
    receiver: &Value,
    name: &'static str,
    args: Vec<Value>,
) -> Result<Value, Exception> {
    match receiver {
        Value::Str(text) => str_method(text, name, args),
        Value::List(_) => list_method(receiver, name, args),
        Value::Dict(_) => dict_method(receiver, name, args),
        other => Err(Exception::new(
            ExcKind::TypeError,
            format!("'{}' object has no method '{name}'", other.type_name()),
        )),
    }
}

fn expect_str<'a>(method: &str, value: &'a Value) -> Result<&'a str, Exception> {
    value.as_str().ok_or_else(|| {
        Exception::new(
            ExcKind::TypeError,
            format!(
                "{method}() argument must be str, not {}",
                value.type_name()
            ),
        )
    })
}

fn is_cased_all(text: &str, lower: bool) -> bool {
    let mut cased = false;
    for ch in text.chars() {
        if ch.is_lowercase() {
            if !lower {
                return false;
            }
            cased = true;
        } else if ch.is_uppercase() {
            if lower {
                return false;
            }
            cased = true;
        }
    }
    cased
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_cased = false;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if previous_cased {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            previous_cased = true;
        } else {
            out.push(ch);
            previous_cased = false;
        }
    }
    out
}

fn char_index(text: &str, byte_index: usize) -> i64 {
    text[..byte_index].chars().count() as i64
}

fn str_method(text: &str, name: &'static str, args: Vec<Value>) -> Result<Value, Exception> {
    let value = match name {
        "lower" | "upper" | "title" | "capitalize" | "isdigit" | "islower" | "isupper" => {
            let [] = exact_args::<0>(name, args)?;
            match name {
                "lower" => Value::from(text.to_lowercase()),
                "upper" => Value::from(text.to_uppercase()),
                "title" => Value::from(title_case(text)),
                "capitalize" => {
                    let mut chars = text.chars();
                    let out = match chars.next() {
                        Some(first) => first
                            .to_uppercase()
                            .chain(chars.as_str().to_lowercase().chars())
                            .collect::<String>(),
                        None => String::new(),
                    };
                    Value::from(out)
                }
                "isdigit" => {
                    Value::Bool(!text.is_empty() && text.chars().all(|c| c.is_ascii_digit()))
                }
                "islower" => Value::Bool(is_cased_all(text, true)),
                _ => Value::Bool(is_cased_all(text, false)),
            }
        }
        "strip" | "lstrip" | "rstrip" => {
            args_between(name, &args, 0, 1)?;
            let chars: Option<Vec<char>> = match args.first() {
                None | Some(Value::None) => None,
                Some(value) => Some(expect_str(name, value)?.chars().collect()),
            };
            let matches = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            let out = match name {
                "strip" => text.trim_matches(matches),
                "lstrip" => text.trim_start_matches(matches),
                _ => text.trim_end_matches(matches),
            };
            Value::from(out)
        }
        "count" | "find" | "startswith" | "endswith" => {
            let [needle] = exact_args::<1>(name, args)?;
            let needle = expect_str(name, &needle)?;
            match name {
                "count" => Value::Int(if needle.is_empty() {
                    text.chars().count() as i64 + 1
                } else {
                    text.matches(needle).count() as i64
                }),
                "find" => Value::Int(
                    text.find(needle)
                        .map(|index| char_index(text, index))
                        .unwrap_or(-1),
                ),
                "startswith" => Value::Bool(text.starts_with(needle)),
                _ => Value::Bool(text.ends_with(needle)),
            }
        }
        "replace" => {
            let [old, new] = exact_args::<2>(name, args)?;
            Value::from(text.replace(expect_str(name, &old)?, expect_str(name, &new)?))
        }
        "split" => {
            args_between(name, &args, 0, 1)?;
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::None) => text.split_whitespace().map(Value::from).collect(),
                Some(sep) => {
                    let sep = expect_str(name, sep)?;
                    if sep.is_empty() {
                        return Err(Exception::new(ExcKind::ValueError, "empty separator"));
                    }
                    text.split(sep).map(Value::from).collect()
                }
            };
            Value::list(parts)
        }
        "join" => {
            let [items] = exact_args::<1>(name, args)?;
            let items = sequence_items(&items).ok_or_else(|| {
                Exception::new(
                    ExcKind::TypeError,
                    "can only join an iterable".to_string(),
                )
            })?;
            let mut parts = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(part) => parts.push(part.to_string()),
                    None => {
                        return Err(Exception::new(
                            ExcKind::TypeError,
                            format!(
                                "sequence item {index}: expected str instance, {} found",
                                item.type_name()
                            ),
                        ))
                    }
                }
            }
            Value::from(parts.join(text))
        }
        other => {
            return Err(Exception::missing_attribute(
                "str",
                other,
                format!("'str' object has no attribute '{other}'"),
            ))
        }
    };
    Ok(value)
}

fn sequence_items(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::List(items) => Some(items.borrow().clone()),
        Value::Tuple(items) => Some(items.as_ref().clone()),
        Value::Dict(entries) => Some(entries.borrow().keys().map(DictKey::to_value).collect()),
        Value::Str(text) => Some(text.chars().map(|c| Value::from(c.to_string())).collect()),
        _ => None,
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

fn list_method(receiver: &Value, name: &'static str, args: Vec<Value>) -> Result<Value, Exception> {
    let Value::List(items) = receiver else {
        return Ok(Value::None);
    };
    let value = match name {
        "append" => {
            let [item] = exact_args::<1>(name, args)?;
            items.borrow_mut().push(item);
            Value::None
        }
        "extend" => {
            let [other] = exact_args::<1>(name, args)?;
            let extra = sequence_items(&other).ok_or_else(|| {
                Exception::new(
                    ExcKind::TypeError,
                    format!("'{}' object is not iterable", other.type_name()),
                )
            })?;
            items.borrow_mut().extend(extra);
            Value::None
        }
        "insert" => {
            let [index, item] = exact_args::<2>(name, args)?;
            let index = match index {
                Value::Int(index) => index,
                other => {
                    return Err(Exception::new(
                        ExcKind::TypeError,
                        format!(
                            "'{}' object cannot be interpreted as an integer",
                            other.type_name()
                        ),
                    ))
                }
            };
            let mut items = items.borrow_mut();
            let len = items.len() as i64;
            let position = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(position as usize, item);
            Value::None
        }
        "pop" => {
            args_between(name, &args, 0, 1)?;
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(Exception::new(ExcKind::IndexError, "pop from empty list"));
            }
            let index = match args.first() {
                None => items.len() - 1,
                Some(Value::Int(index)) => normalize_index(*index, items.len()).ok_or_else(|| {
                    Exception::new(ExcKind::IndexError, "pop index out of range")
                })?,
                Some(other) => {
                    return Err(Exception::new(
                        ExcKind::TypeError,
                        format!(
                            "'{}' object cannot be interpreted as an integer",
                            other.type_name()
                        ),
                    ))
                }
            };
            items.remove(index)
        }
        "remove" | "index" | "count" => {
            let [needle] = exact_args::<1>(name, args)?;
            let position = items.borrow().iter().position(|item| *item == needle);
            match name {
                "count" => Value::Int(
                    items
                        .borrow()
                        .iter()
                        .filter(|item| **item == needle)
                        .count() as i64,
                ),
                "index" => match position {
                    Some(index) => Value::Int(index as i64),
                    None => {
                        return Err(Exception::new(
                            ExcKind::ValueError,
                            format!("{} is not in list", needle.repr()),
                        ))
                    }
                },
                _ => match position {
                    Some(index) => {
                        items.borrow_mut().remove(index);
                        Value::None
                    }
                    None => {
                        return Err(Exception::new(
                            ExcKind::ValueError,
                            "list.remove(x): x not in list",
                        ))
                    }
                },
            }
        }
        "reverse" => {
            let [] = exact_args::<0>(name, args)?;
            items.borrow_mut().reverse();
            Value::None
        }
        other => {
            return Err(Exception::missing_attribute(
                "list",
                other,
                format!("'list' object has no attribute '{other}'"),
            ))
        }
    };
    Ok(value)
}

fn dict_method(receiver: &Value, name: &'static str, args: Vec<Value>) -> Result<Value, Exception> {
    let Value::Dict(entries) = receiver else {
        return Ok(Value::None);
    };
    let value = match name {
        "get" => {
            args_between(name, &args, 1, 2)?;
            let key = DictKey::try_from_value(&args[0])?;
            let default = args.get(1).cloned().unwrap_or(Value::None);
            entries.borrow().get(&key).cloned().unwrap_or(default)
        }
        "keys" => {
            let [] = exact_args::<0>(name, args)?;
            Value::list(entries.borrow().keys().map(DictKey::to_value).collect())
        }
        "values" => {
            let [] = exact_args::<0>(name, args)?;
            Value::list(entries.borrow().values().cloned().collect())
        }
        "items" => {
            let [] = exact_args::<0>(name, args)?;
            Value::list(
                entries
                    .borrow()
                    .iter()
                    .map(|(key, value)| Value::tuple(vec![key.to_value(), value.clone()]))
                    .collect(),
            )
        }
        "pop" => {
            args_between(name, &args, 1, 2)?;
            let key = DictKey::try_from_value(&args[0])?;
            let removed = entries.borrow_mut().shift_remove(&key);
            match (removed, args.get(1)) {
                (Some(value), _) => value,
                (None, Some(default)) => default.clone(),
                (None, None) => {
                    return Err(Exception::with_args(ExcKind::KeyError, vec![args[0].clone()]))
                }
            }
        }
        "setdefault" => {
            args_between(name, &args, 1, 2)?;
            let key = DictKey::try_from_value(&args[0])?;
            let default = args.get(1).cloned().unwrap_or(Value::None);
            entries.borrow_mut().entry(key).or_insert(default).clone()
        }
        "update" => {
            let [other] = exact_args::<1>(name, args)?;
            let other = match other {
                Value::Dict(other) => other,
                other => {
                    return Err(Exception::new(
                        ExcKind::TypeError,
                        format!("'{}' object is not a mapping", other.type_name()),
                    ))
                }
            };
            let extra: Vec<(DictKey, Value)> = other
                .borrow()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            entries.borrow_mut().extend(extra);
            Value::None
        }
        other => {
            return Err(Exception::missing_attribute(
                "dict",
                other,
                format!("'dict' object has no attribute '{other}'"),
            ))
        }
    };
    Ok(value)
}

impl Vm {
    pub(crate) fn write_output(&mut self, line: String) {
        match self.output_buffer.as_mut() {
            Some(buffer) => buffer.push(line),
            None => println!("{line}"),
        }
    }
}
