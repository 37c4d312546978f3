//! Line oriented listing format for procedures.
//!
//! ```text
//! proc <module> file=foo.exa
//!   LOAD_CONST proc subscr_binary
//!     BUILD_LIST 0
//!     STORE_FAST a
//!     LOAD_FAST a
//!     LOAD_CONST 0
//!     BINARY_SUBSCR
//!     RETURN_VALUE
//!   end
//!   MAKE_FUNCTION
//!   STORE_NAME subscr_binary
//! end
//! ```
//!
//! Every instruction records the listing line it came from, which is what
//! tracebacks report.

use std::collections::HashMap;
use std::fmt::Write as _;

use exlens_ir::{BinOp, CmpOp, Const, Op, Procedure, ScratchSlot};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AsmError {
    #[error("line {line}, column {column}: unknown mnemonic `{mnemonic}`")]
    UnknownMnemonic {
        mnemonic: String,
        line: u32,
        column: usize,
    },
    #[error("line {line}, column {column}: expected {expected}, found {found}")]
    Expected {
        expected: String,
        found: String,
        line: u32,
        column: usize,
    },
    #[error("line {line}, column {column}: unterminated string")]
    UnterminatedString { line: u32, column: usize },
    #[error("line {line}, column {column}: invalid escape `\\{escape}`")]
    InvalidEscape {
        escape: char,
        line: u32,
        column: usize,
    },
    #[error("line {line}: undefined label `{label}`")]
    UndefinedLabel { label: String, line: u32 },
    #[error("line {line}: duplicate label `{label}`")]
    DuplicateLabel { label: String, line: u32 },
    #[error("line {line}: missing `end` for proc `{name}`")]
    UnterminatedProc { name: String, line: u32 },
    #[error("line {line}: `end` without a matching proc")]
    UnexpectedEnd { line: u32 },
    #[error("line {line}, column {column}: unexpected trailing input `{found}`")]
    Trailing {
        found: String,
        line: u32,
        column: usize,
    },
    #[error("listing contains no procedure")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Word(String),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    column: usize,
}

impl Token {
    fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Word(word) => format!("`{word}`"),
            TokenKind::Str(text) => format!("string {}", quote(text)),
        }
    }
}

/// Splits one listing line into words and quoted strings; `#` ends the line.
fn tokenize(text: &str, line: u32) -> Result<Vec<Token>, AsmError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(start, ch)) = chars.peek() {
        let column = start + 1;
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '#' {
            break;
        }
        if ch == '\'' || ch == '"' {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some((_, c)) = chars.next() {
                if c == ch {
                    closed = true;
                    break;
                }
                if c == '\\' {
                    let escaped = match chars.next() {
                        Some((_, 'n')) => '\n',
                        Some((_, 't')) => '\t',
                        Some((_, 'r')) => '\r',
                        Some((_, '0')) => '\0',
                        Some((_, '\\')) => '\\',
                        Some((_, '\'')) => '\'',
                        Some((_, '"')) => '"',
                        Some((_, other)) => {
                            return Err(AsmError::InvalidEscape {
                                escape: other,
                                line,
                                column,
                            })
                        }
                        None => break,
                    };
                    value.push(escaped);
                    continue;
                }
                value.push(c);
            }
            if !closed {
                return Err(AsmError::UnterminatedString { line, column });
            }
            tokens.push(Token {
                kind: TokenKind::Str(value),
                column,
            });
            continue;
        }
        let mut word = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if c.is_whitespace() || c == '#' {
                break;
            }
            word.push(c);
            chars.next();
        }
        tokens.push(Token {
            kind: TokenKind::Word(word),
            column,
        });
    }
    Ok(tokens)
}

struct Line {
    number: u32,
    tokens: Vec<Token>,
}

struct Header {
    name: String,
    filename: Option<String>,
    params: Vec<String>,
}

struct Assembler {
    lines: Vec<Line>,
    pos: usize,
}

pub fn assemble(source: &str) -> Result<Procedure, AsmError> {
    assemble_with_filename(source, None)
}

/// Assembles a listing; `filename` applies when the header names none.
pub fn assemble_with_filename(source: &str, filename: Option<&str>) -> Result<Procedure, AsmError> {
    let mut lines = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let number = (index + 1) as u32;
        let tokens = tokenize(text, number)?;
        if !tokens.is_empty() {
            lines.push(Line { number, tokens });
        }
    }
    let mut assembler = Assembler { lines, pos: 0 };
    let Some(first) = assembler.lines.first() else {
        return Err(AsmError::Empty);
    };
    let number = first.number;
    let tokens = first.tokens.clone();
    match tokens.first().map(|token| &token.kind) {
        Some(TokenKind::Word(word)) if word == "proc" => {}
        _ => {
            return Err(AsmError::Expected {
                expected: "`proc`".to_string(),
                found: tokens[0].describe(),
                line: number,
                column: tokens[0].column,
            })
        }
    }
    assembler.pos = 1;
    let header = parse_header(&tokens[1..], number)?;
    let mut procedure = assembler.parse_body(header, number, None)?;
    if procedure.filename.is_none() {
        procedure.filename = filename.map(str::to_string);
        propagate_filename(&mut procedure);
    }
    if let Some(extra) = assembler.lines.get(assembler.pos) {
        return Err(AsmError::Trailing {
            found: extra.tokens[0].describe(),
            line: extra.number,
            column: extra.tokens[0].column,
        });
    }
    Ok(procedure)
}

fn propagate_filename(procedure: &mut Procedure) {
    let filename = procedure.filename.clone();
    for op in &mut procedure.code {
        if let Op::LoadConst(Const::Code(nested)) = op {
            if nested.filename.is_none() {
                nested.filename = filename.clone();
                propagate_filename(nested);
            }
        }
    }
}

fn parse_header(tokens: &[Token], line: u32) -> Result<Header, AsmError> {
    let Some(first) = tokens.first() else {
        return Err(AsmError::Expected {
            expected: "procedure name".to_string(),
            found: "end of line".to_string(),
            line,
            column: 1,
        });
    };
    let name = match &first.kind {
        TokenKind::Word(word) => word.clone(),
        TokenKind::Str(text) => text.clone(),
    };
    let mut header = Header {
        name,
        filename: None,
        params: Vec::new(),
    };
    for token in &tokens[1..] {
        let TokenKind::Word(word) = &token.kind else {
            return Err(AsmError::Trailing {
                found: token.describe(),
                line,
                column: token.column,
            });
        };
        match word.split_once('=') {
            Some(("file", value)) => header.filename = Some(value.to_string()),
            Some(("params", value)) => {
                header.params = value
                    .split(',')
                    .filter(|param| !param.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => {
                return Err(AsmError::Trailing {
                    found: token.describe(),
                    line,
                    column: token.column,
                })
            }
        }
    }
    Ok(header)
}

impl Assembler {
    fn parse_body(
        &mut self,
        header: Header,
        header_line: u32,
        parent: Option<&Procedure>,
    ) -> Result<Procedure, AsmError> {
        let mut procedure = Procedure::new(header.name.clone()).with_params(header.params);
        procedure.first_line = Some(header_line);
        procedure.filename = header
            .filename
            .or_else(|| parent.and_then(|parent| parent.filename.clone()));
        if let Some(parent) = parent {
            procedure.qualname = if parent.name == "<module>" {
                header.name.clone()
            } else {
                format!("{}.<locals>.{}", parent.qualname, header.name)
            };
        }

        let mut labels: HashMap<String, usize> = HashMap::new();
        let mut fixups: Vec<(usize, String, u32)> = Vec::new();

        loop {
            let Some(line) = self.lines.get(self.pos) else {
                return Err(AsmError::UnterminatedProc {
                    name: procedure.name,
                    line: header_line,
                });
            };
            let number = line.number;
            let tokens = line.tokens.clone();
            self.pos += 1;

            let TokenKind::Word(word) = &tokens[0].kind else {
                return Err(AsmError::Expected {
                    expected: "mnemonic".to_string(),
                    found: tokens[0].describe(),
                    line: number,
                    column: tokens[0].column,
                });
            };
            if word == "end" {
                expect_no_operand(&tokens, number)?;
                break;
            }
            if let Some(label) = word.strip_suffix(':') {
                expect_no_operand(&tokens, number)?;
                if labels.insert(label.to_string(), procedure.len()).is_some() {
                    return Err(AsmError::DuplicateLabel {
                        label: label.to_string(),
                        line: number,
                    });
                }
                continue;
            }

            let op = self.parse_instruction(word, &tokens, number, &procedure, &mut fixups)?;
            procedure.push(op, Some(number));
        }

        for (index, label, line) in fixups {
            let target = labels
                .get(&label)
                .copied()
                .ok_or(AsmError::UndefinedLabel { label, line })?;
            match &mut procedure.code[index] {
                Op::Jump(slot) | Op::PopJumpIfFalse(slot) | Op::PopJumpIfTrue(slot) => {
                    *slot = target;
                }
                _ => {}
            }
        }
        Ok(procedure)
    }

    fn parse_instruction(
        &mut self,
        mnemonic: &str,
        tokens: &[Token],
        line: u32,
        current: &Procedure,
        fixups: &mut Vec<(usize, String, u32)>,
    ) -> Result<Op, AsmError> {
        let operand = tokens.get(1);
        let no_operand = |op: Op| -> Result<Op, AsmError> {
            expect_no_operand(tokens, line)?;
            Ok(op)
        };
        let op = match mnemonic {
            "NOP" => no_operand(Op::Nop)?,
            "LOAD_CONST" => {
                let token = require(operand, "constant", line)?;
                if matches!(&token.kind, TokenKind::Word(word) if word == "proc") {
                    let header = parse_header(&tokens[2..], line)?;
                    let nested = self.parse_body(header, line, Some(current))?;
                    return Ok(Op::LoadConst(Const::Code(Box::new(nested))));
                }
                expect_arity(tokens, 2, line)?;
                Op::LoadConst(parse_const(token, line)?)
            }
            "LOAD_FAST" => Op::LoadFast(name_operand(tokens, line)?),
            "STORE_FAST" => Op::StoreFast(name_operand(tokens, line)?),
            "DELETE_FAST" => Op::DeleteFast(name_operand(tokens, line)?),
            "LOAD_GLOBAL" => Op::LoadGlobal(name_operand(tokens, line)?),
            "STORE_GLOBAL" => Op::StoreGlobal(name_operand(tokens, line)?),
            "DELETE_GLOBAL" => Op::DeleteGlobal(name_operand(tokens, line)?),
            "LOAD_NAME" => Op::LoadName(name_operand(tokens, line)?),
            "STORE_NAME" => Op::StoreName(name_operand(tokens, line)?),
            "DELETE_NAME" => Op::DeleteName(name_operand(tokens, line)?),
            "LOAD_ATTR" => Op::LoadAttr(name_operand(tokens, line)?),
            "STORE_ATTR" => Op::StoreAttr(name_operand(tokens, line)?),
            "DELETE_ATTR" => Op::DeleteAttr(name_operand(tokens, line)?),
            "BINARY_SUBSCR" => no_operand(Op::BinarySubscr)?,
            "STORE_SUBSCR" => no_operand(Op::StoreSubscr)?,
            "DELETE_SUBSCR" => no_operand(Op::DeleteSubscr)?,
            "DUP_TOP" => no_operand(Op::DupTop)?,
            "DUP_TOPX" => Op::DupTopN(count_operand(tokens, line)?),
            "POP_TOP" => no_operand(Op::PopTop)?,
            "ROT_TWO" => no_operand(Op::RotTwo)?,
            "BUILD_LIST" => Op::BuildList(count_operand(tokens, line)?),
            "BUILD_TUPLE" => Op::BuildTuple(count_operand(tokens, line)?),
            "BUILD_MAP" => Op::BuildMap(count_operand(tokens, line)?),
            "BUILD_CLASS" => Op::BuildClass(name_operand(tokens, line)?),
            "MAKE_FUNCTION" => {
                let mut captures = Vec::new();
                for token in &tokens[1..] {
                    captures.push(word_of(token, "captured name", line)?.to_string());
                }
                Op::MakeFunction(captures)
            }
            "CALL_FUNCTION" => Op::CallFunction(count_operand(tokens, line)?),
            "BINARY_ADD" => no_operand(Op::BinaryOp(BinOp::Add))?,
            "BINARY_SUBTRACT" => no_operand(Op::BinaryOp(BinOp::Sub))?,
            "BINARY_MULTIPLY" => no_operand(Op::BinaryOp(BinOp::Mul))?,
            "BINARY_TRUE_DIVIDE" => no_operand(Op::BinaryOp(BinOp::TrueDiv))?,
            "BINARY_FLOOR_DIVIDE" => no_operand(Op::BinaryOp(BinOp::FloorDiv))?,
            "BINARY_MODULO" => no_operand(Op::BinaryOp(BinOp::Mod))?,
            "COMPARE_OP" => {
                let symbol = name_operand(tokens, line)?;
                let token = &tokens[1];
                Op::CompareOp(CmpOp::from_symbol(&symbol).ok_or_else(|| AsmError::Expected {
                    expected: "comparison operator".to_string(),
                    found: token.describe(),
                    line,
                    column: token.column,
                })?)
            }
            "UNARY_NOT" => no_operand(Op::UnaryNot)?,
            "JUMP_ABSOLUTE" | "POP_JUMP_IF_FALSE" | "POP_JUMP_IF_TRUE" => {
                let target = name_operand(tokens, line)?;
                let index = match target.parse::<usize>() {
                    Ok(index) => index,
                    Err(_) => {
                        fixups.push((current.len(), target, line));
                        0
                    }
                };
                match mnemonic {
                    "JUMP_ABSOLUTE" => Op::Jump(index),
                    "POP_JUMP_IF_FALSE" => Op::PopJumpIfFalse(index),
                    _ => Op::PopJumpIfTrue(index),
                }
            }
            "RAISE" => Op::Raise(name_operand(tokens, line)?),
            "RETURN_VALUE" => no_operand(Op::ReturnValue)?,
            "STORE_SCRATCH" | "CLEAR_SCRATCH" => {
                let name = name_operand(tokens, line)?;
                let token = &tokens[1];
                let slot = ScratchSlot::from_name(&name).ok_or_else(|| AsmError::Expected {
                    expected: "`attr` or `index`".to_string(),
                    found: token.describe(),
                    line,
                    column: token.column,
                })?;
                if mnemonic == "STORE_SCRATCH" {
                    Op::StoreScratch(slot)
                } else {
                    Op::ClearScratch(slot)
                }
            }
            other => {
                return Err(AsmError::UnknownMnemonic {
                    mnemonic: other.to_string(),
                    line,
                    column: tokens[0].column,
                })
            }
        };
        Ok(op)
    }
}

fn require<'t>(token: Option<&'t Token>, expected: &str, line: u32) -> Result<&'t Token, AsmError> {
    token.ok_or_else(|| AsmError::Expected {
        expected: expected.to_string(),
        found: "end of line".to_string(),
        line,
        column: 0,
    })
}

fn expect_no_operand(tokens: &[Token], line: u32) -> Result<(), AsmError> {
    expect_arity(tokens, 1, line)
}

fn expect_arity(tokens: &[Token], count: usize, line: u32) -> Result<(), AsmError> {
    match tokens.get(count) {
        Some(extra) => Err(AsmError::Trailing {
            found: extra.describe(),
            line,
            column: extra.column,
        }),
        None => Ok(()),
    }
}

fn word_of<'t>(token: &'t Token, expected: &str, line: u32) -> Result<&'t str, AsmError> {
    match &token.kind {
        TokenKind::Word(word) => Ok(word),
        TokenKind::Str(_) => Err(AsmError::Expected {
            expected: expected.to_string(),
            found: token.describe(),
            line,
            column: token.column,
        }),
    }
}

fn name_operand(tokens: &[Token], line: u32) -> Result<String, AsmError> {
    let token = require(tokens.get(1), "name", line)?;
    expect_arity(tokens, 2, line)?;
    Ok(word_of(token, "name", line)?.to_string())
}

fn count_operand(tokens: &[Token], line: u32) -> Result<usize, AsmError> {
    let token = require(tokens.get(1), "count", line)?;
    expect_arity(tokens, 2, line)?;
    word_of(token, "count", line)?
        .parse::<usize>()
        .map_err(|_| AsmError::Expected {
            expected: "count".to_string(),
            found: token.describe(),
            line,
            column: token.column,
        })
}

fn parse_const(token: &Token, line: u32) -> Result<Const, AsmError> {
    let word = match &token.kind {
        TokenKind::Str(text) => return Ok(Const::Str(text.clone())),
        TokenKind::Word(word) => word,
    };
    match word.as_str() {
        "None" => return Ok(Const::None),
        "True" => return Ok(Const::Bool(true)),
        "False" => return Ok(Const::Bool(false)),
        _ => {}
    }
    if let Ok(value) = word.parse::<i64>() {
        return Ok(Const::Int(value));
    }
    if word.contains(['.', 'e', 'E']) || word == "inf" || word == "nan" {
        if let Ok(value) = word.parse::<f64>() {
            return Ok(Const::Float(value));
        }
    }
    Err(AsmError::Expected {
        expected: "constant".to_string(),
        found: token.describe(),
        line,
        column: token.column,
    })
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        (if value > 0.0 { "inf" } else { "-inf" }).to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value:?}")
    }
}

/// Renders a procedure in the listing format accepted by [`assemble`].
pub fn disassemble(procedure: &Procedure) -> String {
    let mut out = String::new();
    write_header(&mut out, procedure, true);
    out.push('\n');
    write_body(&mut out, procedure, 1);
    out.push_str("end\n");
    out
}

fn write_header(out: &mut String, procedure: &Procedure, with_file: bool) {
    out.push_str("proc ");
    out.push_str(&procedure.name);
    if with_file {
        if let Some(file) = &procedure.filename {
            let _ = write!(out, " file={file}");
        }
    }
    if !procedure.params.is_empty() {
        let _ = write!(out, " params={}", procedure.params.join(","));
    }
}

fn write_body(out: &mut String, procedure: &Procedure, depth: usize) {
    let mut targets: Vec<usize> = procedure.code.iter().filter_map(Op::jump_target).collect();
    targets.sort_unstable();
    targets.dedup();
    let label = |target: usize| format!("L{target}");
    let indent = "  ".repeat(depth);

    for (ip, op) in procedure.code.iter().enumerate() {
        if targets.binary_search(&ip).is_ok() {
            let _ = writeln!(out, "{}{}:", "  ".repeat(depth.saturating_sub(1)), label(ip));
        }
        out.push_str(&indent);
        out.push_str(op.mnemonic());
        match op {
            Op::LoadConst(Const::Code(nested)) => {
                out.push(' ');
                let inherits_file = nested.filename == procedure.filename;
                write_header(out, nested, !inherits_file);
                out.push('\n');
                write_body(out, nested, depth + 1);
                out.push_str(&indent);
                out.push_str("end\n");
                continue;
            }
            Op::LoadConst(constant) => {
                let text = match constant {
                    Const::None => "None".to_string(),
                    Const::Bool(true) => "True".to_string(),
                    Const::Bool(false) => "False".to_string(),
                    Const::Int(value) => value.to_string(),
                    Const::Float(value) => format_float(*value),
                    Const::Str(text) => quote(text),
                    Const::Code(_) => unreachable!("handled above"),
                };
                let _ = write!(out, " {text}");
            }
            Op::LoadFast(name)
            | Op::StoreFast(name)
            | Op::DeleteFast(name)
            | Op::LoadGlobal(name)
            | Op::StoreGlobal(name)
            | Op::DeleteGlobal(name)
            | Op::LoadName(name)
            | Op::StoreName(name)
            | Op::DeleteName(name)
            | Op::LoadAttr(name)
            | Op::StoreAttr(name)
            | Op::DeleteAttr(name)
            | Op::BuildClass(name)
            | Op::Raise(name) => {
                let _ = write!(out, " {name}");
            }
            Op::DupTopN(count)
            | Op::BuildList(count)
            | Op::BuildTuple(count)
            | Op::BuildMap(count)
            | Op::CallFunction(count) => {
                let _ = write!(out, " {count}");
            }
            Op::MakeFunction(captures) => {
                for name in captures {
                    let _ = write!(out, " {name}");
                }
            }
            Op::CompareOp(cmp) => {
                let _ = write!(out, " {}", cmp.symbol());
            }
            Op::Jump(target) | Op::PopJumpIfFalse(target) | Op::PopJumpIfTrue(target) => {
                if *target < procedure.code.len() {
                    let _ = write!(out, " {}", label(*target));
                } else {
                    let _ = write!(out, " {target}");
                }
            }
            Op::StoreScratch(slot) | Op::ClearScratch(slot) => {
                let _ = write!(out, " {}", slot.name());
            }
            _ => {}
        }
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::{assemble, assemble_with_filename, disassemble, AsmError};
    use exlens_ir::{instrument, Const, Op, ScratchSlot};

    const MODULE: &str = r#"
# fixture module
proc <module> file=foo_data.exa
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
end
"#;

    #[test]
    fn assembles_nested_procedures_with_lines() {
        let module = assemble(MODULE).expect("assemble");
        assert_eq!(module.name, "<module>");
        assert_eq!(module.filename.as_deref(), Some("foo_data.exa"));
        assert_eq!(module.first_line, Some(3));
        let inner = module.find_nested("subscr_store").expect("nested");
        assert_eq!(inner.qualname, "subscr_store");
        assert_eq!(inner.filename.as_deref(), Some("foo_data.exa"));
        assert_eq!(inner.code[5], Op::StoreSubscr);
        assert_eq!(inner.lines[5], Some(10));
        assert_eq!(module.code[1], Op::MakeFunction(Vec::new()));
    }

    #[test]
    fn resolves_labels_forward_and_backward() {
        let source = r#"
proc count params=n
top:
  LOAD_FAST n
  POP_JUMP_IF_FALSE done
  LOAD_FAST n
  LOAD_CONST 1
  BINARY_SUBTRACT
  STORE_FAST n
  JUMP_ABSOLUTE top
done:
  LOAD_FAST n
  RETURN_VALUE
end
"#;
        let procedure = assemble(source).expect("assemble");
        assert_eq!(procedure.params, vec!["n".to_string()]);
        assert_eq!(procedure.code[1], Op::PopJumpIfFalse(7));
        assert_eq!(procedure.code[6], Op::Jump(0));
    }

    #[test]
    fn parses_constants_and_escapes() {
        let source = "proc f\n  LOAD_CONST 'it\\'s'\n  LOAD_CONST \"a b\"\n  LOAD_CONST -3\n  LOAD_CONST 2.5\n  LOAD_CONST True\n  LOAD_CONST None\nend\n";
        let procedure = assemble(source).expect("assemble");
        assert_eq!(
            procedure.code,
            vec![
                Op::LoadConst(Const::Str("it's".to_string())),
                Op::LoadConst(Const::Str("a b".to_string())),
                Op::LoadConst(Const::Int(-3)),
                Op::LoadConst(Const::Float(2.5)),
                Op::LoadConst(Const::Bool(true)),
                Op::LoadConst(Const::None),
            ]
        );
    }

    #[test]
    fn nested_functions_get_local_qualnames() {
        let source = r#"
proc f
  LOAD_CONST proc g
    LOAD_CONST None
    RETURN_VALUE
  end
  MAKE_FUNCTION
  RETURN_VALUE
end
"#;
        let procedure = assemble_with_filename(source, Some("inner.exa")).expect("assemble");
        let g = procedure.find_nested("g").expect("g");
        assert_eq!(g.qualname, "f.<locals>.g");
        assert_eq!(g.filename.as_deref(), Some("inner.exa"));
    }

    #[test]
    fn reports_unknown_mnemonic_with_position() {
        let err = assemble("proc f\n  LOAD_CONST 1\n  FROB\nend\n").expect_err("error");
        assert_eq!(
            err,
            AsmError::UnknownMnemonic {
                mnemonic: "FROB".to_string(),
                line: 3,
                column: 3,
            }
        );
    }

    #[test]
    fn reports_structural_errors() {
        assert!(matches!(
            assemble("proc f\n  JUMP_ABSOLUTE nowhere\nend\n"),
            Err(AsmError::UndefinedLabel { line: 2, .. })
        ));
        assert!(matches!(
            assemble("proc f\n  NOP\n"),
            Err(AsmError::UnterminatedProc { line: 1, .. })
        ));
        assert!(matches!(
            assemble("proc f\n  LOAD_CONST 'open\nend\n"),
            Err(AsmError::UnterminatedString { line: 2, .. })
        ));
        assert!(matches!(
            assemble("proc f\n  POP_TOP 3\nend\n"),
            Err(AsmError::Trailing { line: 2, .. })
        ));
        assert!(matches!(assemble("# nothing\n"), Err(AsmError::Empty)));
    }

    #[test]
    fn disassembly_reassembles_to_the_same_instructions() {
        let module = instrument(assemble(MODULE).expect("assemble"));
        let text = disassemble(&module);
        assert!(text.contains("STORE_SCRATCH index"));
        assert!(text.contains("DUP_TOPX 2"));
        let again = assemble(&text).expect("reassemble");
        assert_eq!(again.code.len(), module.code.len());
        let inner = again.find_nested("subscr_store").expect("nested");
        let original = module.find_nested("subscr_store").expect("nested");
        assert_eq!(inner.code, original.code);
        assert!(inner
            .code
            .iter()
            .any(|op| *op == Op::ClearScratch(ScratchSlot::Attr)));
    }
}
