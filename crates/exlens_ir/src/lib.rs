use std::fmt;

use serde::{Deserialize, Serialize};

mod instrument;

pub use instrument::{
    instrument, instrument_in_place, instrument_with_stats, is_instrumented, InstrumentStats,
};

/// Scratch storage written by bookkeeping instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScratchSlot {
    /// Subject object or container of the guarded operation.
    Attr,
    /// Key or index of a guarded subscript.
    Index,
}

impl ScratchSlot {
    pub fn name(self) -> &'static str {
        match self {
            ScratchSlot::Attr => "attr",
            ScratchSlot::Index => "index",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "attr" => Some(ScratchSlot::Attr),
            "index" => Some(ScratchSlot::Index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not_in",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::Ge),
            "in" => Some(CmpOp::In),
            "not_in" => Some(CmpOp::NotIn),
            _ => None,
        }
    }
}

/// Literal operand of `LoadConst`. `Code` holds a nested procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Code(Box<Procedure>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Nop,
    LoadConst(Const),
    LoadFast(String),
    StoreFast(String),
    DeleteFast(String),
    LoadGlobal(String),
    StoreGlobal(String),
    DeleteGlobal(String),
    LoadName(String),
    StoreName(String),
    DeleteName(String),
    LoadAttr(String),
    StoreAttr(String),
    DeleteAttr(String),
    BinarySubscr,
    StoreSubscr,
    DeleteSubscr,
    DupTop,
    /// Duplicates the top `n` stack values, keeping their order.
    DupTopN(usize),
    PopTop,
    RotTwo,
    BuildList(usize),
    BuildTuple(usize),
    BuildMap(usize),
    BuildClass(String),
    /// Pops a code object and binds it to the current globals, capturing the
    /// named locals of the running activation.
    MakeFunction(Vec<String>),
    CallFunction(usize),
    BinaryOp(BinOp),
    CompareOp(CmpOp),
    UnaryNot,
    Jump(usize),
    PopJumpIfFalse(usize),
    PopJumpIfTrue(usize),
    /// Pops a message and raises a failure of the named kind.
    Raise(String),
    ReturnValue,
    StoreScratch(ScratchSlot),
    ClearScratch(ScratchSlot),
}

/// Classification used by the instrumentation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCategory {
    IndexedAccess,
    AttributeAccess,
    NestedProcedure,
    Other,
}

impl Op {
    pub fn category(&self) -> OpCategory {
        match self {
            Op::BinarySubscr | Op::StoreSubscr | Op::DeleteSubscr => OpCategory::IndexedAccess,
            Op::LoadAttr(_) | Op::StoreAttr(_) | Op::DeleteAttr(_) => OpCategory::AttributeAccess,
            Op::LoadConst(Const::Code(_)) => OpCategory::NestedProcedure,
            _ => OpCategory::Other,
        }
    }

    pub fn is_bookkeeping(&self) -> bool {
        matches!(self, Op::StoreScratch(_) | Op::ClearScratch(_))
    }

    pub fn jump_target(&self) -> Option<usize> {
        match self {
            Op::Jump(target) | Op::PopJumpIfFalse(target) | Op::PopJumpIfTrue(target) => {
                Some(*target)
            }
            _ => None,
        }
    }

    fn jump_target_mut(&mut self) -> Option<&mut usize> {
        match self {
            Op::Jump(target) | Op::PopJumpIfFalse(target) | Op::PopJumpIfTrue(target) => {
                Some(target)
            }
            _ => None,
        }
    }

    /// Upper snake case mnemonic used by listings and profiles.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Nop => "NOP",
            Op::LoadConst(_) => "LOAD_CONST",
            Op::LoadFast(_) => "LOAD_FAST",
            Op::StoreFast(_) => "STORE_FAST",
            Op::DeleteFast(_) => "DELETE_FAST",
            Op::LoadGlobal(_) => "LOAD_GLOBAL",
            Op::StoreGlobal(_) => "STORE_GLOBAL",
            Op::DeleteGlobal(_) => "DELETE_GLOBAL",
            Op::LoadName(_) => "LOAD_NAME",
            Op::StoreName(_) => "STORE_NAME",
            Op::DeleteName(_) => "DELETE_NAME",
            Op::LoadAttr(_) => "LOAD_ATTR",
            Op::StoreAttr(_) => "STORE_ATTR",
            Op::DeleteAttr(_) => "DELETE_ATTR",
            Op::BinarySubscr => "BINARY_SUBSCR",
            Op::StoreSubscr => "STORE_SUBSCR",
            Op::DeleteSubscr => "DELETE_SUBSCR",
            Op::DupTop => "DUP_TOP",
            Op::DupTopN(_) => "DUP_TOPX",
            Op::PopTop => "POP_TOP",
            Op::RotTwo => "ROT_TWO",
            Op::BuildList(_) => "BUILD_LIST",
            Op::BuildTuple(_) => "BUILD_TUPLE",
            Op::BuildMap(_) => "BUILD_MAP",
            Op::BuildClass(_) => "BUILD_CLASS",
            Op::MakeFunction(_) => "MAKE_FUNCTION",
            Op::CallFunction(_) => "CALL_FUNCTION",
            Op::BinaryOp(BinOp::Add) => "BINARY_ADD",
            Op::BinaryOp(BinOp::Sub) => "BINARY_SUBTRACT",
            Op::BinaryOp(BinOp::Mul) => "BINARY_MULTIPLY",
            Op::BinaryOp(BinOp::TrueDiv) => "BINARY_TRUE_DIVIDE",
            Op::BinaryOp(BinOp::FloorDiv) => "BINARY_FLOOR_DIVIDE",
            Op::BinaryOp(BinOp::Mod) => "BINARY_MODULO",
            Op::CompareOp(_) => "COMPARE_OP",
            Op::UnaryNot => "UNARY_NOT",
            Op::Jump(_) => "JUMP_ABSOLUTE",
            Op::PopJumpIfFalse(_) => "POP_JUMP_IF_FALSE",
            Op::PopJumpIfTrue(_) => "POP_JUMP_IF_TRUE",
            Op::Raise(_) => "RAISE",
            Op::ReturnValue => "RETURN_VALUE",
            Op::StoreScratch(_) => "STORE_SCRATCH",
            Op::ClearScratch(_) => "CLEAR_SCRATCH",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IrError {
    #[error("instruction and line tables differ in length: {code} ops, {lines} lines")]
    LengthMismatch { code: usize, lines: usize },
    #[error("failed to decode procedure: {0}")]
    Decode(#[source] bincode::Error),
    #[error("failed to encode procedure: {0}")]
    Encode(#[source] bincode::Error),
}

/// A named body of instructions. `code` and `lines` are parallel tables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    pub qualname: String,
    pub filename: Option<String>,
    pub params: Vec<String>,
    pub first_line: Option<u32>,
    pub code: Vec<Op>,
    pub lines: Vec<Option<u32>>,
}

impl Procedure {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            qualname: name.clone(),
            name,
            ..Self::default()
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn push(&mut self, op: Op, line: Option<u32>) -> usize {
        self.code.push(op);
        self.lines.push(line);
        self.code.len() - 1
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn line_at(&self, ip: usize) -> Option<u32> {
        self.lines.get(ip).copied().flatten().or(self.first_line)
    }

    /// Swaps in a new instruction sequence. Only the table shape is checked.
    pub fn replace_code(&mut self, code: Vec<Op>, lines: Vec<Option<u32>>) -> Result<(), IrError> {
        if code.len() != lines.len() {
            return Err(IrError::LengthMismatch {
                code: code.len(),
                lines: lines.len(),
            });
        }
        self.code = code;
        self.lines = lines;
        Ok(())
    }

    /// Procedures loaded as constants, in instruction order.
    pub fn nested(&self) -> impl Iterator<Item = &Procedure> {
        self.code.iter().filter_map(|op| match op {
            Op::LoadConst(Const::Code(nested)) => Some(nested.as_ref()),
            _ => None,
        })
    }

    /// Counts matching instructions in this procedure and every nested one.
    pub fn count_ops(&self, pred: &dyn Fn(&Op) -> bool) -> usize {
        let own = self.code.iter().filter(|op| pred(op)).count();
        own + self.nested().map(|nested| nested.count_ops(pred)).sum::<usize>()
    }

    pub fn find_nested(&self, name: &str) -> Option<&Procedure> {
        for nested in self.nested() {
            if nested.name == name {
                return Some(nested);
            }
            if let Some(found) = nested.find_nested(name) {
                return Some(found);
            }
        }
        None
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IrError> {
        bincode::serialize(self).map_err(IrError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IrError> {
        let procedure: Procedure = bincode::deserialize(bytes).map_err(IrError::Decode)?;
        if procedure.code.len() != procedure.lines.len() {
            return Err(IrError::LengthMismatch {
                code: procedure.code.len(),
                lines: procedure.lines.len(),
            });
        }
        Ok(procedure)
    }

    /// Remaps jump operands through an old-index to new-index table.
    pub fn rewrite_jumps(&mut self, mapping: &[usize]) {
        for op in &mut self.code {
            if let Some(target) = op.jump_target_mut() {
                let mapped = mapping.get(*target).copied().unwrap_or(*target);
                *target = mapped;
            }
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filename {
            Some(file) => write!(f, "<code object {} at \"{}\">", self.name, file),
            None => write!(f, "<code object {}>", self.name),
        }
    }
}
