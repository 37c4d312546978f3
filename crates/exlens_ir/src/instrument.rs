//! Bookkeeping instrumentation for guarded operations.
//!
//! Indexed access (`BINARY_SUBSCR`, `STORE_SUBSCR`, `DELETE_SUBSCR`) becomes
//!
//! ```text
//! DUP_TOPX 2
//! STORE_SCRATCH index
//! STORE_SCRATCH attr
//! <original>
//! CLEAR_SCRATCH index
//! CLEAR_SCRATCH attr
//! ```
//!
//! The key is above the subject on the stack, so `index` is written before
//! `attr`. No other operation runs between the two writes, so either order
//! leaves the same slots behind.
//!
//! Attribute access (`LOAD_ATTR`, `STORE_ATTR`, `DELETE_ATTR`) becomes
//!
//! ```text
//! DUP_TOP
//! STORE_SCRATCH attr
//! <original>
//! CLEAR_SCRATCH attr
//! ```
//!
//! The subject and key are always the topmost stack values of these
//! operations, so the duplicated copies are consumed by the scratch writes and
//! the original instruction sees its operands untouched. The clears only run
//! when the operation completes, which leaves the operands of a failing
//! operation behind for the enrichment layer.

use tracing::debug;

use crate::{Const, Op, OpCategory, Procedure, ScratchSlot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstrumentStats {
    pub indexed: usize,
    pub attribute: usize,
    pub nested: usize,
}

impl InstrumentStats {
    pub fn total(&self) -> usize {
        self.indexed + self.attribute
    }
}

/// Returns an instrumented copy of `procedure`, nested procedures included.
///
/// Applying this twice doubles the bookkeeping; use [`is_instrumented`] to
/// guard when the origin of a body is unknown.
pub fn instrument(procedure: Procedure) -> Procedure {
    instrument_with_stats(procedure).0
}

pub fn instrument_in_place(procedure: &mut Procedure) -> InstrumentStats {
    let mut stats = InstrumentStats::default();
    rewrite_procedure(procedure, &mut stats);
    debug!(
        procedure = %procedure.qualname,
        indexed = stats.indexed,
        attribute = stats.attribute,
        nested = stats.nested,
        "instrumented procedure"
    );
    stats
}

pub fn instrument_with_stats(mut procedure: Procedure) -> (Procedure, InstrumentStats) {
    let stats = instrument_in_place(&mut procedure);
    (procedure, stats)
}

/// True when the body, or any nested body, already carries bookkeeping.
pub fn is_instrumented(procedure: &Procedure) -> bool {
    procedure.count_ops(&|op| op.is_bookkeeping()) > 0
}

fn rewrite_procedure(procedure: &mut Procedure, stats: &mut InstrumentStats) {
    let old_code = std::mem::take(&mut procedure.code);
    let old_lines = std::mem::take(&mut procedure.lines);
    let mut code = Vec::with_capacity(old_code.len() * 2);
    let mut lines = Vec::with_capacity(old_code.len() * 2);
    let mut mapping = Vec::with_capacity(old_code.len() + 1);

    for (ip, op) in old_code.into_iter().enumerate() {
        let line = old_lines.get(ip).copied().flatten();
        mapping.push(code.len());
        match op.category() {
            OpCategory::IndexedAccess => {
                stats.indexed += 1;
                code.extend([
                    Op::DupTopN(2),
                    Op::StoreScratch(ScratchSlot::Index),
                    Op::StoreScratch(ScratchSlot::Attr),
                    op,
                    Op::ClearScratch(ScratchSlot::Index),
                    Op::ClearScratch(ScratchSlot::Attr),
                ]);
                lines.extend([line; 6]);
            }
            OpCategory::AttributeAccess => {
                stats.attribute += 1;
                code.extend([
                    Op::DupTop,
                    Op::StoreScratch(ScratchSlot::Attr),
                    op,
                    Op::ClearScratch(ScratchSlot::Attr),
                ]);
                lines.extend([line; 4]);
            }
            OpCategory::NestedProcedure => {
                let op = match op {
                    Op::LoadConst(Const::Code(mut nested)) => {
                        stats.nested += 1;
                        rewrite_procedure(&mut nested, stats);
                        Op::LoadConst(Const::Code(nested))
                    }
                    other => other,
                };
                code.push(op);
                lines.push(line);
            }
            OpCategory::Other => {
                code.push(op);
                lines.push(line);
            }
        }
    }
    mapping.push(code.len());

    procedure.code = code;
    procedure.lines = lines;
    procedure.rewrite_jumps(&mapping);
}
