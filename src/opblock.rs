use std::ops::Range;

use bitflags::bitflags;

use crate::functions::FuncId;
use crate::opcodes::DecodedOp;
use crate::variables::VarId;

/// Handle of an opblock in the module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpbId(pub(crate) u32);

impl OpbId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Stack effect and placement of an opblock kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpbFlags: u8 {
        /// Pops one expression into `child`.
        const POPS_1 = 1 << 0;
        /// Pops two expressions into `op1` (top) and `op2` (deeper).
        const POPS_2 = 1 << 1;
        /// Pushes itself onto the work stack.
        const PUSHES = 1 << 2;
        /// Appended to the owning function's statement list.
        const STATEMENT = 1 << 3;
    }
}

/// Closed set of lifted statement/expression kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpblockKind {
    Undef,
    FuncEnter,
    FuncReturn,
    FuncLeave,
    FuncArg,
    FuncCall,
    Push,
    Pop,
    Const,
    GlobalAdr,
    Global,
    LocalAdr,
    Local,
    Jump,
    Compare,
    Load,
    Assignation,
    StructCopy,
    Operation,
    DoubleOperation,
    JumpPoint,
    JumpAddress,
}

impl OpblockKind {
    #[must_use]
    pub const fn flags(self) -> OpbFlags {
        use OpblockKind::*;

        match self {
            Undef | JumpPoint => OpbFlags::empty(),
            FuncEnter => OpbFlags::STATEMENT,
            FuncReturn | FuncLeave | FuncArg | Pop | Jump => {
                OpbFlags::POPS_1.union(OpbFlags::STATEMENT)
            }
            FuncCall | Load | Operation => OpbFlags::POPS_1.union(OpbFlags::PUSHES),
            Push | Const | GlobalAdr | Global | LocalAdr | Local | JumpAddress => OpbFlags::PUSHES,
            Compare | Assignation | StructCopy => OpbFlags::POPS_2.union(OpbFlags::STATEMENT),
            DoubleOperation => OpbFlags::POPS_2.union(OpbFlags::PUSHES),
        }
    }

    #[must_use]
    pub const fn is_statement(self) -> bool {
        self.flags().contains(OpbFlags::STATEMENT)
    }
}

/// A lifted statement or expression node.
///
/// Statements live on their function's doubly-linked list through
/// `prev`/`next`; expressions dangle off another opblock's `child`,
/// `op1` or `op2` edge. All cross-references are arena handles owned by
/// the module.
#[derive(Debug, Clone)]
pub struct Opblock {
    pub kind: OpblockKind,
    /// Originating decoded opcode; `None` for synthesized blocks.
    pub opcode: Option<DecodedOp>,
    pub child: Option<OpbId>,
    /// Right-hand operand (top of stack).
    pub op1: Option<OpbId>,
    /// Left-hand operand (deeper on the stack).
    pub op2: Option<OpbId>,
    pub prev: Option<OpbId>,
    pub next: Option<OpbId>,
    /// Owning function.
    pub function: Option<FuncId>,
    /// Resolved direct-call target.
    pub function_called: Option<FuncId>,
    /// Referenced jump point, for compares and label references.
    pub jumppoint: Option<OpbId>,
    /// Resolved variable, for address-forming blocks.
    pub variable: Option<VarId>,
    /// First FUNC_ARG statement feeding this call.
    pub function_arg: Option<OpbId>,
    /// Reserved: synthesized goto target for restored returns.
    pub return_goto: Option<OpbId>,
    /// Label text, jump points only.
    pub label: Option<String>,
    /// Raw opcode indexes covered by this block and its operands.
    pub ops: Range<u32>,
}

impl Opblock {
    pub(crate) fn new(kind: OpblockKind, opcode: Option<DecodedOp>) -> Self {
        Self {
            kind,
            opcode,
            child: None,
            op1: None,
            op2: None,
            prev: None,
            next: None,
            function: None,
            function_called: None,
            jumppoint: None,
            variable: None,
            function_arg: None,
            return_goto: None,
            label: None,
            ops: 0..0,
        }
    }

    /// Immediate operand of the originating opcode; zero for synthesized
    /// blocks.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.opcode.map_or(0, |op| op.value)
    }

    /// Operator rendering of the originating opcode, if it has one.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        self.opcode
            .and_then(|op| op.op.info().operation)
            .unwrap_or("")
    }

    #[must_use]
    pub fn ops_count(&self) -> usize {
        (self.ops.end - self.ops.start) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_stack_effects() {
        assert_eq!(OpbFlags::empty(), OpblockKind::JumpPoint.flags());
        assert_eq!(OpbFlags::STATEMENT, OpblockKind::FuncEnter.flags());
        assert_eq!(
            OpbFlags::POPS_2 | OpbFlags::STATEMENT,
            OpblockKind::Assignation.flags()
        );
        assert_eq!(
            OpbFlags::POPS_1 | OpbFlags::PUSHES,
            OpblockKind::FuncCall.flags()
        );
        assert_eq!(
            OpbFlags::POPS_2 | OpbFlags::PUSHES,
            OpblockKind::DoubleOperation.flags()
        );
        assert!(OpblockKind::Pop.is_statement());
        assert!(!OpblockKind::Const.is_statement());
    }
}
