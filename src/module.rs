use tracing::debug;

use crate::error::Error;
use crate::functions::{FuncId, Function};
use crate::opblock::{OpbId, Opblock, OpblockKind};
use crate::opcodes::{self, DecodedOp};
use crate::variables::{self, VarId, Variable};
use crate::{lift, xref};

/// Raw sections of a QVM module, as produced by the loader.
///
/// DATA and LIT share one address space: LIT addresses start at
/// `data.len()`. BSS is size-only. The jump table is carried through for
/// callers but unused by the analysis.
#[derive(Debug, Clone, Default)]
pub struct Sections {
    pub instruction_count: u32,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub lit: Vec<u8>,
    pub bss_length: u32,
    pub jump_table: Vec<u32>,
}

/// A decoded and analyzed QVM module.
///
/// The module owns every function, variable, opcode and opblock in
/// per-module arenas; all cross-references are arena handles, so
/// dropping the module releases the whole graph in one sweep.
#[derive(Debug)]
pub struct Qvm {
    /// Module file name, for the listing banner.
    pub name: String,
    pub sections: Sections,
    pub ops: Vec<DecodedOp>,
    pub opblocks: Vec<Opblock>,
    pub funcs: Vec<Function>,
    /// Known functions, ascending by address.
    pub functions: Vec<FuncId>,
    /// Syscall stubs, in discovery order.
    pub syscalls: Vec<FuncId>,
    pub vars: Vec<Variable>,
    /// Module-level variables, ascending by address.
    pub globals: Vec<VarId>,
    /// Percentage of calls resolved to a known function or syscall.
    pub restored_calls_perc: f64,
}

impl Qvm {
    /// Run the full analysis pipeline over a module's sections.
    pub fn analyze(name: impl Into<String>, sections: Sections) -> Result<Self, Error> {
        let ops = opcodes::decode(&sections.code)?;
        debug!(ops = ops.len(), "decoded code section");

        let mut qvm = Self {
            name: name.into(),
            sections,
            ops,
            opblocks: Vec::new(),
            funcs: Vec::new(),
            functions: Vec::new(),
            syscalls: Vec::new(),
            vars: Vec::new(),
            globals: Vec::new(),
            restored_calls_perc: 100.0,
        };
        lift::segment(&mut qvm)?;
        lift::lift(&mut qvm)?;
        variables::resolve(&mut qvm);
        xref::build_xrefs(&mut qvm);
        xref::link_call_args(&mut qvm);
        variables::finalize_sizes(&mut qvm);
        debug!(
            functions = qvm.functions.len(),
            syscalls = qvm.syscalls.len(),
            globals = qvm.globals.len(),
            restored = qvm.restored_calls_perc,
            "analysis finished"
        );
        Ok(qvm)
    }

    #[inline]
    #[must_use]
    pub fn opb(&self, id: OpbId) -> &Opblock {
        &self.opblocks[id.index()]
    }

    #[inline]
    pub(crate) fn opb_mut(&mut self, id: OpbId) -> &mut Opblock {
        &mut self.opblocks[id.index()]
    }

    #[inline]
    #[must_use]
    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id.index()]
    }

    #[inline]
    pub(crate) fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.funcs[id.index()]
    }

    #[inline]
    #[must_use]
    pub fn var(&self, id: VarId) -> &Variable {
        &self.vars[id.index()]
    }

    #[inline]
    pub(crate) fn var_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.vars[id.index()]
    }

    pub(crate) fn alloc_opb(&mut self, kind: OpblockKind, opcode: Option<DecodedOp>) -> OpbId {
        let id = OpbId(self.opblocks.len() as u32);
        self.opblocks.push(Opblock::new(kind, opcode));
        id
    }

    /// Statement opblocks of a function, in list order.
    #[must_use]
    pub fn statements(&self, func: FuncId) -> Statements<'_> {
        Statements {
            qvm: self,
            next: self.func(func).opblock_start,
        }
    }

    /// First FUNC_CALL in an expression tree: child first, then op1,
    /// then op2.
    #[must_use]
    pub fn find_call(&self, id: OpbId) -> Option<OpbId> {
        let opb = self.opb(id);
        if opb.kind == OpblockKind::FuncCall {
            return Some(id);
        }
        if let Some(child) = opb.child {
            return self.find_call(child);
        }
        if let Some(op1) = opb.op1 {
            if let Some(call) = self.find_call(op1) {
                return Some(call);
            }
        }
        opb.op2.and_then(|op2| self.find_call(op2))
    }

    /// Initialized bytes backing a module-level variable, when it lies in
    /// DATA or LIT.
    #[must_use]
    pub fn var_content(&self, var: &Variable) -> Option<&[u8]> {
        let address = var.address as usize;
        let data = self.sections.data.len();
        if address < data {
            Some(&self.sections.data[address..])
        } else if address < data + self.sections.lit.len() {
            Some(&self.sections.lit[address - data..])
        } else {
            None
        }
    }
}

/// Iterator over a function's statement list.
#[derive(Debug)]
pub struct Statements<'a> {
    qvm: &'a Qvm,
    next: Option<OpbId>,
}

impl Iterator for Statements<'_> {
    type Item = OpbId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.qvm.opb(id).next;
        Some(id)
    }
}
