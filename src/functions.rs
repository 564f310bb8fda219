use std::ops::Range;

use tracing::warn;

use crate::error::Error;
use crate::module::Qvm;
use crate::opblock::OpbId;
use crate::variables::{MAX_NAME_LENGTH, VarId};

/// Handle of a function in the module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub(crate) u32);

impl FuncId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Analysis lifecycle of a function. Emission is only valid once the
/// function is `Linked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncState {
    Unknown,
    Entered,
    Body,
    Left,
    Resolved,
    Linked,
}

/// A segmented function, or a syscall stub.
///
/// Syscalls carry only a name and their (negative) address; every other
/// field stays at its initial value.
#[derive(Debug, Clone)]
pub struct Function {
    pub address: u32,
    pub name: String,
    pub stack_size: u32,
    /// Inferred return size: 0 (void) or 4.
    pub return_size: u32,
    /// Head of the statement list.
    pub opblock_start: Option<OpbId>,
    /// Tail of the statement list.
    pub opblock_end: Option<OpbId>,
    /// Locals and arguments, ascending by frame address.
    pub locals: Vec<VarId>,
    pub calls: Vec<FuncId>,
    pub called_by: Vec<FuncId>,
    /// Raw opcode indexes owned by this function.
    pub ops: Range<usize>,
    pub opblocks_count: u32,
    pub state: FuncState,
    pub syscall: bool,
}

impl Function {
    pub(crate) fn new(name: String, address: u32) -> Self {
        Self {
            address,
            name,
            stack_size: 0,
            return_size: 0,
            opblock_start: None,
            opblock_end: None,
            locals: Vec::new(),
            calls: Vec::new(),
            called_by: Vec::new(),
            ops: 0..0,
            opblocks_count: 0,
            state: FuncState::Unknown,
            syscall: false,
        }
    }

    #[must_use]
    pub fn ops_count(&self) -> usize {
        self.ops.len()
    }
}

/// Look an address up among the known functions, then the syscalls.
pub fn func_find(qvm: &Qvm, address: u32) -> Option<FuncId> {
    if let Ok(i) = qvm
        .functions
        .binary_search_by_key(&address, |&f| qvm.func(f).address)
    {
        return Some(qvm.functions[i]);
    }
    qvm.syscalls
        .iter()
        .copied()
        .find(|&f| qvm.func(f).address == address)
}

/// Find or create the syscall stub for a trap address.
pub(crate) fn func_add_syscall(qvm: &mut Qvm, address: u32) -> FuncId {
    if let Some(f) = func_find(qvm, address) {
        return f;
    }
    let mut func = Function::new(format!("trap_{address:x}"), address);
    func.syscall = true;
    func.state = FuncState::Linked;
    let id = FuncId(qvm.funcs.len() as u32);
    qvm.funcs.push(func);
    qvm.syscalls.push(id);
    id
}

/// Rename a function. Names are bounded; an oversized request is skipped
/// with a diagnostic.
pub fn func_rename(qvm: &mut Qvm, func: FuncId, name: &str) -> Result<(), Error> {
    if name.len() >= MAX_NAME_LENGTH {
        warn!(
            function = %qvm.func(func).name,
            "rename skipped: replacement name too long"
        );
        return Err(Error::NameTooLong { len: name.len() });
    }
    qvm.func_mut(func).name = name.to_owned();
    Ok(())
}

/// Append `func` unless already present; the first reference wins the
/// position.
pub(crate) fn ref_list_add(list: &mut Vec<FuncId>, func: FuncId) {
    if !list.contains(&func) {
        list.push(func);
    }
}
