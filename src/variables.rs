use tracing::warn;

use crate::error::Error;
use crate::functions::{FuncId, FuncState};
use crate::module::Qvm;
use crate::opblock::{OpbId, OpblockKind};

/// Bound on function and variable names, including renames.
pub const MAX_NAME_LENGTH: usize = 64;

/// Handle of a variable in the module arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub(crate) u32);

impl VarId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Storage class of a discovered variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarStatus {
    Global,
    Literal,
    Bss,
    Local,
    Arg,
}

/// A discovered global, literal, BSS region, local or argument.
///
/// `address` is frame-relative for locals and arguments,
/// module-relative otherwise.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub address: u32,
    /// Final size in bytes; 0 until an access or a cut reveals one.
    pub size: u32,
    /// Observations of 1-, 2- and 4-byte accesses.
    pub prob_size: [u32; 3],
    pub status: VarStatus,
    /// Functions referencing this variable, first reference first.
    pub parents: Vec<FuncId>,
    /// Reserved for functions with variable argument lists.
    pub variadic: bool,
}

impl Variable {
    fn slot(size: u32) -> Option<usize> {
        match size {
            1 => Some(0),
            2 => Some(1),
            4 => Some(2),
            _ => None,
        }
    }

    fn observe(&mut self, used_size: u32) {
        if let Some(slot) = Self::slot(used_size) {
            self.prob_size[slot] += 1;
        }
    }

    /// Histogram argmax over {4, 2, 1}, larger sizes winning ties.
    /// Variables never observed by a sized access keep their current size.
    fn finalize_size(&mut self) {
        let [h1, h2, h4] = self.prob_size;
        let best = h1.max(h2).max(h4);
        if best == 0 {
            return;
        }
        self.size = if h4 == best {
            4
        } else if h2 == best {
            2
        } else {
            1
        };
    }
}

fn list<'a>(qvm: &'a Qvm, owner: Option<FuncId>) -> &'a [VarId] {
    match owner {
        Some(f) => &qvm.func(f).locals,
        None => &qvm.globals,
    }
}

/// Find a variable by exact address in a function's locals or the module
/// globals.
pub fn var_find(qvm: &Qvm, owner: Option<FuncId>, address: u32) -> Option<VarId> {
    let list = list(qvm, owner);
    let i = list.partition_point(|&v| qvm.var(v).address < address);
    list.get(i)
        .copied()
        .filter(|&v| qvm.var(v).address == address)
}

/// Find a variable by name within a function's locals or the module
/// globals.
pub fn var_find_by_name(qvm: &Qvm, owner: Option<FuncId>, name: &str) -> Option<VarId> {
    list(qvm, owner)
        .iter()
        .copied()
        .find(|&v| qvm.var(v).name == name)
}

fn var_create(qvm: &mut Qvm, owner: Option<FuncId>, address: u32) -> VarId {
    let (status, name) = match owner {
        Some(f) => {
            let stack_size = qvm.func(f).stack_size;
            if address >= stack_size {
                let n = (address - stack_size).wrapping_sub(8) / 4;
                (VarStatus::Arg, format!("arg_{n}"))
            } else {
                (VarStatus::Local, format!("local_{address:x}"))
            }
        }
        None => {
            let data = qvm.sections.data.len() as u32;
            let lit = qvm.sections.lit.len() as u32;
            if address < data {
                (VarStatus::Global, format!("global_{address:x}"))
            } else if address < data + lit {
                (VarStatus::Literal, format!("lit_{address:x}"))
            } else {
                (VarStatus::Bss, format!("bss_{address:x}"))
            }
        }
    };

    // insertion point keeping the list ascending by address
    let pos = {
        let list = list(qvm, owner);
        list.partition_point(|&v| qvm.var(v).address < address)
    };

    let id = VarId(qvm.vars.len() as u32);
    qvm.vars.push(Variable {
        name,
        address,
        size: 0,
        prob_size: [0; 3],
        status,
        parents: Vec::new(),
        variadic: false,
    });
    match owner {
        Some(f) => qvm.func_mut(f).locals.insert(pos, id),
        None => qvm.globals.insert(pos, id),
    }
    id
}

/// Split the variable spanning `address` in two at that address.
///
/// The existing variable shrinks to the leading bytes and a new variable
/// inherits the remainder, so the two ranges partition the original one.
/// Returns the existing variable when `address` is already a boundary.
pub fn var_cut(qvm: &mut Qvm, owner: Option<FuncId>, address: u32) -> Result<VarId, Error> {
    if let Some(v) = var_find(qvm, owner, address) {
        return Ok(v);
    }

    let pred = {
        let list = list(qvm, owner);
        let i = list.partition_point(|&v| qvm.var(v).address < address);
        i.checked_sub(1).and_then(|i| list.get(i).copied())
    };
    let Some(pred) = pred else {
        return Err(Error::VariableCutFailed { address });
    };
    let (pred_address, pred_size) = {
        let v = qvm.var(pred);
        (v.address, v.size)
    };
    if pred_size == 0 || address >= pred_address + pred_size {
        return Err(Error::VariableCutFailed { address });
    }

    let id = var_create(qvm, owner, address);
    qvm.var_mut(id).size = pred_address + pred_size - address;
    qvm.var_mut(pred).size = address - pred_address;
    Ok(id)
}

/// Resolve an address to a variable, creating or cutting one as needed,
/// recording the access size and the referring function.
pub(crate) fn var_get(
    qvm: &mut Qvm,
    owner: Option<FuncId>,
    address: u32,
    used_size: u32,
    parent: FuncId,
) -> VarId {
    let id = match var_find(qvm, owner, address) {
        Some(v) => v,
        // an address inside an already-sized variable cuts it in two
        None => var_cut(qvm, owner, address)
            .unwrap_or_else(|_| var_create(qvm, owner, address)),
    };
    qvm.var_mut(id).observe(used_size);
    let parents = &mut qvm.var_mut(id).parents;
    if !parents.contains(&parent) {
        parents.push(parent);
    }
    id
}

/// Rename a variable. Names are bounded; an oversized request is skipped
/// with a diagnostic.
pub fn var_rename(qvm: &mut Qvm, var: VarId, name: &str) -> Result<(), Error> {
    if name.len() >= MAX_NAME_LENGTH {
        warn!(
            variable = %qvm.var(var).name,
            "rename skipped: replacement name too long"
        );
        return Err(Error::NameTooLong { len: name.len() });
    }
    qvm.var_mut(var).name = name.to_owned();
    Ok(())
}

/// Decide every variable's final size from its access histogram.
pub(crate) fn finalize_sizes(qvm: &mut Qvm) {
    for var in &mut qvm.vars {
        var.finalize_size();
    }
}

/// Discover the variables referenced by every function's statements.
pub(crate) fn resolve(qvm: &mut Qvm) {
    for i in 0..qvm.functions.len() {
        let fid = qvm.functions[i];
        let statements: Vec<OpbId> = qvm.statements(fid).collect();
        for statement in statements {
            resolve_opb(qvm, fid, statement);
        }
        qvm.func_mut(fid).state = FuncState::Resolved;
    }
}

fn resolve_opb(qvm: &mut Qvm, fid: FuncId, id: OpbId) {
    let (kind, child, op1, op2, size) = {
        let opb = qvm.opb(id);
        (opb.kind, opb.child, opb.op1, opb.op2, opb.value())
    };
    match kind {
        OpblockKind::Load => {
            if let Some(c) = child {
                resolve_access(qvm, fid, c, size);
            }
        }
        OpblockKind::Assignation => {
            if let Some(o2) = op2 {
                resolve_access(qvm, fid, o2, size);
            }
        }
        OpblockKind::StructCopy => {
            if let Some(o2) = op2 {
                if qvm.opb(o2).kind == OpblockKind::Const {
                    let address = qvm.opb(o2).value();
                    let vid = var_get(qvm, None, address, 0, fid);
                    // the copy reveals the destination's extent
                    if qvm.var(vid).size == 0 {
                        qvm.var_mut(vid).size = size;
                    }
                    qvm.opb_mut(o2).variable = Some(vid);
                    qvm.opb_mut(o2).kind = OpblockKind::GlobalAdr;
                }
            }
        }
        OpblockKind::LocalAdr => {
            if qvm.opb(id).variable.is_none() {
                let address = qvm.opb(id).value();
                let vid = var_get(qvm, Some(fid), address, 0, fid);
                qvm.opb_mut(id).variable = Some(vid);
            }
        }
        _ => {}
    }
    if let Some(c) = child {
        resolve_opb(qvm, fid, c);
    }
    if let Some(o1) = op1 {
        resolve_opb(qvm, fid, o1);
    }
    if let Some(o2) = op2 {
        resolve_opb(qvm, fid, o2);
    }
}

/// Resolve the addressed operand of a sized load or store. A constant
/// address becomes a named global reference so emission prints a name,
/// not a literal.
fn resolve_access(qvm: &mut Qvm, fid: FuncId, target: OpbId, used_size: u32) {
    let kind = qvm.opb(target).kind;
    if !matches!(kind, OpblockKind::LocalAdr | OpblockKind::Const) {
        return;
    }
    let owner = (kind == OpblockKind::LocalAdr).then_some(fid);
    let address = qvm.opb(target).value();
    let vid = var_get(qvm, owner, address, used_size, fid);
    qvm.opb_mut(target).variable = Some(vid);
    if kind == OpblockKind::Const {
        qvm.opb_mut(target).kind = OpblockKind::GlobalAdr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(prob_size: [u32; 3], size: u32) -> Variable {
        Variable {
            name: String::new(),
            address: 0,
            size,
            prob_size,
            status: VarStatus::Global,
            parents: Vec::new(),
            variadic: false,
        }
    }

    #[test]
    fn size_histogram_argmax() {
        let mut v = var([0, 3, 1], 0);
        v.finalize_size();
        assert_eq!(2, v.size);

        let mut v = var([5, 0, 2], 0);
        v.finalize_size();
        assert_eq!(1, v.size);
    }

    #[test]
    fn size_histogram_ties_prefer_larger() {
        let mut v = var([2, 2, 2], 0);
        v.finalize_size();
        assert_eq!(4, v.size);

        let mut v = var([1, 1, 0], 0);
        v.finalize_size();
        assert_eq!(2, v.size);
    }

    #[test]
    fn untyped_variables_keep_their_size() {
        let mut v = var([0, 0, 0], 12);
        v.finalize_size();
        assert_eq!(12, v.size);
    }
}
