use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Error;
use crate::functions::{FuncId, FuncState, Function};
use crate::module::Qvm;
use crate::opblock::{OpbFlags, OpbId, OpblockKind};
use crate::opcodes::Opcode;

/// Split the decoded opcode stream into functions on ENTER boundaries.
///
/// A function spans its ENTER (address = byte offset, stack size =
/// operand) up to the opcode before the next ENTER; its last opcode must
/// be a LEAVE.
pub(crate) fn segment(qvm: &mut Qvm) -> Result<(), Error> {
    let mut starts = Vec::new();
    for (i, op) in qvm.ops.iter().enumerate() {
        if op.op == Opcode::Enter {
            starts.push(i);
        } else if starts.is_empty() {
            return Err(Error::MalformedModule("opcode before first function enter"));
        }
    }

    for (k, &start) in starts.iter().enumerate() {
        let end = starts.get(k + 1).copied().unwrap_or(qvm.ops.len());
        let enter = qvm.ops[start];
        if (enter.value as i32) < 0 {
            return Err(Error::MalformedModule("negative stack size"));
        }
        if qvm.ops[end - 1].op != Opcode::Leave {
            return Err(Error::MalformedModule("function does not end with a leave"));
        }
        let mut func = Function::new(format!("sub_{:x}", enter.offset), enter.offset);
        func.stack_size = enter.value;
        func.ops = start..end;
        func.state = FuncState::Entered;
        let id = FuncId(qvm.funcs.len() as u32);
        qvm.funcs.push(func);
        qvm.functions.push(id);
    }
    debug!(functions = qvm.functions.len(), "segmented code");
    Ok(())
}

/// Fold every function's opcode slice into a statement list of
/// expression trees, then place jump points.
pub(crate) fn lift(qvm: &mut Qvm) -> Result<(), Error> {
    for i in 0..qvm.functions.len() {
        let fid = qvm.functions[i];
        let branches = lift_function(qvm, fid)?;
        place_jump_points(qvm, fid, branches)?;
    }
    Ok(())
}

/// Lift one function. Returns the lifted branch sources
/// (compare / label-reference blocks) paired with their target address.
fn lift_function(qvm: &mut Qvm, fid: FuncId) -> Result<Vec<(OpbId, u32)>, Error> {
    let range = qvm.func(fid).ops.clone();
    let address = qvm.func(fid).address;
    let mut stack: Vec<OpbId> = Vec::new();
    let mut branches = Vec::new();

    let mut i = range.start;
    while i < range.end {
        let mut opcode = qvm.ops[i];
        let last = i + 1 == range.end;
        let kind = match opcode.op {
            Opcode::Ignore | Opcode::Break => {
                i += 1;
                continue;
            }
            Opcode::Undef => return Err(Error::MalformedModule("undef opcode in code section")),
            Opcode::Enter => OpblockKind::FuncEnter,
            // the function's final leave is its epilogue; any earlier
            // leave is a return
            Opcode::Leave if last => OpblockKind::FuncLeave,
            Opcode::Leave => OpblockKind::FuncReturn,
            Opcode::Call => OpblockKind::FuncCall,
            Opcode::Push => OpblockKind::Push,
            Opcode::Pop => OpblockKind::Pop,
            // a constant feeding a jump is a label reference
            Opcode::Const => match qvm.ops.get(i + 1).map(|next| next.op) {
                Some(Opcode::Jump) => OpblockKind::JumpAddress,
                _ => OpblockKind::Const,
            },
            Opcode::Local => OpblockKind::LocalAdr,
            Opcode::Jump => OpblockKind::Jump,
            Opcode::Load1 | Opcode::Load2 | Opcode::Load4 => OpblockKind::Load,
            Opcode::Store1 | Opcode::Store2 | Opcode::Store4 => OpblockKind::Assignation,
            Opcode::Arg => OpblockKind::FuncArg,
            Opcode::BlockCopy => OpblockKind::StructCopy,
            op if op.is_conditional_jump() => OpblockKind::Compare,
            op if op.is_unary() => OpblockKind::Operation,
            _ => OpblockKind::DoubleOperation,
        };
        match opcode.op {
            Opcode::Load1 | Opcode::Store1 => opcode.value = 1,
            Opcode::Load2 | Opcode::Store2 => opcode.value = 2,
            Opcode::Load4 | Opcode::Store4 => opcode.value = 4,
            _ => {}
        }

        let id = qvm.alloc_opb(kind, Some(opcode));
        qvm.opb_mut(id).function = Some(fid);
        qvm.func_mut(fid).opblocks_count += 1;

        let mut start = i as u32;
        let flags = kind.flags();
        if flags.contains(OpbFlags::POPS_2) {
            let op1 = stack.pop().ok_or(Error::UnbalancedStack { address })?;
            let op2 = stack.pop().ok_or(Error::UnbalancedStack { address })?;
            start = start.min(qvm.opb(op1).ops.start).min(qvm.opb(op2).ops.start);
            let opb = qvm.opb_mut(id);
            opb.op1 = Some(op1);
            opb.op2 = Some(op2);
        } else if flags.contains(OpbFlags::POPS_1) {
            // a bare epilogue has nothing to consume
            if !(kind == OpblockKind::FuncLeave && stack.is_empty()) {
                let child = stack.pop().ok_or(Error::UnbalancedStack { address })?;
                start = start.min(qvm.opb(child).ops.start);
                qvm.opb_mut(id).child = Some(child);
            }
        }
        qvm.opb_mut(id).ops = start..i as u32 + 1;

        if kind == OpblockKind::FuncReturn {
            let returns_value = qvm
                .opb(id)
                .child
                .is_some_and(|c| qvm.opb(c).kind != OpblockKind::Push);
            if returns_value {
                qvm.func_mut(fid).return_size = 4;
            }
        }
        if matches!(kind, OpblockKind::Compare | OpblockKind::JumpAddress) {
            branches.push((id, opcode.value));
        }

        if flags.contains(OpbFlags::STATEMENT) {
            append_statement(qvm, fid, id);
        } else if flags.contains(OpbFlags::PUSHES) {
            stack.push(id);
        }
        i += 1;
    }

    if !stack.is_empty() {
        return Err(Error::UnbalancedStack { address });
    }
    Ok(branches)
}

fn append_statement(qvm: &mut Qvm, fid: FuncId, id: OpbId) {
    let tail = qvm.func(fid).opblock_end;
    if let Some(tail) = tail {
        qvm.opb_mut(tail).next = Some(id);
        qvm.opb_mut(id).prev = Some(tail);
    } else {
        qvm.func_mut(fid).opblock_start = Some(id);
    }
    qvm.func_mut(fid).opblock_end = Some(id);

    let kind = qvm.opb(id).kind;
    let func = qvm.func_mut(fid);
    func.state = match kind {
        OpblockKind::FuncEnter => FuncState::Entered,
        OpblockKind::FuncLeave => FuncState::Left,
        _ if func.state == FuncState::Entered => FuncState::Body,
        _ => func.state,
    };
}

/// Synthesize one JUMP_POINT per branch target and splice it into the
/// statement list before the statement covering that address, then wire
/// every branch source to its point.
fn place_jump_points(
    qvm: &mut Qvm,
    fid: FuncId,
    branches: Vec<(OpbId, u32)>,
) -> Result<(), Error> {
    let mut points: BTreeMap<u32, OpbId> = BTreeMap::new();
    let mut targets: Vec<u32> = branches.iter().map(|&(_, target)| target).collect();
    targets.sort_unstable();
    targets.dedup();

    for target in targets {
        let op_index = qvm
            .ops
            .binary_search_by_key(&target, |op| op.offset)
            .map_err(|_| Error::UnresolvedJump { address: target })? as u32;

        let mut statement = None;
        let mut cursor = qvm.func(fid).opblock_start;
        while let Some(id) = cursor {
            let ops = &qvm.opb(id).ops;
            if ops.start <= op_index && op_index < ops.end {
                statement = Some(id);
                break;
            }
            cursor = qvm.opb(id).next;
        }
        let Some(statement) = statement else {
            return Err(Error::UnresolvedJump { address: target });
        };

        let point = qvm.alloc_opb(OpblockKind::JumpPoint, None);
        {
            let opb = qvm.opb_mut(point);
            opb.function = Some(fid);
            opb.label = Some(format!("loc_{target:x}"));
        }
        qvm.func_mut(fid).opblocks_count += 1;

        let prev = qvm.opb(statement).prev;
        qvm.opb_mut(point).prev = prev;
        qvm.opb_mut(point).next = Some(statement);
        qvm.opb_mut(statement).prev = Some(point);
        match prev {
            Some(prev) => qvm.opb_mut(prev).next = Some(point),
            None => qvm.func_mut(fid).opblock_start = Some(point),
        }
        points.insert(target, point);
    }

    for (source, target) in branches {
        qvm.opb_mut(source).jumppoint = points.get(&target).copied();
    }
    Ok(())
}
