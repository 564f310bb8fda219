use tracing::debug;

use crate::functions::{FuncState, func_add_syscall, func_find, ref_list_add};
use crate::module::Qvm;
use crate::opblock::{OpbId, OpblockKind};

/// Resolve direct-call targets against the function table, synthesizing
/// syscall stubs for negative addresses, and build the calls/called-by
/// lists.
pub(crate) fn build_xrefs(qvm: &mut Qvm) {
    let mut total = 0usize;
    let mut restored = 0usize;

    for index in 0..qvm.opblocks.len() {
        let id = OpbId(index as u32);
        if qvm.opb(id).kind != OpblockKind::FuncCall {
            continue;
        }
        total += 1;
        let Some(child) = qvm.opb(id).child else {
            continue;
        };
        if qvm.opb(child).kind != OpblockKind::Const {
            continue;
        }
        let target = qvm.opb(child).value();
        let callee = if (target as i32) < 0 {
            Some(func_add_syscall(qvm, target))
        } else {
            func_find(qvm, target)
        };
        let Some(callee) = callee else {
            // neither a known function nor a trap: the call stays indirect
            continue;
        };
        qvm.opb_mut(id).function_called = Some(callee);
        restored += 1;
        if let Some(caller) = qvm.opb(id).function {
            ref_list_add(&mut qvm.func_mut(caller).calls, callee);
            ref_list_add(&mut qvm.func_mut(callee).called_by, caller);
        }
    }

    qvm.restored_calls_perc = if total == 0 {
        100.0
    } else {
        restored as f64 * 100.0 / total as f64
    };
    debug!(total, restored, "resolved calls");
}

/// Attach to every call the contiguous run of FUNC_ARG statements that
/// feeds it, earliest first.
pub(crate) fn link_call_args(qvm: &mut Qvm) {
    for i in 0..qvm.functions.len() {
        let fid = qvm.functions[i];
        let statements: Vec<OpbId> = qvm.statements(fid).collect();
        for &statement in &statements {
            let Some(call) = qvm.find_call(statement) else {
                continue;
            };
            let mut first = None;
            let mut cursor = qvm.opb(statement).prev;
            while let Some(prev) = cursor {
                if qvm.opb(prev).kind != OpblockKind::FuncArg {
                    break;
                }
                first = Some(prev);
                cursor = qvm.opb(prev).prev;
            }
            if first.is_some() {
                qvm.opb_mut(call).function_arg = first;
            }
        }
        qvm.func_mut(fid).state = FuncState::Linked;
    }
}
