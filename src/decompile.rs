use std::io::{self, Write};

use crate::functions::{FuncId, FuncState};
use crate::module::Qvm;
use crate::opblock::{OpbId, OpblockKind};
use crate::variables::{VarId, VarStatus};

/// Write the C-like listing for an analyzed module: banner, globals,
/// then every function in address order.
pub fn decompile<W: Write>(qvm: &Qvm, out: &mut W) -> io::Result<()> {
    write_banner(qvm, out)?;
    write_globals(qvm, out)?;
    for &fid in &qvm.functions {
        debug_assert_eq!(FuncState::Linked, qvm.func(fid).state);
        write_function_banner(qvm, out, fid)?;
        write_function_code(qvm, out, fid)?;
        writeln!(out)?;
    }
    Ok(())
}

fn write_banner<W: Write>(qvm: &Qvm, out: &mut W) -> io::Result<()> {
    writeln!(out, "/*")?;
    writeln!(out, "\tQVM Decompiler {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out)?;
    writeln!(out, "\tName: {}", qvm.name)?;
    writeln!(out, "\tOpcodes Count: {}", qvm.ops.len())?;
    writeln!(out, "\tFunctions Count: {}", qvm.functions.len())?;
    writeln!(out, "\tSyscalls Count: {}", qvm.syscalls.len())?;
    writeln!(out, "\tGlobals Count: {}", qvm.globals.len())?;
    writeln!(out, "\tCalls Restored: {:.2}", qvm.restored_calls_perc)?;
    writeln!(out, "*/")?;
    writeln!(out)
}

fn write_globals<W: Write>(qvm: &Qvm, out: &mut W) -> io::Result<()> {
    for (i, &vid) in qvm.globals.iter().enumerate() {
        let var = qvm.var(vid);
        write!(
            out,
            "{}{}",
            match var.size {
                4 => "int\t\t",
                2 => "short\t",
                _ => "char\t",
            },
            var.name
        )?;
        if !matches!(var.size, 1 | 2 | 4) {
            write!(out, "[{}]", display_size(qvm, &qvm.globals, i, global_bound(qvm, vid)))?;
        }

        // initializers exist for DATA only; LIT and BSS stay bare
        if var.status == VarStatus::Global {
            if let Some(content) = qvm.var_content(var) {
                write!(out, " = ")?;
                match var.size {
                    1 | 2 | 4 => write!(out, "{}", le_int(content, var.size as usize))?,
                    _ => {
                        let len =
                            display_size(qvm, &qvm.globals, i, global_bound(qvm, vid)) as usize;
                        write!(out, "\"")?;
                        for byte in content.iter().take(len) {
                            write!(out, "\\x{byte:02x}")?;
                        }
                        write!(out, "\"")?;
                    }
                }
            }
        }
        write!(out, ";")?;

        if !var.parents.is_empty() {
            write!(out, " // Used by: ")?;
            for (k, &parent) in var.parents.iter().enumerate() {
                if k > 0 {
                    write!(out, ", ")?;
                }
                write!(out, "{}", qvm.func(parent).name)?;
            }
        }
        writeln!(out)?;
    }
    writeln!(out)
}

/// End of the region a module-level variable lives in, for gap sizing.
fn global_bound(qvm: &Qvm, vid: VarId) -> u32 {
    let data = qvm.sections.data.len() as u32;
    let lit = qvm.sections.lit.len() as u32;
    match qvm.var(vid).status {
        VarStatus::Global => data,
        VarStatus::Literal => data + lit,
        _ => data + lit + qvm.sections.bss_length,
    }
}

/// Display length of a size-0 variable: the gap to the next variable in
/// its list, bounded by the owning region.
fn display_size(qvm: &Qvm, list: &[VarId], i: usize, bound: u32) -> u32 {
    let var = qvm.var(list[i]);
    if var.size > 0 {
        return var.size;
    }
    let next = list
        .get(i + 1)
        .map(|&v| qvm.var(v).address)
        .unwrap_or(bound)
        .min(bound);
    next.saturating_sub(var.address).max(1)
}

/// Little-endian signed integer of `size` bytes; missing bytes read as
/// zero.
fn le_int(content: &[u8], size: usize) -> i64 {
    let mut word = [0u8; 4];
    for (dst, src) in word.iter_mut().zip(content.iter().take(size)) {
        *dst = *src;
    }
    match size {
        1 => i64::from(word[0] as i8),
        2 => i64::from(i16::from_le_bytes([word[0], word[1]])),
        _ => i64::from(i32::from_le_bytes(word)),
    }
}

fn write_function_banner<W: Write>(qvm: &Qvm, out: &mut W, fid: FuncId) -> io::Result<()> {
    let func = qvm.func(fid);
    writeln!(out, "/*")?;
    writeln!(out, "=================")?;
    writeln!(out, "{}", func.name)?;
    writeln!(out)?;
    writeln!(out, "Address: 0x{:x}", func.address)?;
    writeln!(out, "Stack Size: 0x{:x}", func.stack_size)?;
    writeln!(out, "Opcodes Count: {}", func.ops_count())?;
    writeln!(out, "Opblocks Count: {}", func.opblocks_count)?;
    if !func.calls.is_empty() {
        write!(out, "Calls: ")?;
        write_name_list(qvm, out, &func.calls)?;
        writeln!(out)?;
    }
    if !func.called_by.is_empty() {
        write!(out, "Called by: ")?;
        write_name_list(qvm, out, &func.called_by)?;
        writeln!(out)?;
    }
    writeln!(out, "=================")?;
    writeln!(out, "*/")
}

fn write_name_list<W: Write>(qvm: &Qvm, out: &mut W, list: &[FuncId]) -> io::Result<()> {
    for (i, &f) in list.iter().enumerate() {
        if i > 0 {
            write!(out, ", ")?;
        }
        write!(out, "{}", qvm.func(f).name)?;
    }
    Ok(())
}

fn write_function_code<W: Write>(qvm: &Qvm, out: &mut W, fid: FuncId) -> io::Result<()> {
    for id in qvm.statements(fid) {
        let opb = qvm.opb(id);
        if opb.ops_count() > 0 {
            let plain = matches!(
                opb.kind,
                OpblockKind::FuncEnter | OpblockKind::FuncLeave | OpblockKind::FuncArg
            );
            if !plain {
                write!(out, "\t")?;
            }
            write_opb(qvm, out, id)?;
            if !plain {
                write!(out, ";")?;
            }
            writeln!(out)?;
        }
        if opb.kind == OpblockKind::JumpPoint {
            write_opb(qvm, out, id)?;
            writeln!(out)?;
        }
        if opb.kind == OpblockKind::FuncEnter {
            write_locals(qvm, out, fid)?;
        }
    }
    Ok(())
}

fn write_locals<W: Write>(qvm: &Qvm, out: &mut W, fid: FuncId) -> io::Result<()> {
    let func = qvm.func(fid);
    let mut printed = false;
    for (i, &vid) in func.locals.iter().enumerate() {
        let var = qvm.var(vid);
        if var.address >= func.stack_size {
            break;
        }
        match var.size {
            4 => writeln!(out, "\tint\t\t{};", var.name)?,
            2 => writeln!(out, "\tshort\t{};", var.name)?,
            1 => writeln!(out, "\tchar\t{};", var.name)?,
            _ => writeln!(
                out,
                "\tchar\t{}[{}];",
                var.name,
                display_size(qvm, &func.locals, i, func.stack_size)
            )?,
        }
        printed = true;
    }
    if printed {
        writeln!(out)?;
    }
    Ok(())
}

/// Variable a sized dereference collapses to, when the addressed
/// variable's final size equals the access size.
fn collapsed(qvm: &Qvm, id: OpbId, size: u32) -> Option<VarId> {
    let opb = qvm.opb(id);
    if !matches!(opb.kind, OpblockKind::LocalAdr | OpblockKind::GlobalAdr) {
        return None;
    }
    let vid = opb.variable?;
    (qvm.var(vid).size == size).then_some(vid)
}

fn cast(size: u32) -> &'static str {
    match size {
        1 => "*(char *)",
        2 => "*(short *)",
        4 => "*(int *)",
        _ => "",
    }
}

fn write_child<W: Write>(qvm: &Qvm, out: &mut W, child: Option<OpbId>) -> io::Result<()> {
    match child {
        Some(id) => write_opb(qvm, out, id),
        None => Ok(()),
    }
}

fn write_opb<W: Write>(qvm: &Qvm, out: &mut W, id: OpbId) -> io::Result<()> {
    let opb = qvm.opb(id);
    match opb.kind {
        OpblockKind::Undef | OpblockKind::Push => Ok(()),
        OpblockKind::FuncEnter => {
            let Some(fid) = opb.function else {
                return Ok(());
            };
            let func = qvm.func(fid);
            write!(
                out,
                "{} {}(",
                if func.return_size == 4 { "int" } else { "void" },
                func.name
            )?;
            let mut has_args = false;
            for &vid in &func.locals {
                let var = qvm.var(vid);
                if var.address < func.stack_size {
                    continue;
                }
                if var.address > func.stack_size + 8 {
                    write!(out, ", ")?;
                }
                write!(out, "int {}", var.name)?;
                has_args = true;
            }
            if !has_args {
                write!(out, "void")?;
            }
            write!(out, ") {{")
        }
        OpblockKind::FuncReturn => {
            write!(out, "return ")?;
            write_child(qvm, out, opb.child)
        }
        OpblockKind::FuncLeave => write!(out, "}}"),
        OpblockKind::FuncArg => {
            write!(
                out,
                "#define next_call_arg_{} \"",
                (opb.value() as i32 - 8) / 4
            )?;
            write_child(qvm, out, opb.child)?;
            write!(out, "\"")
        }
        OpblockKind::FuncCall => {
            match opb.function_called {
                Some(callee) => write!(out, "{}(", qvm.func(callee).name)?,
                None => {
                    write!(out, "(*(")?;
                    write_child(qvm, out, opb.child)?;
                    write!(out, "))(")?;
                }
            }
            let mut arg = opb.function_arg;
            let mut first = true;
            while let Some(a) = arg {
                let feeder = qvm.opb(a);
                if feeder.kind != OpblockKind::FuncArg {
                    break;
                }
                if !first {
                    write!(out, ", ")?;
                }
                first = false;
                write_child(qvm, out, feeder.child)?;
                arg = feeder.next;
            }
            write!(out, ")")
        }
        OpblockKind::Pop => write_child(qvm, out, opb.child),
        OpblockKind::Const => write!(out, "0x{:x}", opb.value()),
        OpblockKind::LocalAdr | OpblockKind::GlobalAdr => {
            let Some(vid) = opb.variable else {
                return write!(out, "0x{:x}", opb.value());
            };
            let var = qvm.var(vid);
            if matches!(var.size, 1 | 2 | 4) {
                write!(out, "&{}", var.name)
            } else {
                write!(out, "{}", var.name)
            }
        }
        OpblockKind::Local | OpblockKind::Global => {
            let Some(vid) = opb.variable else {
                return Ok(());
            };
            write!(out, "{}", qvm.var(vid).name)
        }
        OpblockKind::Jump => {
            write!(out, "goto ")?;
            write_child(qvm, out, opb.child)
        }
        OpblockKind::Compare => {
            write!(out, "if (")?;
            write_child(qvm, out, opb.op2)?;
            write!(out, " {} ", opb.operation())?;
            write_child(qvm, out, opb.op1)?;
            write!(out, ") goto {}", jump_label(qvm, opb.jumppoint))
        }
        OpblockKind::Load => match opb.child {
            Some(child) => match collapsed(qvm, child, opb.value()) {
                Some(vid) => write!(out, "{}", qvm.var(vid).name),
                None => {
                    write!(out, "{}", cast(opb.value()))?;
                    write_opb(qvm, out, child)
                }
            },
            None => Ok(()),
        },
        OpblockKind::Assignation => {
            match opb.op2 {
                Some(target) => match collapsed(qvm, target, opb.value()) {
                    Some(vid) => write!(out, "{}", qvm.var(vid).name)?,
                    None => {
                        write!(out, "{}", cast(opb.value()))?;
                        write_opb(qvm, out, target)?;
                    }
                },
                None => {}
            }
            write!(out, " = ")?;
            write_child(qvm, out, opb.op1)
        }
        OpblockKind::StructCopy => {
            write!(out, "block_copy(")?;
            write_child(qvm, out, opb.op2)?;
            write!(out, ", ")?;
            write_child(qvm, out, opb.op1)?;
            write!(out, ", 0x{:x})", opb.value())
        }
        OpblockKind::Operation => {
            write!(out, "{}", opb.operation())?;
            write_child(qvm, out, opb.child)
        }
        OpblockKind::DoubleOperation => {
            write!(out, "(")?;
            write_child(qvm, out, opb.op2)?;
            write!(out, " {} ", opb.operation())?;
            write_child(qvm, out, opb.op1)?;
            write!(out, ")")
        }
        OpblockKind::JumpPoint => {
            write!(out, "{}:", opb.label.as_deref().unwrap_or(""))
        }
        OpblockKind::JumpAddress => {
            write!(out, "{}", jump_label(qvm, opb.jumppoint))
        }
    }
}

fn jump_label<'a>(qvm: &'a Qvm, jumppoint: Option<OpbId>) -> &'a str {
    jumppoint
        .and_then(|id| qvm.opb(id).label.as_deref())
        .unwrap_or("")
}
