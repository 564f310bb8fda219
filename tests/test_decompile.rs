use std::collections::HashMap;

use pretty_assertions::assert_eq;

use qvmd::error::Error;
use qvmd::opblock::OpbId;
use qvmd::opcodes::Opcode;
use qvmd::variables::{var_cut, var_find_by_name, var_rename};
use qvmd::{Qvm, Sections, decompile};

/// Tiny assembler for QVM code sections.
struct Asm(Vec<u8>);

impl Asm {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn here(&self) -> u32 {
        self.0.len() as u32
    }

    fn op(&mut self, op: Opcode) {
        self.0.push(op as u8);
    }

    fn word(&mut self, op: Opcode, value: u32) {
        self.0.push(op as u8);
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn arg(&mut self, offset: u8) {
        self.0.push(Opcode::Arg as u8);
        self.0.push(offset);
    }

    /// Standard function epilogue: push a slot, leave.
    fn epilogue(&mut self, stack_size: u32) {
        self.op(Opcode::Push);
        self.word(Opcode::Leave, stack_size);
    }
}

fn analyze(code: Vec<u8>, data_len: usize) -> Qvm {
    let sections = Sections {
        code,
        data: vec![0; data_len],
        ..Sections::default()
    };
    Qvm::analyze("test.qvm", sections).expect("analysis failed")
}

fn analyze_err(code: Vec<u8>) -> Error {
    let sections = Sections {
        code,
        ..Sections::default()
    };
    Qvm::analyze("test.qvm", sections).unwrap_err()
}

fn listing(qvm: &Qvm) -> String {
    let mut out = Vec::new();
    decompile(qvm, &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn empty_function_listing() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0);
    a.word(Opcode::Leave, 0);
    let qvm = analyze(a.0, 0);

    let expected = format!(
        "/*\n\
         \tQVM Decompiler {}\n\
         \n\
         \tName: test.qvm\n\
         \tOpcodes Count: 2\n\
         \tFunctions Count: 1\n\
         \tSyscalls Count: 0\n\
         \tGlobals Count: 0\n\
         \tCalls Restored: 100.00\n\
         */\n\
         \n\
         \n\
         /*\n\
         =================\n\
         sub_0\n\
         \n\
         Address: 0x0\n\
         Stack Size: 0x0\n\
         Opcodes Count: 2\n\
         Opblocks Count: 2\n\
         =================\n\
         */\n\
         void sub_0(void) {{\n\
         }}\n\
         \n",
        env!("CARGO_PKG_VERSION")
    );
    assert_eq!(expected, listing(&qvm));
}

#[test]
fn global_assignment() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0x10);
    a.word(Opcode::Const, 0x100);
    a.word(Opcode::Const, 0x2a);
    a.op(Opcode::Store4);
    a.epilogue(0x10);
    let qvm = analyze(a.0, 0x200);

    let text = listing(&qvm);
    assert!(text.contains("int\t\tglobal_100 = 0; // Used by: sub_0\n"));
    assert!(text.contains("\tglobal_100 = 0x2a;\n"));
}

#[test]
fn direct_call_with_args() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0x20);
    a.word(Opcode::Const, 1);
    a.arg(0x8);
    a.word(Opcode::Const, 2);
    a.arg(0xc);
    a.word(Opcode::Const, 32);
    a.op(Opcode::Call);
    a.op(Opcode::Pop);
    a.epilogue(0x20);
    assert_eq!(32, a.here());
    a.word(Opcode::Enter, 0x10);
    a.epilogue(0x10);
    let qvm = analyze(a.0, 0);

    let text = listing(&qvm);
    assert!(text.contains("#define next_call_arg_0 \"0x1\"\n"));
    assert!(text.contains("#define next_call_arg_1 \"0x2\"\n"));
    assert!(text.contains("\tsub_20(0x1, 0x2);\n"));
    assert!(text.contains("Calls: sub_20\n"));
    assert!(text.contains("Called by: sub_0\n"));
    assert!(text.contains("Calls Restored: 100.00\n"));

    // calls/called-by are symmetric
    let caller = qvm.functions[0];
    let callee = qvm.functions[1];
    assert_eq!(vec![callee], qvm.func(caller).calls);
    assert_eq!(vec![caller], qvm.func(callee).called_by);
}

#[test]
fn conditional_branch() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 8);
    a.word(Opcode::Local, 4);
    a.op(Opcode::Load4);
    a.word(Opcode::Const, 0);
    a.word(Opcode::Eq, 21);
    a.epilogue(8);
    let qvm = analyze(a.0, 0);

    let text = listing(&qvm);
    assert!(text.contains("\tint\t\tlocal_4;\n"));
    assert!(text.contains("\tif (local_4 == 0x0) goto loc_15;\n"));
    assert!(text.contains("loc_15:\n"));
}

#[test]
fn syscall_stub() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0);
    a.word(Opcode::Const, 0xfffffff9);
    a.op(Opcode::Call);
    a.op(Opcode::Pop);
    a.epilogue(0);
    let qvm = analyze(a.0, 0);

    assert_eq!(1, qvm.syscalls.len());
    assert_eq!("trap_fffffff9", qvm.func(qvm.syscalls[0]).name);

    let text = listing(&qvm);
    assert!(text.contains("\ttrap_fffffff9();\n"));
    assert!(text.contains("Syscalls Count: 1\n"));
}

#[test]
fn variable_cut_via_access() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0);
    a.word(Opcode::Const, 0x100);
    a.word(Opcode::Const, 0x180);
    a.word(Opcode::BlockCopy, 8);
    a.word(Opcode::Const, 0x104);
    a.op(Opcode::Load4);
    a.op(Opcode::Pop);
    a.epilogue(0);
    let qvm = analyze(a.0, 0x200);

    let globals: Vec<(&str, u32, u32)> = qvm
        .globals
        .iter()
        .map(|&v| {
            let var = qvm.var(v);
            (var.name.as_str(), var.address, var.size)
        })
        .collect();
    assert_eq!(
        vec![("global_100", 0x100, 4), ("global_104", 0x104, 4)],
        globals
    );

    let text = listing(&qvm);
    assert!(text.contains("\tblock_copy(&global_100, 0x180, 0x8);\n"));
    assert!(text.contains("int\t\tglobal_104 = 0; // Used by: sub_0\n"));
}

#[test]
fn indirect_call_stays_indirect() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0);
    a.word(Opcode::Const, 0x1000);
    a.op(Opcode::Call);
    a.op(Opcode::Pop);
    a.epilogue(0);
    let qvm = analyze(a.0, 0);

    let text = listing(&qvm);
    assert!(text.contains("\t(*(0x1000))();\n"));
    assert!(text.contains("Calls Restored: 0.00\n"));
}

#[test]
fn goto_label() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0);
    a.word(Opcode::Const, 11);
    a.op(Opcode::Jump);
    a.epilogue(0);
    let qvm = analyze(a.0, 0);

    let text = listing(&qvm);
    assert!(text.contains("\tgoto loc_b;\n"));
    assert!(text.contains("loc_b:\n}\n"));
}

#[test]
fn return_value_infers_int() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 8);
    a.word(Opcode::Const, 5);
    a.word(Opcode::Leave, 8);
    a.epilogue(8);
    let qvm = analyze(a.0, 0);

    assert_eq!(4, qvm.func(qvm.functions[0]).return_size);
    let text = listing(&qvm);
    assert!(text.contains("int sub_0(void) {\n"));
    assert!(text.contains("\treturn 0x5;\n"));
}

#[test]
fn argument_naming_in_header() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 8);
    a.word(Opcode::Local, 16);
    a.op(Opcode::Load4);
    a.op(Opcode::Pop);
    a.epilogue(8);
    let qvm = analyze(a.0, 0);

    let text = listing(&qvm);
    assert!(text.contains("void sub_0(int arg_0) {\n"));
    assert!(text.contains("\targ_0;\n"));
}

#[test]
fn literal_and_bss_naming() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0);
    a.word(Opcode::Const, 0x18);
    a.op(Opcode::Load4);
    a.op(Opcode::Pop);
    a.word(Opcode::Const, 0x30);
    a.op(Opcode::Load4);
    a.op(Opcode::Pop);
    a.epilogue(0);
    let sections = Sections {
        code: a.0,
        data: vec![0; 0x10],
        lit: vec![0; 0x10],
        ..Sections::default()
    };
    let qvm = Qvm::analyze("test.qvm", sections).unwrap();

    let text = listing(&qvm);
    // no initializers outside DATA
    assert!(text.contains("int\t\tlit_18; // Used by: sub_0\n"));
    assert!(text.contains("int\t\tbss_30; // Used by: sub_0\n"));
}

#[test]
fn restored_percentage_partial() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0);
    a.epilogue(0);
    assert_eq!(11, a.here());
    a.word(Opcode::Enter, 0);
    a.word(Opcode::Const, 0);
    a.op(Opcode::Call);
    a.op(Opcode::Pop);
    a.word(Opcode::Const, 0x1000);
    a.op(Opcode::Call);
    a.op(Opcode::Pop);
    a.epilogue(0);
    let qvm = analyze(a.0, 0);

    assert_eq!(50.0, qvm.restored_calls_perc);
    assert!(listing(&qvm).contains("Calls Restored: 50.00\n"));
}

#[test]
fn empty_module_banner() {
    let qvm = analyze(Vec::new(), 0);
    let text = listing(&qvm);
    assert!(text.contains("Functions Count: 0\n"));
    assert!(text.contains("Globals Count: 0\n"));
    assert!(text.contains("Calls Restored: 100.00\n"));
}

#[test]
fn lifting_is_deterministic() {
    let build = || {
        let mut a = Asm::new();
        a.word(Opcode::Enter, 0x20);
        a.word(Opcode::Const, 1);
        a.arg(0x8);
        a.word(Opcode::Const, 25);
        a.op(Opcode::Call);
        a.op(Opcode::Pop);
        a.epilogue(0x20);
        assert_eq!(25, a.here());
        a.word(Opcode::Enter, 0x10);
        a.word(Opcode::Local, 4);
        a.op(Opcode::Load4);
        a.word(Opcode::Const, 0);
        a.word(Opcode::Eq, 46);
        a.epilogue(0x10);
        a.0
    };
    let first = listing(&analyze(build(), 0x40));
    let second = listing(&analyze(build(), 0x40));
    assert_eq!(first, second);
}

#[test]
fn rename_roundtrip() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0x10);
    a.word(Opcode::Const, 0x100);
    a.word(Opcode::Const, 0x2a);
    a.op(Opcode::Store4);
    a.epilogue(0x10);
    let mut qvm = analyze(a.0, 0x200);

    let vid = var_find_by_name(&qvm, None, "global_100").unwrap();
    var_rename(&mut qvm, vid, "score").unwrap();
    assert_eq!(Some(vid), var_find_by_name(&qvm, None, "score"));
    assert_eq!(None, var_find_by_name(&qvm, None, "global_100"));

    // an oversized rename is skipped and the old name survives
    let long = "x".repeat(80);
    assert!(matches!(
        var_rename(&mut qvm, vid, &long),
        Err(Error::NameTooLong { len: 80 })
    ));
    assert_eq!("score", qvm.var(vid).name);
    assert!(listing(&qvm).contains("\tscore = 0x2a;\n"));
}

#[test]
fn cut_partitions_the_original_range() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0);
    a.word(Opcode::Const, 0x100);
    a.word(Opcode::Const, 0x180);
    a.word(Opcode::BlockCopy, 8);
    a.epilogue(0);
    let mut qvm = analyze(a.0, 0x200);

    // outside any sized variable: refused
    assert!(matches!(
        var_cut(&mut qvm, None, 0x108),
        Err(Error::VariableCutFailed { address: 0x108 })
    ));
    assert!(matches!(
        var_cut(&mut qvm, None, 0x50),
        Err(Error::VariableCutFailed { address: 0x50 })
    ));

    let tail = var_cut(&mut qvm, None, 0x103).unwrap();
    assert_eq!(0x103, qvm.var(tail).address);
    assert_eq!(5, qvm.var(tail).size);

    let head = var_find_by_name(&qvm, None, "global_100").unwrap();
    assert_eq!(3, qvm.var(head).size);

    // cutting at an existing boundary returns the variable itself
    assert_eq!(head, var_cut(&mut qvm, None, 0x100).unwrap());
}

#[test]
fn error_unbalanced_stack() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0);
    a.op(Opcode::Pop);
    a.epilogue(0);
    assert!(matches!(
        analyze_err(a.0),
        Error::UnbalancedStack { address: 0 }
    ));
}

#[test]
fn error_truncated_stream() {
    assert!(matches!(
        analyze_err(vec![Opcode::Const as u8, 0x2a]),
        Error::TruncatedStream
    ));
}

#[test]
fn error_code_before_enter() {
    let mut a = Asm::new();
    a.word(Opcode::Const, 0);
    assert!(matches!(analyze_err(a.0), Error::MalformedModule(_)));
}

#[test]
fn error_unknown_opcode() {
    assert!(matches!(
        analyze_err(vec![0xff]),
        Error::MalformedModule(_)
    ));
}

#[test]
fn error_unresolved_jump() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0);
    a.word(Opcode::Const, 1);
    a.word(Opcode::Const, 2);
    a.word(Opcode::Eq, 0x63);
    a.epilogue(0);
    assert!(matches!(
        analyze_err(a.0),
        Error::UnresolvedJump { address: 0x63 }
    ));
}

fn visit(qvm: &Qvm, id: OpbId, counts: &mut HashMap<OpbId, u32>) {
    *counts.entry(id).or_default() += 1;
    let opb = qvm.opb(id);
    for edge in [opb.child, opb.op1, opb.op2].into_iter().flatten() {
        visit(qvm, edge, counts);
    }
}

#[test]
fn expression_ownership_is_unique() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0x10);
    a.word(Opcode::Local, 4);
    a.word(Opcode::Local, 8);
    a.op(Opcode::Load4);
    a.word(Opcode::Const, 3);
    a.op(Opcode::Add);
    a.op(Opcode::Store4);
    a.word(Opcode::Const, 1);
    a.arg(0x8);
    a.word(Opcode::Const, 0xfffffff0);
    a.op(Opcode::Call);
    a.op(Opcode::Pop);
    a.epilogue(0x10);
    let qvm = analyze(a.0, 0);

    let mut counts = HashMap::new();
    for &fid in &qvm.functions {
        for statement in qvm.statements(fid) {
            visit(&qvm, statement, &mut counts);
        }
    }
    // every reachable opblock has exactly one owner: a parent edge or a
    // statement-list slot
    assert!(counts.values().all(|&n| n == 1));
    assert_eq!(qvm.opblocks.len(), counts.len());
}

#[test]
fn variable_lists_strictly_increase() {
    let mut a = Asm::new();
    a.word(Opcode::Enter, 0x10);
    a.word(Opcode::Const, 0x104);
    a.op(Opcode::Load4);
    a.op(Opcode::Pop);
    a.word(Opcode::Const, 0x100);
    a.op(Opcode::Load2);
    a.op(Opcode::Pop);
    a.word(Opcode::Local, 8);
    a.op(Opcode::Load4);
    a.op(Opcode::Pop);
    a.word(Opcode::Local, 4);
    a.op(Opcode::Load4);
    a.op(Opcode::Pop);
    a.epilogue(0x10);
    let qvm = analyze(a.0, 0x200);

    let addresses: Vec<u32> = qvm.globals.iter().map(|&v| qvm.var(v).address).collect();
    assert_eq!(vec![0x100, 0x104], addresses);
    let locals: Vec<u32> = qvm
        .func(qvm.functions[0])
        .locals
        .iter()
        .map(|&v| qvm.var(v).address)
        .collect();
    assert_eq!(vec![4, 8], locals);
}
