use num_enum::TryFromPrimitive;

use crate::bytes::Cursor;
use crate::error::Error;

/// QVM instruction set.
///
/// The machine is a 32-bit stack machine; opcodes carry at most one
/// immediate operand (see [`OperandWidth`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Undef = 0,
    Ignore,
    Break,
    Enter,
    Leave,
    Call,
    Push,
    Pop,
    Const,
    Local,
    Jump,
    Eq,
    Ne,
    Lti,
    Lei,
    Gti,
    Gei,
    Ltu,
    Leu,
    Gtu,
    Geu,
    Eqf,
    Nef,
    Ltf,
    Lef,
    Gtf,
    Gef,
    Load1,
    Load2,
    Load4,
    Store1,
    Store2,
    Store4,
    Arg,
    BlockCopy,
    Sex8,
    Sex16,
    Negi,
    Add,
    Sub,
    Divi,
    Divu,
    Modi,
    Modu,
    Muli,
    Mulu,
    Band,
    Bor,
    Bxor,
    Bcom,
    Lsh,
    Rshi,
    Rshu,
    Negf,
    Addf,
    Subf,
    Divf,
    Mulf,
    Cvif,
    Cvfi,
}

/// Immediate operand encoding of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandWidth {
    None,
    Byte,
    Word,
}

/// Static opcode metadata: mnemonic, operand encoding and, for
/// arithmetic/comparison opcodes, the C operator rendering.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    pub mnemonic: &'static str,
    pub operand: OperandWidth,
    pub operation: Option<&'static str>,
}

impl OpcodeInfo {
    const fn plain(mnemonic: &'static str, operand: OperandWidth) -> Self {
        Self {
            mnemonic,
            operand,
            operation: None,
        }
    }

    const fn op(mnemonic: &'static str, operand: OperandWidth, operation: &'static str) -> Self {
        Self {
            mnemonic,
            operand,
            operation: Some(operation),
        }
    }
}

impl Opcode {
    #[must_use]
    pub const fn info(self) -> OpcodeInfo {
        use OperandWidth::{Byte, None, Word};

        match self {
            Self::Undef => OpcodeInfo::plain("undef", None),
            Self::Ignore => OpcodeInfo::plain("ignore", None),
            Self::Break => OpcodeInfo::plain("break", None),
            Self::Enter => OpcodeInfo::plain("enter", Word),
            Self::Leave => OpcodeInfo::plain("leave", Word),
            Self::Call => OpcodeInfo::plain("call", None),
            Self::Push => OpcodeInfo::plain("push", None),
            Self::Pop => OpcodeInfo::plain("pop", None),
            Self::Const => OpcodeInfo::plain("const", Word),
            Self::Local => OpcodeInfo::plain("local", Word),
            Self::Jump => OpcodeInfo::plain("jump", None),
            Self::Eq => OpcodeInfo::op("eq", Word, "=="),
            Self::Ne => OpcodeInfo::op("ne", Word, "!="),
            Self::Lti => OpcodeInfo::op("lti", Word, "<"),
            Self::Lei => OpcodeInfo::op("lei", Word, "<="),
            Self::Gti => OpcodeInfo::op("gti", Word, ">"),
            Self::Gei => OpcodeInfo::op("gei", Word, ">="),
            Self::Ltu => OpcodeInfo::op("ltu", Word, "<"),
            Self::Leu => OpcodeInfo::op("leu", Word, "<="),
            Self::Gtu => OpcodeInfo::op("gtu", Word, ">"),
            Self::Geu => OpcodeInfo::op("geu", Word, ">="),
            Self::Eqf => OpcodeInfo::op("eqf", Word, "=="),
            Self::Nef => OpcodeInfo::op("nef", Word, "!="),
            Self::Ltf => OpcodeInfo::op("ltf", Word, "<"),
            Self::Lef => OpcodeInfo::op("lef", Word, "<="),
            Self::Gtf => OpcodeInfo::op("gtf", Word, ">"),
            Self::Gef => OpcodeInfo::op("gef", Word, ">="),
            Self::Load1 => OpcodeInfo::plain("load1", None),
            Self::Load2 => OpcodeInfo::plain("load2", None),
            Self::Load4 => OpcodeInfo::plain("load4", None),
            Self::Store1 => OpcodeInfo::plain("store1", None),
            Self::Store2 => OpcodeInfo::plain("store2", None),
            Self::Store4 => OpcodeInfo::plain("store4", None),
            Self::Arg => OpcodeInfo::plain("arg", Byte),
            Self::BlockCopy => OpcodeInfo::plain("block_copy", Word),
            Self::Sex8 => OpcodeInfo::op("sex8", None, "(char)"),
            Self::Sex16 => OpcodeInfo::op("sex16", None, "(short)"),
            Self::Negi => OpcodeInfo::op("negi", None, "-"),
            Self::Add => OpcodeInfo::op("add", None, "+"),
            Self::Sub => OpcodeInfo::op("sub", None, "-"),
            Self::Divi => OpcodeInfo::op("divi", None, "/"),
            Self::Divu => OpcodeInfo::op("divu", None, "/"),
            Self::Modi => OpcodeInfo::op("modi", None, "%"),
            Self::Modu => OpcodeInfo::op("modu", None, "%"),
            Self::Muli => OpcodeInfo::op("muli", None, "*"),
            Self::Mulu => OpcodeInfo::op("mulu", None, "*"),
            Self::Band => OpcodeInfo::op("band", None, "&"),
            Self::Bor => OpcodeInfo::op("bor", None, "|"),
            Self::Bxor => OpcodeInfo::op("bxor", None, "^"),
            Self::Bcom => OpcodeInfo::op("bcom", None, "~"),
            Self::Lsh => OpcodeInfo::op("lsh", None, "<<"),
            Self::Rshi => OpcodeInfo::op("rshi", None, ">>"),
            Self::Rshu => OpcodeInfo::op("rshu", None, ">>"),
            Self::Negf => OpcodeInfo::op("negf", None, "-"),
            Self::Addf => OpcodeInfo::op("addf", None, "+"),
            Self::Subf => OpcodeInfo::op("subf", None, "-"),
            Self::Divf => OpcodeInfo::op("divf", None, "/"),
            Self::Mulf => OpcodeInfo::op("mulf", None, "*"),
            Self::Cvif => OpcodeInfo::op("cvif", None, "(float)"),
            Self::Cvfi => OpcodeInfo::op("cvfi", None, "(int)"),
        }
    }

    /// Conditional jumps: EQ through GEF.
    #[must_use]
    pub const fn is_conditional_jump(self) -> bool {
        self as u8 >= Self::Eq as u8 && self as u8 <= Self::Gef as u8
    }

    /// Single-operand arithmetic, sign extensions and conversions.
    #[must_use]
    pub const fn is_unary(self) -> bool {
        matches!(
            self,
            Self::Sex8 | Self::Sex16 | Self::Negi | Self::Bcom | Self::Negf | Self::Cvif | Self::Cvfi
        )
    }
}

/// A decoded VM instruction.
///
/// `value` is the immediate operand, zero when the opcode takes none;
/// `offset` is the byte offset of the opcode in CODE and doubles as its
/// address for calls and branches.
#[derive(Debug, Clone, Copy)]
pub struct DecodedOp {
    pub op: Opcode,
    pub value: u32,
    pub offset: u32,
}

/// Decode the raw CODE section into typed opcodes.
pub fn decode(code: &[u8]) -> Result<Vec<DecodedOp>, Error> {
    let mut cursor = Cursor::new(code);
    let mut ops = Vec::new();
    while !cursor.is_at_end() {
        let offset = cursor.offset() as u32;
        let byte = cursor.read_u8()?;
        let op = Opcode::try_from(byte).map_err(|_| Error::MalformedModule("unknown opcode"))?;
        let value = match op.info().operand {
            OperandWidth::None => 0,
            OperandWidth::Byte => u32::from(cursor.read_u8()?),
            OperandWidth::Word => cursor.read_u32()?,
        };
        ops.push(DecodedOp { op, value, offset });
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_operands() {
        // enter 0x20, const 0x2a, arg 8, add
        let code = [
            3, 0x20, 0, 0, 0, //
            8, 0x2a, 0, 0, 0, //
            33, 8, //
            38,
        ];
        let ops = decode(&code).unwrap();
        assert_eq!(4, ops.len());
        assert_eq!(Opcode::Enter, ops[0].op);
        assert_eq!(0x20, ops[0].value);
        assert_eq!(0, ops[0].offset);
        assert_eq!(Opcode::Const, ops[1].op);
        assert_eq!(5, ops[1].offset);
        assert_eq!(Opcode::Arg, ops[2].op);
        assert_eq!(8, ops[2].value);
        assert_eq!(Opcode::Add, ops[3].op);
        assert_eq!(0, ops[3].value);
        assert_eq!(12, ops[3].offset);
    }

    #[test]
    fn decode_truncated_operand() {
        assert!(matches!(
            decode(&[8, 0x2a, 0]),
            Err(Error::TruncatedStream)
        ));
    }

    #[test]
    fn decode_unknown_opcode() {
        assert!(matches!(
            decode(&[0xff]),
            Err(Error::MalformedModule(_))
        ));
    }

    #[test]
    fn operator_strings() {
        assert_eq!(Some("=="), Opcode::Eq.info().operation);
        assert_eq!(Some("~"), Opcode::Bcom.info().operation);
        assert_eq!(Some(">>"), Opcode::Rshu.info().operation);
        assert_eq!(None, Opcode::Load4.info().operation);
        assert!(Opcode::Gef.is_conditional_jump());
        assert!(!Opcode::Load1.is_conditional_jump());
        assert!(Opcode::Negi.is_unary());
        assert!(!Opcode::Add.is_unary());
    }
}
