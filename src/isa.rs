//! Instruction Set Architecture (ISA) definitions.
//!
//! Defines the VM's instruction set. The [`for_each_instruction!`](crate::for_each_instruction)
//! macro holds the canonical instruction definitions and invokes a callback
//! macro for code generation. This enables multiple modules to generate
//! instruction-related code without duplicating definitions.
//!
//! This module generates:
//! - The [`Instruction`] enum with opcode mappings
//! - `TryFrom<u8>` for decoding opcodes
//! - Mnemonic lookups, encoded sizes and operand templates
//!
//! # Bytecode Format
//!
//! Instructions use variable-length encoding:
//! - Opcode: 1 byte
//! - Integer operand: 1 flag byte + 4 payload bytes (little-endian `i32`)
//! - Byte operand: 1 flag byte + 1 payload byte
//! - Jump address: 4 bytes (little-endian `i32`, no flag byte)
//!
//! A nonzero flag byte marks the operand as indirect: the VM fetches the
//! Integer stored in the register named by the payload and uses its value as
//! the real operand.

use crate::errors::VmError;

/// Integer operand: a register index or literal, optionally resolved through
/// the Integer stored in the named register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IntOp {
    /// When set, `value` names a register whose Integer payload is the
    /// real operand.
    pub indirect: bool,
    pub value: i32,
}

impl IntOp {
    /// Operand used as-is.
    pub const fn direct(value: i32) -> Self {
        Self {
            indirect: false,
            value,
        }
    }

    /// Operand resolved through the Integer stored in register `value`.
    pub const fn indirect(value: i32) -> Self {
        Self {
            indirect: true,
            value,
        }
    }
}

/// Byte operand: same shape as [`IntOp`] with a byte payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ByteOp {
    pub indirect: bool,
    pub value: u8,
}

impl ByteOp {
    /// Operand used as-is.
    pub const fn direct(value: u8) -> Self {
        Self {
            indirect: false,
            value,
        }
    }

    /// Operand resolved through the Byte stored in register `value`.
    pub const fn indirect(value: u8) -> Self {
        Self {
            indirect: true,
            value,
        }
    }
}

/// Operand categories used by the instruction table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandKind {
    /// Flag byte plus little-endian `i32` payload.
    Int,
    /// Flag byte plus single byte payload.
    Byte,
    /// Raw little-endian `i32` jump target, back-patched after assembly.
    Addr,
}

impl OperandKind {
    /// Encoded size of the operand in bytes.
    pub const fn encoded_size(self) -> usize {
        match self {
            OperandKind::Int => 5,
            OperandKind::Byte => 2,
            OperandKind::Addr => 4,
        }
    }
}

/// Invokes a callback macro with the complete instruction definition list.
///
/// This macro enables code generation for instructions in multiple modules
/// without duplicating the instruction definitions.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            /// istore reg, num ; reg = num
            Istore = 0x00, "istore" => [reg: IntOp, num: IntOp],
            /// iadd rega, regb, regr ; regr = rega + regb
            Iadd = 0x01, "iadd" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// isub rega, regb, regr ; regr = rega - regb
            Isub = 0x02, "isub" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// imul rega, regb, regr ; regr = rega * regb
            Imul = 0x03, "imul" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// idiv rega, regb, regr ; regr = rega / regb
            Idiv = 0x04, "idiv" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// iinc reg ; reg = reg + 1, in place
            Iinc = 0x05, "iinc" => [reg: IntOp],
            /// idec reg ; reg = reg - 1, in place
            Idec = 0x06, "idec" => [reg: IntOp],
            /// ilt rega, regb, regr ; regr = rega < regb
            Ilt = 0x07, "ilt" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// ilte rega, regb, regr ; regr = rega <= regb
            Ilte = 0x08, "ilte" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// igt rega, regb, regr ; regr = rega > regb
            Igt = 0x09, "igt" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// igte rega, regb, regr ; regr = rega >= regb
            Igte = 0x0A, "igte" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// ieq rega, regb, regr ; regr = rega == regb
            Ieq = 0x0B, "ieq" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// bstore reg, b ; reg = b
            Bstore = 0x0C, "bstore" => [reg: IntOp, b: ByteOp],
            /// not reg ; reg = !reg, in place
            Not = 0x0D, "not" => [reg: IntOp],
            /// and rega, regb, regr ; regr = rega && regb
            And = 0x0E, "and" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// or rega, regb, regr ; regr = rega || regb
            Or = 0x0F, "or" => [rega: IntOp, regb: IntOp, regr: IntOp],
            /// move a, b ; transfer ownership from a to b, clearing a
            Move = 0x10, "move" => [a: IntOp, b: IntOp],
            /// copy a, b ; b = deep copy of a
            Copy = 0x11, "copy" => [a: IntOp, b: IntOp],
            /// ref a, b ; make a an alias of the value owned via b
            Ref = 0x12, "ref" => [a: IntOp, b: IntOp],
            /// swap a, b ; exchange the two slots
            Swap = 0x13, "swap" => [a: IntOp, b: IntOp],
            /// delete reg ; destroy the value in reg, emptying the slot
            Delete = 0x14, "delete" => [reg: IntOp],
            /// print reg ; render the value followed by a newline
            Print = 0x15, "print" => [reg: IntOp],
            /// echo reg ; render the value without a newline
            Echo = 0x16, "echo" => [reg: IntOp],
            /// jump addr ; continue at the given instruction index
            Jump = 0x17, "jump" => [addr: Addr],
            /// branch cond, addrt, addrf ; go to addrt if cond else addrf
            Branch = 0x18, "branch" => [cond: IntOp, addr_truth: Addr, addr_false: Addr],
            /// ret reg ; mark reg as the return-value register
            Ret = 0x19, "ret" => [reg: IntOp],
            /// halt ; stop execution
            Halt = 0x1A, "halt" => [],
            /// pass ; no-op
            Pass = 0x1B, "pass" => [],
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        // =========================
        // VM instruction enum
        // =========================
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Instruction {
            type Error = VmError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(VmError::UnknownOpcode(value)),
                }
            }
        }

        impl Instruction {
            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Looks an instruction up by its assembly mnemonic.
            pub fn from_mnemonic(name: &str) -> Result<Instruction, VmError> {
                match name {
                    $( $mnemonic => Ok(Instruction::$name), )*
                    _ => Err(VmError::UnknownInstruction(name.to_string())),
                }
            }

            /// Returns the encoded size of the instruction (opcode + operands).
            pub const fn size(&self) -> usize {
                match self {
                    $(
                        Instruction::$name => {
                            1usize $( + define_instructions!(@size $kind) )*
                        }
                    )*
                }
            }

            /// Returns the ordered operand template for this instruction.
            pub fn operands(&self) -> &'static [OperandKind] {
                match self {
                    $(
                        Instruction::$name => &[
                            $( define_instructions!(@operand_kind $kind) ),*
                        ],
                    )*
                }
            }
        }
    };

    // ---------- operand sizes ----------
    (@size IntOp)  => { 5usize };
    (@size ByteOp) => { 2usize };
    (@size Addr)   => { 4usize };

    // ---------- operand kinds ----------
    (@operand_kind IntOp)  => { OperandKind::Int };
    (@operand_kind ByteOp) => { OperandKind::Byte };
    (@operand_kind Addr)   => { OperandKind::Addr };
}

for_each_instruction!(define_instructions);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_try_from_invalid() {
        assert!(matches!(
            Instruction::try_from(0xFF),
            Err(VmError::UnknownOpcode(0xFF))
        ));
    }

    #[test]
    fn instruction_try_from_roundtrip() {
        for op in [
            Instruction::Istore,
            Instruction::Bstore,
            Instruction::Branch,
            Instruction::Pass,
        ] {
            assert_eq!(Instruction::try_from(op as u8).unwrap(), op);
        }
    }

    #[test]
    fn mnemonic_roundtrip() {
        for op in [
            Instruction::Istore,
            Instruction::Ilt,
            Instruction::Ilte,
            Instruction::Delete,
            Instruction::Halt,
        ] {
            assert_eq!(Instruction::from_mnemonic(op.mnemonic()).unwrap(), op);
        }
    }

    #[test]
    fn from_mnemonic_invalid() {
        assert!(matches!(
            Instruction::from_mnemonic("frobnicate"),
            Err(VmError::UnknownInstruction(name)) if name == "frobnicate"
        ));
        // mnemonics are lowercase
        assert!(Instruction::from_mnemonic("ISTORE").is_err());
    }

    #[test]
    fn encoded_sizes() {
        assert_eq!(Instruction::Istore.size(), 11);
        assert_eq!(Instruction::Iadd.size(), 16);
        assert_eq!(Instruction::Iinc.size(), 6);
        assert_eq!(Instruction::Bstore.size(), 8);
        assert_eq!(Instruction::Move.size(), 11);
        assert_eq!(Instruction::Delete.size(), 6);
        assert_eq!(Instruction::Jump.size(), 5);
        assert_eq!(Instruction::Branch.size(), 14);
        assert_eq!(Instruction::Halt.size(), 1);
        assert_eq!(Instruction::Pass.size(), 1);
    }

    #[test]
    fn size_matches_operand_template() {
        for byte in 0x00..=0x1B {
            let instr = Instruction::try_from(byte).unwrap();
            let operand_bytes: usize = instr
                .operands()
                .iter()
                .map(|kind| kind.encoded_size())
                .sum();
            assert_eq!(instr.size(), 1 + operand_bytes);
        }
    }

    #[test]
    fn branch_operand_template() {
        assert_eq!(
            Instruction::Branch.operands(),
            &[OperandKind::Int, OperandKind::Addr, OperandKind::Addr]
        );
        assert_eq!(
            Instruction::Bstore.operands(),
            &[OperandKind::Int, OperandKind::Byte]
        );
        assert!(Instruction::Halt.operands().is_empty());
    }
}
