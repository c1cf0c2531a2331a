//! Bytecode program builder and image serialization.
//!
//! [`Program`] builds a byte buffer by appending typed instructions through a
//! fluent API. Jump and branch instructions are written with *instruction
//! index* operands and recorded in a branch list; [`Program::calculate_branches`]
//! rewrites those operands as byte offsets once the program is complete.
//!
//! [`ProgramImage`] is the on-disk artifact shared by the assembler and the
//! VM: a 4-byte header (`u16` code size, `u16` executable offset, both
//! little-endian) followed by the code region.

use crate::errors::VmError;
use crate::isa::{ByteOp, Instruction, IntOp, OperandKind};
use std::fmt::Write as _;

/// Back-patch anchor: the byte position of a control-flow opcode, stored
/// together with its kind so patching never re-reads the opcode byte.
#[derive(Copy, Clone, Debug)]
struct BranchAnchor {
    position: usize,
    kind: Instruction,
}

/// Bytecode program under construction.
///
/// The write cursor never retreats; callers are expected to pre-size the
/// buffer from the assembler's sizing pass.
#[derive(Debug)]
pub struct Program {
    code: Vec<u8>,
    branches: Vec<BranchAnchor>,
}

impl Program {
    /// Creates an empty program with capacity for `bytes` bytes of code.
    pub fn new(bytes: usize) -> Self {
        Self {
            code: Vec::with_capacity(bytes),
            branches: Vec::new(),
        }
    }

    fn push_opcode(&mut self, instr: Instruction) {
        self.code.push(instr as u8);
    }

    fn push_int_op(&mut self, op: IntOp) {
        self.code.push(op.indirect as u8);
        self.code.extend_from_slice(&op.value.to_le_bytes());
    }

    fn push_byte_op(&mut self, op: ByteOp) {
        self.code.push(op.indirect as u8);
        self.code.push(op.value);
    }

    fn push_addr(&mut self, addr: i32) {
        self.code.extend_from_slice(&addr.to_le_bytes());
    }

    fn two_int_ops(&mut self, instr: Instruction, a: IntOp, b: IntOp) -> &mut Self {
        self.push_opcode(instr);
        self.push_int_op(a);
        self.push_int_op(b);
        self
    }

    fn three_int_ops(&mut self, instr: Instruction, a: IntOp, b: IntOp, c: IntOp) -> &mut Self {
        self.push_opcode(instr);
        self.push_int_op(a);
        self.push_int_op(b);
        self.push_int_op(c);
        self
    }

    fn one_int_op(&mut self, instr: Instruction, reg: IntOp) -> &mut Self {
        self.push_opcode(instr);
        self.push_int_op(reg);
        self
    }

    // =========================
    // Instruction interface
    // =========================

    /// Stores an integer in a register.
    pub fn istore(&mut self, reg: IntOp, num: IntOp) -> &mut Self {
        self.two_int_ops(Instruction::Istore, reg, num)
    }

    pub fn iadd(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::Iadd, rega, regb, regr)
    }

    pub fn isub(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::Isub, rega, regb, regr)
    }

    pub fn imul(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::Imul, rega, regb, regr)
    }

    pub fn idiv(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::Idiv, rega, regb, regr)
    }

    pub fn iinc(&mut self, reg: IntOp) -> &mut Self {
        self.one_int_op(Instruction::Iinc, reg)
    }

    pub fn idec(&mut self, reg: IntOp) -> &mut Self {
        self.one_int_op(Instruction::Idec, reg)
    }

    pub fn ilt(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::Ilt, rega, regb, regr)
    }

    pub fn ilte(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::Ilte, rega, regb, regr)
    }

    pub fn igt(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::Igt, rega, regb, regr)
    }

    pub fn igte(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::Igte, rega, regb, regr)
    }

    pub fn ieq(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::Ieq, rega, regb, regr)
    }

    /// Stores a byte in a register.
    pub fn bstore(&mut self, reg: IntOp, b: ByteOp) -> &mut Self {
        self.push_opcode(Instruction::Bstore);
        self.push_int_op(reg);
        self.push_byte_op(b);
        self
    }

    pub fn lognot(&mut self, reg: IntOp) -> &mut Self {
        self.one_int_op(Instruction::Not, reg)
    }

    pub fn logand(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::And, rega, regb, regr)
    }

    pub fn logor(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> &mut Self {
        self.three_int_ops(Instruction::Or, rega, regb, regr)
    }

    pub fn move_(&mut self, a: IntOp, b: IntOp) -> &mut Self {
        self.two_int_ops(Instruction::Move, a, b)
    }

    pub fn copy(&mut self, a: IntOp, b: IntOp) -> &mut Self {
        self.two_int_ops(Instruction::Copy, a, b)
    }

    pub fn ref_(&mut self, a: IntOp, b: IntOp) -> &mut Self {
        self.two_int_ops(Instruction::Ref, a, b)
    }

    pub fn swap(&mut self, a: IntOp, b: IntOp) -> &mut Self {
        self.two_int_ops(Instruction::Swap, a, b)
    }

    pub fn delete(&mut self, reg: IntOp) -> &mut Self {
        self.one_int_op(Instruction::Delete, reg)
    }

    pub fn print(&mut self, reg: IntOp) -> &mut Self {
        self.one_int_op(Instruction::Print, reg)
    }

    pub fn echo(&mut self, reg: IntOp) -> &mut Self {
        self.one_int_op(Instruction::Echo, reg)
    }

    /// Inserts a jump to the given *instruction index*. The operand is
    /// rewritten as a byte offset by [`Program::calculate_branches`].
    pub fn jump(&mut self, addr: i32) -> &mut Self {
        self.branches.push(BranchAnchor {
            position: self.code.len(),
            kind: Instruction::Jump,
        });
        self.push_opcode(Instruction::Jump);
        self.push_addr(addr);
        self
    }

    /// Inserts a conditional branch. `addr_truth` and `addr_false` are
    /// *instruction indexes*, rewritten by [`Program::calculate_branches`].
    pub fn branch(&mut self, cond: IntOp, addr_truth: i32, addr_false: i32) -> &mut Self {
        self.branches.push(BranchAnchor {
            position: self.code.len(),
            kind: Instruction::Branch,
        });
        self.push_opcode(Instruction::Branch);
        self.push_int_op(cond);
        self.push_addr(addr_truth);
        self.push_addr(addr_false);
        self
    }

    pub fn ret(&mut self, reg: IntOp) -> &mut Self {
        self.one_int_op(Instruction::Ret, reg)
    }

    pub fn pass(&mut self) -> &mut Self {
        self.push_opcode(Instruction::Pass);
        self
    }

    pub fn halt(&mut self) -> &mut Self {
        self.push_opcode(Instruction::Halt);
        self
    }

    // =========================
    // Back-patching
    // =========================

    /// Rewrites the recorded jump and branch operands from instruction
    /// indexes to byte offsets. Must be called once the program is complete.
    pub fn calculate_branches(&mut self) -> Result<(), VmError> {
        for i in 0..self.branches.len() {
            let BranchAnchor { position, kind } = self.branches[i];
            match kind {
                Instruction::Jump => {
                    self.patch_addr(position + 1)?;
                }
                Instruction::Branch => {
                    let operands = position + 1 + OperandKind::Int.encoded_size();
                    self.patch_addr(operands)?;
                    self.patch_addr(operands + OperandKind::Addr.encoded_size())?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Replaces the instruction index stored at `at` with its byte offset.
    fn patch_addr(&mut self, at: usize) -> Result<(), VmError> {
        let field = self
            .code
            .get(at..at + 4)
            .ok_or(VmError::UnexpectedEndOfBytecode)?;
        let index = i32::from_le_bytes(field.try_into().unwrap());
        let offset = self.instruction_offset(index)? as i32;
        self.code[at..at + 4].copy_from_slice(&offset.to_le_bytes());
        Ok(())
    }

    /// Returns the byte offset of the instruction with the given index.
    ///
    /// Walks instructions from the start of the buffer, incrementing by each
    /// opcode's tabulated size.
    fn instruction_offset(&self, index: i32) -> Result<usize, VmError> {
        if index < 0 {
            return Err(VmError::BranchOutOfBounds);
        }
        let mut offset = 0usize;
        for _ in 0..index {
            let opcode = *self.code.get(offset).ok_or(VmError::BranchOutOfBounds)?;
            offset += Instruction::try_from(opcode)?.size();
            if offset + 1 > self.code.len() {
                return Err(VmError::BranchOutOfBounds);
            }
        }
        Ok(offset)
    }

    // =========================
    // Representations
    // =========================

    /// Returns an independent copy of the bytecode buffer.
    pub fn bytecode(&self) -> Vec<u8> {
        self.code.clone()
    }

    /// Returns the program size in bytes.
    pub fn size(&self) -> usize {
        self.code.len()
    }

    /// Returns the total number of instructions in the program, calculated
    /// by bytecode analysis. Should be called only after the program is
    /// constructed.
    pub fn instruction_count(&self) -> Result<usize, VmError> {
        let mut count = 0usize;
        let mut offset = 0usize;
        while offset < self.code.len() {
            offset += Instruction::try_from(self.code[offset])?.size();
            count += 1;
        }
        Ok(count)
    }

    /// Renders the program back to assembly mnemonics, one instruction per
    /// line. Jump targets appear as byte offsets once patched.
    pub fn assembler(&self) -> Result<String, VmError> {
        let mut out = String::new();
        let mut offset = 0usize;
        while offset < self.code.len() {
            let instr = Instruction::try_from(self.code[offset])?;
            offset += 1;
            out.push_str(instr.mnemonic());
            for kind in instr.operands() {
                let field = self
                    .code
                    .get(offset..offset + kind.encoded_size())
                    .ok_or(VmError::UnexpectedEndOfBytecode)?;
                match kind {
                    OperandKind::Int => {
                        let value = i32::from_le_bytes(field[1..5].try_into().unwrap());
                        let flag = if field[0] != 0 { "@" } else { "" };
                        let _ = write!(out, " {}{}", flag, value);
                    }
                    OperandKind::Byte => {
                        let flag = if field[0] != 0 { "@" } else { "" };
                        let _ = write!(out, " {}{}", flag, field[1]);
                    }
                    OperandKind::Addr => {
                        let value = i32::from_le_bytes(field.try_into().unwrap());
                        let _ = write!(out, " {}", value);
                    }
                }
                offset += kind.encoded_size();
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Packages the bytecode into an executable image starting at offset 0.
    pub fn image(&self) -> ProgramImage {
        ProgramImage {
            executable_offset: 0,
            code: self.bytecode(),
        }
    }
}

/// On-disk bytecode image.
///
/// Layout: `[u16 LE code size][u16 LE executable offset][code]`. The
/// executable offset is the byte offset of the first instruction to run.
#[derive(Debug, Clone)]
pub struct ProgramImage {
    pub executable_offset: u16,
    pub code: Vec<u8>,
}

impl ProgramImage {
    /// Size of the fixed header in bytes.
    pub const HEADER_SIZE: usize = 4;

    /// Serializes the image to its on-disk representation.
    ///
    /// The `u16` size field cannot represent programs over 65 535 bytes;
    /// those are rejected.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VmError> {
        let size = u16::try_from(self.code.len())
            .map_err(|_| VmError::ProgramTooLarge(self.code.len()))?;
        let mut out = Vec::with_capacity(Self::HEADER_SIZE + self.code.len());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&self.executable_offset.to_le_bytes());
        out.extend_from_slice(&self.code);
        Ok(out)
    }

    /// Deserializes an image, validating the header against the actual
    /// code region length.
    pub fn from_bytes(input: &[u8]) -> Result<Self, VmError> {
        if input.len() < Self::HEADER_SIZE {
            return Err(VmError::DecodeError("truncated header".to_string()));
        }
        let size = u16::from_le_bytes([input[0], input[1]]) as usize;
        let executable_offset = u16::from_le_bytes([input[2], input[3]]);
        let code = &input[Self::HEADER_SIZE..];
        if code.len() < size {
            return Err(VmError::DecodeError("truncated code region".to_string()));
        }
        if code.len() > size {
            return Err(VmError::DecodeError("trailing bytes".to_string()));
        }
        Ok(Self {
            executable_offset,
            code: code.to_vec(),
        })
    }
}
