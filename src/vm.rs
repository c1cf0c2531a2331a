//! Core virtual machine implementation.
//!
//! The VM executes bytecode using a register-based architecture. Integer
//! arithmetic uses wrapping semantics to prevent overflow panics. Program
//! output (`print`/`echo`) goes to an injectable sink, stdout by default.

use crate::errors::VmError;
use crate::isa::{ByteOp, Instruction, IntOp};
use crate::program::ProgramImage;
use crate::utils::log;
use crate::vm::registers::{Registers, Value, REG_COUNT};
use std::io::{self, Write};

pub mod registers;

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        instr = $instr:ident,
        { $( $variant:ident => $handler:ident ( $( $field:ident : $kind:ident ),* $(,)? ) ),* $(,)? }
    ) => {{
        match $instr {
            $(
                Instruction::$variant => {
                    $( let $field = exec_vm!(@read $vm, $kind)?; )*
                    $vm.$handler($( $field ),*)
                }
            )*
        }
    }};

    // Decode an integer operand (flag byte + little-endian i32)
    (@read $vm:ident, IntOp) => {{
        let bytes = $vm.read_exact(5)?;
        Ok::<IntOp, VmError>(IntOp {
            indirect: bytes[0] != 0,
            value: i32::from_le_bytes(bytes[1..5].try_into().unwrap()),
        })
    }};

    // Decode a byte operand (flag byte + payload byte)
    (@read $vm:ident, ByteOp) => {{
        let bytes = $vm.read_exact(2)?;
        Ok::<ByteOp, VmError>(ByteOp {
            indirect: bytes[0] != 0,
            value: bytes[1],
        })
    }};

    // Decode a raw jump target (little-endian i32, patched byte offset)
    (@read $vm:ident, Addr) => {{
        let bytes = $vm.read_exact(4)?;
        Ok::<i32, VmError>(i32::from_le_bytes(bytes.try_into().unwrap()))
    }};
}

/// Bytecode virtual machine.
///
/// Executes a loaded [`ProgramImage`] until `halt`, a runtime error, or the
/// instruction pointer leaves the code region.
pub struct Vm<W: Write> {
    /// Bytecode to execute.
    code: Vec<u8>,
    /// Instruction pointer (current byte position in the code).
    ip: usize,
    /// Register file.
    registers: Registers,
    /// Register read for the exit code at halt. `ret` changes it.
    return_register: usize,
    halted: bool,
    /// Program output sink.
    out: W,
}

impl Vm<io::Stdout> {
    /// Creates a VM writing program output to stdout.
    pub fn new(image: ProgramImage) -> Self {
        Self::with_output(image, io::stdout())
    }
}

impl<W: Write> Vm<W> {
    /// Creates a VM writing program output to the given sink.
    pub fn with_output(image: ProgramImage, out: W) -> Self {
        let mut registers = Registers::new(REG_COUNT);
        // the return register starts as integer zero
        let _ = registers.place(0, Value::Integer(0));
        Self {
            ip: image.executable_offset as usize,
            code: image.code,
            registers,
            return_register: 0,
            halted: false,
            out,
        }
    }

    /// Executes the loaded bytecode until `halt` or an error.
    ///
    /// Returns the process exit code: the Integer visible through the
    /// return-value register (register 0 unless `ret` selected another), or
    /// 0 when that register holds nothing.
    pub fn run(&mut self) -> Result<i32, VmError> {
        if self.code.is_empty() {
            return Err(VmError::NullBytecode);
        }
        while !self.halted {
            if self.ip >= self.code.len() {
                return Err(VmError::AddressOutOfBounds);
            }
            let opcode_offset = self.ip;
            let instr = Instruction::try_from(self.code[opcode_offset])?;
            self.ip += 1;
            if log::enabled(log::Level::Debug) {
                log::debug(&format!("vm: {:>5}: {}", opcode_offset, instr.mnemonic()));
            }
            self.exec(instr)?;
        }
        Ok(self.exit_code())
    }

    /// Reads exactly `count` operand bytes at the current instruction
    /// pointer, advancing past them.
    fn read_exact(&mut self, count: usize) -> Result<&[u8], VmError> {
        let start = self.ip;
        let end = start
            .checked_add(count)
            .ok_or(VmError::AddressOutOfBounds)?;
        let slice = self
            .code
            .get(start..end)
            .ok_or(VmError::UnexpectedEndOfBytecode)?;
        self.ip = end;
        Ok(slice)
    }

    /// Executes a single instruction.
    fn exec(&mut self, instruction: Instruction) -> Result<(), VmError> {
        exec_vm! {
            vm = self,
            instr = instruction,
            {
                Istore => op_istore(reg: IntOp, num: IntOp),
                Iadd => op_iadd(rega: IntOp, regb: IntOp, regr: IntOp),
                Isub => op_isub(rega: IntOp, regb: IntOp, regr: IntOp),
                Imul => op_imul(rega: IntOp, regb: IntOp, regr: IntOp),
                Idiv => op_idiv(rega: IntOp, regb: IntOp, regr: IntOp),
                Iinc => op_iinc(reg: IntOp),
                Idec => op_idec(reg: IntOp),
                Ilt => op_ilt(rega: IntOp, regb: IntOp, regr: IntOp),
                Ilte => op_ilte(rega: IntOp, regb: IntOp, regr: IntOp),
                Igt => op_igt(rega: IntOp, regb: IntOp, regr: IntOp),
                Igte => op_igte(rega: IntOp, regb: IntOp, regr: IntOp),
                Ieq => op_ieq(rega: IntOp, regb: IntOp, regr: IntOp),
                Bstore => op_bstore(reg: IntOp, b: ByteOp),
                Not => op_lognot(reg: IntOp),
                And => op_logand(rega: IntOp, regb: IntOp, regr: IntOp),
                Or => op_logor(rega: IntOp, regb: IntOp, regr: IntOp),
                Move => op_move(a: IntOp, b: IntOp),
                Copy => op_copy(a: IntOp, b: IntOp),
                Ref => op_ref(a: IntOp, b: IntOp),
                Swap => op_swap(a: IntOp, b: IntOp),
                Delete => op_delete(reg: IntOp),
                Print => op_print(reg: IntOp),
                Echo => op_echo(reg: IntOp),
                Jump => op_jump(addr: Addr),
                Branch => op_branch(cond: IntOp, addr_truth: Addr, addr_false: Addr),
                Ret => op_ret(reg: IntOp),
                Halt => op_halt(),
                Pass => op_pass(),
            }
        }
    }

    /// Exit code protocol: the Integer visible through the return register,
    /// or 0 when it is empty or holds another type.
    fn exit_code(&self) -> i32 {
        match self.registers.fetch(self.return_register) {
            Ok(Value::Integer(v)) => *v,
            _ => 0,
        }
    }

    /// Resolves an integer operand. Indirect operands read their payload
    /// from the Integer stored in the named register.
    fn resolve_int(&self, op: IntOp) -> Result<i32, VmError> {
        if op.indirect {
            self.registers.fetch(op.value as usize)?.as_integer()
        } else {
            Ok(op.value)
        }
    }

    /// Resolves an integer operand naming a register. Negative values wrap
    /// out of range and fail the register-file bounds checks.
    fn resolve_register(&self, op: IntOp) -> Result<usize, VmError> {
        Ok(self.resolve_int(op)? as usize)
    }

    /// Resolves a byte operand, fetching through a register when indirect.
    fn resolve_byte(&self, op: ByteOp) -> Result<u8, VmError> {
        if op.indirect {
            self.registers.fetch(op.value as usize)?.as_byte()
        } else {
            Ok(op.value)
        }
    }

    /// Shared body for arithmetic over two integer registers.
    fn integer_binop(
        &mut self,
        rega: IntOp,
        regb: IntOp,
        regr: IntOp,
        op: fn(i32, i32) -> i32,
    ) -> Result<(), VmError> {
        let rega = self.resolve_register(rega)?;
        let regb = self.resolve_register(regb)?;
        let regr = self.resolve_register(regr)?;
        let va = self.registers.fetch(rega)?.as_integer()?;
        let vb = self.registers.fetch(regb)?.as_integer()?;
        self.registers.place(regr, Value::Integer(op(va, vb)))?;
        Ok(())
    }

    /// Shared body for comparisons over two integer registers.
    fn integer_compare(
        &mut self,
        rega: IntOp,
        regb: IntOp,
        regr: IntOp,
        op: fn(i32, i32) -> bool,
    ) -> Result<(), VmError> {
        let rega = self.resolve_register(rega)?;
        let regb = self.resolve_register(regb)?;
        let regr = self.resolve_register(regr)?;
        let va = self.registers.fetch(rega)?.as_integer()?;
        let vb = self.registers.fetch(regb)?.as_integer()?;
        self.registers.place(regr, Value::Boolean(op(va, vb)))?;
        Ok(())
    }

    /// Shared body for logic over two boolean registers.
    fn boolean_binop(
        &mut self,
        rega: IntOp,
        regb: IntOp,
        regr: IntOp,
        op: fn(bool, bool) -> bool,
    ) -> Result<(), VmError> {
        let rega = self.resolve_register(rega)?;
        let regb = self.resolve_register(regb)?;
        let regr = self.resolve_register(regr)?;
        let va = self.registers.fetch(rega)?.as_boolean()?;
        let vb = self.registers.fetch(regb)?.as_boolean()?;
        self.registers.place(regr, Value::Boolean(op(va, vb)))?;
        Ok(())
    }

    fn op_istore(&mut self, reg: IntOp, num: IntOp) -> Result<(), VmError> {
        let reg = self.resolve_register(reg)?;
        let num = self.resolve_int(num)?;
        self.registers.place(reg, Value::Integer(num))?;
        Ok(())
    }

    fn op_iadd(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        self.integer_binop(rega, regb, regr, |a, b| a.wrapping_add(b))
    }

    fn op_isub(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        self.integer_binop(rega, regb, regr, |a, b| a.wrapping_sub(b))
    }

    fn op_imul(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        self.integer_binop(rega, regb, regr, |a, b| a.wrapping_mul(b))
    }

    fn op_idiv(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        let rega = self.resolve_register(rega)?;
        let regb = self.resolve_register(regb)?;
        let regr = self.resolve_register(regr)?;
        let va = self.registers.fetch(rega)?.as_integer()?;
        let vb = self.registers.fetch(regb)?.as_integer()?;
        if vb == 0 {
            return Err(VmError::DivisionByZero);
        }
        self.registers
            .place(regr, Value::Integer(va.wrapping_div(vb)))?;
        Ok(())
    }

    fn op_iinc(&mut self, reg: IntOp) -> Result<(), VmError> {
        let reg = self.resolve_register(reg)?;
        let value = self.registers.fetch_mut(reg)?.as_integer_mut()?;
        *value = value.wrapping_add(1);
        Ok(())
    }

    fn op_idec(&mut self, reg: IntOp) -> Result<(), VmError> {
        let reg = self.resolve_register(reg)?;
        let value = self.registers.fetch_mut(reg)?.as_integer_mut()?;
        *value = value.wrapping_sub(1);
        Ok(())
    }

    fn op_ilt(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        self.integer_compare(rega, regb, regr, |a, b| a < b)
    }

    fn op_ilte(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        self.integer_compare(rega, regb, regr, |a, b| a <= b)
    }

    fn op_igt(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        self.integer_compare(rega, regb, regr, |a, b| a > b)
    }

    fn op_igte(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        self.integer_compare(rega, regb, regr, |a, b| a >= b)
    }

    fn op_ieq(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        self.integer_compare(rega, regb, regr, |a, b| a == b)
    }

    fn op_bstore(&mut self, reg: IntOp, b: ByteOp) -> Result<(), VmError> {
        let reg = self.resolve_register(reg)?;
        let b = self.resolve_byte(b)?;
        self.registers.place(reg, Value::Byte(b))?;
        Ok(())
    }

    fn op_lognot(&mut self, reg: IntOp) -> Result<(), VmError> {
        let reg = self.resolve_register(reg)?;
        let value = self.registers.fetch_mut(reg)?.as_boolean_mut()?;
        *value = !*value;
        Ok(())
    }

    fn op_logand(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        self.boolean_binop(rega, regb, regr, |a, b| a && b)
    }

    fn op_logor(&mut self, rega: IntOp, regb: IntOp, regr: IntOp) -> Result<(), VmError> {
        self.boolean_binop(rega, regb, regr, |a, b| a || b)
    }

    fn op_move(&mut self, a: IntOp, b: IntOp) -> Result<(), VmError> {
        let a = self.resolve_register(a)?;
        let b = self.resolve_register(b)?;
        self.registers.move_to(a, b)
    }

    fn op_copy(&mut self, a: IntOp, b: IntOp) -> Result<(), VmError> {
        let a = self.resolve_register(a)?;
        let b = self.resolve_register(b)?;
        self.registers.copy_to(a, b)
    }

    fn op_ref(&mut self, a: IntOp, b: IntOp) -> Result<(), VmError> {
        let a = self.resolve_register(a)?;
        let b = self.resolve_register(b)?;
        self.registers.make_ref(a, b)
    }

    fn op_swap(&mut self, a: IntOp, b: IntOp) -> Result<(), VmError> {
        let a = self.resolve_register(a)?;
        let b = self.resolve_register(b)?;
        self.registers.swap(a, b)
    }

    fn op_delete(&mut self, reg: IntOp) -> Result<(), VmError> {
        let reg = self.resolve_register(reg)?;
        self.registers.delete(reg)
    }

    fn op_print(&mut self, reg: IntOp) -> Result<(), VmError> {
        let reg = self.resolve_register(reg)?;
        let value = self.registers.fetch(reg)?;
        writeln!(self.out, "{}", value).map_err(|e| VmError::OutputError(e.to_string()))?;
        Ok(())
    }

    fn op_echo(&mut self, reg: IntOp) -> Result<(), VmError> {
        let reg = self.resolve_register(reg)?;
        let value = self.registers.fetch(reg)?;
        write!(self.out, "{}", value).map_err(|e| VmError::OutputError(e.to_string()))?;
        self.out
            .flush()
            .map_err(|e| VmError::OutputError(e.to_string()))?;
        Ok(())
    }

    fn op_jump(&mut self, addr: i32) -> Result<(), VmError> {
        self.ip = addr as usize;
        Ok(())
    }

    fn op_branch(&mut self, cond: IntOp, addr_truth: i32, addr_false: i32) -> Result<(), VmError> {
        let cond = self.resolve_register(cond)?;
        let taken = self.registers.fetch(cond)?.as_boolean()?;
        self.ip = if taken { addr_truth } else { addr_false } as usize;
        Ok(())
    }

    fn op_ret(&mut self, reg: IntOp) -> Result<(), VmError> {
        let reg = self.resolve_register(reg)?;
        // the register may still be empty here; only its index is checked
        if reg >= REG_COUNT {
            return Err(VmError::RegisterReadOutOfBounds(reg));
        }
        self.return_register = reg;
        Ok(())
    }

    fn op_halt(&mut self) -> Result<(), VmError> {
        self.halted = true;
        Ok(())
    }

    fn op_pass(&mut self) -> Result<(), VmError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_source;

    fn run_vm(source: &str) -> (Vm<Vec<u8>>, i32) {
        let program = assemble_source(source).expect("assembly failed");
        let mut vm = Vm::with_output(program.image(), Vec::new());
        let code = vm.run().expect("vm run failed");
        (vm, code)
    }

    fn run_and_get_output(source: &str) -> String {
        let (vm, _) = run_vm(source);
        String::from_utf8(vm.out).expect("output is valid utf8")
    }

    fn run_and_get_exit_code(source: &str) -> i32 {
        run_vm(source).1
    }

    fn run_expect_err(source: &str) -> VmError {
        let program = assemble_source(source).expect("assembly failed");
        let mut vm = Vm::with_output(program.image(), Vec::new());
        vm.run().expect_err("expected a runtime error")
    }

    fn raw_vm(code: Vec<u8>) -> Vm<Vec<u8>> {
        let image = ProgramImage {
            executable_offset: 0,
            code,
        };
        Vm::with_output(image, Vec::new())
    }

    // ==================== Stores and printing ====================

    #[test]
    fn istore_print() {
        assert_eq!(run_and_get_output("istore 1 42\nprint 1\nhalt"), "42\n");
        assert_eq!(run_and_get_exit_code("istore 1 42\nprint 1\nhalt"), 0);
    }

    #[test]
    fn istore_negative() {
        assert_eq!(run_and_get_output("istore 1 -7\nprint 1\nhalt"), "-7\n");
    }

    #[test]
    fn bstore_echo() {
        assert_eq!(
            run_and_get_output("bstore 1 72\necho 1\nbstore 1 105\necho 1\nhalt"),
            "Hi"
        );
    }

    #[test]
    fn print_boolean() {
        assert_eq!(
            run_and_get_output("istore 1 1\nistore 2 2\nilt 1 2 3\nprint 3\nhalt"),
            "true\n"
        );
    }

    // ==================== Arithmetic ====================

    #[test]
    fn iadd() {
        let source = "istore 1 2\nistore 2 3\niadd 1 2 3\nprint 3\nhalt";
        assert_eq!(run_and_get_output(source), "5\n");
    }

    #[test]
    fn isub() {
        let source = "istore 1 50\nistore 2 8\nisub 1 2 3\nprint 3\nhalt";
        assert_eq!(run_and_get_output(source), "42\n");
    }

    #[test]
    fn imul() {
        let source = "istore 1 6\nistore 2 7\nimul 1 2 3\nprint 3\nhalt";
        assert_eq!(run_and_get_output(source), "42\n");
    }

    #[test]
    fn idiv() {
        let source = "istore 1 84\nistore 2 2\nidiv 1 2 3\nprint 3\nhalt";
        assert_eq!(run_and_get_output(source), "42\n");
    }

    #[test]
    fn idiv_by_zero() {
        let source = "istore 1 1\nistore 2 0\nidiv 1 2 3\nhalt";
        assert!(matches!(run_expect_err(source), VmError::DivisionByZero));
    }

    #[test]
    fn iadd_wrapping() {
        let source = "istore 1 2147483647\nistore 2 1\niadd 1 2 3\nprint 3\nhalt";
        assert_eq!(run_and_get_output(source), format!("{}\n", i32::MIN));
    }

    #[test]
    fn iinc_idec_mutate_in_place() {
        assert_eq!(
            run_and_get_output("istore 1 5\niinc 1\niinc 1\nprint 1\nhalt"),
            "7\n"
        );
        assert_eq!(
            run_and_get_output("istore 1 5\nidec 1\nprint 1\nhalt"),
            "4\n"
        );
    }

    // ==================== Comparisons and logic ====================

    #[test]
    fn comparisons_produce_booleans() {
        let source = "istore 1 3\nistore 2 5\nilte 1 2 3\nprint 3\nhalt";
        assert_eq!(run_and_get_output(source), "true\n");
        let source = "istore 1 3\nistore 2 5\nigte 1 2 3\nprint 3\nhalt";
        assert_eq!(run_and_get_output(source), "false\n");
        let source = "istore 1 5\nistore 2 5\nieq 1 2 3\nprint 3\nhalt";
        assert_eq!(run_and_get_output(source), "true\n");
        let source = "istore 1 6\nistore 2 5\nigt 1 2 3\nprint 3\nhalt";
        assert_eq!(run_and_get_output(source), "true\n");
    }

    #[test]
    fn lognot_flips_in_place() {
        let source = "istore 1 1\nistore 2 2\nilt 1 2 3\nnot 3\nprint 3\nhalt";
        assert_eq!(run_and_get_output(source), "false\n");
    }

    #[test]
    fn logand_logor() {
        let source = "\
istore 1 1
istore 2 2
ilt 1 2 3
igt 1 2 4
and 3 4 5
or 3 4 6
print 5
print 6
halt";
        assert_eq!(run_and_get_output(source), "false\ntrue\n");
    }

    #[test]
    fn not_on_integer_is_type_mismatch() {
        let source = "istore 1 1\nnot 1\nhalt";
        assert!(matches!(
            run_expect_err(source),
            VmError::TypeMismatch {
                expected: "Boolean",
                actual: "Integer"
            }
        ));
    }

    // ==================== References ====================

    #[test]
    fn writing_through_reference_updates_owner() {
        let source = "istore 1 10\nref 2 1\nistore 2 99\nprint 1\nhalt";
        assert_eq!(run_and_get_output(source), "99\n");
    }

    #[test]
    fn reference_reads_owner_value() {
        let source = "istore 1 2\nref 2 1\nprint 2\nistore 2 16\nprint 1\nhalt";
        assert_eq!(run_and_get_output(source), "2\n16\n");
    }

    #[test]
    fn ref_after_istore_observes_value() {
        let source = "istore 1 1\nref 2 1\nistore 2 7\nprint 1\nprint 2\nhalt";
        assert_eq!(run_and_get_output(source), "7\n7\n");
    }

    #[test]
    fn iinc_through_reference() {
        let source = "istore 1 5\nref 2 1\niinc 2\nprint 1\nhalt";
        assert_eq!(run_and_get_output(source), "6\n");
    }

    // ==================== Register manipulation ====================

    #[test]
    fn move_clears_source() {
        let source = "istore 1 1\nmove 1 2\nprint 2\nhalt";
        assert_eq!(run_and_get_output(source), "1\n");
        let source = "istore 1 1\nmove 1 2\nprint 1\nhalt";
        assert!(matches!(run_expect_err(source), VmError::NullRegister(1)));
    }

    #[test]
    fn copy_is_independent() {
        let source = "istore 1 1\ncopy 1 2\niinc 2\nprint 1\nprint 2\nhalt";
        assert_eq!(run_and_get_output(source), "1\n2\n");
    }

    #[test]
    fn swap_exchanges_registers() {
        let source = "istore 1 1\nistore 2 0\nswap 1 2\nprint 1\nprint 2\nhalt";
        assert_eq!(run_and_get_output(source), "0\n1\n");
    }

    #[test]
    fn delete_empties_register() {
        let source = "istore 1 1\ndelete 1\nprint 1\nhalt";
        assert!(matches!(run_expect_err(source), VmError::NullRegister(1)));
    }

    #[test]
    fn delete_with_alias_keeps_value_reachable() {
        let source = "istore 1 1\nref 2 1\ndelete 1\nprint 2\nhalt";
        assert_eq!(run_and_get_output(source), "1\n");
    }

    // ==================== Indirect operands ====================

    #[test]
    fn indirect_register_operands() {
        // register 2 holds 1, so @2 addresses register 1
        let source = "\
istore 1 16
istore 2 1
print @2
print 2
istore 4 @2
print 4
istore 5 @1
print 5
halt";
        assert_eq!(run_and_get_output(source), "16\n1\n1\n16\n");
    }

    // ==================== Control flow ====================

    #[test]
    fn countdown_loop() {
        let source = "\
istore 1 3
.mark: loop
idec 1
ilt 1 0 2
branch 2 :end :loop
.mark: end
print 1
halt";
        let (vm, code) = run_vm(source);
        assert_eq!(String::from_utf8(vm.out).unwrap(), "-1\n");
        assert_eq!(code, 0);
    }

    #[test]
    fn branch_short_form_falls_through() {
        let source = "\
istore 1 5
istore 2 9
ilt 1 2 3
not 3
branch 3 :end
print 1
.mark: end
halt";
        assert_eq!(run_and_get_output(source), "5\n");
    }

    #[test]
    fn jump_skips_instructions() {
        let source = "jump :end\nistore 1 1\n.mark: end\nhalt";
        let (_, code) = run_vm(source);
        assert_eq!(code, 0);
    }

    #[test]
    fn pass_is_noop() {
        assert_eq!(run_and_get_output("pass\nistore 1 9\nprint 1\nhalt"), "9\n");
    }

    // ==================== Exit codes ====================

    #[test]
    fn exit_code_from_register_zero() {
        assert_eq!(run_and_get_exit_code("istore 0 7\nhalt"), 7);
        assert_eq!(run_and_get_output("istore 0 7\nhalt"), "");
    }

    #[test]
    fn exit_code_defaults_to_zero() {
        assert_eq!(run_and_get_exit_code("halt"), 0);
    }

    #[test]
    fn ret_selects_return_register() {
        assert_eq!(run_and_get_exit_code("istore 3 4\nret 3\nhalt"), 4);
    }

    #[test]
    fn exit_code_zero_when_return_register_emptied() {
        assert_eq!(run_and_get_exit_code("istore 0 7\nmove 0 1\nhalt"), 0);
    }

    // ==================== Error cases ====================

    #[test]
    fn read_from_null_register() {
        assert!(matches!(
            run_expect_err("print 5\nhalt"),
            VmError::NullRegister(5)
        ));
    }

    #[test]
    fn register_out_of_bounds_read() {
        let source = format!("istore 1 1\niadd {0} {0} 2\nhalt", REG_COUNT);
        assert!(matches!(
            run_expect_err(&source),
            VmError::RegisterReadOutOfBounds(i) if i == REG_COUNT
        ));
    }

    #[test]
    fn register_out_of_bounds_write() {
        let source = format!("istore {} 1\nhalt", REG_COUNT);
        assert!(matches!(
            run_expect_err(&source),
            VmError::RegisterWriteOutOfBounds(i) if i == REG_COUNT
        ));
    }

    #[test]
    fn ret_out_of_bounds_register() {
        let source = format!("ret {}\nhalt", REG_COUNT);
        assert!(matches!(
            run_expect_err(&source),
            VmError::RegisterReadOutOfBounds(i) if i == REG_COUNT
        ));
    }

    #[test]
    fn unknown_opcode() {
        let mut vm = raw_vm(vec![0xFF]);
        assert!(matches!(vm.run(), Err(VmError::UnknownOpcode(0xFF))));
    }

    #[test]
    fn truncated_operand() {
        let mut vm = raw_vm(vec![Instruction::Istore as u8, 0x00]);
        assert!(matches!(vm.run(), Err(VmError::UnexpectedEndOfBytecode)));
    }

    #[test]
    fn null_bytecode() {
        let mut vm = raw_vm(Vec::new());
        assert!(matches!(vm.run(), Err(VmError::NullBytecode)));
    }

    #[test]
    fn running_off_the_end() {
        // istore with no halt: the instruction pointer leaves the region
        let mut vm = raw_vm({
            let mut program = crate::program::Program::new(11);
            program.istore(IntOp::direct(1), IntOp::direct(1));
            program.bytecode()
        });
        assert!(matches!(vm.run(), Err(VmError::AddressOutOfBounds)));
    }

    #[test]
    fn branch_condition_must_be_boolean() {
        let source = "istore 1 1\nbranch 1 :end\n.mark: end\nhalt";
        assert!(matches!(
            run_expect_err(source),
            VmError::TypeMismatch {
                expected: "Boolean",
                actual: "Integer"
            }
        ));
    }
}
