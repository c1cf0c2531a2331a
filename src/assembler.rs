//! Assembly language parser and bytecode compiler.
//!
//! Converts human-readable assembly source into executable bytecode through
//! the [`Program`] builder.
//!
//! # Syntax
//!
//! ```text
//! instruction operand1 operand2 ...   ; comment
//! .mark: <name>                       ; names the next instruction's index
//! .name: <register> <alias>           ; names a register
//! ```
//!
//! - Instructions are lowercase (e.g. `istore`, `iadd`)
//! - Operands are decimal integers; `@` prefixes an indirect operand
//! - Register aliases come from `.name:` directives, optionally with `@`
//! - Jump targets are `:mark` references or bare instruction indexes
//! - Comments start with `;` and run to the end of the line

use crate::errors::VmError;
use crate::isa::{ByteOp, Instruction, IntOp};
use crate::program::Program;
use crate::utils::log;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: char = ';';
const MARK_DIRECTIVE: &str = ".mark:";
const NAME_DIRECTIVE: &str = ".name:";

/// Source line surviving pre-processing, with its 1-based line number.
#[derive(Debug, Clone)]
struct Line {
    number: usize,
    text: String,
}

/// Wraps an error with the line it occurred on.
fn at_line(number: usize, err: VmError) -> VmError {
    VmError::AssemblyError {
        line: number,
        source: err.to_string(),
    }
}

/// Clears code from blank lines and comments.
fn strip_lines(source: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    for (i, raw) in source.lines().enumerate() {
        let text = raw.split(COMMENT_CHAR).next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }
        lines.push(Line {
            number: i + 1,
            text: text.to_string(),
        });
    }
    lines
}

fn is_directive(text: &str) -> bool {
    text.starts_with(MARK_DIRECTIVE) || text.starts_with(NAME_DIRECTIVE)
}

fn first_token(text: &str) -> &str {
    text.split_whitespace().next().unwrap_or("")
}

fn is_number(token: &str) -> bool {
    let digits = token.strip_prefix('-').unwrap_or(token);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Sizing pass: sums the encoded size of every instruction line so the
/// program buffer can be allocated up front.
fn count_bytes(lines: &[Line]) -> Result<u16, VmError> {
    let mut bytes = 0usize;
    for line in lines {
        if is_directive(&line.text) {
            continue;
        }
        let mnemonic = first_token(&line.text);
        let instr =
            Instruction::from_mnemonic(mnemonic).map_err(|e| at_line(line.number, e))?;
        if instr.size() == 0 {
            return Err(at_line(
                line.number,
                VmError::ZeroSizeInstruction(mnemonic.to_string()),
            ));
        }
        bytes += instr.size();
    }
    u16::try_from(bytes).map_err(|_| VmError::ProgramTooLarge(bytes))
}

/// Mark pass: binds each `.mark: <name>` to the index of the next real
/// instruction. `.name:` lines do not advance the instruction counter.
fn gather_marks(lines: &[Line]) -> Result<HashMap<String, i32>, VmError> {
    let mut marks = HashMap::new();
    let mut instruction = 0i32;
    for line in lines {
        if line.text.starts_with(NAME_DIRECTIVE) {
            continue;
        }
        let Some(rest) = line.text.strip_prefix(MARK_DIRECTIVE) else {
            instruction += 1;
            continue;
        };
        let mark = first_token(rest);
        if mark.is_empty() {
            return Err(at_line(
                line.number,
                VmError::MalformedDirective(line.text.clone()),
            ));
        }
        if marks.insert(mark.to_string(), instruction).is_some() {
            return Err(at_line(line.number, VmError::DuplicateMark(mark.to_string())));
        }
        log::debug(&format!("asm: marker `{}` -> {}", mark, instruction));
    }
    Ok(marks)
}

/// Name pass: collects `.name: <register> <alias>` register aliases.
fn gather_names(lines: &[Line]) -> Result<HashMap<String, i32>, VmError> {
    let mut names = HashMap::new();
    for line in lines {
        let Some(rest) = line.text.strip_prefix(NAME_DIRECTIVE) else {
            continue;
        };
        let mut tokens = rest.split_whitespace();
        let (Some(reg), Some(name)) = (tokens.next(), tokens.next()) else {
            return Err(at_line(
                line.number,
                VmError::MalformedDirective(line.text.clone()),
            ));
        };
        let reg: i32 = reg
            .parse()
            .map_err(|_| at_line(line.number, VmError::InvalidNameRegister(reg.to_string())))?;
        names.insert(name.to_string(), reg);
        log::debug(&format!("asm: name `{}` -> {}", name, reg));
    }
    Ok(names)
}

/// Resolves a register token to numeric form, looking aliases up in the
/// names table. The output keeps any leading `@` and is consumable by
/// `int_operand`/`byte_operand`.
fn resolve_register(token: &str, names: &HashMap<String, i32>) -> Result<String, VmError> {
    let (prefix, body) = match token.strip_prefix('@') {
        Some(rest) => ("@", rest),
        None => ("", token),
    };
    if is_number(body) {
        return Ok(token.to_string());
    }
    match names.get(body) {
        Some(reg) => Ok(format!("{}{}", prefix, reg)),
        None => Err(VmError::UndeclaredName(body.to_string())),
    }
}

fn split_indirect(token: &str) -> (bool, &str) {
    match token.strip_prefix('@') {
        Some(rest) => (true, rest),
        None => (false, token),
    }
}

/// Parses an integer operand token; a leading `@` marks it indirect.
fn int_operand(token: &str) -> Result<IntOp, VmError> {
    let (indirect, body) = split_indirect(token);
    let value = body
        .parse()
        .map_err(|_| VmError::InvalidOperand(token.to_string()))?;
    Ok(IntOp { indirect, value })
}

/// Parses a byte operand token; a leading `@` marks it indirect.
fn byte_operand(token: &str) -> Result<ByteOp, VmError> {
    let (indirect, body) = split_indirect(token);
    let value = body
        .parse()
        .map_err(|_| VmError::InvalidOperand(token.to_string()))?;
    Ok(ByteOp { indirect, value })
}

/// Resolves a jump target: a bare instruction index, or a `:mark` reference
/// looked up in the marks table.
fn resolve_jump(token: &str, marks: &HashMap<String, i32>) -> Result<i32, VmError> {
    if is_number(token) {
        return token
            .parse()
            .map_err(|_| VmError::InvalidOperand(token.to_string()));
    }
    let Some(mark) = token.strip_prefix(':') else {
        return Err(VmError::InvalidJumpTarget(token.to_string()));
    };
    marks
        .get(mark)
        .copied()
        .ok_or_else(|| VmError::UnknownMark(mark.to_string()))
}

/// Resolves a register token all the way to an operand.
fn reg_op(token: &str, names: &HashMap<String, i32>) -> Result<IntOp, VmError> {
    int_operand(&resolve_register(token, names)?)
}

/// Checks the operand count and destructures the tail into an array.
fn expect_operands<'a, const N: usize>(
    mnemonic: &str,
    operands: &[&'a str],
) -> Result<[&'a str; N], VmError> {
    operands
        .try_into()
        .map_err(|_| VmError::OperandCountMismatch {
            instruction: mnemonic.to_string(),
            expected: N,
            actual: operands.len(),
        })
}

/// Encoder methods for instructions taking three register operands.
fn three_intop_method(
    mnemonic: &str,
) -> Option<fn(&mut Program, IntOp, IntOp, IntOp) -> &mut Program> {
    Some(match mnemonic {
        "iadd" => Program::iadd,
        "isub" => Program::isub,
        "imul" => Program::imul,
        "idiv" => Program::idiv,
        "ilt" => Program::ilt,
        "ilte" => Program::ilte,
        "igt" => Program::igt,
        "igte" => Program::igte,
        "ieq" => Program::ieq,
        "and" => Program::logand,
        "or" => Program::logor,
        _ => return None,
    })
}

/// Encoder methods for instructions taking a single register operand.
fn one_intop_method(mnemonic: &str) -> Option<fn(&mut Program, IntOp) -> &mut Program> {
    Some(match mnemonic {
        "iinc" => Program::iinc,
        "idec" => Program::idec,
        "not" => Program::lognot,
        "delete" => Program::delete,
        "print" => Program::print,
        "echo" => Program::echo,
        "ret" => Program::ret,
        _ => return None,
    })
}

/// Encoder methods for instructions taking two register operands.
fn two_intop_method(mnemonic: &str) -> Option<fn(&mut Program, IntOp, IntOp) -> &mut Program> {
    Some(match mnemonic {
        "move" => Program::move_,
        "copy" => Program::copy,
        "ref" => Program::ref_,
        "swap" => Program::swap,
        _ => return None,
    })
}

/// Emits a single instruction line through the encoder.
fn emit_line(
    program: &mut Program,
    text: &str,
    instruction: i32,
    marks: &HashMap<String, i32>,
    names: &HashMap<String, i32>,
) -> Result<(), VmError> {
    let mut tokens = text.split_whitespace();
    let mnemonic = tokens.next().unwrap_or("");
    let operands: Vec<&str> = tokens.collect();

    if let Some(method) = three_intop_method(mnemonic) {
        let [a, b, r] = expect_operands(mnemonic, &operands)?;
        method(
            program,
            reg_op(a, names)?,
            reg_op(b, names)?,
            reg_op(r, names)?,
        );
        return Ok(());
    }
    if let Some(method) = one_intop_method(mnemonic) {
        let [reg] = expect_operands(mnemonic, &operands)?;
        method(program, reg_op(reg, names)?);
        return Ok(());
    }
    if let Some(method) = two_intop_method(mnemonic) {
        let [a, b] = expect_operands(mnemonic, &operands)?;
        method(program, reg_op(a, names)?, reg_op(b, names)?);
        return Ok(());
    }

    match mnemonic {
        "istore" => {
            let [reg, num] = expect_operands(mnemonic, &operands)?;
            program.istore(reg_op(reg, names)?, reg_op(num, names)?);
        }
        "bstore" => {
            let [reg, b] = expect_operands(mnemonic, &operands)?;
            program.bstore(
                reg_op(reg, names)?,
                byte_operand(&resolve_register(b, names)?)?,
            );
        }
        "jump" => {
            let [target] = expect_operands(mnemonic, &operands)?;
            program.jump(resolve_jump(target, marks)?);
        }
        "branch" => {
            // Two-operand form falls through to the next instruction when
            // the condition is false.
            let (cond, if_true, if_false) = match operands.as_slice() {
                [cond, t] => (*cond, *t, None),
                [cond, t, f] => (*cond, *t, Some(*f)),
                _ => {
                    return Err(VmError::OperandCountMismatch {
                        instruction: mnemonic.to_string(),
                        expected: 3,
                        actual: operands.len(),
                    });
                }
            };
            let addr_truth = resolve_jump(if_true, marks)?;
            let addr_false = match if_false {
                Some(token) => resolve_jump(token, marks)?,
                None => instruction + 1,
            };
            program.branch(reg_op(cond, names)?, addr_truth, addr_false);
        }
        "pass" => {
            let [] = expect_operands::<0>(mnemonic, &operands)?;
            program.pass();
        }
        "halt" => {
            let [] = expect_operands::<0>(mnemonic, &operands)?;
            program.halt();
        }
        other => return Err(VmError::UnknownInstruction(other.to_string())),
    }
    Ok(())
}

/// Emit pass: walks instruction lines, resolving operands against the marks
/// and names tables and feeding the encoder.
fn assemble(
    program: &mut Program,
    lines: &[Line],
    marks: &HashMap<String, i32>,
    names: &HashMap<String, i32>,
) -> Result<(), VmError> {
    let mut instruction = 0i32;
    for line in lines {
        if is_directive(&line.text) {
            continue;
        }
        log::debug(&format!(
            "asm: assemble +{}: {}",
            instruction,
            first_token(&line.text)
        ));
        emit_line(program, &line.text, instruction, marks, names)
            .map_err(|e| at_line(line.number, e))?;
        instruction += 1;
    }
    Ok(())
}

/// Assembles a full source string into a back-patched program.
///
/// Runs the sizing pass, gathers marks and names, emits instructions through
/// the encoder, then rewrites jump and branch operands as byte offsets.
pub fn assemble_source(source: &str) -> Result<Program, VmError> {
    let lines = strip_lines(source);
    let bytes = count_bytes(&lines)?;
    log::debug(&format!("asm: total required bytes: {}", bytes));
    let marks = gather_marks(&lines)?;
    let names = gather_names(&lines)?;
    let mut program = Program::new(bytes as usize);
    assemble(&mut program, &lines, &marks, &names)?;
    program.calculate_branches()?;
    Ok(program)
}

/// Convenience: assemble directly from a file path.
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Program, VmError> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|e| VmError::IoError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    assemble_source(&source)
}
