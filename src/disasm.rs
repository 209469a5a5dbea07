//! Disassembler: pretty-prints a compiled code buffer one instruction per
//! line, pc-prefixed. Built on the same `decoder::decode` the VM's fetch
//! loop uses, so the listing can never diverge from what actually runs.

use std::fmt::{Display, Formatter};

use crate::bytecode::{Cursor, Instruction};
use crate::decoder::{self, DecoderError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Listed {
    pub pc: usize,
    pub instr: Instruction,
}

/// A fully decoded listing of a code buffer, in program order.
#[derive(Debug, Default)]
pub struct Disassembly {
    pub lines: Vec<Listed>,
}

/// Decode `code` end to end. Stops at the first `Instruction::Halt` seen,
/// since everything past it (if anything) is unreachable padding, not
/// because trailing bytes are assumed garbage.
pub fn disassemble(code: &[u8]) -> Result<Disassembly, DecoderError> {
    let mut cursor = Cursor::new(code, 0);
    let mut lines = Vec::new();
    loop {
        let pc = cursor.ip;
        if pc >= code.len() {
            break;
        }
        let instr = decoder::decode(&mut cursor)?;
        let halted = matches!(instr, Instruction::Halt);
        lines.push(Listed { pc, instr });
        if halted {
            break;
        }
    }
    Ok(Disassembly { lines })
}

fn mnemonic(instr: &Instruction) -> String {
    match instr {
        Instruction::Push(n) => format!("push\t{n}"),
        Instruction::Pop => "pop".to_string(),
        Instruction::Add => "add".to_string(),
        Instruction::Sub => "sub".to_string(),
        Instruction::Mul => "mul".to_string(),
        Instruction::Div => "div".to_string(),
        Instruction::Mod => "mod".to_string(),
        Instruction::Or => "or".to_string(),
        Instruction::And => "and".to_string(),
        Instruction::Lt => "lt".to_string(),
        Instruction::Lte => "lte".to_string(),
        Instruction::Gt => "gt".to_string(),
        Instruction::Gte => "gte".to_string(),
        Instruction::Equ => "equ".to_string(),
        Instruction::Nequ => "nequ".to_string(),
        Instruction::Print => "print".to_string(),
        Instruction::Set(idx) => format!("set\t{idx}"),
        Instruction::Get(idx) => format!("get\t{idx}"),
        Instruction::Read => "read".to_string(),
        Instruction::Goto(target) => format!("goto\t{target}"),
        Instruction::Gotoz(target) => format!("gotoz\t{target}"),
        Instruction::Gotonz(target) => format!("gotonz\t{target}"),
        Instruction::Call { nargs, proc_id } => format!("call\t{proc_id}, {nargs}"),
        Instruction::Return => "return".to_string(),
        Instruction::ReturnValue => "returnv".to_string(),
        Instruction::Callf(slot) => format!("callf\t{slot}"),
        Instruction::Getlocal(idx) => format!("getlocal\t{idx}"),
        Instruction::Setlocal(idx) => format!("setlocal\t{idx}"),
        Instruction::MakeArray => "makearray".to_string(),
        Instruction::Setindex => "setindex".to_string(),
        Instruction::Getindex => "getindex".to_string(),
        Instruction::Halt => "halt".to_string(),
    }
}

impl Display for Disassembly {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for line in &self.lines {
            writeln!(f, "{:>6}:\t{}", line.pc, mnemonic(&line.instr))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Chunk;

    #[test]
    fn disassembles_push_add_halt() {
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::Push(2));
        chunk.emit(Instruction::Push(3));
        chunk.emit(Instruction::Add);
        chunk.emit(Instruction::Halt);

        let listing = disassemble(&chunk.code).unwrap();
        assert_eq!(listing.lines.len(), 4);
        assert_eq!(listing.lines[0].instr, Instruction::Push(2));
        assert_eq!(listing.lines[3].instr, Instruction::Halt);

        let text = listing.to_string();
        assert!(text.contains("push\t2"));
        assert!(text.contains("halt"));
    }

    #[test]
    fn stops_at_first_halt_ignoring_trailing_bytes() {
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::Halt);
        chunk.emit(Instruction::Push(9));

        let listing = disassemble(&chunk.code).unwrap();
        assert_eq!(listing.lines.len(), 1);
    }

    #[test]
    fn rejects_invalid_opcode() {
        let err = disassemble(&[0xff]).unwrap_err();
        assert_eq!(err, DecoderError::InvalidOpcode(0xff));
    }
}
