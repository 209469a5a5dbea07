//! Shared bytecode decoding, used by both the VM's fetch loop and the
//! disassembler. Mirrors the teacher crate's `lamacore::decoder` split: one
//! `decode` routine, two consumers.

use std::fmt::{Display, Formatter};

use crate::bytecode::{Cursor, Instruction, Opcode};

#[derive(Debug, PartialEq, Eq)]
pub enum DecoderError {
    InvalidOpcode(u8),
    TruncatedImmediate { ip: usize },
}

impl Display for DecoderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DecoderError::InvalidOpcode(byte) => write!(f, "invalid opcode: {:#x}", byte),
            DecoderError::TruncatedImmediate { ip } => {
                write!(f, "truncated immediate operand at ip {}", ip)
            }
        }
    }
}

impl std::error::Error for DecoderError {}

/// Decode one instruction starting at `cursor.ip`, advancing it past the
/// opcode byte and any immediates it consumes.
pub fn decode(cursor: &mut Cursor<'_>) -> Result<Instruction, DecoderError> {
    let start = cursor.ip;
    let byte: u8 = cursor
        .next()
        .ok_or(DecoderError::TruncatedImmediate { ip: start })?;
    let opcode = Opcode::try_from(byte).map_err(DecoderError::InvalidOpcode)?;

    let imm = |cursor: &mut Cursor<'_>| {
        cursor
            .next::<i32>()
            .ok_or(DecoderError::TruncatedImmediate { ip: start })
    };

    Ok(match opcode {
        Opcode::Push => Instruction::Push(imm(cursor)?),
        Opcode::Pop => Instruction::Pop,
        Opcode::Add => Instruction::Add,
        Opcode::Sub => Instruction::Sub,
        Opcode::Mul => Instruction::Mul,
        Opcode::Div => Instruction::Div,
        Opcode::Mod => Instruction::Mod,
        Opcode::Or => Instruction::Or,
        Opcode::And => Instruction::And,
        Opcode::Lt => Instruction::Lt,
        Opcode::Lte => Instruction::Lte,
        Opcode::Gt => Instruction::Gt,
        Opcode::Gte => Instruction::Gte,
        Opcode::Equ => Instruction::Equ,
        Opcode::Nequ => Instruction::Nequ,
        Opcode::Print => Instruction::Print,
        Opcode::Set => Instruction::Set(imm(cursor)?),
        Opcode::Get => Instruction::Get(imm(cursor)?),
        Opcode::Read => Instruction::Read,
        Opcode::Goto => Instruction::Goto(imm(cursor)?),
        Opcode::Gotoz => Instruction::Gotoz(imm(cursor)?),
        Opcode::Gotonz => Instruction::Gotonz(imm(cursor)?),
        Opcode::Call => Instruction::Call {
            nargs: imm(cursor)?,
            proc_id: imm(cursor)?,
        },
        Opcode::Return => Instruction::Return,
        Opcode::ReturnValue => Instruction::ReturnValue,
        Opcode::Callf => Instruction::Callf(imm(cursor)?),
        Opcode::Getlocal => Instruction::Getlocal(imm(cursor)?),
        Opcode::Setlocal => Instruction::Setlocal(imm(cursor)?),
        Opcode::MakeArray => Instruction::MakeArray,
        Opcode::Setindex => Instruction::Setindex,
        Opcode::Getindex => Instruction::Getindex,
        Opcode::Halt => Instruction::Halt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Chunk;

    #[test]
    fn round_trips_every_immediate_shape() {
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::Push(7));
        chunk.emit(Instruction::Call {
            nargs: 2,
            proc_id: 5,
        });
        chunk.emit(Instruction::Halt);

        let mut cursor = Cursor::new(&chunk.code, 0);
        assert_eq!(decode(&mut cursor).unwrap(), Instruction::Push(7));
        assert_eq!(
            decode(&mut cursor).unwrap(),
            Instruction::Call {
                nargs: 2,
                proc_id: 5
            }
        );
        assert_eq!(decode(&mut cursor).unwrap(), Instruction::Halt);
    }

    #[test]
    fn rejects_invalid_opcode() {
        let mut cursor = Cursor::new(&[0xff], 0);
        assert_eq!(decode(&mut cursor), Err(DecoderError::InvalidOpcode(0xff)));
    }
}
