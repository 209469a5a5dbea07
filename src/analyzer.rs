//! Static opcode-frequency analysis over a disassembled code buffer.
//!
//! Slimmed down from the teacher crate's `analyzer.rs`: no control-flow
//! graph, no `.dot` export, no bytecode-file structural verification —
//! this language has no closures, s-expressions, or separately compiled
//! objects for a CFG to be built over. What survives is the single part
//! that generalizes: counting how often each opcode (and each adjacent
//! opcode pair) occurs, the way `Analyzer::get_frequency` did.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use crate::disasm::Disassembly;

fn opcode_name(instr: &crate::bytecode::Instruction) -> &'static str {
    use crate::bytecode::Instruction::*;
    match instr {
        Push(_) => "push",
        Pop => "pop",
        Add => "add",
        Sub => "sub",
        Mul => "mul",
        Div => "div",
        Mod => "mod",
        Or => "or",
        And => "and",
        Lt => "lt",
        Lte => "lte",
        Gt => "gt",
        Gte => "gte",
        Equ => "equ",
        Nequ => "nequ",
        Print => "print",
        Set(_) => "set",
        Get(_) => "get",
        Read => "read",
        Goto(_) => "goto",
        Gotoz(_) => "gotoz",
        Gotonz(_) => "gotonz",
        Call { .. } => "call",
        Return => "return",
        ReturnValue => "returnv",
        Callf(_) => "callf",
        Getlocal(_) => "getlocal",
        Setlocal(_) => "setlocal",
        MakeArray => "makearray",
        Setindex => "setindex",
        Getindex => "getindex",
        Halt => "halt",
    }
}

/// Opcode (and opcode-bigram) occurrence counts over one listing.
#[derive(Debug, Default)]
pub struct Frequency {
    counts: HashMap<String, u32>,
}

impl Frequency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, key: &str) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: String) {
        *self.counts.entry(key).or_insert(0) += 1;
    }
}

/// Count single-opcode and adjacent-opcode-pair frequencies across
/// `listing`, in program order.
pub fn analyze(listing: &Disassembly) -> Frequency {
    let mut freq = Frequency::new();
    let names: Vec<&str> = listing.lines.iter().map(|l| opcode_name(&l.instr)).collect();

    for name in &names {
        freq.bump(name.to_string());
    }
    for pair in names.windows(2) {
        freq.bump(format!("{}; {}", pair[0], pair[1]));
    }

    freq
}

impl Display for Frequency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut rows: Vec<_> = self.counts.iter().collect();
        rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (key, count) in rows {
            writeln!(f, "{key}: {count}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, Instruction};
    use crate::disasm::disassemble;

    #[test]
    fn counts_single_opcodes_and_bigrams() {
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::Push(1));
        chunk.emit(Instruction::Push(2));
        chunk.emit(Instruction::Add);
        chunk.emit(Instruction::Halt);

        let listing = disassemble(&chunk.code).unwrap();
        let freq = analyze(&listing);

        assert_eq!(freq.count("push"), 2);
        assert_eq!(freq.count("add"), 1);
        assert_eq!(freq.count("push; push"), 1);
        assert_eq!(freq.count("push; add"), 1);
    }
}
