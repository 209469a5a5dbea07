//! Symbol tables: globals, user procedures, foreign procedures, and the
//! deduplicated constant pool. See SPEC_FULL.md §3.

use std::collections::HashMap;

pub const MAX_MEMBERS: usize = 32;

#[derive(Debug, Clone)]
pub struct GlobalSlot {
    pub name: String,
    pub initialized: bool,
    pub members: Option<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct GlobalTable {
    slots: Vec<GlobalSlot>,
    index: HashMap<String, usize>,
}

impl GlobalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an existing global, or declare a fresh uninitialized one.
    /// Returns its table index.
    pub fn declare(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.slots.len();
        self.slots.push(GlobalSlot {
            name: name.to_string(),
            initialized: false,
            members: None,
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, idx: usize) -> &GlobalSlot {
        &self.slots[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut GlobalSlot {
        &mut self.slots[idx]
    }

    pub fn mark_initialized(&mut self, idx: usize) {
        self.slots[idx].initialized = true;
    }

    pub fn set_members(&mut self, idx: usize, members: Vec<String>) {
        self.slots[idx].members = Some(members);
    }

    pub fn member_index(&self, idx: usize, member: &str) -> Option<usize> {
        self.slots[idx]
            .members
            .as_ref()
            .and_then(|m| m.iter().position(|n| n == member))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GlobalSlot> {
        self.slots.iter()
    }
}

#[derive(Debug, Clone)]
pub struct ProcEntry {
    pub name: String,
    pub entry_pc: Option<usize>,
    pub n_args: usize,
}

/// User procedure table, addressed by non-negative ids assigned by the
/// compiler/parser. `entry_pc` is filled in late, once the `proc` body is
/// compiled (program text order determines pc values).
#[derive(Debug, Default)]
pub struct ProcTable {
    entries: Vec<ProcEntry>,
    index: HashMap<String, usize>,
}

impl ProcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an existing procedure, or declare a fresh one referenced
    /// before its definition (a forward call). `n_args` is filled in for
    /// real once the `proc` definition itself is parsed.
    pub fn declare(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.entries.len();
        self.entries.push(ProcEntry {
            name: name.to_string(),
            entry_pc: None,
            n_args: 0,
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, idx: usize) -> &ProcEntry {
        &self.entries[idx]
    }

    pub fn set_entry_pc(&mut self, idx: usize, pc: usize) {
        self.entries[idx].entry_pc = Some(pc);
    }

    pub fn set_n_args(&mut self, idx: usize, n_args: usize) {
        self.entries[idx].n_args = n_args;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Foreign procedure table, addressed by the bitwise-complement convention
/// at the bytecode layer (id = -(i+1)). The actual callback lives on the VM
/// (see `vm::Vm::foreigns`); this table only tracks name <-> slot and arity.
#[derive(Debug, Default)]
pub struct ForeignTable {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl ForeignTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstEntry {
    Number(f64),
    Str(Vec<u8>),
}

/// Deduplicated table of literal numbers/strings, addressed by index from
/// bytecode. Dedup policy: bitwise `f64` equality (via `to_bits`) for
/// numbers, byte equality for strings.
#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: Vec<ConstEntry>,
    number_index: HashMap<u64, usize>,
    string_index: HashMap<Vec<u8>, usize>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern_number(&mut self, n: f64) -> usize {
        let bits = n.to_bits();
        if let Some(&idx) = self.number_index.get(&bits) {
            return idx;
        }
        let idx = self.entries.len();
        self.entries.push(ConstEntry::Number(n));
        self.number_index.insert(bits, idx);
        idx
    }

    pub fn intern_string(&mut self, s: Vec<u8>) -> usize {
        if let Some(&idx) = self.string_index.get(&s) {
            return idx;
        }
        let idx = self.entries.len();
        self.string_index.insert(s.clone(), idx);
        self.entries.push(ConstEntry::Str(s));
        idx
    }

    pub fn get(&self, idx: usize) -> &ConstEntry {
        &self.entries[idx]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_declare_is_idempotent() {
        let mut globals = GlobalTable::new();
        let a = globals.declare("x");
        let b = globals.declare("x");
        assert_eq!(a, b);
        assert_eq!(globals.len(), 1);
    }

    #[test]
    fn constant_pool_dedups_numbers_and_strings() {
        let mut pool = ConstantPool::new();
        let a = pool.intern_number(3.0);
        let b = pool.intern_number(3.0);
        assert_eq!(a, b);

        let s1 = pool.intern_string(b"hi".to_vec());
        let s2 = pool.intern_string(b"hi".to_vec());
        assert_eq!(s1, s2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn member_index_resolves_declared_members() {
        let mut globals = GlobalTable::new();
        let idx = globals.declare("point");
        globals.set_members(idx, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(globals.member_index(idx, "y"), Some(1));
        assert_eq!(globals.member_index(idx, "z"), None);
    }
}
