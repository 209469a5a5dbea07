//! The host embedding surface: one aggregate bundling every singleton the
//! compiler/VM need (globals, procedures, foreigns, constants, GC/heap,
//! program buffer) instead of process-global state. See SPEC_FULL.md §6, §9.

use std::fmt::{Display, Formatter};
use std::io::BufRead;

use crate::compiler::{self, CompileError};
use crate::parser::{ParseError, Parser};
use crate::value::{Native, Value, ValueRef};
use crate::vm::{ForeignFn, RuntimeError, Vm};

#[derive(Debug)]
pub enum MachineError {
    Parse(ParseError),
    Compile(CompileError),
    Runtime(RuntimeError),
    UnknownProcedure(String),
}

impl Display for MachineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineError::Parse(e) => write!(f, "{e}"),
            MachineError::Compile(e) => write!(f, "{e}"),
            MachineError::Runtime(e) => write!(f, "{e}"),
            MachineError::UnknownProcedure(name) => {
                write!(f, "no compiled procedure named `{name}`")
            }
        }
    }
}

impl std::error::Error for MachineError {}

impl From<ParseError> for MachineError {
    fn from(e: ParseError) -> Self {
        MachineError::Parse(e)
    }
}

impl From<CompileError> for MachineError {
    fn from(e: CompileError) -> Self {
        MachineError::Compile(e)
    }
}

impl From<RuntimeError> for MachineError {
    fn from(e: RuntimeError) -> Self {
        MachineError::Runtime(e)
    }
}

/// The embedding surface described in SPEC_FULL.md §6. Every singleton the
/// compiler/VM touch (globals, procedures, foreigns, constants, the GC
/// arena, the program buffer) lives behind this one struct, so multiple
/// independent interpreters can coexist in one process.
pub struct Machine {
    vm: Vm,
}

impl Machine {
    /// Zero the machine and seed the GC threshold, reading program input
    /// from `input` and writing `write`/diagnostics-free program output to
    /// `output`.
    pub fn init(input: Box<dyn BufRead>, output: Box<dyn std::io::Write>) -> Self {
        Machine { vm: Vm::new(input, output) }
    }

    /// Bind a host callback to `name`. Name resolution at parse time favors
    /// a foreign procedure over a user one for the same name.
    pub fn register_foreign(&mut self, name: &str, callback: ForeignFn) {
        self.vm.register_foreign(name, callback);
    }

    /// Lex, parse, and emit bytecode terminated by `HALT`.
    pub fn compile(&mut self, source: &str) -> Result<(), MachineError> {
        let parser = Parser::new(
            source,
            &mut self.vm.globals,
            &mut self.vm.procs,
            &self.vm.foreigns,
            &mut self.vm.constants,
        )?;
        let (body, n_top_locals) = parser.parse_program()?;
        let chunk = compiler::compile_program(
            &body,
            n_top_locals,
            &mut self.vm.globals,
            &mut self.vm.procs,
            &mut self.vm.constants,
        )?;
        self.vm.load(chunk.code);
        Ok(())
    }

    /// Execute from pc 0 until halt.
    pub fn run(&mut self) -> Result<(), MachineError> {
        self.vm.run().map_err(MachineError::from)
    }

    /// Invoke a compiled user procedure by name; returns the produced
    /// `ValueRef` if the procedure returned a value.
    pub fn call_proc(&mut self, name: &str, args: &[ValueRef]) -> Result<Option<ValueRef>, MachineError> {
        let proc_id = self
            .vm
            .procs
            .lookup(name)
            .ok_or_else(|| MachineError::UnknownProcedure(name.to_string()))?;
        self.vm.call_proc(proc_id, args).map_err(MachineError::from)
    }

    pub fn push_value(&mut self, value: ValueRef) -> Result<(), MachineError> {
        let pc = self.vm.pc();
        self.vm.push(value, pc).map_err(MachineError::from)
    }

    pub fn pop_value(&mut self) -> Result<ValueRef, MachineError> {
        self.vm.pop(0).map_err(MachineError::from)
    }

    pub fn alloc_number(&mut self, n: f64) -> ValueRef {
        self.vm.alloc_number(n)
    }

    pub fn alloc_string(&mut self, s: Vec<u8>) -> ValueRef {
        self.vm.alloc_string(s)
    }

    pub fn alloc_array(&mut self, len: usize) -> ValueRef {
        self.vm.alloc_array(len)
    }

    pub fn alloc_native(&mut self, native: Native) -> ValueRef {
        self.vm.alloc_native(native)
    }

    pub fn value(&self, r: ValueRef) -> &Value {
        self.vm.value(r)
    }

    pub fn program(&self) -> &[u8] {
        &self.vm.program
    }

    /// Free everything and run one final collection so every live heap
    /// slot is finalized.
    pub fn teardown(mut self) {
        self.vm.gc.collect(&[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct SharedWriter(Rc<RefCell<Vec<u8>>>);
    impl std::io::Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run(source: &str) -> String {
        let buf = Rc::new(RefCell::new(Vec::new()));
        let mut machine = Machine::init(
            Box::new(std::io::Cursor::new(Vec::new())),
            Box::new(SharedWriter(buf.clone())),
        );
        machine.compile(source).unwrap();
        machine.run().unwrap();
        String::from_utf8(buf.borrow().clone()).unwrap()
    }

    #[test]
    fn scenario_arithmetic_precedence() {
        assert_eq!(run("write 1 + 2 * 3 end"), "7\n");
    }

    #[test]
    fn scenario_counting_loop() {
        let out = run("x = 10  while x > 0  write x end  x = x - 1 end");
        let expected: String = (1..=10).rev().map(|n| format!("{n}\n")).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn scenario_proc_call() {
        assert_eq!(
            run("proc f(n) return $n * $n end  write f(6) end"),
            "36\n"
        );
    }

    #[test]
    fn scenario_array_indexing() {
        assert_eq!(
            run("a = [3]  a[0] = 1  a[1] = 2  a[2] = a[0] + a[1]  write a[2] end"),
            "3\n"
        );
    }

    #[test]
    fn scenario_recursive_factorial() {
        let src = "proc fact(n) if $n <= 1 then return 1 end  return $n * fact($n - 1) end  write fact(6) end";
        assert_eq!(run(src), "720\n");
    }

    #[test]
    fn scenario_string_literal() {
        assert_eq!(run("write \"hi\" end"), "hi\n");
    }

    #[test]
    fn empty_program_compiles_and_halts() {
        assert_eq!(run(""), "");
    }
}
