//! Fetch-decode-execute loop, operand stack, call-frame indirection stack,
//! and the allocation/collection trigger policy. See SPEC_FULL.md §4.4.

use std::fmt::{Display, Formatter};
use std::io::{BufRead, Write as _};

use crate::bytecode::{Cursor, Instruction};
use crate::decoder::{decode, DecoderError};
use crate::frame::Frame;
use crate::gc::Gc;
use crate::symbols::{ConstEntry, ConstantPool, ForeignTable, GlobalTable, ProcTable};
use crate::value::{Native, Value, ValueRef};

pub const MAX_OPERAND_STACK_SIZE: usize = 1 << 20;
pub const MAX_CALL_DEPTH: usize = 1 << 14;

#[derive(Debug, PartialEq)]
pub enum RuntimeError {
    Decode(DecoderError),
    StackOverflow { pc: usize },
    StackUnderflow { pc: usize },
    CallDepthExceeded { pc: usize },
    ArrayIndexOutOfBounds { pc: usize, index: i64, len: usize },
    ProgramCounterOutOfRange { pc: usize },
    UnknownForeign { pc: usize, slot: usize },
    TypeMismatch { pc: usize, expected: &'static str },
    UnresolvedProcedure { pc: usize, proc_id: usize },
    UninitializedGlobal { pc: usize, idx: usize },
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Decode(e) => write!(f, "decode error: {e}"),
            RuntimeError::StackOverflow { pc } => write!(f, "pc {pc}: operand stack overflow"),
            RuntimeError::StackUnderflow { pc } => write!(f, "pc {pc}: operand stack underflow"),
            RuntimeError::CallDepthExceeded { pc } => {
                write!(f, "pc {pc}: call depth exceeded")
            }
            RuntimeError::ArrayIndexOutOfBounds { pc, index, len } => write!(
                f,
                "pc {pc}: array index {index} out of bounds for length {len}"
            ),
            RuntimeError::ProgramCounterOutOfRange { pc } => {
                write!(f, "pc {pc}: program counter out of range")
            }
            RuntimeError::UnknownForeign { pc, slot } => {
                write!(f, "pc {pc}: no foreign callback bound to slot {slot}")
            }
            RuntimeError::TypeMismatch { pc, expected } => {
                write!(f, "pc {pc}: expected a {expected}")
            }
            RuntimeError::UnresolvedProcedure { pc, proc_id } => {
                write!(f, "pc {pc}: procedure {proc_id} has no compiled body")
            }
            RuntimeError::UninitializedGlobal { pc, idx } => write!(
                f,
                "pc {pc}: global slot {idx} was never set along this execution path"
            ),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<DecoderError> for RuntimeError {
    fn from(e: DecoderError) -> Self {
        RuntimeError::Decode(e)
    }
}

/// A host callback bound to a foreign procedure slot. Receives the VM so it
/// can pop its arguments and push its result through the normal stack/heap
/// API (`Vm::pop`, `Vm::alloc_number`, ...).
pub type ForeignFn = Box<dyn FnMut(&mut Vm) -> Result<(), RuntimeError>>;

/// The stack machine: program buffer, operand stack of `ValueRef`s, the
/// call-frame indirection stack, frame pointer, program counter, and every
/// table it needs to resolve names and allocate values.
pub struct Vm {
    pub program: Vec<u8>,
    pc: usize,
    halted: bool,
    operand_stack: Vec<ValueRef>,
    frames: Vec<Frame>,
    fp: usize,
    pub globals: GlobalTable,
    pub constants: ConstantPool,
    pub procs: ProcTable,
    pub foreigns: ForeignTable,
    foreign_fns: Vec<Option<ForeignFn>>,
    pub gc: Gc,
    global_values: Vec<Option<ValueRef>>,
    input: Box<dyn BufRead>,
    output: Box<dyn std::io::Write>,
}

impl Vm {
    pub fn new(input: Box<dyn BufRead>, output: Box<dyn std::io::Write>) -> Self {
        Vm {
            program: Vec::new(),
            pc: 0,
            halted: true,
            operand_stack: Vec::new(),
            frames: Vec::new(),
            fp: 0,
            globals: GlobalTable::new(),
            constants: ConstantPool::new(),
            procs: ProcTable::new(),
            foreigns: ForeignTable::new(),
            foreign_fns: Vec::new(),
            gc: Gc::new(),
            global_values: Vec::new(),
            input,
            output,
        }
    }

    pub fn register_foreign(&mut self, name: &str, callback: ForeignFn) -> usize {
        let slot = self.foreigns.register(name);
        if self.foreign_fns.len() <= slot {
            self.foreign_fns.resize_with(slot + 1, || None);
        }
        self.foreign_fns[slot] = Some(callback);
        slot
    }

    pub fn load(&mut self, program: Vec<u8>) {
        self.program = program;
        self.pc = 0;
        self.halted = false;
    }

    // --- operand stack / GC-aware allocation --------------------------------

    /// Push onto the operand stack, enforcing `MAX_OPERAND_STACK_SIZE` so
    /// every path that grows the stack — not just the `PUSH` opcode — can
    /// only ever fail with a reported `StackOverflow`, never a host crash.
    pub fn push(&mut self, value: ValueRef, pc: usize) -> Result<(), RuntimeError> {
        self.check_stack_headroom(pc)?;
        self.operand_stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self, pc: usize) -> Result<ValueRef, RuntimeError> {
        self.operand_stack
            .pop()
            .ok_or(RuntimeError::StackUnderflow { pc })
    }

    fn roots(&self) -> Vec<ValueRef> {
        let mut roots: Vec<ValueRef> = self.operand_stack.clone();
        roots.extend(self.global_values.iter().flatten().copied());
        roots
    }

    fn alloc(&mut self, value: Value) -> ValueRef {
        if self.gc.should_collect() {
            let roots = self.roots();
            self.gc.collect(&roots);
        }
        self.gc.insert(value)
    }

    pub fn alloc_number(&mut self, n: f64) -> ValueRef {
        self.alloc(Value::Number(n))
    }

    pub fn alloc_string(&mut self, s: Vec<u8>) -> ValueRef {
        self.alloc(Value::Str(s))
    }

    pub fn alloc_array(&mut self, len: usize) -> ValueRef {
        self.alloc(Value::Array(vec![None; len]))
    }

    pub fn alloc_native(&mut self, native: Native) -> ValueRef {
        self.alloc(Value::Native(native))
    }

    pub fn value(&self, r: ValueRef) -> &Value {
        self.gc.get(r)
    }

    /// Current fetch-decode-execute program counter, for host callbacks that
    /// need a pc to attribute a `RuntimeError` to.
    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn number_at(&self, r: ValueRef, pc: usize) -> Result<f64, RuntimeError> {
        self.gc
            .get(r)
            .as_number()
            .ok_or(RuntimeError::TypeMismatch { pc, expected: "number" })
    }

    // --- globals (by runtime index, may grow past the compile-time count) --

    fn set_global(&mut self, idx: usize, value: ValueRef) {
        if self.global_values.len() <= idx {
            self.global_values.resize(idx + 1, None);
        }
        self.global_values[idx] = Some(value);
    }

    /// The compiler's use-before-set check (SPEC_FULL.md §4.3) is a single
    /// non-flow-sensitive walk: it marks a global initialized the moment it
    /// sees the assignment in program order, not the moment it actually
    /// executes. A global guarded by a branch that's never taken at runtime
    /// (`if 0 then x = 1 end write x end`) therefore compiles clean but
    /// still has no value here — that's a runtime condition, not a stack
    /// imbalance, so it gets its own variant rather than `StackUnderflow`.
    fn get_global(&self, idx: usize, pc: usize) -> Result<ValueRef, RuntimeError> {
        self.global_values
            .get(idx)
            .copied()
            .flatten()
            .ok_or(RuntimeError::UninitializedGlobal { pc, idx })
    }

    // --- run loop ------------------------------------------------------------

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        while !self.halted {
            self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), RuntimeError> {
        if self.pc > self.program.len() {
            return Err(RuntimeError::ProgramCounterOutOfRange { pc: self.pc });
        }
        let pc = self.pc;
        let mut cursor = Cursor::new(&self.program, self.pc);
        let instr = decode(&mut cursor)?;
        self.pc = cursor.ip;
        self.exec(instr, pc)
    }

    fn exec(&mut self, instr: Instruction, pc: usize) -> Result<(), RuntimeError> {
        match instr {
            Instruction::Push(imm) => {
                let value = match self.constants.get(imm as usize) {
                    ConstEntry::Number(n) => Value::Number(*n),
                    ConstEntry::Str(s) => Value::Str(s.clone()),
                };
                let r = self.alloc(value);
                self.push(r, pc)?;
            }
            Instruction::Pop => {
                self.pop(pc)?;
            }
            Instruction::Add | Instruction::Sub | Instruction::Mul | Instruction::Div => {
                let b = self.pop(pc)?;
                let a = self.pop(pc)?;
                let a = self.number_at(a, pc)?;
                let b = self.number_at(b, pc)?;
                let result = match instr {
                    Instruction::Add => a + b,
                    Instruction::Sub => a - b,
                    Instruction::Mul => a * b,
                    Instruction::Div => a / b,
                    _ => unreachable!(),
                };
                let r = self.alloc_number(result);
                self.push(r, pc)?;
            }
            Instruction::Mod | Instruction::Or | Instruction::And => {
                let b = self.pop(pc)?;
                let a = self.pop(pc)?;
                let a = self.number_at(a, pc)? as i64;
                let b = self.number_at(b, pc)? as i64;
                let result = match instr {
                    Instruction::Mod => a % b,
                    Instruction::Or => a | b,
                    Instruction::And => a & b,
                    _ => unreachable!(),
                };
                let r = self.alloc_number(result as f64);
                self.push(r, pc)?;
            }
            Instruction::Lt
            | Instruction::Lte
            | Instruction::Gt
            | Instruction::Gte
            | Instruction::Equ
            | Instruction::Nequ => {
                let b = self.pop(pc)?;
                let a = self.pop(pc)?;
                let a = self.number_at(a, pc)?;
                let b = self.number_at(b, pc)?;
                let truth = match instr {
                    Instruction::Lt => a < b,
                    Instruction::Lte => a <= b,
                    Instruction::Gt => a > b,
                    Instruction::Gte => a >= b,
                    Instruction::Equ => a == b,
                    Instruction::Nequ => a != b,
                    _ => unreachable!(),
                };
                let r = self.alloc_number(if truth { 1.0 } else { 0.0 });
                self.push(r, pc)?;
            }
            Instruction::Print => {
                let r = self.pop(pc)?;
                match self.gc.get(r) {
                    Value::Number(n) => writeln!(self.output, "{n}"),
                    Value::Str(s) => {
                        self.output.write_all(s).ok();
                        writeln!(self.output)
                    }
                    _ => writeln!(self.output, "<unprintable>"),
                }
                .ok();
            }
            Instruction::Set(imm) => {
                let v = self.pop(pc)?;
                self.set_global(imm as usize, v);
            }
            Instruction::Get(imm) => {
                let v = self.get_global(imm as usize, pc)?;
                self.push(v, pc)?;
            }
            Instruction::Read => {
                let mut line = String::new();
                let n = self.input.read_line(&mut line).unwrap_or(0);
                if n > 0 && line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                let r = self.alloc_string(line.into_bytes());
                self.push(r, pc)?;
            }
            Instruction::Goto(target) => {
                self.pc = target as usize;
            }
            Instruction::Gotoz(target) => {
                let v = self.pop(pc)?;
                if self.number_at(v, pc)? == 0.0 {
                    self.pc = target as usize;
                }
            }
            Instruction::Gotonz(target) => {
                let v = self.pop(pc)?;
                if self.number_at(v, pc)? != 0.0 {
                    self.pc = target as usize;
                }
            }
            Instruction::Call { nargs, proc_id } => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(RuntimeError::CallDepthExceeded { pc });
                }
                let entry_pc = self.procs.get(proc_id as usize).entry_pc.ok_or(
                    RuntimeError::UnresolvedProcedure {
                        pc,
                        proc_id: proc_id as usize,
                    },
                )?;
                self.frames.push(Frame::new(nargs, self.fp, self.pc));
                self.fp = self.operand_stack.len();
                self.pc = entry_pc;
            }
            Instruction::Return => self.do_return(pc)?,
            Instruction::ReturnValue => {
                let v = self.pop(pc)?;
                self.do_return(pc)?;
                self.push(v, pc)?;
            }
            Instruction::Callf(slot) => {
                let slot = slot as usize;
                let mut callback = self
                    .foreign_fns
                    .get_mut(slot)
                    .and_then(|f| f.take())
                    .ok_or(RuntimeError::UnknownForeign { pc, slot })?;
                let result = callback(self);
                self.foreign_fns[slot] = Some(callback);
                result?;
            }
            Instruction::Getlocal(imm) => {
                let idx = Frame::absolute_index(self.fp, imm)
                    .ok_or(RuntimeError::StackUnderflow { pc })?;
                let v = *self
                    .operand_stack
                    .get(idx)
                    .ok_or(RuntimeError::StackUnderflow { pc })?;
                self.push(v, pc)?;
            }
            Instruction::Setlocal(imm) => {
                let idx = Frame::absolute_index(self.fp, imm)
                    .ok_or(RuntimeError::StackUnderflow { pc })?;
                let v = self.pop(pc)?;
                *self
                    .operand_stack
                    .get_mut(idx)
                    .ok_or(RuntimeError::StackUnderflow { pc })? = v;
            }
            Instruction::MakeArray => {
                let len_ref = self.pop(pc)?;
                let len = self.number_at(len_ref, pc)? as usize;
                let r = self.alloc_array(len);
                self.push(r, pc)?;
            }
            Instruction::Setindex => {
                let value = self.pop(pc)?;
                let index_ref = self.pop(pc)?;
                let arr_ref = self.pop(pc)?;
                let index = self.number_at(index_ref, pc)? as i64;
                let len = self
                    .gc
                    .get(arr_ref)
                    .as_array()
                    .ok_or(RuntimeError::TypeMismatch { pc, expected: "array" })?
                    .len();
                if index < 0 || index as usize >= len {
                    return Err(RuntimeError::ArrayIndexOutOfBounds { pc, index, len });
                }
                self.gc
                    .get_mut(arr_ref)
                    .as_array_mut()
                    .ok_or(RuntimeError::TypeMismatch { pc, expected: "array" })?[index as usize] =
                    Some(value);
            }
            Instruction::Getindex => {
                let index_ref = self.pop(pc)?;
                let arr_ref = self.pop(pc)?;
                let index = self.number_at(index_ref, pc)? as i64;
                let slot = {
                    let arr = self
                        .gc
                        .get(arr_ref)
                        .as_array()
                        .ok_or(RuntimeError::TypeMismatch { pc, expected: "array" })?;
                    if index < 0 || index as usize >= arr.len() {
                        return Err(RuntimeError::ArrayIndexOutOfBounds {
                            pc,
                            index,
                            len: arr.len(),
                        });
                    }
                    arr[index as usize]
                };
                let r = match slot {
                    Some(r) => r,
                    None => self.alloc_number(0.0),
                };
                self.push(r, pc)?;
            }
            Instruction::Halt => self.halted = true,
        }
        Ok(())
    }

    fn do_return(&mut self, pc: usize) -> Result<(), RuntimeError> {
        let frame = self.frames.pop().ok_or(RuntimeError::StackUnderflow { pc })?;
        self.operand_stack.truncate(self.fp);
        let nargs = frame.nargs as usize;
        let new_len = self.operand_stack.len().saturating_sub(nargs);
        self.operand_stack.truncate(new_len);
        self.fp = frame.ret_frame_pointer;
        self.pc = frame.ret_pc;
        Ok(())
    }

    fn check_stack_headroom(&self, pc: usize) -> Result<(), RuntimeError> {
        if self.operand_stack.len() >= MAX_OPERAND_STACK_SIZE {
            return Err(RuntimeError::StackOverflow { pc });
        }
        Ok(())
    }

    pub fn operand_stack_len(&self) -> usize {
        self.operand_stack.len()
    }

    /// Invoke a compiled user procedure directly, as the host binding API
    /// (`Machine::call_proc`) does. Pushes `args`, synthesizes a call frame
    /// that returns to a sentinel pc never actually dispatched (the step
    /// loop here stops as soon as that frame pops), and restores the VM's
    /// own pc/halted state before returning.
    pub fn call_proc(&mut self, proc_id: usize, args: &[ValueRef]) -> Result<Option<ValueRef>, RuntimeError> {
        let entry_pc = self
            .procs
            .get(proc_id)
            .entry_pc
            .ok_or(RuntimeError::UnresolvedProcedure { pc: 0, proc_id })?;
        let saved_pc = self.pc;
        let saved_halted = self.halted;
        let depth_before = self.frames.len();
        let stack_before = self.operand_stack.len();

        for &a in args {
            self.push(a, saved_pc)?;
        }
        self.frames
            .push(Frame::new(args.len() as i32, self.fp, usize::MAX));
        self.fp = self.operand_stack.len();
        self.pc = entry_pc;
        self.halted = false;

        while self.frames.len() > depth_before {
            self.step()?;
        }

        self.halted = saved_halted;
        self.pc = saved_pc;
        let result = if self.operand_stack.len() > stack_before {
            self.operand_stack.pop()
        } else {
            None
        };
        Ok(result)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Chunk;

    fn vm_with_output() -> (Vm, std::rc::Rc<std::cell::RefCell<Vec<u8>>>) {
        struct SharedWriter(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
        impl std::io::Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().write(buf)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let buf = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let vm = Vm::new(
            Box::new(std::io::Cursor::new(Vec::new())),
            Box::new(SharedWriter(buf.clone())),
        );
        (vm, buf)
    }

    #[test]
    fn runs_arithmetic_and_prints() {
        let (mut vm, out) = vm_with_output();
        let one = vm.constants.intern_number(1.0);
        let two = vm.constants.intern_number(2.0);
        let three = vm.constants.intern_number(3.0);
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::Push(one as i32));
        chunk.emit(Instruction::Push(two as i32));
        chunk.emit(Instruction::Push(three as i32));
        chunk.emit(Instruction::Mul);
        chunk.emit(Instruction::Add);
        chunk.emit(Instruction::Print);
        chunk.emit(Instruction::Halt);
        vm.load(chunk.code);
        vm.run().unwrap();
        assert_eq!(out.borrow().as_slice(), b"7\n");
    }

    #[test]
    fn call_and_return_value_round_trip_stack_balance() {
        let (mut vm, out) = vm_with_output();
        // proc f(n) return n * n end ; write f(6) end
        let six = vm.constants.intern_number(6.0) as i32;
        let mut chunk = Chunk::new();
        let skip = chunk.emit_jump_placeholder(crate::bytecode::Opcode::Goto);
        let entry = chunk.current_pc();
        chunk.emit(Instruction::Getlocal(-1));
        chunk.emit(Instruction::Getlocal(-1));
        chunk.emit(Instruction::Mul);
        chunk.emit(Instruction::ReturnValue);
        let after = chunk.current_pc() as i32;
        chunk.patch(skip, after);

        vm.procs.declare("f");
        vm.procs.set_entry_pc(0, entry);

        chunk.emit(Instruction::Push(six));
        chunk.emit(Instruction::Call { nargs: 1, proc_id: 0 });
        chunk.emit(Instruction::Print);
        chunk.emit(Instruction::Halt);

        vm.load(chunk.code);
        vm.run().unwrap();
        assert_eq!(out.borrow().as_slice(), b"36\n");
        assert_eq!(vm.operand_stack_len(), 0);
    }

    #[test]
    fn array_zero_default_on_unwritten_slot() {
        let (mut vm, out) = vm_with_output();
        let len = vm.constants.intern_number(3.0) as i32;
        let idx1 = vm.constants.intern_number(1.0) as i32;
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::Push(len));
        chunk.emit(Instruction::MakeArray);
        chunk.emit(Instruction::Push(idx1));
        chunk.emit(Instruction::Getindex);
        chunk.emit(Instruction::Print);
        chunk.emit(Instruction::Halt);
        vm.load(chunk.code);
        vm.run().unwrap();
        assert_eq!(out.borrow().as_slice(), b"0\n");
    }

    #[test]
    fn out_of_bounds_index_is_fatal() {
        let (mut vm, _out) = vm_with_output();
        let len = vm.constants.intern_number(1.0) as i32;
        let bad_idx = vm.constants.intern_number(5.0) as i32;
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::Push(len));
        chunk.emit(Instruction::MakeArray);
        chunk.emit(Instruction::Push(bad_idx));
        chunk.emit(Instruction::Getindex);
        chunk.emit(Instruction::Halt);
        vm.load(chunk.code);
        let err = vm.run().unwrap_err();
        assert!(matches!(err, RuntimeError::ArrayIndexOutOfBounds { .. }));
    }

    #[test]
    fn stack_headroom_check_applies_to_non_push_opcodes() {
        let (mut vm, _out) = vm_with_output();
        let r = vm.alloc_number(1.0);
        vm.set_global(0, r);
        vm.operand_stack.resize(MAX_OPERAND_STACK_SIZE, r);
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::Get(0));
        chunk.emit(Instruction::Halt);
        vm.load(chunk.code);
        let err = vm.run().unwrap_err();
        assert!(matches!(err, RuntimeError::StackOverflow { .. }));
    }

    #[test]
    fn reading_a_global_whose_assignment_never_ran_is_uninitialized_not_underflow() {
        let (mut vm, _out) = vm_with_output();
        // `GET 0` with no prior `SET 0` along this execution path — the
        // compiler's non-flow-sensitive check can't catch this statically.
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::Get(0));
        chunk.emit(Instruction::Halt);
        vm.load(chunk.code);
        let err = vm.run().unwrap_err();
        assert!(matches!(err, RuntimeError::UninitializedGlobal { idx: 0, .. }));
    }

    #[test]
    fn read_at_eof_pushes_empty_string() {
        let mut vm = Vm::new(Box::new(std::io::Cursor::new(Vec::new())), Box::new(Vec::new()));
        let mut chunk = Chunk::new();
        chunk.emit(Instruction::Read);
        chunk.emit(Instruction::Halt);
        vm.load(chunk.code);
        vm.run().unwrap();
        assert_eq!(vm.operand_stack_len(), 1);
        let r = vm.operand_stack[0];
        assert_eq!(vm.value(r).as_str(), Some(b"".as_slice()));
    }
}
