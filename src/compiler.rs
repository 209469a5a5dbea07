//! AST to bytecode. A single post-order walk of the tree the parser already
//! built; see SPEC_FULL.md §4.3 for the lowering rules this follows.
//!
//! Every `compile_expr` call leaves exactly one value on the operand stack,
//! including assignment (which re-reads the just-stored location so chained
//! and nested assignment compose: `a = b = 5`, `write (x = 1) end`). The one
//! documented exception is a call to a user procedure: whether it leaves a
//! value depends on whether the callee used `RETURN` or `RETURN_VALUE`,
//! which the compiler does not check (consistent with "no type checking").
//! Array/member assignment targets intentionally do not support nested
//! value use — see `CompileError::ArrayAssignNotAValue`.

use std::fmt::{Display, Formatter};

use crate::ast::{BinOp, CallTarget, Expr, ReadTarget};
use crate::bytecode::{Chunk, Instruction, Opcode};
use crate::symbols::{ConstantPool, GlobalTable, ProcTable};

#[derive(Debug, PartialEq)]
pub enum CompileError {
    InvalidAssignTarget(&'static str),
    ArrayAssignNotAValue,
    UninitializedGlobalRead(String),
    MemberOnNonGlobal,
    UnknownMember { var: String, member: String },
    MemberListOutsideAssignment,
    NotAValue(&'static str),
}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::InvalidAssignTarget(kind) => {
                write!(f, "cannot assign to a {kind}")
            }
            CompileError::ArrayAssignNotAValue => write!(
                f,
                "an array or member assignment cannot be used as a value"
            ),
            CompileError::UninitializedGlobalRead(name) => {
                write!(f, "read of uninitialized global `{name}`")
            }
            CompileError::MemberOnNonGlobal => {
                write!(f, "`.member` is only legal on a global variable")
            }
            CompileError::UnknownMember { var, member } => {
                write!(f, "`{var}` has no member named `{member}`")
            }
            CompileError::MemberListOutsideAssignment => write!(
                f,
                "a member list `{{ ... }}` is only legal as the right-hand side of a global assignment"
            ),
            CompileError::NotAValue(kind) => write!(f, "a {kind} cannot be used as a value"),
        }
    }
}

impl std::error::Error for CompileError {}

struct Compiler<'a> {
    chunk: Chunk,
    globals: &'a mut GlobalTable,
    procs: &'a mut ProcTable,
    constants: &'a mut ConstantPool,
}

pub fn compile_program(
    body: &[Expr],
    n_top_locals: usize,
    globals: &mut GlobalTable,
    procs: &mut ProcTable,
    constants: &mut ConstantPool,
) -> Result<Chunk, CompileError> {
    let mut compiler = Compiler {
        chunk: Chunk::new(),
        globals,
        procs,
        constants,
    };
    for _ in 0..n_top_locals {
        compiler.push_const(0.0);
    }
    compiler.compile_block(body)?;
    compiler.chunk.emit(Instruction::Halt);
    Ok(compiler.chunk)
}

impl Compiler<'_> {
    fn push_const(&mut self, n: f64) {
        let idx = self.constants.intern_number(n);
        self.chunk.emit(Instruction::Push(idx as i32));
    }

    fn compile_block(&mut self, body: &[Expr]) -> Result<(), CompileError> {
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::If { cond, then_branch } => self.compile_if(cond, then_branch),
            Expr::While { cond, body } => self.compile_while(cond, body),
            Expr::Return(value) => self.compile_return(value.as_deref()),
            Expr::Read(targets) => self.compile_read(targets),
            Expr::Write(exprs) => self.compile_write(exprs),
            Expr::Proc {
                proc_id,
                n_locals,
                body,
                ..
            } => self.compile_proc(*proc_id, *n_locals, body),
            // A bare call's net stack effect depends on the callee's own
            // RETURN discipline; popping unconditionally here would
            // underflow for a procedure that returns no value.
            Expr::Call { .. } => self.compile_expr(expr).map(|_| ()),
            Expr::Assign { lhs, rhs } if matches!(**lhs, Expr::Index { .. } | Expr::Member { .. }) => {
                self.compile_array_assign(lhs, rhs)
            }
            other => {
                self.compile_expr(other)?;
                self.chunk.emit(Instruction::Pop);
                Ok(())
            }
        }
    }

    fn compile_proc(
        &mut self,
        proc_id: usize,
        n_locals: usize,
        body: &[Expr],
    ) -> Result<(), CompileError> {
        let skip = self.chunk.emit_jump_placeholder(Opcode::Goto);
        let entry_pc = self.chunk.current_pc();
        self.procs.set_entry_pc(proc_id, entry_pc);
        for _ in 0..n_locals {
            self.push_const(0.0);
        }
        self.compile_block(body)?;
        self.chunk.emit(Instruction::Return);
        let after = self.chunk.current_pc() as i32;
        self.chunk.patch(skip, after);
        Ok(())
    }

    fn compile_if(&mut self, cond: &Expr, then_branch: &[Expr]) -> Result<(), CompileError> {
        self.compile_expr(cond)?;
        let skip = self.chunk.emit_jump_placeholder(Opcode::Gotoz);
        self.compile_block(then_branch)?;
        let target = self.chunk.current_pc() as i32;
        self.chunk.patch(skip, target);
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &[Expr]) -> Result<(), CompileError> {
        let loop_start = self.chunk.current_pc() as i32;
        self.compile_expr(cond)?;
        let skip = self.chunk.emit_jump_placeholder(Opcode::Gotoz);
        self.compile_block(body)?;
        self.chunk.emit(Instruction::Goto(loop_start));
        let target = self.chunk.current_pc() as i32;
        self.chunk.patch(skip, target);
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expr>) -> Result<(), CompileError> {
        match value {
            Some(e) => {
                self.compile_expr(e)?;
                self.chunk.emit(Instruction::ReturnValue);
            }
            None => self.chunk.emit(Instruction::Return),
        }
        Ok(())
    }

    fn compile_read(&mut self, targets: &[ReadTarget]) -> Result<(), CompileError> {
        for target in targets {
            self.chunk.emit(Instruction::Read);
            match target {
                ReadTarget::Global(idx) => {
                    self.chunk.emit(Instruction::Set(*idx as i32));
                    self.globals.mark_initialized(*idx);
                }
                ReadTarget::Local(idx) => self.chunk.emit(Instruction::Setlocal(*idx)),
            }
        }
        Ok(())
    }

    fn compile_write(&mut self, exprs: &[Expr]) -> Result<(), CompileError> {
        for e in exprs {
            self.compile_expr(e)?;
            self.chunk.emit(Instruction::Print);
        }
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Number(n) => {
                self.push_const(*n);
                Ok(())
            }
            Expr::Str(s) => {
                let idx = self.constants.intern_string(s.clone());
                self.chunk.emit(Instruction::Push(idx as i32));
                Ok(())
            }
            Expr::GlobalRef(idx) => self.compile_global_read(*idx),
            Expr::LocalRef(idx) | Expr::LocalDecl(idx) => {
                self.chunk.emit(Instruction::Getlocal(*idx));
                Ok(())
            }
            Expr::Index { arr, idx } => {
                self.compile_expr(arr)?;
                self.compile_expr(idx)?;
                self.chunk.emit(Instruction::Getindex);
                Ok(())
            }
            Expr::Member { base, name } => {
                let var_idx = self.global_base_index(base)?;
                let member_idx = self.resolve_member(var_idx, name)?;
                self.chunk.emit(Instruction::Get(var_idx as i32));
                self.push_const(member_idx as f64);
                self.chunk.emit(Instruction::Getindex);
                Ok(())
            }
            Expr::ArrayLiteral(len) => {
                self.compile_expr(len)?;
                self.chunk.emit(Instruction::MakeArray);
                Ok(())
            }
            Expr::MemberList(_) => Err(CompileError::MemberListOutsideAssignment),
            Expr::Neg(e) => {
                self.compile_expr(e)?;
                self.push_const(-1.0);
                self.chunk.emit(Instruction::Mul);
                Ok(())
            }
            Expr::Pos(e) => self.compile_expr(e),
            Expr::Binary { op, lhs, rhs } => {
                self.compile_expr(lhs)?;
                self.compile_expr(rhs)?;
                self.chunk.emit(binop_instruction(*op));
                Ok(())
            }
            Expr::Call { target, args } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                match target {
                    CallTarget::User(proc_id) => self.chunk.emit(Instruction::Call {
                        nargs: args.len() as i32,
                        proc_id: *proc_id as i32,
                    }),
                    CallTarget::Foreign(slot) => {
                        self.chunk.emit(Instruction::Callf(*slot as i32))
                    }
                }
                Ok(())
            }
            Expr::Assign { lhs, rhs } => self.compile_assign(lhs, rhs),
            Expr::If { .. } => Err(CompileError::NotAValue("`if`")),
            Expr::While { .. } => Err(CompileError::NotAValue("`while`")),
            Expr::Return(_) => Err(CompileError::NotAValue("`return`")),
            Expr::Read(_) => Err(CompileError::NotAValue("`read`")),
            Expr::Write(_) => Err(CompileError::NotAValue("`write`")),
            Expr::Proc { .. } => Err(CompileError::NotAValue("`proc`")),
        }
    }

    fn compile_global_read(&mut self, idx: usize) -> Result<(), CompileError> {
        let slot = self.globals.get(idx);
        if !slot.initialized {
            return Err(CompileError::UninitializedGlobalRead(slot.name.clone()));
        }
        self.chunk.emit(Instruction::Get(idx as i32));
        Ok(())
    }

    fn global_base_index(&self, base: &Expr) -> Result<usize, CompileError> {
        match base {
            Expr::GlobalRef(idx) => Ok(*idx),
            _ => Err(CompileError::MemberOnNonGlobal),
        }
    }

    fn resolve_member(&self, var_idx: usize, member: &str) -> Result<usize, CompileError> {
        self.globals
            .member_index(var_idx, member)
            .ok_or_else(|| CompileError::UnknownMember {
                var: self.globals.get(var_idx).name.clone(),
                member: member.to_string(),
            })
    }

    /// Assignment always leaves the stored value on the stack (by reading
    /// it back after the store), so it composes as a value anywhere `expr`
    /// is expected — except array/member targets, which only support
    /// statement position.
    fn compile_assign(&mut self, lhs: &Expr, rhs: &Expr) -> Result<(), CompileError> {
        match lhs {
            Expr::GlobalRef(idx) => {
                if let Expr::MemberList(names) = rhs {
                    self.globals.set_members(*idx, names.clone());
                    self.push_const(0.0);
                    return Ok(());
                }
                self.compile_expr(rhs)?;
                self.chunk.emit(Instruction::Set(*idx as i32));
                self.globals.mark_initialized(*idx);
                self.chunk.emit(Instruction::Get(*idx as i32));
                Ok(())
            }
            Expr::LocalRef(idx) | Expr::LocalDecl(idx) => {
                self.compile_expr(rhs)?;
                self.chunk.emit(Instruction::Setlocal(*idx));
                self.chunk.emit(Instruction::Getlocal(*idx));
                Ok(())
            }
            Expr::Index { .. } | Expr::Member { .. } => Err(CompileError::ArrayAssignNotAValue),
            _ => Err(CompileError::InvalidAssignTarget("non-assignable expression")),
        }
    }

    /// Lowers an array/member store. Only reachable from statement
    /// position (`compile_stmt`) — nested value use of an array/member
    /// assignment is rejected by `compile_assign` before any code for it
    /// is emitted.
    fn compile_array_assign(&mut self, lhs: &Expr, rhs: &Expr) -> Result<(), CompileError> {
        match lhs {
            Expr::Index { arr, idx } => {
                self.compile_expr(arr)?;
                self.compile_expr(idx)?;
                self.compile_expr(rhs)?;
                self.chunk.emit(Instruction::Setindex);
                Ok(())
            }
            Expr::Member { base, name } => {
                let var_idx = self.global_base_index(base)?;
                let member_idx = self.resolve_member(var_idx, name)?;
                self.chunk.emit(Instruction::Get(var_idx as i32));
                self.push_const(member_idx as f64);
                self.compile_expr(rhs)?;
                self.chunk.emit(Instruction::Setindex);
                Ok(())
            }
            _ => unreachable!("compile_array_assign called with non-array/member lhs"),
        }
    }
}

fn binop_instruction(op: BinOp) -> Instruction {
    match op {
        BinOp::Add => Instruction::Add,
        BinOp::Sub => Instruction::Sub,
        BinOp::Mul => Instruction::Mul,
        BinOp::Div => Instruction::Div,
        BinOp::Mod => Instruction::Mod,
        BinOp::And => Instruction::And,
        BinOp::Or => Instruction::Or,
        BinOp::Lt => Instruction::Lt,
        BinOp::Gt => Instruction::Gt,
        BinOp::Lte => Instruction::Lte,
        BinOp::Gte => Instruction::Gte,
        BinOp::Eq => Instruction::Equ,
        BinOp::Neq => Instruction::Nequ,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::bytecode::Cursor;
    use crate::symbols::ForeignTable;
    use crate::parser::Parser;

    fn compile(src: &str) -> Result<Chunk, Box<dyn std::error::Error>> {
        let mut globals = GlobalTable::new();
        let mut procs = ProcTable::new();
        let foreigns = ForeignTable::new();
        let mut constants = ConstantPool::new();
        let parser = Parser::new(src, &mut globals, &mut procs, &foreigns, &mut constants)?;
        let (body, n_locals) = parser.parse_program()?;
        Ok(compile_program(&body, n_locals, &mut globals, &mut procs, &mut constants)?)
    }

    fn decode_all(chunk: &Chunk) -> Vec<Instruction> {
        let mut cursor = Cursor::new(&chunk.code, 0);
        let mut out = Vec::new();
        while cursor.ip < chunk.code.len() {
            out.push(decode(&mut cursor).unwrap());
        }
        out
    }

    #[test]
    fn empty_program_compiles_to_a_single_halt() {
        let chunk = compile("").unwrap();
        assert_eq!(decode_all(&chunk), vec![Instruction::Halt]);
    }

    #[test]
    fn write_arithmetic_ends_with_print_then_halt() {
        let chunk = compile("write 1 + 2 * 3 end").unwrap();
        let instrs = decode_all(&chunk);
        assert_eq!(instrs.last(), Some(&Instruction::Halt));
        assert_eq!(instrs[instrs.len() - 2], Instruction::Print);
    }

    #[test]
    fn global_read_before_write_is_a_compile_error() {
        let err = compile("write x end").unwrap_err();
        assert!(err.to_string().contains("uninitialized"));
    }

    #[test]
    fn member_access_on_non_global_is_rejected() {
        let err = compile("proc f(n) write $n.x end end write f(1) end").unwrap_err();
        assert!(err.to_string().contains("member"));
    }

    #[test]
    fn unknown_member_is_rejected() {
        let err = compile("p = { x, y } write p.z end").unwrap_err();
        assert!(err.to_string().contains("no member"));
    }

    #[test]
    fn chained_global_assignment_compiles() {
        let chunk = compile("a = b = 5 write a + b end").unwrap();
        let instrs = decode_all(&chunk);
        assert!(instrs.contains(&Instruction::Set(1)));
        assert!(instrs.contains(&Instruction::Set(0)));
    }

    #[test]
    fn array_assignment_as_nested_value_is_rejected() {
        let err = compile("a = [2] write (a[0] = 1) end").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompileError>(),
            Some(CompileError::ArrayAssignNotAValue)
        ));
    }

    #[test]
    fn proc_body_is_skipped_by_a_leading_goto() {
        let chunk = compile("proc f() return 1 end write f() end").unwrap();
        let instrs = decode_all(&chunk);
        assert!(matches!(instrs[0], Instruction::Goto(_)));
    }
}
