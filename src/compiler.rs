// File: src/compiler.rs
//
// Single-pass AST-to-bytecode compiler for Hemlock.
// One function state per function body; the root chunk is compiled as an
// implicit top-level function. Scope resolution, upvalue capture and jump
// patching all happen here in one pass over the AST.

use std::sync::Arc;

use ahash::AHashSet;

use crate::ast::{BinaryOp, Expr, Param, Stmt, UnaryOp};
use crate::builtins;
use crate::bytecode::{Chunk, Op, UpvalueDesc};
use crate::errors::HemlockError;
use crate::value::TypeTag;

#[derive(Debug)]
struct Local {
    name: String,
    depth: u32,
    is_const: bool,
    is_captured: bool,
}

#[derive(Debug)]
struct LoopCtx {
    break_sites: Vec<usize>,
    continue_sites: Vec<usize>,
    continue_target: Option<usize>,
    /// Locals deeper than this are popped before a break/continue jumps out.
    scope_depth: u32,
    /// Switches reuse the loop machinery for `break` but are transparent to
    /// `continue`.
    is_switch: bool,
}

/// Per-function compilation state. `functions` in the Compiler forms the
/// lexical nesting chain used for upvalue resolution.
struct FnState {
    chunk: Chunk,
    locals: Vec<Local>,
    scope_depth: u32,
    loops: Vec<LoopCtx>,
    max_locals: usize,
}

impl FnState {
    fn new(name: &str) -> Self {
        let mut state = FnState {
            chunk: Chunk::new(name),
            locals: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            max_locals: 1,
        };
        // Slot 0 holds the called closure itself.
        state.locals.push(Local {
            name: String::new(),
            depth: 0,
            is_const: false,
            is_captured: false,
        });
        state
    }
}

pub struct Compiler {
    functions: Vec<FnState>,
    errors: Vec<HemlockError>,
    panic_mode: bool,
    /// Global names defined so far; used to decide when a bare call can be
    /// routed through `CALL_BUILTIN`.
    declared_globals: AHashSet<String>,
}

/// Compile a whole program into its root chunk.
pub fn compile_program(program: &[Stmt]) -> Result<Arc<Chunk>, Vec<HemlockError>> {
    let mut compiler = Compiler::new();
    for stmt in program {
        if let Err(err) = compiler.compile_stmt(stmt) {
            compiler.report(err);
        }
        compiler.panic_mode = false;
    }
    let line = program.last().map(|s| s.line()).unwrap_or(0);
    compiler.emit(Op::Null, line);
    compiler.emit(Op::Return, line);

    if !compiler.errors.is_empty() {
        return Err(compiler.errors);
    }
    let mut state = compiler.functions.pop().unwrap();
    state.chunk.local_count = state.max_locals;
    Ok(Arc::new(state.chunk))
}

impl Compiler {
    fn new() -> Self {
        Compiler {
            functions: vec![FnState::new("<script>")],
            errors: Vec::new(),
            panic_mode: false,
            declared_globals: AHashSet::new(),
        }
    }

    fn report(&mut self, err: HemlockError) {
        if !self.panic_mode {
            self.errors.push(err);
        }
        self.panic_mode = true;
    }

    fn err(&self, message: impl Into<String>, line: u32) -> HemlockError {
        HemlockError::compile(message, line)
    }

    // ----- chunk access -----

    fn state(&mut self) -> &mut FnState {
        self.functions.last_mut().unwrap()
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.state().chunk
    }

    fn emit(&mut self, op: Op, line: u32) {
        self.chunk().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.chunk().write_byte(byte, line);
    }

    fn emit_short(&mut self, value: u16, line: u32) {
        self.chunk().write_short(value, line);
    }

    fn emit_jump(&mut self, op: Op, line: u32) -> usize {
        self.chunk().write_jump(op, line)
    }

    fn patch_jump(&mut self, site: usize, line: u32) -> Result<(), HemlockError> {
        self.chunk().patch_jump(site).map_err(|msg| self.err(msg, line))
    }

    fn emit_loop(&mut self, target: usize, line: u32) -> Result<(), HemlockError> {
        self.chunk().write_loop(target, line).map_err(|msg| self.err(msg, line))
    }

    fn identifier(&mut self, name: &str, line: u32) -> Result<u16, HemlockError> {
        self.chunk().add_identifier(name).map_err(|msg| self.err(msg, line))
    }

    fn string_const(&mut self, value: &str, line: u32) -> Result<u16, HemlockError> {
        self.chunk().add_string(value).map_err(|msg| self.err(msg, line))
    }

    fn code_len(&mut self) -> usize {
        self.chunk().code.len()
    }

    // ----- scopes, locals, upvalues -----

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        let state = self.functions.last_mut().unwrap();
        state.scope_depth -= 1;
        let depth = state.scope_depth;
        while let Some(local) = state.locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = local.is_captured;
            state.locals.pop();
            if captured {
                state.chunk.write_op(Op::CloseUpvalue, line);
            } else {
                state.chunk.write_op(Op::Pop, line);
            }
        }
    }

    fn declare_local(&mut self, name: &str, is_const: bool, line: u32) -> Result<u8, HemlockError> {
        let state = self.functions.last_mut().unwrap();
        let depth = state.scope_depth;
        if state
            .locals
            .iter()
            .any(|local| local.depth == depth && local.name == name && !local.name.is_empty())
        {
            return Err(HemlockError::compile(
                format!("Variable '{}' already declared in this scope", name),
                line,
            ));
        }
        if state.locals.len() >= u8::MAX as usize {
            return Err(HemlockError::compile("Too many locals in one function", line));
        }
        let slot = state.locals.len() as u8;
        state.locals.push(Local { name: name.to_string(), depth, is_const, is_captured: false });
        state.max_locals = state.max_locals.max(state.locals.len());
        Ok(slot)
    }

    fn resolve_local_in(&self, fn_index: usize, name: &str) -> Option<u8> {
        let state = &self.functions[fn_index];
        state
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, _)| slot as u8)
    }

    fn local_is_const(&self, fn_index: usize, slot: u8) -> bool {
        self.functions[fn_index].locals[slot as usize].is_const
    }

    fn add_upvalue(
        &mut self,
        fn_index: usize,
        desc: UpvalueDesc,
        line: u32,
    ) -> Result<u8, HemlockError> {
        let chunk = &mut self.functions[fn_index].chunk;
        if let Some(existing) = chunk.upvalues.iter().position(|u| *u == desc) {
            return Ok(existing as u8);
        }
        if chunk.upvalues.len() >= u8::MAX as usize {
            return Err(HemlockError::compile("Too many captured variables in one function", line));
        }
        chunk.upvalues.push(desc);
        Ok((chunk.upvalues.len() - 1) as u8)
    }

    /// Walk enclosing function states looking for `name`, threading upvalue
    /// descriptors through every intermediate function.
    fn resolve_upvalue(
        &mut self,
        fn_index: usize,
        name: &str,
        line: u32,
    ) -> Result<Option<u8>, HemlockError> {
        if fn_index == 0 {
            return Ok(None);
        }
        let enclosing = fn_index - 1;
        if let Some(slot) = self.resolve_local_in(enclosing, name) {
            self.functions[enclosing].locals[slot as usize].is_captured = true;
            let index = self.add_upvalue(fn_index, UpvalueDesc { is_local: true, index: slot }, line)?;
            return Ok(Some(index));
        }
        if let Some(outer) = self.resolve_upvalue(enclosing, name, line)? {
            let index =
                self.add_upvalue(fn_index, UpvalueDesc { is_local: false, index: outer }, line)?;
            return Ok(Some(index));
        }
        Ok(None)
    }

    // ----- loops -----

    fn begin_loop(&mut self, is_switch: bool) {
        let depth = self.state().scope_depth;
        self.state().loops.push(LoopCtx {
            break_sites: Vec::new(),
            continue_sites: Vec::new(),
            continue_target: None,
            scope_depth: depth,
            is_switch,
        });
    }

    fn set_continue_target(&mut self) {
        let target = self.code_len();
        if let Some(ctx) = self.state().loops.last_mut() {
            ctx.continue_target = Some(target);
        }
    }

    /// Emit pops for locals that would be abandoned by jumping out to
    /// `target_depth`.
    fn emit_scope_unwind(&mut self, target_depth: u32, line: u32) {
        let state = self.functions.last_mut().unwrap();
        for local in state.locals.iter().rev() {
            if local.depth <= target_depth {
                break;
            }
            if local.is_captured {
                state.chunk.write_op(Op::CloseUpvalue, line);
            } else {
                state.chunk.write_op(Op::Pop, line);
            }
        }
    }

    fn emit_break(&mut self, line: u32) -> Result<(), HemlockError> {
        if self.state().loops.is_empty() {
            return Err(self.err("'break' outside of loop or switch", line));
        }
        let depth = self.state().loops.last().unwrap().scope_depth;
        self.emit_scope_unwind(depth, line);
        let site = self.emit_jump(Op::Jump, line);
        self.state().loops.last_mut().unwrap().break_sites.push(site);
        Ok(())
    }

    fn emit_continue(&mut self, line: u32) -> Result<(), HemlockError> {
        let index = match self.state().loops.iter().rposition(|ctx| !ctx.is_switch) {
            Some(index) => index,
            None => return Err(self.err("'continue' outside of loop", line)),
        };
        let depth = self.state().loops[index].scope_depth;
        self.emit_scope_unwind(depth, line);
        if let Some(target) = self.state().loops[index].continue_target {
            self.emit_loop(target, line)?;
        } else {
            let site = self.emit_jump(Op::Jump, line);
            self.state().loops[index].continue_sites.push(site);
        }
        Ok(())
    }

    fn end_loop(&mut self, line: u32) -> Result<(), HemlockError> {
        let ctx = self.state().loops.pop().unwrap();
        for site in ctx.break_sites {
            self.patch_jump(site, line)?;
        }
        for site in ctx.continue_sites {
            match ctx.continue_target {
                Some(target) => {
                    // Target was recorded after the jump was emitted, so the
                    // jump is still forward.
                    let delta = target - site - 2;
                    if delta > u16::MAX as usize {
                        return Err(self.err("Loop body too large", line));
                    }
                    let chunk = self.chunk();
                    chunk.code[site] = (delta >> 8) as u8;
                    chunk.code[site + 1] = (delta & 0xff) as u8;
                }
                None => self.patch_jump(site, line)?,
            }
        }
        Ok(())
    }

    // ----- statements -----

    fn compile_block(&mut self, body: &[Stmt], line: u32) -> Result<(), HemlockError> {
        self.begin_scope();
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.end_scope(line);
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), HemlockError> {
        match stmt {
            Stmt::Let { name, type_name, initializer, is_const, line } => {
                self.compile_let(name, type_name.as_deref(), initializer.as_ref(), *is_const, *line)
            }
            Stmt::Expr { expr, line } => {
                // A named function expression in statement position defines
                // the name, matching `let name = fn ...`.
                if let Expr::Function { name: Some(fn_name), .. } = expr {
                    let fn_name = fn_name.clone();
                    return self.compile_let(&fn_name, None, Some(expr), false, *line);
                }
                self.compile_expr(expr)?;
                self.emit(Op::Pop, *line);
                Ok(())
            }
            Stmt::If { condition, then_branch, else_branch, line } => {
                self.compile_expr(condition)?;
                let else_site = self.emit_jump(Op::JumpIfFalse, *line);
                self.emit(Op::Pop, *line);
                self.compile_block(then_branch, *line)?;
                let end_site = self.emit_jump(Op::Jump, *line);
                self.patch_jump(else_site, *line)?;
                self.emit(Op::Pop, *line);
                if let Some(else_branch) = else_branch {
                    self.compile_block(else_branch, *line)?;
                }
                self.patch_jump(end_site, *line)
            }
            Stmt::While { condition, body, line } => {
                let loop_start = self.code_len();
                self.begin_loop(false);
                self.set_continue_target();
                self.compile_expr(condition)?;
                let exit_site = self.emit_jump(Op::JumpIfFalse, *line);
                self.emit(Op::Pop, *line);
                self.compile_block(body, *line)?;
                self.emit_loop(loop_start, *line)?;
                self.patch_jump(exit_site, *line)?;
                self.emit(Op::Pop, *line);
                self.end_loop(*line)
            }
            Stmt::For { init, condition, increment, body, line } => {
                self.begin_scope();
                if let Some(init) = init {
                    self.compile_stmt(init)?;
                }
                let loop_start = self.code_len();
                self.begin_loop(false);
                let exit_site = if let Some(condition) = condition {
                    self.compile_expr(condition)?;
                    let site = self.emit_jump(Op::JumpIfFalse, *line);
                    self.emit(Op::Pop, *line);
                    Some(site)
                } else {
                    None
                };
                self.compile_block(body, *line)?;
                self.set_continue_target();
                if let Some(increment) = increment {
                    self.compile_expr(increment)?;
                    self.emit(Op::Pop, *line);
                }
                self.emit_loop(loop_start, *line)?;
                if let Some(site) = exit_site {
                    self.patch_jump(site, *line)?;
                    self.emit(Op::Pop, *line);
                }
                self.end_loop(*line)?;
                self.end_scope(*line);
                Ok(())
            }
            Stmt::ForIn { key_var, value_var, iterable, body, line } => {
                self.compile_for_in(key_var.as_deref(), value_var, iterable, body, *line)
            }
            Stmt::Block { body, line } => self.compile_block(body, *line),
            Stmt::Return { value, line } => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.emit(Op::Null, *line),
                }
                self.emit(Op::Return, *line);
                Ok(())
            }
            Stmt::Break { line } => self.emit_break(*line),
            Stmt::Continue { line } => self.emit_continue(*line),
            Stmt::Switch { scrutinee, case_values, case_bodies, line } => {
                self.compile_switch(scrutinee, case_values, case_bodies, *line)
            }
            Stmt::Try { try_block, catch_param, catch_block, finally_block, line } => {
                self.compile_try(
                    try_block,
                    catch_param.as_deref(),
                    catch_block.as_deref(),
                    finally_block.as_deref(),
                    *line,
                )
            }
            Stmt::Throw { value, line } => {
                self.compile_expr(value)?;
                self.emit(Op::Throw, *line);
                Ok(())
            }
            Stmt::Defer { call, line } => {
                self.compile_defer(call, *line)?;
                Ok(())
            }
            Stmt::Enum { name, variants, line } => self.compile_enum(name, variants, *line),
        }
    }

    fn compile_let(
        &mut self,
        name: &str,
        type_name: Option<&str>,
        initializer: Option<&Expr>,
        is_const: bool,
        line: u32,
    ) -> Result<(), HemlockError> {
        match initializer {
            Some(init) => self.compile_expr(init)?,
            None => self.emit(Op::Null, line),
        }

        if let Some(type_name) = type_name {
            match TypeTag::from_name(type_name) {
                Some(TypeTag::Any) => {}
                Some(tag) => {
                    self.emit(Op::Cast, line);
                    self.emit_byte(tag as u8, line);
                }
                None => {
                    let index = self.identifier(type_name, line)?;
                    self.emit(Op::SetObjType, line);
                    self.emit_short(index, line);
                }
            }
        }

        let in_function_scope =
            self.functions.len() > 1 || self.functions[0].scope_depth > 0;
        if in_function_scope {
            self.declare_local(name, is_const, line)?;
            // The initializer result stays on the stack as the local's slot.
        } else {
            self.declared_globals.insert(name.to_string());
            let index = self.identifier(name, line)?;
            self.emit(if is_const { Op::DefineGlobalConst } else { Op::DefineGlobal }, line);
            self.emit_short(index, line);
        }
        Ok(())
    }

    fn compile_for_in(
        &mut self,
        key_var: Option<&str>,
        value_var: &str,
        iterable: &Expr,
        body: &[Stmt],
        line: u32,
    ) -> Result<(), HemlockError> {
        self.begin_scope();

        self.compile_expr(iterable)?;
        let iter_slot = self.declare_local("", false, line)?;
        self.chunk().emit_int(0, line).map_err(|m| self.err(m, line))?;
        let index_slot = self.declare_local("", false, line)?;
        let key_slot = match key_var {
            Some(name) => {
                self.emit(Op::Null, line);
                Some(self.declare_local(name, false, line)?)
            }
            None => None,
        };
        self.emit(Op::Null, line);
        let value_slot = self.declare_local(value_var, false, line)?;

        let length_idx = self.identifier("length", line)?;
        let loop_start = self.code_len();
        self.begin_loop(false);

        self.emit(Op::GetLocal, line);
        self.emit_byte(index_slot, line);
        self.emit(Op::GetLocal, line);
        self.emit_byte(iter_slot, line);
        self.emit(Op::GetProperty, line);
        self.emit_short(length_idx, line);
        self.emit(Op::Lt, line);
        let exit_site = self.emit_jump(Op::JumpIfFalse, line);
        self.emit(Op::Pop, line);

        if let Some(key_slot) = key_slot {
            self.emit(Op::GetLocal, line);
            self.emit_byte(iter_slot, line);
            self.emit(Op::GetLocal, line);
            self.emit_byte(index_slot, line);
            self.emit(Op::GetKey, line);
            self.emit(Op::SetLocal, line);
            self.emit_byte(key_slot, line);
            self.emit(Op::Pop, line);
        }
        self.emit(Op::GetLocal, line);
        self.emit_byte(iter_slot, line);
        self.emit(Op::GetLocal, line);
        self.emit_byte(index_slot, line);
        self.emit(Op::GetIndex, line);
        self.emit(Op::SetLocal, line);
        self.emit_byte(value_slot, line);
        self.emit(Op::Pop, line);

        self.compile_block(body, line)?;

        self.set_continue_target();
        self.emit(Op::GetLocal, line);
        self.emit_byte(index_slot, line);
        self.chunk().emit_int(1, line).map_err(|m| self.err(m, line))?;
        self.emit(Op::AddI32, line);
        self.emit(Op::SetLocal, line);
        self.emit_byte(index_slot, line);
        self.emit(Op::Pop, line);
        self.emit_loop(loop_start, line)?;

        self.patch_jump(exit_site, line)?;
        self.emit(Op::Pop, line);
        self.end_loop(line)?;
        self.end_scope(line);
        Ok(())
    }

    fn compile_switch(
        &mut self,
        scrutinee: &Expr,
        case_values: &[Option<Expr>],
        case_bodies: &[Vec<Stmt>],
        line: u32,
    ) -> Result<(), HemlockError> {
        self.begin_scope();
        self.compile_expr(scrutinee)?;
        let scrutinee_slot = self.declare_local("", false, line)?;
        self.begin_loop(true);

        // Dispatch section: one comparison per non-default case, jumping
        // straight to the case body so fallthrough costs nothing.
        let mut body_sites = Vec::with_capacity(case_values.len());
        for value in case_values {
            let Some(value) = value else {
                body_sites.push(None);
                continue;
            };
            self.emit(Op::GetLocal, line);
            self.emit_byte(scrutinee_slot, line);
            self.compile_expr(value)?;
            self.emit(Op::Eq, line);
            let miss_site = self.emit_jump(Op::JumpIfFalse, line);
            self.emit(Op::Pop, line);
            let hit_site = self.emit_jump(Op::Jump, line);
            self.patch_jump(miss_site, line)?;
            self.emit(Op::Pop, line);
            body_sites.push(Some(hit_site));
        }
        let default_site = self.emit_jump(Op::Jump, line);

        // Case bodies in source order; no automatic trailing jump, so a body
        // without `break` falls through into the next one.
        let mut default_target = None;
        for (i, body) in case_bodies.iter().enumerate() {
            match &body_sites[i] {
                Some(site) => self.patch_jump(*site, line)?,
                None => default_target = Some(self.code_len()),
            }
            self.begin_scope();
            for stmt in body {
                self.compile_stmt(stmt)?;
            }
            self.end_scope(line);
        }

        match default_target {
            Some(target) => {
                let delta = target - default_site - 2;
                if delta > u16::MAX as usize {
                    return Err(self.err("Switch body too large", line));
                }
                let chunk = self.chunk();
                chunk.code[default_site] = (delta >> 8) as u8;
                chunk.code[default_site + 1] = (delta & 0xff) as u8;
            }
            None => self.patch_jump(default_site, line)?,
        }

        self.end_loop(line)?;
        self.end_scope(line);
        Ok(())
    }

    fn compile_try(
        &mut self,
        try_block: &[Stmt],
        catch_param: Option<&str>,
        catch_block: Option<&[Stmt]>,
        finally_block: Option<&[Stmt]>,
        line: u32,
    ) -> Result<(), HemlockError> {
        self.emit(Op::Try, line);
        let catch_site = self.code_len();
        self.emit_short(0xffff, line);
        let finally_site = self.code_len();
        self.emit_short(0xffff, line);
        let operand_end = self.code_len();

        self.compile_block(try_block, line)?;
        let to_finally = self.emit_jump(Op::Jump, line);

        // Catch section. The unwinder leaves the exception value on the stack.
        let catch_offset = self.code_len() - operand_end;
        if catch_offset > u16::MAX as usize {
            return Err(self.err("Try body too large", line));
        }
        self.chunk().code[catch_site] = (catch_offset >> 8) as u8;
        self.chunk().code[catch_site + 1] = (catch_offset & 0xff) as u8;
        self.emit(Op::Catch, line);
        match catch_block {
            Some(body) => {
                self.begin_scope();
                match catch_param {
                    Some(param) => {
                        self.declare_local(param, false, line)?;
                    }
                    None => {
                        // Anonymous catch still owns the slot until the scope
                        // closes.
                        self.declare_local("", false, line)?;
                    }
                }
                for stmt in body {
                    self.compile_stmt(stmt)?;
                }
                self.end_scope(line);
            }
            None => self.emit(Op::Pop, line),
        }

        self.patch_jump(to_finally, line)?;
        let finally_offset = self.code_len() - operand_end;
        if finally_offset > u16::MAX as usize {
            return Err(self.err("Try body too large", line));
        }
        self.chunk().code[finally_site] = (finally_offset >> 8) as u8;
        self.chunk().code[finally_site + 1] = (finally_offset & 0xff) as u8;
        self.emit(Op::Finally, line);
        if let Some(body) = finally_block {
            self.compile_block(body, line)?;
        }
        self.emit(Op::EndTry, line);
        Ok(())
    }

    fn compile_defer(&mut self, call: &Expr, line: u32) -> Result<(), HemlockError> {
        // The deferred call becomes the body of a synthetic zero-arity
        // closure so argument expressions are captured, not evaluated now.
        self.functions.push(FnState::new("<defer>"));
        self.compile_expr(call)?;
        self.emit(Op::Pop, line);
        self.emit(Op::Null, line);
        self.emit(Op::Return, line);
        self.finish_function(line)?;
        self.emit(Op::Defer, line);
        Ok(())
    }

    fn compile_enum(
        &mut self,
        name: &str,
        variants: &[(String, Option<Expr>)],
        line: u32,
    ) -> Result<(), HemlockError> {
        let mut next_value: i64 = 0;
        for (variant, value) in variants {
            let index = self.string_const(variant, line)?;
            self.emit(Op::Const, line);
            self.emit_short(index, line);
            let value = match value {
                Some(Expr::Int { value, .. }) => *value,
                Some(Expr::Unary { op: UnaryOp::Negate, operand, .. }) => match operand.as_ref() {
                    Expr::Int { value, .. } => -*value,
                    _ => return Err(self.err("Enum value must be an integer constant", line)),
                },
                Some(_) => return Err(self.err("Enum value must be an integer constant", line)),
                None => next_value,
            };
            next_value = value + 1;
            self.chunk().emit_int(value, line).map_err(|m| self.err(m, line))?;
        }
        self.emit(Op::Object, line);
        self.emit_short(variants.len() as u16, line);

        let in_function_scope =
            self.functions.len() > 1 || self.functions[0].scope_depth > 0;
        if in_function_scope {
            self.declare_local(name, true, line)?;
        } else {
            self.declared_globals.insert(name.to_string());
            let index = self.identifier(name, line)?;
            self.emit(Op::DefineGlobalConst, line);
            self.emit_short(index, line);
        }
        Ok(())
    }

    // ----- expressions -----

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), HemlockError> {
        match expr {
            Expr::Int { value, line } => {
                self.chunk().emit_int(*value, *line).map_err(|m| self.err(m, *line))
            }
            Expr::Float { value, line } => {
                self.chunk().emit_float(*value, *line).map_err(|m| self.err(m, *line))
            }
            Expr::Bool { value, line } => {
                self.emit(if *value { Op::True } else { Op::False }, *line);
                Ok(())
            }
            Expr::Null { line } => {
                self.emit(Op::Null, *line);
                Ok(())
            }
            Expr::Str { value, line } => {
                let index = self.string_const(value, *line)?;
                self.emit(Op::Const, *line);
                self.emit_short(index, *line);
                Ok(())
            }
            Expr::Rune { value, line } => {
                let index = self
                    .chunk()
                    .add_constant(crate::bytecode::Constant::Rune(*value))
                    .map_err(|m| self.err(m, *line))?;
                self.emit(Op::Const, *line);
                self.emit_short(index, *line);
                Ok(())
            }
            Expr::Identifier { name, resolved, line } => {
                self.compile_identifier_get(name, resolved.as_ref().copied(), *line)
            }
            Expr::SelfExpr { line } => {
                self.emit(Op::GetSelf, *line);
                Ok(())
            }
            Expr::Binary { op, left, right, line } => self.compile_binary(*op, left, right, *line),
            Expr::Unary { op, operand, line } => {
                self.compile_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Negate => Op::Negate,
                    UnaryOp::Not => Op::Not,
                    UnaryOp::BitNot => Op::BitNot,
                    UnaryOp::Typeof => Op::Typeof,
                };
                self.emit(opcode, *line);
                Ok(())
            }
            Expr::Ternary { cond, then_expr, else_expr, line } => {
                self.compile_expr(cond)?;
                let else_site = self.emit_jump(Op::JumpIfFalse, *line);
                self.emit(Op::Pop, *line);
                self.compile_expr(then_expr)?;
                let end_site = self.emit_jump(Op::Jump, *line);
                self.patch_jump(else_site, *line)?;
                self.emit(Op::Pop, *line);
                self.compile_expr(else_expr)?;
                self.patch_jump(end_site, *line)
            }
            Expr::Call { func, args, line } => self.compile_call(func, args, *line),
            Expr::Assign { name, value, resolved, line } => {
                self.compile_expr(value)?;
                self.compile_identifier_set(name, resolved.as_ref().copied(), *line)
            }
            Expr::GetProperty { object, property, line } => {
                self.compile_expr(object)?;
                let index = self.identifier(property, *line)?;
                self.emit(Op::GetProperty, *line);
                self.emit_short(index, *line);
                Ok(())
            }
            Expr::SetProperty { object, property, value, line } => {
                self.compile_expr(object)?;
                self.compile_expr(value)?;
                let index = self.identifier(property, *line)?;
                self.emit(Op::SetProperty, *line);
                self.emit_short(index, *line);
                Ok(())
            }
            Expr::Index { object, index, line } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Op::GetIndex, *line);
                Ok(())
            }
            Expr::IndexAssign { object, index, value, line } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit(Op::SetIndex, *line);
                Ok(())
            }
            Expr::ArrayLiteral { elements, line } => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(Op::Array, *line);
                self.emit_short(elements.len() as u16, *line);
                Ok(())
            }
            Expr::ObjectLiteral { field_names, field_values, line } => {
                for (name, value) in field_names.iter().zip(field_values) {
                    let index = self.string_const(name, *line)?;
                    self.emit(Op::Const, *line);
                    self.emit_short(index, *line);
                    self.compile_expr(value)?;
                }
                self.emit(Op::Object, *line);
                self.emit_short(field_names.len() as u16, *line);
                Ok(())
            }
            Expr::PrefixInc { target, line } => self.compile_incdec(target, Op::Add, true, *line),
            Expr::PrefixDec { target, line } => self.compile_incdec(target, Op::Sub, true, *line),
            Expr::PostfixInc { target, line } => self.compile_incdec(target, Op::Add, false, *line),
            Expr::PostfixDec { target, line } => self.compile_incdec(target, Op::Sub, false, *line),
            Expr::NullCoalesce { left, right, line } => {
                self.compile_expr(left)?;
                let skip_site = self.emit_jump(Op::Coalesce, *line);
                self.emit(Op::Pop, *line);
                self.compile_expr(right)?;
                self.patch_jump(skip_site, *line)
            }
            Expr::OptionalChain { object, property, index, is_call, args, line } => {
                self.compile_optional_chain(object, property.as_deref(), index.as_deref(), *is_call, args, *line)
            }
            Expr::StringInterp { string_parts, expr_parts, line } => {
                for (i, part) in string_parts.iter().enumerate() {
                    let index = self.string_const(part, *line)?;
                    self.emit(Op::Const, *line);
                    self.emit_short(index, *line);
                    if i < expr_parts.len() {
                        self.compile_expr(&expr_parts[i])?;
                    }
                }
                let total = string_parts.len() + expr_parts.len();
                self.emit(Op::StringInterp, *line);
                self.emit_short(total as u16, *line);
                Ok(())
            }
            Expr::Function { name, params, rest_param, body, is_async, line } => {
                self.compile_function(name.as_deref(), params, rest_param.as_deref(), body, *is_async, *line)
            }
            Expr::Await { operand, line } => {
                self.compile_expr(operand)?;
                self.emit(Op::Await, *line);
                Ok(())
            }
        }
    }

    fn compile_identifier_get(
        &mut self,
        name: &str,
        resolved: Option<crate::ast::Resolved>,
        line: u32,
    ) -> Result<(), HemlockError> {
        if let Some(resolved) = resolved {
            if resolved.depth == 0 {
                self.emit(Op::GetLocal, line);
                self.emit_byte(resolved.slot as u8, line);
                return Ok(());
            }
        }
        let fn_index = self.functions.len() - 1;
        if let Some(slot) = self.resolve_local_in(fn_index, name) {
            self.emit(Op::GetLocal, line);
            self.emit_byte(slot, line);
            return Ok(());
        }
        if let Some(index) = self.resolve_upvalue(fn_index, name, line)? {
            self.emit(Op::GetUpvalue, line);
            self.emit_byte(index, line);
            return Ok(());
        }
        let index = self.identifier(name, line)?;
        self.emit(Op::GetGlobal, line);
        self.emit_short(index, line);
        Ok(())
    }

    fn compile_identifier_set(
        &mut self,
        name: &str,
        resolved: Option<crate::ast::Resolved>,
        line: u32,
    ) -> Result<(), HemlockError> {
        if let Some(resolved) = resolved {
            if resolved.depth == 0 {
                self.emit(Op::SetLocal, line);
                self.emit_byte(resolved.slot as u8, line);
                return Ok(());
            }
        }
        let fn_index = self.functions.len() - 1;
        if let Some(slot) = self.resolve_local_in(fn_index, name) {
            if self.local_is_const(fn_index, slot) {
                return Err(self.err(format!("Cannot reassign constant '{}'", name), line));
            }
            self.emit(Op::SetLocal, line);
            self.emit_byte(slot, line);
            return Ok(());
        }
        if let Some(index) = self.resolve_upvalue(fn_index, name, line)? {
            self.emit(Op::SetUpvalue, line);
            self.emit_byte(index, line);
            return Ok(());
        }
        let index = self.identifier(name, line)?;
        self.emit(Op::SetGlobal, line);
        self.emit_short(index, line);
        Ok(())
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        line: u32,
    ) -> Result<(), HemlockError> {
        match op {
            BinaryOp::And => {
                self.compile_expr(left)?;
                let end_site = self.emit_jump(Op::JumpIfFalse, line);
                self.emit(Op::Pop, line);
                self.compile_expr(right)?;
                return self.patch_jump(end_site, line);
            }
            BinaryOp::Or => {
                self.compile_expr(left)?;
                let end_site = self.emit_jump(Op::JumpIfTrue, line);
                self.emit(Op::Pop, line);
                self.compile_expr(right)?;
                return self.patch_jump(end_site, line);
            }
            _ => {}
        }

        self.compile_expr(left)?;
        self.compile_expr(right)?;
        // Integer-literal operands pick the i32 fast path; the VM falls back
        // to the generic operation when the runtime types don't cooperate.
        let literal_int =
            matches!(left, Expr::Int { .. }) || matches!(right, Expr::Int { .. });
        let opcode = match op {
            BinaryOp::Add => {
                if literal_int {
                    Op::AddI32
                } else {
                    Op::Add
                }
            }
            BinaryOp::Sub => {
                if literal_int {
                    Op::SubI32
                } else {
                    Op::Sub
                }
            }
            BinaryOp::Mul => {
                if literal_int {
                    Op::MulI32
                } else {
                    Op::Mul
                }
            }
            BinaryOp::Div => Op::Div,
            BinaryOp::Mod => Op::Mod,
            BinaryOp::Eq => {
                if literal_int {
                    Op::EqI32
                } else {
                    Op::Eq
                }
            }
            BinaryOp::Ne => Op::Ne,
            BinaryOp::Lt => {
                if literal_int {
                    Op::LtI32
                } else {
                    Op::Lt
                }
            }
            BinaryOp::Le => Op::Le,
            BinaryOp::Gt => Op::Gt,
            BinaryOp::Ge => Op::Ge,
            BinaryOp::BitAnd => Op::BitAnd,
            BinaryOp::BitOr => Op::BitOr,
            BinaryOp::BitXor => Op::BitXor,
            BinaryOp::Shl => Op::Shl,
            BinaryOp::Shr => Op::Shr,
            BinaryOp::And | BinaryOp::Or => unreachable!(),
        };
        self.emit(opcode, line);
        Ok(())
    }

    fn compile_call(&mut self, func: &Expr, args: &[Expr], line: u32) -> Result<(), HemlockError> {
        if args.len() > u8::MAX as usize {
            return Err(self.err("Too many call arguments", line));
        }

        // Method call: receiver, args, CALL_METHOD.
        if let Expr::GetProperty { object, property, .. } = func {
            self.compile_expr(object)?;
            for arg in args {
                self.compile_expr(arg)?;
            }
            let index = self.identifier(property, line)?;
            self.emit(Op::CallMethod, line);
            self.emit_short(index, line);
            self.emit_byte(args.len() as u8, line);
            return Ok(());
        }

        if let Expr::Identifier { name, .. } = func {
            let fn_index = self.functions.len() - 1;
            let shadowed = self.resolve_local_in(fn_index, name).is_some()
                || self.resolve_upvalue(fn_index, name, line)?.is_some()
                || self.declared_globals.contains(name);
            if !shadowed {
                if name == "print" {
                    for arg in args {
                        self.compile_expr(arg)?;
                    }
                    self.emit(Op::Print, line);
                    self.emit_byte(args.len() as u8, line);
                    return Ok(());
                }
                if let Some(id) = builtins::builtin_id(name) {
                    for arg in args {
                        self.compile_expr(arg)?;
                    }
                    self.emit(Op::CallBuiltin, line);
                    self.emit_short(id, line);
                    self.emit_byte(args.len() as u8, line);
                    return Ok(());
                }
            }
        }

        self.compile_expr(func)?;
        for arg in args {
            self.compile_expr(arg)?;
        }
        self.emit(Op::Call, line);
        self.emit_byte(args.len() as u8, line);
        Ok(())
    }

    fn compile_incdec(
        &mut self,
        target: &Expr,
        op: Op,
        is_prefix: bool,
        line: u32,
    ) -> Result<(), HemlockError> {
        match target {
            Expr::Identifier { name, resolved, .. } => {
                self.compile_identifier_get(name, resolved.as_ref().copied(), line)?;
                if !is_prefix {
                    self.emit(Op::Dup, line);
                }
                self.chunk().emit_int(1, line).map_err(|m| self.err(m, line))?;
                self.emit(op, line);
                if is_prefix {
                    self.emit(Op::Dup, line);
                }
                self.compile_identifier_set(name, resolved.as_ref().copied(), line)?;
                self.emit(Op::Pop, line);
                Ok(())
            }
            Expr::Index { object, index, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                if is_prefix {
                    // [o i] -> [o i new] -> [new]
                    self.emit(Op::Dup2, line);
                    self.emit(Op::GetIndex, line);
                    self.chunk().emit_int(1, line).map_err(|m| self.err(m, line))?;
                    self.emit(op, line);
                    self.emit(Op::SetIndex, line);
                } else {
                    // [o i] -> [old o i] -> [old o i new] -> [old new] -> [old]
                    self.emit(Op::Dup2, line);
                    self.emit(Op::GetIndex, line);
                    self.emit(Op::Bury3, line);
                    self.emit(Op::Dup2, line);
                    self.emit(Op::GetIndex, line);
                    self.chunk().emit_int(1, line).map_err(|m| self.err(m, line))?;
                    self.emit(op, line);
                    self.emit(Op::SetIndex, line);
                    self.emit(Op::Pop, line);
                }
                Ok(())
            }
            Expr::GetProperty { object, property, .. } => {
                let index = self.identifier(property, line)?;
                self.compile_expr(object)?;
                if is_prefix {
                    // [o] -> [o old] -> [o new] -> [new]
                    self.emit(Op::Dup, line);
                    self.emit(Op::GetProperty, line);
                    self.emit_short(index, line);
                    self.chunk().emit_int(1, line).map_err(|m| self.err(m, line))?;
                    self.emit(op, line);
                    self.emit(Op::SetProperty, line);
                    self.emit_short(index, line);
                } else {
                    // [o] -> [o old] -> [old o] -> [old o old] -> [old o new]
                    // -> [old new] -> [old]
                    self.emit(Op::Dup, line);
                    self.emit(Op::GetProperty, line);
                    self.emit_short(index, line);
                    self.emit(Op::Swap, line);
                    self.emit(Op::Dup, line);
                    self.emit(Op::GetProperty, line);
                    self.emit_short(index, line);
                    self.chunk().emit_int(1, line).map_err(|m| self.err(m, line))?;
                    self.emit(op, line);
                    self.emit(Op::SetProperty, line);
                    self.emit_short(index, line);
                    self.emit(Op::Pop, line);
                }
                Ok(())
            }
            _ => Err(self.err("Invalid increment operand", line)),
        }
    }

    fn compile_optional_chain(
        &mut self,
        object: &Expr,
        property: Option<&str>,
        index: Option<&Expr>,
        is_call: bool,
        args: &[Expr],
        line: u32,
    ) -> Result<(), HemlockError> {
        self.compile_expr(object)?;
        let skip_site = self.emit_jump(Op::OptionalChain, line);
        match (property, index, is_call) {
            (Some(property), None, true) => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                let idx = self.identifier(property, line)?;
                self.emit(Op::CallMethod, line);
                self.emit_short(idx, line);
                self.emit_byte(args.len() as u8, line);
            }
            (Some(property), None, false) => {
                let idx = self.identifier(property, line)?;
                self.emit(Op::GetProperty, line);
                self.emit_short(idx, line);
            }
            (None, Some(index), false) => {
                self.compile_expr(index)?;
                self.emit(Op::GetIndex, line);
            }
            (None, None, true) => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Op::Call, line);
                self.emit_byte(args.len() as u8, line);
            }
            _ => return Err(self.err("Malformed optional chain", line)),
        }
        self.patch_jump(skip_site, line)
    }

    fn compile_function(
        &mut self,
        name: Option<&str>,
        params: &[Param],
        rest_param: Option<&str>,
        body: &[Stmt],
        is_async: bool,
        line: u32,
    ) -> Result<(), HemlockError> {
        if params.len() > u8::MAX as usize {
            return Err(self.err("Too many parameters", line));
        }
        let mut optional_count = 0u8;
        for param in params {
            if param.default.is_some() {
                optional_count += 1;
            } else if optional_count > 0 {
                return Err(self.err(
                    "Required parameter cannot follow an optional parameter",
                    line,
                ));
            }
        }

        self.functions.push(FnState::new(name.unwrap_or("")));
        self.state().chunk.arity = params.len() as u8;
        self.state().chunk.optional_params = optional_count;
        self.state().chunk.has_rest = rest_param.is_some();
        self.state().chunk.is_async = is_async;

        for param in params {
            self.declare_local(&param.name, false, line)?;
        }
        if let Some(rest) = rest_param {
            self.declare_local(rest, false, line)?;
        }

        // Missing optional arguments arrive as null; patch in the defaults.
        for (i, param) in params.iter().enumerate() {
            let Some(default) = &param.default else { continue };
            let slot = (i + 1) as u8;
            self.emit(Op::GetLocal, line);
            self.emit_byte(slot, line);
            let skip_site = self.emit_jump(Op::Coalesce, line);
            self.emit(Op::Pop, line);
            self.compile_expr(default)?;
            self.emit(Op::SetLocal, line);
            self.emit_byte(slot, line);
            self.patch_jump(skip_site, line)?;
            self.emit(Op::Pop, line);
        }

        // The function scope is the body scope; no extra begin_scope here.
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.emit(Op::Null, line);
        self.emit(Op::Return, line);

        self.finish_function(line)
    }

    /// Pop the innermost function state and emit the CLOSURE instruction for
    /// it in the enclosing function.
    fn finish_function(&mut self, line: u32) -> Result<(), HemlockError> {
        let mut state = self.functions.pop().unwrap();
        state.chunk.local_count = state.max_locals;
        let upvalues = state.chunk.upvalues.clone();
        let index =
            self.chunk().add_function(Arc::new(state.chunk)).map_err(|m| self.err(m, line))?;
        self.emit(Op::Closure, line);
        self.emit_short(index, line);
        self.emit_byte(upvalues.len() as u8, line);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8, line);
            self.emit_byte(upvalue.index, line);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Constant;
    use crate::parser::parse_program;

    fn compile(source: &str) -> Arc<Chunk> {
        compile_program(&parse_program(source).unwrap()).unwrap()
    }

    fn compile_err(source: &str) -> Vec<HemlockError> {
        compile_program(&parse_program(source).unwrap()).unwrap_err()
    }

    /// Walk a chunk's code verifying every jump placeholder was patched and
    /// every local/upvalue reference stays in bounds.
    fn verify_chunk(chunk: &Chunk) {
        let mut ip = 0;
        while ip < chunk.code.len() {
            let op = Op::from_byte(chunk.code[ip]).expect("undefined opcode byte");
            ip += 1;
            match op {
                Op::Jump | Op::JumpIfFalse | Op::JumpIfTrue | Op::Coalesce | Op::OptionalChain => {
                    let delta = chunk.read_short(ip) as usize;
                    assert_ne!(delta, 0xffff, "unpatched jump at {}", ip - 1);
                    assert!(ip + 2 + delta <= chunk.code.len(), "jump out of range");
                    ip += 2;
                }
                Op::Loop => {
                    let delta = chunk.read_short(ip) as usize;
                    assert!(delta <= ip + 2, "loop target before chunk start");
                    ip += 2;
                }
                Op::Try => {
                    assert_ne!(chunk.read_short(ip), 0xffff, "unpatched catch offset");
                    assert_ne!(chunk.read_short(ip + 2), 0xffff, "unpatched finally offset");
                    ip += 4;
                }
                Op::GetLocal | Op::SetLocal => {
                    let slot = chunk.code[ip] as usize;
                    assert!(slot < chunk.local_count, "local slot {} out of range", slot);
                    ip += 1;
                }
                Op::GetUpvalue | Op::SetUpvalue => {
                    let index = chunk.code[ip] as usize;
                    assert!(index < chunk.upvalues.len(), "upvalue index out of range");
                    ip += 1;
                }
                Op::Const => {
                    let index = chunk.read_short(ip) as usize;
                    assert!(index < chunk.constants.len());
                    ip += 2;
                }
                Op::Closure => {
                    let index = chunk.read_short(ip) as usize;
                    let upvalue_count = chunk.code[ip + 2] as usize;
                    ip += 3 + upvalue_count * 2;
                    match &chunk.constants[index] {
                        Constant::Chunk(child) => verify_chunk(child),
                        other => panic!("CLOSURE operand is not a chunk: {:?}", other),
                    }
                }
                Op::ConstByte | Op::PopN | Op::Call | Op::Print | Op::Cast => ip += 1,
                Op::GetGlobal | Op::SetGlobal | Op::DefineGlobal | Op::DefineGlobalConst
                | Op::GetProperty | Op::SetProperty | Op::SetObjType | Op::Array | Op::Object
                | Op::StringInterp => ip += 2,
                Op::CallMethod | Op::CallBuiltin => ip += 3,
                _ => {}
            }
        }
    }

    #[test]
    fn every_jump_is_patched() {
        let chunk = compile(
            r#"
            let x = 0;
            if (x < 3) { x = 1; } else { x = 2; }
            while (x < 10) { x = x + 1; if (x == 5) { break; } continue; }
            for (let i = 0; i < 3; i++) { x = x + i; }
            switch (x) { case 1: x = 2; case 2: break; default: x = 0; }
            try { throw "a"; } catch (e) { x = 4; } finally { x = 5; }
            let f = fn(a, b = 1) { return a ?? b; };
            "#,
        );
        verify_chunk(&chunk);
    }

    #[test]
    fn closure_counter_captures_one_upvalue() {
        let chunk = compile(
            "let make = fn() { let n = 0; return fn() { n = n + 1; return n; }; };",
        );
        // root -> make -> inner
        let make = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Chunk(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        let inner = make
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Chunk(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(inner.upvalues.len(), 1);
        assert!(inner.upvalues[0].is_local);
        verify_chunk(&chunk);
    }

    #[test]
    fn nested_capture_threads_through_intermediate_function() {
        let chunk = compile(
            "let f = fn() { let a = 1; return fn() { return fn() { return a; }; }; };",
        );
        let f = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Chunk(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        let mid = f
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Chunk(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        let inner = mid
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Chunk(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        assert!(mid.upvalues[0].is_local);
        assert!(!inner.upvalues[0].is_local);
    }

    #[test]
    fn duplicate_local_is_a_compile_error() {
        let errors = compile_err("let f = fn() { let a = 1; let a = 2; };");
        assert!(errors[0].message.contains("already declared"));
    }

    #[test]
    fn const_reassignment_rejected_for_locals() {
        let errors = compile_err("let f = fn() { const a = 1; a = 2; };");
        assert!(errors[0].message.contains("Cannot reassign constant"));
    }

    #[test]
    fn small_int_literals_use_const_byte() {
        let chunk = compile("let x = 7;");
        assert_eq!(chunk.code[0], Op::ConstByte as u8);
        assert_eq!(chunk.code[1], 7);
    }

    #[test]
    fn builtin_calls_lower_to_call_builtin() {
        let chunk = compile("sleep(1);");
        assert!(chunk.code.contains(&(Op::CallBuiltin as u8)));
    }

    #[test]
    fn shadowed_builtin_uses_generic_call() {
        let chunk = compile("let sleep = fn(n) { return n; }; sleep(1);");
        assert!(!chunk.code.contains(&(Op::CallBuiltin as u8)));
    }

    #[test]
    fn print_lowers_to_print_opcode() {
        let chunk = compile("print(1, 2);");
        let pos = chunk.code.iter().position(|b| *b == Op::Print as u8).unwrap();
        assert_eq!(chunk.code[pos + 1], 2);
    }

    #[test]
    fn method_call_lowers_to_call_method() {
        let chunk = compile("let a = [1]; a.push(2);");
        assert!(chunk.code.contains(&(Op::CallMethod as u8)));
    }

    #[test]
    fn enum_lowers_to_const_object_with_auto_values() {
        let chunk = compile("enum Color { Red, Green = 5, Blue }");
        assert!(chunk.code.contains(&(Op::DefineGlobalConst as u8)));
        // Blue auto-increments from the explicit 5.
        assert!(chunk.code.windows(2).any(|w| w == [Op::ConstByte as u8, 6]));
        verify_chunk(&chunk);
    }

    #[test]
    fn local_count_covers_hidden_for_in_slots() {
        let chunk = compile("let f = fn(o) { for (k, v in o) { k; } };");
        let inner = chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Chunk(c) => Some(c.clone()),
                _ => None,
            })
            .unwrap();
        // slot0 + param + iter + index + key + value
        assert!(inner.local_count >= 6);
        verify_chunk(&chunk);
    }
}
