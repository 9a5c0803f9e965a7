/// AST → bytecode compiler.
///
/// Walks a pre-built AST (the front-end collaborator's output) and emits a
/// register-based instruction stream through `CodeGen`. The module block
/// owns local slot 0 as `__env`, a fresh map that doubles as the module's
/// export namespace; every other function reserves slot 0 for the implicit
/// receiver and puts declared parameters in slots 1..=N.
///
/// Free identifiers resolve local → upvalue → `__env` field. Comparisons
/// lower to the fused CMP + JMP pair; small-integer operands collapse to the
/// immediate opcode forms (ADDI, EQI, LTI, LEI, EQK).
///
/// Errors are reported through the installed handler and collected; lowering
/// continues best-effort and callers discard the chunk when `has_error()`.

use crate::ast::{self, BinaryOp, Block, ClassMember, Expr, ForInit, Stmt, UnaryOp};
use crate::bytecode::{CompiledChunk, Op};
use crate::codegen::CodeGen;
use crate::core::value::ConstantValue;
use crate::errors::{CompileError, SourceLocation};

pub type ErrorHandler = Box<dyn FnMut(&CompileError)>;

const ENV_SLOT: u8 = 0;
const ENV_NAME: &str = "__env";
const MAX_CONST_BYTE: u16 = 255;

/// Resolved assignment target.
enum LValue {
    Local(u8),
    Upvalue(u8),
    /// Module-root global: a field of the env map sitting in slot 0.
    Global(u8),
    Field { obj: u8, name_idx: u8 },
    Index { obj: u8, key: u8 },
}

pub struct Compiler {
    module_name: String,
    filename: String,
    cg: CodeGen,
    exports: Vec<String>,
    errors: Vec<CompileError>,
    error_handler: Option<ErrorHandler>,
    has_error: bool,
}

impl Compiler {
    pub fn new(module_name: impl Into<String>, filename: impl Into<String>) -> Self {
        Compiler {
            module_name: module_name.into(),
            filename: filename.into(),
            cg: CodeGen::new(),
            exports: Vec::new(),
            errors: Vec::new(),
            error_handler: None,
            has_error: false,
        }
    }

    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    /// Compile a module block into a chunk. The result must be discarded if
    /// `has_error()` reports true.
    pub fn compile(&mut self, block: &Block) -> CompiledChunk {
        self.cg.set_line(block.loc.line);
        self.cg.begin_function(&self.module_name.clone(), &self.filename.clone(), 0, false);

        // Slot 0: the module's export namespace, linked to the root
        // environment for builtin lookups.
        self.cg.add_local(ENV_NAME);
        self.cg.mark_initialized();
        self.cg.emit_abc(Op::NewMap, ENV_SLOT, 0, 1);

        for stmt in &block.statements {
            self.compile_statement(stmt);
        }

        self.cg.emit_abc(Op::Return, ENV_SLOT, 2, 0);

        self.drain_gen_errors();
        let main_proto = self.cg.end_function();
        let mut chunk = CompiledChunk::new(self.module_name.clone(), main_proto);
        chunk.exports = self.exports.clone();
        chunk
    }

    // ── Statements ───────────────────────────────────────────────────────────

    fn compile_statement(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Block(block) => self.compile_block(block),
            Stmt::VarDecl { name, initializer, exported, loc } => {
                self.compile_var_decl(name, initializer.as_ref(), *exported, *loc);
            }
            Stmt::MultiVarDecl { names, initializer, exported, loc } => {
                self.compile_multi_var_decl(names, initializer.as_ref(), *exported, *loc);
            }
            Stmt::FunctionDecl { name, params, is_variadic, body, exported, loc } => {
                self.compile_function_decl(name, params, *is_variadic, body, *exported, *loc);
            }
            Stmt::ClassDecl { name, members, exported, loc } => {
                self.compile_class_decl(name, members, *exported, *loc);
            }
            Stmt::If { condition, then_block, else_ifs, else_block, loc } => {
                self.compile_if(condition, then_block, else_ifs, else_block.as_ref(), *loc);
            }
            Stmt::While { condition, body, loc } => self.compile_while(condition, body, *loc),
            Stmt::ForC { initializer, condition, updates, body, loc } => {
                self.compile_for_c(initializer.as_ref(), condition.as_ref(), updates, body, *loc);
            }
            Stmt::ForEach { vars, iterable, body, loc } => {
                self.compile_for_each(vars, iterable, body, *loc);
            }
            Stmt::Return { values, loc } => self.compile_return(values, *loc),
            Stmt::Break { loc } => self.compile_break(*loc),
            Stmt::Continue { loc } => self.compile_continue(*loc),
            Stmt::Assignment { targets, values, loc } => {
                self.compile_assignment(targets, values, *loc);
            }
            Stmt::UpdateAssignment { target, op, value, loc } => {
                self.compile_update_assignment(target, *op, value, *loc);
            }
            Stmt::ExprStmt { expr, loc } => {
                self.cg.set_line(loc.line);
                let slot = self.cg.alloc_slot();
                self.compile_expression(expr, slot);
                self.cg.free_slots(1);
            }
            Stmt::ImportNamespace { module, alias, loc } => {
                self.compile_import_namespace(module, alias, *loc);
            }
            Stmt::ImportNamed { module, specifiers, loc } => {
                self.compile_import_named(module, specifiers, *loc);
            }
            Stmt::Defer { body, loc } => self.compile_defer(body, *loc),
        }
    }

    fn compile_block(&mut self, block: &Block) {
        self.cg.set_line(block.loc.line);
        self.cg.begin_scope();
        for stmt in &block.statements {
            self.compile_statement(stmt);
        }
        self.cg.end_scope();
    }

    fn compile_var_decl(
        &mut self,
        name: &str,
        initializer: Option<&Expr>,
        exported: bool,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        let module_root = self.cg.at_module_root();
        let slot = self.cg.add_local(name);

        match initializer {
            Some(init) => self.compile_expression(init, slot),
            None => {
                self.cg.emit_abc(Op::LoadNil, slot, 0, 0);
            }
        }
        self.cg.mark_initialized();

        if exported {
            self.exports.push(name.to_string());
        }
        if module_root {
            self.emit_store_to_env(name, slot);
        }
    }

    fn compile_multi_var_decl(
        &mut self,
        names: &[String],
        initializer: Option<&Expr>,
        exported: bool,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        let module_root = self.cg.at_module_root();
        let num_vars = names.len();
        if num_vars == 0 {
            return;
        }
        let base = self.cg.alloc_slots(num_vars as u16);

        match initializer {
            Some(Expr::Call { callee, args, loc }) => {
                self.compile_call(callee, args, base, num_vars as u8, *loc);
            }
            Some(init) => {
                self.compile_expression(init, base);
                if num_vars > 1 {
                    self.cg.emit_abc(Op::LoadNil, base + 1, (num_vars - 2) as u8, 0);
                }
            }
            None => {
                self.cg.emit_abc(Op::LoadNil, base, (num_vars - 1) as u8, 0);
            }
        }

        for (i, name) in names.iter().enumerate() {
            self.cg.add_local_at(name, base + i as u8);
            self.cg.mark_initialized();
            if exported {
                self.exports.push(name.clone());
            }
            if module_root {
                self.emit_store_to_env(name, base + i as u8);
            }
        }
    }

    fn compile_function_decl(
        &mut self,
        name: &str,
        params: &[String],
        is_variadic: bool,
        body: &Block,
        exported: bool,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        let module_root = self.cg.at_module_root();
        // Declared before the body compiles so the function can recurse
        // through its own name (captured as an upvalue).
        let name_slot = self.cg.add_local(name);
        self.cg.mark_initialized();

        let proto_idx = self.compile_function_body(name, params, is_variadic, body, false);
        self.cg.emit_abx(Op::Closure, name_slot, proto_idx);

        if exported {
            self.exports.push(name.to_string());
        }
        if module_root {
            self.emit_store_to_env(name, name_slot);
        }
    }

    /// Compile a function body into a nested prototype, returning its index
    /// in the enclosing prototype's nested list.
    ///
    /// Slot 0 is the receiver: named `this` for methods (and when the first
    /// formal is literally `this`/`self`), anonymous otherwise so that
    /// `this` stays a compile error in plain functions.
    fn compile_function_body(
        &mut self,
        name: &str,
        params: &[String],
        is_variadic: bool,
        body: &Block,
        is_method: bool,
    ) -> u16 {
        let explicit_receiver =
            !is_method && matches!(params.first().map(String::as_str), Some("this") | Some("self"));
        let user_params: &[String] = if explicit_receiver { &params[1..] } else { params };

        self.cg.begin_function(name, &self.filename.clone(), user_params.len() as u8, is_variadic);

        if is_method {
            self.cg.add_local("this");
        } else if explicit_receiver {
            let receiver_name = params[0].clone();
            self.cg.add_local(&receiver_name);
        } else {
            self.cg.add_local("");
        }
        self.cg.mark_initialized();

        for param in user_params {
            self.cg.add_local(param);
            self.cg.mark_initialized();
        }
        if is_variadic {
            // Excess arguments arrive collected into a list in this slot.
            self.cg.add_local("...");
            self.cg.mark_initialized();
        }

        self.compile_block(body);
        self.cg.emit_abc(Op::Return, 0, 1, 0);

        let proto = self.cg.end_function();
        let protos = &mut self.cg.current().proto.protos;
        let idx = protos.len() as u16;
        protos.push(proto);
        idx
    }

    fn compile_class_decl(
        &mut self,
        name: &str,
        members: &[ClassMember],
        exported: bool,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        let module_root = self.cg.at_module_root();
        let slot = self.cg.add_local(name);
        self.cg.mark_initialized();

        let name_idx = self.cg.add_string_constant(name);
        self.cg.emit_abx(Op::NewClass, slot, name_idx);

        for member in members {
            match member {
                ClassMember::Method { name: method_name, params, is_variadic, body, loc } => {
                    self.cg.set_line(loc.line);
                    let method_idx = self.cg.add_string_constant(method_name);
                    let temp = self.cg.alloc_slot();
                    let proto_idx =
                        self.compile_function_body(method_name, params, *is_variadic, body, true);
                    self.cg.emit_abx(Op::Closure, temp, proto_idx);
                    self.emit_set_member(slot, method_idx, temp);
                    self.cg.free_slots(1);
                }
                ClassMember::Field { name: field_name, initializer, loc } => {
                    let Some(init) = initializer else { continue };
                    self.cg.set_line(loc.line);
                    let field_idx = self.cg.add_string_constant(field_name);
                    let temp = self.cg.alloc_slot();
                    self.compile_expression(init, temp);
                    self.emit_set_member(slot, field_idx, temp);
                    self.cg.free_slots(1);
                }
            }
        }

        if exported {
            self.exports.push(name.to_string());
        }
        if module_root {
            self.emit_store_to_env(name, slot);
        }
    }

    /// `obj.K[name_idx] = R[src]`, spilling the key through a register when
    /// the constant index does not fit the byte operand.
    fn emit_set_member(&mut self, obj: u8, name_idx: u16, src: u8) {
        if name_idx <= MAX_CONST_BYTE {
            self.cg.emit_abc(Op::SetField, obj, name_idx as u8, src);
        } else {
            let key = self.cg.alloc_slot();
            self.cg.emit_abx(Op::LoadK, key, name_idx);
            self.cg.emit_abc(Op::SetIndex, obj, key, src);
            self.cg.free_slots(1);
        }
    }

    // ── Conditions & control flow ────────────────────────────────────────────

    /// Lower a condition and return the pc of the JMP taken when it fails.
    /// Binary comparisons fuse into CMP + JMP (with the immediate/constant
    /// forms when the right operand is a small literal); anything else tests
    /// truthiness.
    fn compile_condition(&mut self, expr: &Expr) -> usize {
        if let Expr::Binary { op, left, right, loc } = expr {
            if op.is_comparison() {
                self.cg.set_line(loc.line);
                let (left_slot, left_temp) = self.expr_to_slot(left);
                self.emit_comparison(*op, left_slot, right);
                if left_temp {
                    self.cg.free_slots(1);
                }
                return self.cg.emit_jump(Op::Jmp);
            }
        }

        let slot = self.cg.alloc_slot();
        self.compile_expression(expr, slot);
        self.cg.emit_abc(Op::Test, slot, 0, 0);
        self.cg.free_slots(1);
        self.cg.emit_jump(Op::Jmp)
    }

    /// Emit the comparison instruction for `R[left] op right`, choosing the
    /// immediate/constant collapsed form where the operand allows it. The
    /// caller emits the companion JMP.
    fn emit_comparison(&mut self, op: BinaryOp, left_slot: u8, right: &Expr) {
        // NE/GE/GT are the K-flipped forms of EQ/LT/LE.
        let k: u8 = match op {
            BinaryOp::Ne | BinaryOp::Ge | BinaryOp::Gt => 1,
            _ => 0,
        };
        let eq_ne = matches!(op, BinaryOp::Eq | BinaryOp::Ne);
        let lt_ge = matches!(op, BinaryOp::Lt | BinaryOp::Ge);

        if eq_ne {
            if let Some(imm) = small_int(right) {
                self.cg.emit_abc(Op::EqI, left_slot, imm as u8, k);
                return;
            }
            if let Some(const_idx) = self.const_for_eqk(right) {
                self.cg.emit_abc(Op::EqK, left_slot, const_idx, k);
                return;
            }
        } else if let Some(imm) = small_int(right) {
            let imm_op = if lt_ge { Op::LtI } else { Op::LeI };
            self.cg.emit_abc(imm_op, left_slot, imm as u8, k);
            return;
        }

        let (right_slot, right_temp) = self.expr_to_slot(right);
        let std_op = if eq_ne {
            Op::Eq
        } else if lt_ge {
            Op::Lt
        } else {
            Op::Le
        };
        self.cg.emit_abc(std_op, left_slot, right_slot, k);
        if right_temp {
            self.cg.free_slots(1);
        }
    }

    fn compile_if(
        &mut self,
        condition: &Expr,
        then_block: &Block,
        else_ifs: &[(Expr, Block)],
        else_block: Option<&Block>,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        let jump_to_else = self.compile_condition(condition);
        self.compile_block(then_block);

        let mut end_jumps = Vec::new();
        if !else_ifs.is_empty() || else_block.is_some() {
            end_jumps.push(self.cg.emit_jump(Op::Jmp));
        }
        self.cg.patch_jump(jump_to_else);

        for (cond, block) in else_ifs {
            let jump_to_next = self.compile_condition(cond);
            self.compile_block(block);
            end_jumps.push(self.cg.emit_jump(Op::Jmp));
            self.cg.patch_jump(jump_to_next);
        }

        if let Some(block) = else_block {
            self.compile_block(block);
        }

        for jump in end_jumps {
            self.cg.patch_jump(jump);
        }
    }

    fn compile_while(&mut self, condition: &Expr, body: &Block, loc: SourceLocation) {
        self.cg.set_line(loc.line);
        let loop_start = self.cg.current_pc();
        self.cg.begin_loop(loop_start);

        let exit_jump = self.compile_condition(condition);
        self.compile_block(body);
        self.emit_loop_back(loop_start);

        self.cg.patch_jump(exit_jump);
        self.cg.patch_breaks();
        self.cg.patch_continues(loop_start);
        self.cg.end_loop();
    }

    fn emit_loop_back(&mut self, loop_start: usize) {
        let offset = loop_start as i32 - self.cg.current_pc() as i32 - 1;
        self.cg.emit_asbx(Op::Jmp, 0, offset);
    }

    fn compile_for_c(
        &mut self,
        initializer: Option<&ForInit>,
        condition: Option<&Expr>,
        updates: &[Stmt],
        body: &Block,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        if self.try_compile_numeric_loop(initializer, condition, updates, body) {
            return;
        }

        self.cg.begin_scope();
        match initializer {
            Some(ForInit::Decls(decls)) => {
                for decl in decls {
                    self.compile_statement(decl);
                }
            }
            Some(ForInit::Assign(assign)) => self.compile_statement(assign),
            Some(ForInit::Exprs(exprs)) => {
                for expr in exprs {
                    let slot = self.cg.alloc_slot();
                    self.compile_expression(expr, slot);
                    self.cg.free_slots(1);
                }
            }
            None => {}
        }

        let loop_start = self.cg.current_pc();
        self.cg.begin_loop(loop_start);

        let exit_jump = condition.map(|cond| self.compile_condition(cond));
        self.compile_block(body);

        let continue_target = self.cg.current_pc();
        for update in updates {
            self.compile_statement(update);
        }
        self.emit_loop_back(loop_start);

        if let Some(jump) = exit_jump {
            self.cg.patch_jump(jump);
        }
        self.cg.patch_breaks();
        self.cg.patch_continues(continue_target);
        self.cg.end_loop();
        self.cg.end_scope();
    }

    /// Detect the canonical counting loop `for (var i = a; i < b; i += k)`
    /// and lower it to FORPREP/FORLOOP with index/limit/step in three
    /// consecutive slots. A `<` bound is tightened by one so the loop test
    /// is uniformly `index <= limit`.
    fn try_compile_numeric_loop(
        &mut self,
        initializer: Option<&ForInit>,
        condition: Option<&Expr>,
        updates: &[Stmt],
        body: &Block,
    ) -> bool {
        let Some(ForInit::Decls(decls)) = initializer else { return false };
        let [Stmt::VarDecl { name: var_name, initializer: var_init, .. }] = decls.as_slice() else {
            return false;
        };
        let Some(Expr::Binary { op, left, right, .. }) = condition else { return false };
        if !matches!(op, BinaryOp::Lt | BinaryOp::Le) {
            return false;
        }
        let Expr::Identifier { name: cond_name, .. } = left.as_ref() else { return false };
        if cond_name != var_name {
            return false;
        }
        let [update] = updates else { return false };
        let Some(step_expr) = step_expression(var_name, update) else { return false };

        self.cg.begin_scope();

        let index_slot = self.cg.add_local(var_name);
        match var_init {
            Some(init) => self.compile_expression(init, index_slot),
            None => {
                self.cg.emit_abc(Op::LoadNil, index_slot, 0, 0);
            }
        }
        self.cg.mark_initialized();

        let limit_slot = self.cg.alloc_slot();
        self.compile_expression(right, limit_slot);
        if matches!(op, BinaryOp::Lt) {
            self.cg.emit_abc(Op::AddI, limit_slot, limit_slot, (-1i8) as u8);
        }

        let step_slot = self.cg.alloc_slot();
        self.compile_expression(step_expr, step_slot);
        debug_assert_eq!(step_slot, index_slot + 2);

        let forprep_pc = self.cg.emit_asbx(Op::ForPrep, index_slot, 0);
        self.cg.begin_loop(forprep_pc + 1);

        self.compile_block(body);

        let loop_end = self.cg.current_pc();
        self.cg.patch_continues(loop_end);
        self.cg.emit_asbx(Op::ForLoop, index_slot, forprep_pc as i32 - loop_end as i32);

        self.cg.patch_breaks();
        self.cg.end_loop();
        self.cg.patch_jump_to(forprep_pc, loop_end);

        self.cg.end_scope();
        true
    }

    fn compile_for_each(
        &mut self,
        vars: &[String],
        iterable: &Expr,
        body: &Block,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        self.cg.begin_scope();

        let iter_slot = self.cg.alloc_slot();
        self.compile_expression(iterable, iter_slot);
        self.cg.emit_abc(Op::IterPrep, iter_slot, 0, 0);

        let mut var_slots = Vec::new();
        for var in vars {
            let slot = self.cg.add_local(var);
            self.cg.mark_initialized();
            var_slots.push(slot);
        }
        let result_slot = match var_slots.first() {
            Some(slot) => *slot,
            None => self.cg.alloc_slot(),
        };

        let loop_start = self.cg.current_pc();
        self.cg.begin_loop(loop_start);

        self.cg.emit_abc(Op::IterNext, iter_slot, var_slots.len().max(1) as u8, 0);
        self.cg.emit_abc(Op::Test, result_slot, 0, 0);
        let exit_jump = self.cg.emit_jump(Op::Jmp);

        self.compile_block(body);
        self.emit_loop_back(loop_start);

        self.cg.patch_jump(exit_jump);
        self.cg.patch_breaks();
        self.cg.patch_continues(loop_start);
        self.cg.end_loop();
        self.cg.end_scope();
    }

    fn compile_return(&mut self, values: &[Expr], loc: SourceLocation) {
        self.cg.set_line(loc.line);
        match values.len() {
            0 => {
                self.cg.emit_abc(Op::Return, 0, 1, 0);
            }
            1 => {
                let slot = self.cg.alloc_slot();
                self.compile_expression(&values[0], slot);
                self.cg.emit_abc(Op::Return, slot, 2, 0);
                self.cg.free_slots(1);
            }
            n => {
                let base = self.cg.alloc_slots(n as u16);
                for (i, value) in values.iter().enumerate() {
                    self.compile_expression(value, base + i as u8);
                }
                self.cg.emit_abc(Op::Return, base, (n + 1) as u8, 0);
                self.cg.free_slots(n as u16);
            }
        }
    }

    fn compile_break(&mut self, loc: SourceLocation) {
        self.cg.set_line(loc.line);
        if !self.cg.in_loop() {
            self.error("'break' outside of loop", loc);
            return;
        }
        let jump = self.cg.emit_jump(Op::Jmp);
        self.cg.add_break_jump(jump);
    }

    fn compile_continue(&mut self, loc: SourceLocation) {
        self.cg.set_line(loc.line);
        if !self.cg.in_loop() {
            self.error("'continue' outside of loop", loc);
            return;
        }
        let jump = self.cg.emit_jump(Op::Jmp);
        self.cg.add_continue_jump(jump);
    }

    fn compile_assignment(&mut self, targets: &[Expr], values: &[Expr], loc: SourceLocation) {
        self.cg.set_line(loc.line);
        let mut value_slots = Vec::new();
        for value in values {
            let slot = self.cg.alloc_slot();
            self.compile_expression(value, slot);
            value_slots.push(slot);
        }
        if value_slots.is_empty() {
            return;
        }

        for (i, target) in targets.iter().enumerate() {
            // More targets than values: the last value repeats.
            let src = value_slots.get(i).copied().unwrap_or(value_slots[value_slots.len() - 1]);
            let lv = self.compile_lvalue(target);
            self.emit_store(lv, src);
        }

        self.cg.free_slots(value_slots.len() as u16);
    }

    fn compile_update_assignment(
        &mut self,
        target: &Expr,
        op: BinaryOp,
        value: &Expr,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        let lv = self.compile_lvalue(target);
        let left = self.cg.alloc_slot();
        let right = self.cg.alloc_slot();

        match &lv {
            LValue::Local(slot) => {
                self.cg.emit_abc(Op::Move, left, *slot, 0);
            }
            LValue::Upvalue(idx) => {
                self.cg.emit_abc(Op::GetUpval, left, *idx, 0);
            }
            LValue::Global(name_idx) => {
                self.cg.emit_abc(Op::GetField, left, ENV_SLOT, *name_idx);
            }
            LValue::Field { obj, name_idx } => {
                self.cg.emit_abc(Op::GetField, left, *obj, *name_idx);
            }
            LValue::Index { obj, key } => {
                self.cg.emit_abc(Op::GetIndex, left, *obj, *key);
            }
        }

        self.compile_expression(value, right);
        let opcode = arith_opcode(op);
        self.cg.emit_abc(opcode, left, left, right);

        self.emit_store(lv, left);
        self.cg.free_slots(2);
    }

    // ── Expressions ──────────────────────────────────────────────────────────

    fn compile_expression(&mut self, expr: &Expr, dest: u8) {
        self.cg.set_line(expr.loc().line);
        match expr {
            Expr::Int { value, .. } => {
                let idx = self.cg.add_constant(ConstantValue::Int(*value));
                self.cg.emit_abx(Op::LoadK, dest, idx);
            }
            Expr::Float { value, .. } => {
                let idx = self.cg.add_constant(ConstantValue::Float(*value));
                self.cg.emit_abx(Op::LoadK, dest, idx);
            }
            Expr::Str { value, .. } => {
                let idx = self.cg.add_string_constant(value);
                self.cg.emit_abx(Op::LoadK, dest, idx);
            }
            Expr::Bool { value, .. } => {
                self.cg.emit_abc(Op::LoadBool, dest, *value as u8, 0);
            }
            Expr::Nil { .. } => {
                self.cg.emit_abc(Op::LoadNil, dest, 0, 0);
            }
            Expr::List { elements, loc } => self.compile_list_literal(elements, dest, *loc),
            Expr::Map { entries, loc } => self.compile_map_literal(entries, dest, *loc),
            Expr::Identifier { name, loc } => self.compile_identifier(name, dest, *loc),
            Expr::Binary { op, left, right, loc } => {
                self.compile_binary_op(*op, left, right, dest, *loc);
            }
            Expr::Unary { op, operand, .. } => {
                self.compile_expression(operand, dest);
                match op {
                    UnaryOp::Neg => {
                        self.cg.emit_abc(Op::Unm, dest, dest, 0);
                    }
                    UnaryOp::Not => {
                        self.cg.emit_abc(Op::Test, dest, 0, 0);
                        self.cg.emit_abc(Op::LoadBool, dest, 1, 1);
                        self.cg.emit_abc(Op::LoadBool, dest, 0, 0);
                    }
                }
            }
            Expr::Call { callee, args, loc } => {
                self.compile_call(callee, args, dest, 1, *loc);
            }
            Expr::MemberAccess { object, member, loc } => {
                self.cg.set_line(loc.line);
                let obj = self.cg.alloc_slot();
                self.compile_expression(object, obj);
                let idx = self.cg.add_string_constant(member);
                if idx <= MAX_CONST_BYTE {
                    self.cg.emit_abc(Op::GetField, dest, obj, idx as u8);
                } else {
                    let key = self.cg.alloc_slot();
                    self.cg.emit_abx(Op::LoadK, key, idx);
                    self.cg.emit_abc(Op::GetIndex, dest, obj, key);
                    self.cg.free_slots(1);
                }
                self.cg.free_slots(1);
            }
            Expr::Index { object, index, .. } => {
                let obj = self.cg.alloc_slot();
                let key = self.cg.alloc_slot();
                self.compile_expression(object, obj);
                self.compile_expression(index, key);
                self.cg.emit_abc(Op::GetIndex, dest, obj, key);
                self.cg.free_slots(2);
            }
            Expr::Lambda { params, is_variadic, body, .. } => {
                let proto_idx =
                    self.compile_function_body("<lambda>", params, *is_variadic, body, false);
                self.cg.emit_abx(Op::Closure, dest, proto_idx);
            }
            Expr::New { class_name, args, loc } => {
                self.compile_new(class_name, args, dest, *loc);
            }
            Expr::This { loc } => self.compile_this(dest, *loc),
            Expr::Varargs { loc } => {
                self.cg.set_line(loc.line);
                match self.cg.resolve_local("...") {
                    Some(slot) => {
                        if slot != dest {
                            self.cg.emit_abc(Op::Move, dest, slot, 0);
                        }
                    }
                    None => {
                        self.error("Use of '...' in a non-variadic function", *loc);
                        self.cg.emit_abc(Op::LoadNil, dest, 0, 0);
                    }
                }
            }
        }
    }

    fn compile_identifier(&mut self, name: &str, dest: u8, loc: SourceLocation) {
        self.cg.set_line(loc.line);
        if let Some(slot) = self.cg.resolve_local(name) {
            if slot != dest {
                self.cg.emit_abc(Op::Move, dest, slot, 0);
            }
            return;
        }
        if let Some(idx) = self.cg.resolve_upvalue(name) {
            self.cg.emit_abc(Op::GetUpval, dest, idx, 0);
            return;
        }

        // Fall back to the module environment.
        let env_slot = self.emit_load_environment(loc);
        let name_idx = self.cg.add_string_constant(name);
        if name_idx <= MAX_CONST_BYTE {
            self.cg.emit_abc(Op::GetField, dest, env_slot, name_idx as u8);
        } else {
            let key = self.cg.alloc_slot();
            self.cg.emit_abx(Op::LoadK, key, name_idx);
            self.cg.emit_abc(Op::GetIndex, dest, env_slot, key);
            self.cg.free_slots(1);
        }
        self.cg.free_slots(1);
    }

    /// Materialize the module environment into a fresh temp; the caller owns
    /// freeing it. In the root function `__env` is local slot 0; nested
    /// functions reach it as an upvalue.
    fn emit_load_environment(&mut self, loc: SourceLocation) -> u8 {
        if let Some(slot) = self.cg.resolve_local(ENV_NAME) {
            let temp = self.cg.alloc_slot();
            self.cg.emit_abc(Op::Move, temp, slot, 0);
            return temp;
        }
        if let Some(idx) = self.cg.resolve_upvalue(ENV_NAME) {
            let temp = self.cg.alloc_slot();
            self.cg.emit_abc(Op::GetUpval, temp, idx, 0);
            return temp;
        }
        self.error("Internal compiler error: module environment lost in nested scope", loc);
        self.cg.alloc_slot()
    }

    fn compile_binary_op(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        dest: u8,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        match op {
            BinaryOp::And => {
                self.compile_expression(left, dest);
                self.cg.emit_abc(Op::Test, dest, 0, 0);
                let jump = self.cg.emit_jump(Op::Jmp);
                self.compile_expression(right, dest);
                self.cg.patch_jump(jump);
                return;
            }
            BinaryOp::Or => {
                self.compile_expression(left, dest);
                self.cg.emit_abc(Op::Test, dest, 0, 1);
                let jump = self.cg.emit_jump(Op::Jmp);
                self.compile_expression(right, dest);
                self.cg.patch_jump(jump);
                return;
            }
            _ => {}
        }

        // Small-integer RHS of add/sub collapses to the immediate form;
        // `x - (-128)` stays generic because the negated immediate would
        // overflow an i8.
        if matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            let imm = match (op, small_int(right)) {
                (BinaryOp::Add, Some(v)) => Some(v),
                (BinaryOp::Sub, Some(v)) if v != -128 => Some(-v),
                _ => None,
            };
            if let Some(imm) = imm {
                let (left_slot, left_temp) = self.expr_to_slot(left);
                self.cg.emit_abc(Op::AddI, dest, left_slot, imm as u8);
                if left_temp {
                    self.cg.free_slots(1);
                }
                return;
            }
        }

        if op.is_comparison() {
            let (left_slot, left_temp) = self.expr_to_slot(left);
            self.emit_comparison(op, left_slot, right);
            // Skip-next encoding: comparison-as-value materializes through a
            // LoadBool pair, the first of which hops over the second.
            self.cg.emit_abc(Op::LoadBool, dest, 0, 1);
            self.cg.emit_abc(Op::LoadBool, dest, 1, 0);
            if left_temp {
                self.cg.free_slots(1);
            }
            return;
        }

        let (left_slot, left_temp) = self.expr_to_slot(left);
        let (right_slot, right_temp) = self.expr_to_slot(right);
        self.cg.emit_abc(arith_opcode(op), dest, left_slot, right_slot);
        if right_temp {
            self.cg.free_slots(1);
        }
        if left_temp {
            self.cg.free_slots(1);
        }
    }

    /// A local already sitting in a slot is used in place; anything else
    /// compiles into a fresh temp (the bool tells the caller to free it).
    fn expr_to_slot(&mut self, expr: &Expr) -> (u8, bool) {
        if let Expr::Identifier { name, .. } = expr {
            if let Some(slot) = self.cg.resolve_local(name) {
                return (slot, false);
            }
        }
        let slot = self.cg.alloc_slot();
        self.compile_expression(expr, slot);
        (slot, true)
    }

    fn const_for_eqk(&mut self, expr: &Expr) -> Option<u8> {
        let val = match expr {
            Expr::Nil { .. } => ConstantValue::Nil,
            Expr::Bool { value, .. } => ConstantValue::Bool(*value),
            Expr::Int { value, .. } => ConstantValue::Int(*value),
            Expr::Float { value, .. } => ConstantValue::Float(*value),
            _ => return None,
        };
        let idx = self.cg.add_constant(val);
        if idx <= MAX_CONST_BYTE {
            Some(idx as u8)
        } else {
            None
        }
    }

    fn compile_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        dest: u8,
        n_results: u8,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        if let Expr::MemberAccess { object, member, .. } = callee {
            self.compile_method_invoke(object, member, args, dest, n_results, loc);
            return;
        }

        if args.len() > 253 {
            self.error("Too many arguments in call", loc);
            return;
        }

        let func_slot = self.cg.alloc_slot();
        self.compile_expression(callee, func_slot);

        // Receiver slot: nil for bare calls.
        let recv_slot = self.cg.alloc_slot();
        self.cg.emit_abc(Op::LoadNil, recv_slot, 0, 0);

        for arg in args {
            let slot = self.cg.alloc_slot();
            self.compile_expression(arg, slot);
        }

        let nargs = 1 + args.len(); // receiver + user args
        self.cg.emit_abc(Op::Call, func_slot, (nargs + 1) as u8, n_results + 1);

        if n_results > 0 && dest != func_slot {
            for i in 0..n_results {
                self.cg.emit_abc(Op::Move, dest + i, func_slot + i, 0);
            }
        }

        self.cg.free_slots(2 + args.len() as u16);
    }

    fn compile_method_invoke(
        &mut self,
        receiver: &Expr,
        method: &str,
        args: &[Expr],
        dest: u8,
        n_results: u8,
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        if args.len() > 253 {
            self.error("Too many arguments in call", loc);
            return;
        }

        let method_idx = self.cg.add_string_constant(method);
        // INVOKE has no result-count operand; anything other than the single
        // result case goes through the explicit lookup + CALL pair.
        if method_idx > MAX_CONST_BYTE || n_results != 1 {
            self.compile_method_invoke_fallback(receiver, method_idx, args, dest, n_results);
            return;
        }

        let base = self.cg.alloc_slot(); // callable, filled by the VM
        let recv_slot = self.cg.alloc_slot();
        self.compile_expression(receiver, recv_slot);

        for arg in args {
            let slot = self.cg.alloc_slot();
            self.compile_expression(arg, slot);
        }

        let nargs = 1 + args.len();
        self.cg.emit_abc(Op::Invoke, base, (nargs + 1) as u8, method_idx as u8);

        if dest != base {
            self.cg.emit_abc(Op::Move, dest, base, 0);
        }
        self.cg.free_slots(2 + args.len() as u16);
    }

    fn compile_method_invoke_fallback(
        &mut self,
        receiver: &Expr,
        method_idx: u16,
        args: &[Expr],
        dest: u8,
        n_results: u8,
    ) {
        let method_slot = self.cg.alloc_slot();
        let recv_slot = self.cg.alloc_slot();
        self.compile_expression(receiver, recv_slot);

        let key = self.cg.alloc_slot();
        self.cg.emit_abx(Op::LoadK, key, method_idx);
        self.cg.emit_abc(Op::GetIndex, method_slot, recv_slot, key);
        self.cg.free_slots(1);

        for arg in args {
            let slot = self.cg.alloc_slot();
            self.compile_expression(arg, slot);
        }

        let nargs = 1 + args.len();
        self.cg.emit_abc(Op::Call, method_slot, (nargs + 1) as u8, n_results + 1);

        if n_results > 0 && dest != method_slot {
            for i in 0..n_results {
                self.cg.emit_abc(Op::Move, dest + i, method_slot + i, 0);
            }
        }

        self.cg.free_slots(2 + args.len() as u16);
    }

    fn compile_new(&mut self, class_name: &str, args: &[Expr], dest: u8, loc: SourceLocation) {
        self.cg.set_line(loc.line);
        if args.len() > 255 {
            self.error("Too many arguments for constructor", loc);
            return;
        }

        let class_slot = self.cg.alloc_slot();
        self.compile_identifier(class_name, class_slot, loc);
        // One spare slot after the class: the VM rewrites [class][spare] into
        // [__init][instance] when dispatching the constructor.
        self.cg.alloc_slot();

        for arg in args {
            let slot = self.cg.alloc_slot();
            self.compile_expression(arg, slot);
        }

        self.cg.emit_abc(Op::NewObj, dest, class_slot, args.len() as u8);
        self.cg.free_slots(2 + args.len() as u16);
    }

    fn compile_this(&mut self, dest: u8, loc: SourceLocation) {
        self.cg.set_line(loc.line);
        if let Some(slot) = self.cg.resolve_local("this") {
            if slot != dest {
                self.cg.emit_abc(Op::Move, dest, slot, 0);
            }
            return;
        }
        if let Some(idx) = self.cg.resolve_upvalue("this") {
            self.cg.emit_abc(Op::GetUpval, dest, idx, 0);
            return;
        }
        self.error("Use of 'this' outside of a method", loc);
        self.cg.emit_abc(Op::LoadNil, dest, 0, 0);
    }

    fn compile_list_literal(&mut self, elements: &[Expr], dest: u8, loc: SourceLocation) {
        self.cg.set_line(loc.line);
        let cap = elements.len().min(255) as u8;
        self.cg.emit_abc(Op::NewList, dest, cap, 0);

        for (i, element) in elements.iter().enumerate() {
            let elem_slot = self.cg.alloc_slot();
            self.compile_expression(element, elem_slot);

            let idx_slot = self.cg.alloc_slot();
            let idx_const = self.cg.add_constant(ConstantValue::Int(i as i64));
            self.cg.emit_abx(Op::LoadK, idx_slot, idx_const);
            self.cg.emit_abc(Op::SetIndex, dest, idx_slot, elem_slot);

            self.cg.free_slots(2);
        }
    }

    fn compile_map_literal(&mut self, entries: &[(Expr, Expr)], dest: u8, loc: SourceLocation) {
        self.cg.set_line(loc.line);
        let cap = entries.len().min(255) as u8;
        self.cg.emit_abc(Op::NewMap, dest, cap, 0);

        for (key, value) in entries {
            let key_slot = self.cg.alloc_slot();
            let val_slot = self.cg.alloc_slot();
            self.compile_expression(key, key_slot);
            self.compile_expression(value, val_slot);
            self.cg.emit_abc(Op::SetIndex, dest, key_slot, val_slot);
            self.cg.free_slots(2);
        }
    }

    // ── Modules, defer ───────────────────────────────────────────────────────

    fn compile_import_namespace(&mut self, module: &str, alias: &str, loc: SourceLocation) {
        self.cg.set_line(loc.line);
        let module_root = self.cg.at_module_root();
        let module_idx = self.cg.add_string_constant(module);
        let dest = self.cg.add_local(alias);
        self.cg.emit_abx(Op::Import, dest, module_idx);
        self.cg.mark_initialized();

        if module_root {
            self.emit_store_to_env(alias, dest);
        }
    }

    fn compile_import_named(
        &mut self,
        module: &str,
        specifiers: &[ast::ImportSpecifier],
        loc: SourceLocation,
    ) {
        self.cg.set_line(loc.line);
        let module_root = self.cg.at_module_root();
        let module_idx = self.cg.add_string_constant(module);

        for spec in specifiers {
            let symbol_idx = self.cg.add_string_constant(&spec.imported);
            let local_name = spec.local_name().to_string();
            let dest = self.cg.add_local(&local_name);

            if module_idx <= MAX_CONST_BYTE && symbol_idx <= MAX_CONST_BYTE {
                self.cg.emit_abc(Op::ImportFrom, dest, module_idx as u8, symbol_idx as u8);
            } else {
                // Wide constant indices: import the namespace, then index it.
                self.cg.emit_abx(Op::Import, dest, module_idx);
                if symbol_idx <= MAX_CONST_BYTE {
                    self.cg.emit_abc(Op::GetField, dest, dest, symbol_idx as u8);
                } else {
                    let key = self.cg.alloc_slot();
                    self.cg.emit_abx(Op::LoadK, key, symbol_idx);
                    self.cg.emit_abc(Op::GetIndex, dest, dest, key);
                    self.cg.free_slots(1);
                }
            }
            self.cg.mark_initialized();

            if module_root {
                self.emit_store_to_env(&local_name, dest);
            }
        }
    }

    fn compile_defer(&mut self, body: &Block, loc: SourceLocation) {
        self.cg.set_line(loc.line);

        // The deferred block becomes an anonymous closure taking the
        // scope-exit reason (nil on normal exit, the error text otherwise).
        self.cg.begin_function("<defer>", &self.filename.clone(), 1, false);
        self.cg.add_local("");
        self.cg.mark_initialized();
        self.cg.add_local("reason");
        self.cg.mark_initialized();
        for stmt in &body.statements {
            self.compile_statement(stmt);
        }
        self.cg.emit_abc(Op::Return, 0, 1, 0);
        let proto = self.cg.end_function();

        let protos = &mut self.cg.current().proto.protos;
        let proto_idx = protos.len() as u16;
        protos.push(proto);

        let closure_slot = self.cg.alloc_slot();
        self.cg.emit_abx(Op::Closure, closure_slot, proto_idx);
        self.cg.emit_abc(Op::Defer, closure_slot, 0, 0);
        self.cg.free_slots(1);
    }

    // ── Stores ───────────────────────────────────────────────────────────────

    fn emit_store_to_env(&mut self, name: &str, src_slot: u8) {
        let name_idx = self.cg.add_string_constant(name);
        if self.cg.is_root_function() {
            self.emit_set_member(ENV_SLOT, name_idx, src_slot);
        } else {
            let env = self.emit_load_environment(SourceLocation::default());
            self.emit_set_member(env, name_idx, src_slot);
            self.cg.free_slots(1);
        }
    }

    fn compile_lvalue(&mut self, expr: &Expr) -> LValue {
        self.cg.set_line(expr.loc().line);
        match expr {
            Expr::Identifier { name, loc } => {
                if let Some(slot) = self.cg.resolve_local(name) {
                    return LValue::Local(slot);
                }
                if let Some(idx) = self.cg.resolve_upvalue(name) {
                    return LValue::Upvalue(idx);
                }
                let name_idx = self.cg.add_string_constant(name);
                if self.cg.is_root_function() && name_idx <= MAX_CONST_BYTE {
                    return LValue::Global(name_idx as u8);
                }
                let env = self.emit_load_environment(*loc);
                if name_idx <= MAX_CONST_BYTE {
                    LValue::Field { obj: env, name_idx: name_idx as u8 }
                } else {
                    let key = self.cg.alloc_slot();
                    self.cg.emit_abx(Op::LoadK, key, name_idx);
                    LValue::Index { obj: env, key }
                }
            }
            Expr::MemberAccess { object, member, .. } => {
                let name_idx = self.cg.add_string_constant(member);
                let obj = self.cg.alloc_slot();
                self.compile_expression(object, obj);
                if name_idx <= MAX_CONST_BYTE {
                    LValue::Field { obj, name_idx: name_idx as u8 }
                } else {
                    let key = self.cg.alloc_slot();
                    self.cg.emit_abx(Op::LoadK, key, name_idx);
                    LValue::Index { obj, key }
                }
            }
            Expr::Index { object, index, .. } => {
                let obj = self.cg.alloc_slot();
                let key = self.cg.alloc_slot();
                self.compile_expression(object, obj);
                self.compile_expression(index, key);
                LValue::Index { obj, key }
            }
            other => {
                self.error("Invalid assignment target", other.loc());
                LValue::Local(0)
            }
        }
    }

    fn emit_store(&mut self, lv: LValue, src: u8) {
        match lv {
            LValue::Local(slot) => {
                if slot != src {
                    self.cg.emit_abc(Op::Move, slot, src, 0);
                }
            }
            LValue::Upvalue(idx) => {
                self.cg.emit_abc(Op::SetUpval, src, idx, 0);
            }
            LValue::Global(name_idx) => {
                self.cg.emit_abc(Op::SetField, ENV_SLOT, name_idx, src);
            }
            LValue::Field { obj, name_idx } => {
                self.cg.emit_abc(Op::SetField, obj, name_idx, src);
                self.cg.free_slots(1);
            }
            LValue::Index { obj, key } => {
                self.cg.emit_abc(Op::SetIndex, obj, key, src);
                self.cg.free_slots(2);
            }
        }
    }

    // ── Error plumbing ───────────────────────────────────────────────────────

    fn error(&mut self, message: impl Into<String>, loc: SourceLocation) {
        let err = CompileError {
            message: message.into(),
            filename: self.filename.clone(),
            line: loc.line,
            column: loc.column,
        };
        self.has_error = true;
        if let Some(handler) = self.error_handler.as_mut() {
            handler(&err);
        }
        self.errors.push(err);
    }

    fn drain_gen_errors(&mut self) {
        let gen_errors = std::mem::take(&mut self.cg.errors);
        for (message, line) in gen_errors {
            self.error(message, SourceLocation::new(line, 0));
        }
    }
}

fn arith_opcode(op: BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Sub => Op::Sub,
        BinaryOp::Mul => Op::Mul,
        BinaryOp::Div => Op::Div,
        BinaryOp::IDiv => Op::IDiv,
        BinaryOp::Mod => Op::Mod,
        BinaryOp::Concat => Op::Concat,
        // Comparisons and logic never reach here.
        _ => Op::Add,
    }
}

fn small_int(expr: &Expr) -> Option<i8> {
    match expr {
        Expr::Int { value, .. } if (-128..=127).contains(value) => Some(*value as i8),
        _ => None,
    }
}

/// Recognize `i += k` or `i = i + k` update forms, yielding the step.
fn step_expression<'a>(var_name: &str, update: &'a Stmt) -> Option<&'a Expr> {
    match update {
        Stmt::UpdateAssignment { target, op: BinaryOp::Add, value, .. } => match target {
            Expr::Identifier { name, .. } if name == var_name => Some(value),
            _ => None,
        },
        Stmt::Assignment { targets, values, .. } => {
            let [Expr::Identifier { name, .. }] = targets.as_slice() else { return None };
            if name != var_name {
                return None;
            }
            let [Expr::Binary { op: BinaryOp::Add, left, right, .. }] = values.as_slice() else {
                return None;
            };
            match (left.as_ref(), right.as_ref()) {
                (Expr::Identifier { name, .. }, step) if name == var_name => Some(step),
                (step, Expr::Identifier { name, .. }) if name == var_name => Some(step),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use crate::errors::SourceLocation as L;

    fn ident(name: &str) -> Expr {
        Expr::Identifier { name: name.into(), loc: L::default() }
    }

    fn int(v: i64) -> Expr {
        Expr::Int { value: v, loc: L::default() }
    }

    fn var(name: &str, init: Expr) -> Stmt {
        Stmt::VarDecl {
            name: name.into(),
            initializer: Some(init),
            exported: false,
            loc: L::default(),
        }
    }

    fn compile(stmts: Vec<Stmt>) -> (CompiledChunk, bool) {
        let mut compiler = Compiler::new("main", "test.flx");
        let chunk = compiler.compile(&Block::new(stmts));
        (chunk, compiler.has_error())
    }

    #[test]
    fn small_int_rhs_collapses_to_addi() {
        let add = Expr::Binary {
            op: BinaryOp::Add,
            left: Box::new(ident("x")),
            right: Box::new(int(5)),
            loc: L::default(),
        };
        let (chunk, err) = compile(vec![var("x", int(1)), var("y", add)]);
        assert!(!err);
        let ops: Vec<Op> = chunk.main_proto.code.iter().map(|i| i.op()).collect();
        assert!(ops.contains(&Op::AddI), "expected ADDI in {:?}", ops);
        assert!(!ops.contains(&Op::Add));
    }

    #[test]
    fn sub_negative_128_stays_generic() {
        let sub = Expr::Binary {
            op: BinaryOp::Sub,
            left: Box::new(ident("x")),
            right: Box::new(int(-128)),
            loc: L::default(),
        };
        let (chunk, _) = compile(vec![var("x", int(1)), var("y", sub)]);
        let ops: Vec<Op> = chunk.main_proto.code.iter().map(|i| i.op()).collect();
        assert!(ops.contains(&Op::Sub), "negating -128 would overflow i8: {:?}", ops);
    }

    #[test]
    fn comparison_against_small_literal_uses_immediate_form() {
        let cond = Expr::Binary {
            op: BinaryOp::Lt,
            left: Box::new(ident("x")),
            right: Box::new(int(10)),
            loc: L::default(),
        };
        let body = Block::new(vec![]);
        let (chunk, _) = compile(vec![
            var("x", int(1)),
            Stmt::If {
                condition: cond,
                then_block: body,
                else_ifs: vec![],
                else_block: None,
                loc: L::default(),
            },
        ]);
        let ops: Vec<Op> = chunk.main_proto.code.iter().map(|i| i.op()).collect();
        assert!(ops.contains(&Op::LtI), "expected LTI in {:?}", ops);
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let (_, err) = compile(vec![Stmt::Break { loc: L::default() }]);
        assert!(err);
    }

    #[test]
    fn module_root_var_mirrors_into_env() {
        let (chunk, _) = compile(vec![var("x", int(3))]);
        let ops: Vec<Op> = chunk.main_proto.code.iter().map(|i| i.op()).collect();
        assert!(ops.contains(&Op::SetField), "root decl should write __env: {:?}", ops);
    }

    #[test]
    fn exported_names_reach_the_chunk() {
        let (chunk, _) = compile(vec![Stmt::VarDecl {
            name: "answer".into(),
            initializer: Some(int(42)),
            exported: true,
            loc: L::default(),
        }]);
        assert_eq!(chunk.exports, vec!["answer".to_string()]);
    }

    #[test]
    fn this_outside_method_is_a_compile_error() {
        let (_, err) = compile(vec![Stmt::ExprStmt {
            expr: Expr::This { loc: L::default() },
            loc: L::default(),
        }]);
        assert!(err);
    }

    #[test]
    fn varargs_outside_variadic_function_is_a_compile_error() {
        let (_, err) = compile(vec![Stmt::ExprStmt {
            expr: Expr::Varargs { loc: L::default() },
            loc: L::default(),
        }]);
        assert!(err);
    }

    #[test]
    fn numeric_loop_lowers_to_forprep_forloop() {
        let loop_stmt = Stmt::ForC {
            initializer: Some(ForInit::Decls(vec![var("i", int(0))])),
            condition: Some(Expr::Binary {
                op: BinaryOp::Lt,
                left: Box::new(ident("i")),
                right: Box::new(int(10)),
                loc: L::default(),
            }),
            updates: vec![Stmt::UpdateAssignment {
                target: ident("i"),
                op: BinaryOp::Add,
                value: int(1),
                loc: L::default(),
            }],
            body: Block::new(vec![]),
            loc: L::default(),
        };
        let (chunk, err) = compile(vec![loop_stmt]);
        assert!(!err);
        let ops: Vec<Op> = chunk.main_proto.code.iter().map(|i| i.op()).collect();
        assert!(ops.contains(&Op::ForPrep) && ops.contains(&Op::ForLoop), "{:?}", ops);
    }
}
