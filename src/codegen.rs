/// Code generation state — the compiler's low-level half.
///
/// A stack of compiling-function contexts, one per nested function. Each
/// context owns the Prototype under construction, the local-slot cursor, the
/// scope depth, the live-locals list, the upvalue descriptor list, the
/// constant pool, and a loop stack with pending break/continue patch lists.
///
/// SLOT ALLOCATION is bump-and-free: `alloc_slot` hands out the cursor and
/// advances, `free_slots` retracts. Locals occupy the prefix of the frame
/// window, temporaries the suffix; the high-water mark becomes the
/// prototype's `max_stack_size`.

use std::collections::HashMap;

use crate::bytecode::{Instr, Op, Prototype, UpvalueDesc};
use crate::core::value::ConstantValue;

const MAX_LOCALS: usize = 255;
const MAX_UPVALUES: usize = 255;
const MAX_CONSTANTS: usize = u16::MAX as usize;

#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    pub slot: u8,
    pub depth: u32,
    pub captured: bool,
    /// false while the initializer is being compiled, so `var x = x` binds
    /// the outer x.
    pub initialized: bool,
}

#[derive(Debug, Default)]
pub struct LoopCtx {
    pub start_pc: usize,
    pub break_jumps: Vec<usize>,
    pub continue_jumps: Vec<usize>,
}

pub struct FuncState {
    pub proto: Prototype,
    pub locals: Vec<Local>,
    pub scope_depth: u32,
    next_slot: u16,
    pub loops: Vec<LoopCtx>,
    const_map: HashMap<ConstantValue, u16>,
}

impl FuncState {
    fn new(name: &str, source: &str, num_params: u8, is_vararg: bool, line: u32) -> Self {
        let mut proto = Prototype::new(name, source);
        proto.num_params = num_params;
        proto.is_vararg = is_vararg;
        proto.line_defined = line;
        FuncState {
            proto,
            locals: Vec::new(),
            scope_depth: 0,
            next_slot: 0,
            loops: Vec::new(),
            const_map: HashMap::new(),
        }
    }
}

/// An internal generation error: `(message, line)`. The compiler drains these
/// into its CompileError list; generation keeps going best-effort.
pub type GenError = (String, u32);

pub struct CodeGen {
    states: Vec<FuncState>,
    pub errors: Vec<GenError>,
    current_line: u32,
}

impl CodeGen {
    pub fn new() -> Self {
        CodeGen { states: Vec::new(), errors: Vec::new(), current_line: 0 }
    }

    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    pub fn line(&self) -> u32 {
        self.current_line
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push((msg.into(), self.current_line));
    }

    // ── Function nesting ─────────────────────────────────────────────────────

    pub fn begin_function(&mut self, name: &str, source: &str, num_params: u8, is_vararg: bool) {
        let line = self.current_line;
        self.states.push(FuncState::new(name, source, num_params, is_vararg, line));
    }

    pub fn end_function(&mut self) -> Prototype {
        let mut state = match self.states.pop() {
            Some(s) => s,
            None => {
                self.error("internal: end_function with no active function");
                FuncState::new("<error>", "<error>", 0, false, 0)
            }
        };
        state.proto.num_upvalues = state.proto.upvalues.len() as u8;
        state.proto.last_line_defined = self.current_line;
        state.proto
    }

    pub fn current(&mut self) -> &mut FuncState {
        let idx = self.states.len() - 1;
        &mut self.states[idx]
    }

    pub fn is_root_function(&self) -> bool {
        self.states.len() == 1
    }

    pub fn at_module_root(&self) -> bool {
        self.states.len() == 1 && self.states[0].scope_depth == 0
    }

    // ── Emission ─────────────────────────────────────────────────────────────

    pub fn emit(&mut self, instr: Instr) -> usize {
        let line = self.current_line;
        let state = self.current();
        let pc = state.proto.code.len();
        state.proto.code.push(instr);
        state.proto.line_info.push(line);
        pc
    }

    pub fn emit_abc(&mut self, op: Op, a: u8, b: u8, c: u8) -> usize {
        self.emit(Instr::abc(op, a, b, c))
    }

    pub fn emit_abx(&mut self, op: Op, a: u8, bx: u16) -> usize {
        self.emit(Instr::abx(op, a, bx))
    }

    pub fn emit_asbx(&mut self, op: Op, a: u8, sbx: i32) -> usize {
        if sbx < i16::MIN as i32 || sbx > i16::MAX as i32 {
            self.error("Jump offset out of encodable range");
            return self.emit(Instr::asbx(op, a, 0));
        }
        self.emit(Instr::asbx(op, a, sbx as i16))
    }

    pub fn current_pc(&self) -> usize {
        self.states
            .last()
            .map(|s| s.proto.code.len())
            .unwrap_or(0)
    }

    // ── Jump fixup ───────────────────────────────────────────────────────────

    /// Emit a placeholder jump; the pc is patched once the target is known.
    pub fn emit_jump(&mut self, op: Op) -> usize {
        self.emit(Instr::asbx(op, 0, 0))
    }

    pub fn patch_jump(&mut self, pc: usize) {
        let target = self.current_pc();
        self.patch_jump_to(pc, target);
    }

    pub fn patch_jump_to(&mut self, pc: usize, target: usize) {
        let offset = target as i32 - pc as i32 - 1;
        if offset < i16::MIN as i32 || offset > i16::MAX as i32 {
            self.error("Jump offset out of encodable range");
            return;
        }
        self.current().proto.code[pc].patch_sbx(offset as i16);
    }

    // ── Slot allocation ──────────────────────────────────────────────────────

    pub fn alloc_slot(&mut self) -> u8 {
        self.alloc_slots(1)
    }

    pub fn alloc_slots(&mut self, n: u16) -> u8 {
        let base = self.current().next_slot;
        if base + n > MAX_LOCALS as u16 {
            self.error("Register allocation failure: function needs more than 255 slots");
            return MAX_LOCALS as u8;
        }
        let state = self.current();
        state.next_slot = base + n;
        if state.next_slot as u8 > state.proto.max_stack_size {
            state.proto.max_stack_size = state.next_slot as u8;
        }
        base as u8
    }

    pub fn free_slots(&mut self, n: u16) {
        let state = self.current();
        state.next_slot = state.next_slot.saturating_sub(n);
    }

    // ── Locals ───────────────────────────────────────────────────────────────

    /// Declare a local in the current scope. The local stays invisible to
    /// name resolution until `mark_initialized`.
    pub fn add_local(&mut self, name: &str) -> u8 {
        if self.current().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables (limit: 255)");
            return MAX_LOCALS as u8;
        }
        let slot = self.alloc_slot();
        let depth = self.current().scope_depth;
        self.current().locals.push(Local {
            name: name.to_string(),
            slot,
            depth,
            captured: false,
            initialized: false,
        });
        slot
    }

    /// Register a local over an already-allocated slot (multi-declaration
    /// targets whose slots were reserved as a contiguous run up front).
    pub fn add_local_at(&mut self, name: &str, slot: u8) {
        if self.current().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables (limit: 255)");
            return;
        }
        let depth = self.current().scope_depth;
        self.current().locals.push(Local {
            name: name.to_string(),
            slot,
            depth,
            captured: false,
            initialized: false,
        });
    }

    pub fn mark_initialized(&mut self) {
        if let Some(local) = self.current().locals.last_mut() {
            local.initialized = true;
        }
    }

    /// Walk the live-locals list in reverse; uninitialized locals (their own
    /// initializer is still compiling) do not resolve.
    pub fn resolve_local(&mut self, name: &str) -> Option<u8> {
        self.current()
            .locals
            .iter()
            .rev()
            .find(|l| l.initialized && l.name == name)
            .map(|l| l.slot)
    }

    // ── Upvalues ─────────────────────────────────────────────────────────────

    /// Resolve a free identifier against enclosing function states, inserting
    /// upvalue descriptors along the path. Each descriptor records whether it
    /// captures an enclosing local or a further upvalue.
    pub fn resolve_upvalue(&mut self, name: &str) -> Option<u8> {
        let top = self.states.len().checked_sub(1)?;
        self.resolve_upvalue_at(top, name)
    }

    fn resolve_upvalue_at(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        let enclosing = level - 1;
        let found = self.states[enclosing]
            .locals
            .iter()
            .rev()
            .position(|l| l.initialized && l.name == name);
        if let Some(rev_pos) = found {
            let idx = self.states[enclosing].locals.len() - 1 - rev_pos;
            let slot = self.states[enclosing].locals[idx].slot;
            self.states[enclosing].locals[idx].captured = true;
            return self.add_upvalue(level, slot, true);
        }
        if let Some(up) = self.resolve_upvalue_at(enclosing, name) {
            return self.add_upvalue(level, up, false);
        }
        None
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> Option<u8> {
        let upvalues = &mut self.states[level].proto.upvalues;
        for (i, uv) in upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return Some(i as u8);
            }
        }
        if upvalues.len() >= MAX_UPVALUES {
            self.error("Too many upvalues in function (limit: 255)");
            return None;
        }
        upvalues.push(UpvalueDesc { index, is_local });
        Some((upvalues.len() - 1) as u8)
    }

    // ── Scopes ───────────────────────────────────────────────────────────────

    pub fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    /// Pop the scope's locals, retract their slots, and close any that were
    /// captured so their upvalue cells survive the slots being reused.
    pub fn end_scope(&mut self) {
        let state = self.current();
        state.scope_depth -= 1;
        let depth = state.scope_depth;

        let mut min_slot: Option<u8> = None;
        let mut min_captured: Option<u8> = None;
        while let Some(local) = state.locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.captured {
                min_captured = Some(match min_captured {
                    Some(s) => s.min(local.slot),
                    None => local.slot,
                });
            }
            min_slot = Some(match min_slot {
                Some(s) => s.min(local.slot),
                None => local.slot,
            });
            state.locals.pop();
        }
        if let Some(slot) = min_slot {
            state.next_slot = slot as u16;
        }
        if let Some(slot) = min_captured {
            self.emit_abc(Op::Close, slot, 0, 0);
        }
    }

    pub fn current_scope_depth(&self) -> u32 {
        self.states.last().map(|s| s.scope_depth).unwrap_or(0)
    }

    // ── Constants ────────────────────────────────────────────────────────────

    /// Intern a constant into the current prototype's pool. Identical
    /// primitives (floats compared by bit pattern) share an index, so the
    /// pool — and the serialized image — is deterministic in AST traversal
    /// order.
    pub fn add_constant(&mut self, val: ConstantValue) -> u16 {
        if let Some(&idx) = self.current().const_map.get(&val) {
            return idx;
        }
        let state = self.current();
        if state.proto.constants.len() >= MAX_CONSTANTS {
            self.error("Too many constants in function");
            return 0;
        }
        let idx = state.proto.constants.len() as u16;
        state.proto.constants.push(val.clone());
        state.const_map.insert(val, idx);
        idx
    }

    pub fn add_string_constant(&mut self, s: &str) -> u16 {
        self.add_constant(ConstantValue::Str(s.to_string()))
    }

    // ── Loops ────────────────────────────────────────────────────────────────

    pub fn begin_loop(&mut self, start_pc: usize) {
        self.current().loops.push(LoopCtx { start_pc, ..Default::default() });
    }

    pub fn end_loop(&mut self) {
        self.current().loops.pop();
    }

    pub fn in_loop(&mut self) -> bool {
        !self.current().loops.is_empty()
    }

    pub fn add_break_jump(&mut self, pc: usize) {
        if let Some(ctx) = self.current().loops.last_mut() {
            ctx.break_jumps.push(pc);
        }
    }

    pub fn add_continue_jump(&mut self, pc: usize) {
        if let Some(ctx) = self.current().loops.last_mut() {
            ctx.continue_jumps.push(pc);
        }
    }

    /// Patch all pending breaks of the innermost loop to the current pc.
    pub fn patch_breaks(&mut self) {
        let jumps = match self.current().loops.last_mut() {
            Some(ctx) => std::mem::take(&mut ctx.break_jumps),
            None => Vec::new(),
        };
        for pc in jumps {
            self.patch_jump(pc);
        }
    }

    pub fn patch_continues(&mut self, target: usize) {
        let jumps = match self.current().loops.last_mut() {
            Some(ctx) => std::mem::take(&mut ctx.continue_jumps),
            None => Vec::new(),
        };
        for pc in jumps {
            self.patch_jump_to(pc, target);
        }
    }
}

impl Default for CodeGen {
    fn default() -> Self {
        CodeGen::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen() -> CodeGen {
        let mut cg = CodeGen::new();
        cg.begin_function("test", "test.flx", 0, false);
        cg
    }

    #[test]
    fn slots_bump_and_retract() {
        let mut cg = gen();
        assert_eq!(cg.alloc_slot(), 0);
        assert_eq!(cg.alloc_slot(), 1);
        cg.free_slots(1);
        assert_eq!(cg.alloc_slot(), 1);
        let proto = cg.end_function();
        assert_eq!(proto.max_stack_size, 2);
    }

    #[test]
    fn uninitialized_local_does_not_resolve() {
        let mut cg = gen();
        cg.add_local("x");
        assert_eq!(cg.resolve_local("x"), None);
        cg.mark_initialized();
        assert_eq!(cg.resolve_local("x"), Some(0));
    }

    #[test]
    fn shadowing_resolves_to_innermost() {
        let mut cg = gen();
        cg.add_local("x");
        cg.mark_initialized();
        cg.begin_scope();
        cg.add_local("x");
        cg.mark_initialized();
        assert_eq!(cg.resolve_local("x"), Some(1));
        cg.end_scope();
        assert_eq!(cg.resolve_local("x"), Some(0));
    }

    #[test]
    fn upvalue_resolution_inserts_descriptors_along_the_path() {
        let mut cg = gen();
        cg.add_local("n");
        cg.mark_initialized();

        cg.begin_function("middle", "test.flx", 0, false);
        cg.begin_function("inner", "test.flx", 0, false);

        assert_eq!(cg.resolve_upvalue("n"), Some(0));
        let inner = cg.end_function();
        let middle = cg.end_function();

        // inner captures middle's upvalue; middle captures the root local.
        assert_eq!(inner.upvalues, vec![UpvalueDesc { index: 0, is_local: false }]);
        assert_eq!(middle.upvalues, vec![UpvalueDesc { index: 0, is_local: true }]);
    }

    #[test]
    fn repeated_capture_dedups() {
        let mut cg = gen();
        cg.add_local("n");
        cg.mark_initialized();
        cg.begin_function("inner", "test.flx", 0, false);
        assert_eq!(cg.resolve_upvalue("n"), Some(0));
        assert_eq!(cg.resolve_upvalue("n"), Some(0));
        let inner = cg.end_function();
        assert_eq!(inner.upvalues.len(), 1);
    }

    #[test]
    fn constants_intern_by_content() {
        let mut cg = gen();
        let a = cg.add_constant(ConstantValue::Int(42));
        let b = cg.add_string_constant("hello");
        let c = cg.add_constant(ConstantValue::Int(42));
        let d = cg.add_string_constant("hello");
        assert_eq!(a, c);
        assert_eq!(b, d);
        assert_eq!(cg.end_function().constants.len(), 2);
    }

    #[test]
    fn jump_patching_lands_on_target() {
        let mut cg = gen();
        let jmp = cg.emit_jump(Op::Jmp);
        cg.emit_abc(Op::Move, 0, 1, 0);
        cg.emit_abc(Op::Move, 1, 2, 0);
        cg.patch_jump(jmp);
        let proto = cg.end_function();
        // ip after fetching the jump is jmp+1; offset 2 skips both moves.
        assert_eq!(proto.code[jmp].sbx(), 2);
    }
}
