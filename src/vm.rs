/// Register VM — decode-dispatch interpreter.
///
/// ARCHITECTURE
/// ────────────
/// • Contiguous value stack; a call frame is (closure, ip, base) and
///   register R(i) of a frame is stack[base + i]
/// • Slot 0 of every frame holds the receiver (`__env` for module roots);
///   declared parameters sit in slots 1..=N
/// • Upvalues are shared cells: open while their stack slot lives, closed
///   (owning the value) once the frame pops
/// • Deferred closures attach to the frame that registered them and run in
///   LIFO order on scope exit, receiving the exit reason
/// • Runtime errors unwind the frame stack — running defers and closing
///   upvalues on the way down — and terminate `interpret` through the
///   installed error handler; no native exception crosses a frame
///
/// The interpret loop exits when the frame stack returns to the depth it
/// had on entry, which is what lets module execution, defers and `__init`
/// calls nest inside a running dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bytecode::{CompiledChunk, Op, Prototype};
use crate::core::oop::{ClassObject, InstanceObject};
use crate::core::value::{ConstantValue, Handle, MapKey, Value};
use crate::errors::{InterpretResult, RuntimeError};
use crate::gc::{ClosureObject, Heap, IterState, NativeFn, NativeObject, Object, UpvalueState};
use crate::module::ModuleManager;

const MULTRET: i32 = -1;

pub type PrintHandler = Box<dyn FnMut(&str)>;
pub type ErrorHandler = Box<dyn FnMut(&str, u32)>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub struct VmConfig {
    pub enable_gc: bool,
    pub debug_gc: bool,
    pub max_frames: usize,
    pub module_paths: Vec<String>,
    pub enable_hot_reload: bool,
    pub max_module_cache: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            enable_gc: true,
            debug_gc: false,
            max_frames: 1000,
            module_paths: Vec::new(),
            enable_hot_reload: false,
            max_module_cache: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Call frames
// ---------------------------------------------------------------------------

pub(crate) struct CallFrame {
    pub closure: Handle,
    pub proto: Arc<Prototype>,
    pub ip: usize,
    /// Absolute stack index of this frame's R(0).
    pub base: usize,
    /// Absolute stack index where results land on return.
    pub ret_dest: usize,
    /// Result count the caller asked for; MULTRET keeps everything.
    pub wanted: i32,
    /// Deferred closures, run LIFO when this frame exits.
    pub defers: Vec<Handle>,
}

// ---------------------------------------------------------------------------
// The VM
// ---------------------------------------------------------------------------

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) stack_top: usize,
    pub(crate) frames: Vec<CallFrame>,
    open_upvalues: Vec<Handle>,
    protected: Vec<Value>,
    pub(crate) root_env: Handle,
    pub(crate) modules: ModuleManager,
    pub(crate) last_module_result: Value,
    print_handler: PrintHandler,
    error_handler: ErrorHandler,
    pub(crate) config: VmConfig,
    /// Arc-wrapped nested prototypes, keyed by parent identity and index, so
    /// closure creation in a loop does not deep-clone the prototype tree.
    proto_cache: HashMap<(usize, u16), Arc<Prototype>>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new();
        heap.debug = config.debug_gc;
        let root_env = heap.alloc_map(16);
        let modules = ModuleManager::new(&config);
        Vm {
            heap,
            stack: Vec::with_capacity(256),
            stack_top: 0,
            frames: Vec::with_capacity(16),
            open_upvalues: Vec::new(),
            protected: Vec::new(),
            root_env,
            modules,
            last_module_result: Value::Nil,
            print_handler: Box::new(|msg| print!("{}", msg)),
            error_handler: Box::new(|msg, line| eprintln!("[Runtime Error] line {}: {}", line, msg)),
            config,
            proto_cache: HashMap::new(),
        }
    }

    // ── Host API ─────────────────────────────────────────────────────────────

    pub fn set_print_handler(&mut self, handler: PrintHandler) {
        self.print_handler = handler;
    }

    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = handler;
    }

    pub fn print(&mut self, msg: &str) {
        (self.print_handler)(msg);
    }

    /// Install a native function in the root environment. `arity` counts the
    /// implicit receiver; variadic natives accept at least `arity` values.
    pub fn register_native<F>(&mut self, name: &str, arity: u8, variadic: bool, func: F)
    where
        F: Fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError> + 'static,
    {
        let native = self.heap.alloc(Object::Native(NativeObject {
            name: name.to_string(),
            arity,
            variadic,
            func: std::rc::Rc::new(func),
        }));
        let key = MapKey::str(name);
        if let Some(env) = self.heap.as_map_mut(self.root_env) {
            env.insert(key, Value::Obj(native));
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn modules(&mut self) -> &mut ModuleManager {
        &mut self.modules
    }

    pub fn last_module_result(&self) -> Value {
        self.last_module_result
    }

    /// Run a compiled chunk to completion. The chunk starts with an empty
    /// module environment; its result (the `__env` map) is retained as the
    /// last module result.
    pub fn interpret(&mut self, chunk: &CompiledChunk) -> InterpretResult {
        match self.execute_chunk(chunk) {
            Ok(value) => {
                self.last_module_result = value;
                InterpretResult::Ok
            }
            Err(err) => {
                let msg = err.to_string();
                (self.error_handler)(&msg, err.line());
                InterpretResult::RuntimeError
            }
        }
    }

    // ── GC interface ─────────────────────────────────────────────────────────

    /// Pin a value as a GC root for the duration of a native operation.
    pub fn protect(&mut self, v: Value) {
        self.protected.push(v);
    }

    pub fn unprotect(&mut self, n: usize) {
        let keep = self.protected.len().saturating_sub(n);
        self.protected.truncate(keep);
    }

    fn maybe_collect(&mut self) {
        if self.config.enable_gc && self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) {
        for i in 0..self.stack_top {
            let v = self.stack[i];
            self.heap.mark_value(&v);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_handle(closure);
            for j in 0..self.frames[i].defers.len() {
                let d = self.frames[i].defers[j];
                self.heap.mark_handle(d);
            }
        }
        for i in 0..self.open_upvalues.len() {
            let h = self.open_upvalues[i];
            self.heap.mark_handle(h);
        }
        for i in 0..self.protected.len() {
            let v = self.protected[i];
            self.heap.mark_value(&v);
        }
        self.heap.mark_handle(self.root_env);
        let last = self.last_module_result;
        self.heap.mark_value(&last);
        for h in self.modules.export_tables() {
            self.heap.mark_handle(h);
        }
        self.heap.trace_and_sweep();
    }

    pub fn allocate_string(&mut self, s: &str) -> Handle {
        self.maybe_collect();
        self.heap.alloc_string(s)
    }

    pub fn allocate_map(&mut self, cap_hint: usize) -> Handle {
        self.maybe_collect();
        self.heap.alloc_map(cap_hint)
    }

    pub fn allocate_list(&mut self, items: Vec<Value>) -> Handle {
        self.maybe_collect();
        self.heap.alloc_list(items)
    }

    pub fn allocate_closure(&mut self, proto: Arc<Prototype>) -> Handle {
        self.maybe_collect();
        self.heap.alloc(Object::Closure(ClosureObject { proto, upvalues: Vec::new() }))
    }

    // ── Stack management ─────────────────────────────────────────────────────

    fn ensure_stack(&mut self, needed: usize) {
        if self.stack.len() < needed {
            self.stack.resize(needed, Value::Nil);
        }
    }

    #[inline]
    fn current_line(&self) -> u32 {
        match self.frames.last() {
            Some(f) => f.proto.line_at(f.ip.saturating_sub(1)),
            None => 0,
        }
    }

    // ── Upvalue cells ────────────────────────────────────────────────────────

    /// Find or create the open cell for a stack slot; closures created at
    /// the same slot share the cell, so mutation through one is visible
    /// through the other.
    fn capture_upvalue(&mut self, stack_idx: usize) -> Handle {
        for &h in &self.open_upvalues {
            if matches!(self.heap.get(h), Object::Upvalue(UpvalueState::Open(idx)) if *idx == stack_idx)
            {
                return h;
            }
        }
        let h = self.heap.alloc(Object::Upvalue(UpvalueState::Open(stack_idx)));
        self.open_upvalues.push(h);
        h
    }

    /// Close every open cell at or above `from`, moving the stack value into
    /// the cell.
    fn close_upvalues(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let h = self.open_upvalues[i];
            let slot = match self.heap.get(h) {
                Object::Upvalue(UpvalueState::Open(idx)) => Some(*idx),
                _ => None,
            };
            match slot {
                Some(idx) if idx >= from => {
                    let value = self.stack[idx];
                    *self.heap.get_mut(h) = Object::Upvalue(UpvalueState::Closed(value));
                    self.open_upvalues.swap_remove(i);
                }
                _ => i += 1,
            }
        }
    }

    fn read_upvalue(&self, cell: Handle) -> Value {
        match self.heap.get(cell) {
            Object::Upvalue(UpvalueState::Open(idx)) => self.stack[*idx],
            Object::Upvalue(UpvalueState::Closed(v)) => *v,
            _ => Value::Nil,
        }
    }

    fn write_upvalue(&mut self, cell: Handle, value: Value) {
        let target = match self.heap.get(cell) {
            Object::Upvalue(UpvalueState::Open(idx)) => Some(*idx),
            _ => None,
        };
        match target {
            Some(idx) => self.stack[idx] = value,
            None => *self.heap.get_mut(cell) = Object::Upvalue(UpvalueState::Closed(value)),
        }
    }

    // ── Chunk execution ──────────────────────────────────────────────────────

    /// Execute a chunk in a fresh root frame and hand back its result (the
    /// module's `__env` map).
    pub(crate) fn execute_chunk(&mut self, chunk: &CompiledChunk) -> Result<Value, RuntimeError> {
        let proto = Arc::new(chunk.main_proto.clone());
        let closure = self.allocate_closure(Arc::clone(&proto));
        self.protect(Value::Obj(closure));

        let entry_top = self.stack_top;
        let base = self.stack_top;
        self.ensure_stack(base + proto.max_stack_size as usize);
        for i in base..base + proto.max_stack_size as usize {
            self.stack[i] = Value::Nil;
        }
        self.stack_top = base + proto.max_stack_size as usize;

        let min_depth = self.frames.len();
        self.frames.push(CallFrame {
            closure,
            proto,
            ip: 0,
            base,
            ret_dest: base,
            wanted: 1,
            defers: Vec::new(),
        });

        let result = self.run(min_depth);
        self.unprotect(1);

        match result {
            Ok(value) => {
                self.stack_top = entry_top;
                // The holder is a GC root, so the env survives the frame.
                self.last_module_result = value;
                Ok(value)
            }
            Err(err) => {
                self.unwind(min_depth, &err);
                self.stack_top = entry_top;
                Err(err)
            }
        }
    }

    /// Unwind frames above `min_depth`: run pending defers with the error as
    /// the exit reason, close upvalues, pop.
    fn unwind(&mut self, min_depth: usize, err: &RuntimeError) {
        let reason_handle = self.allocate_string(&err.to_string());
        let reason = Value::Obj(reason_handle);
        self.protect(reason);
        while self.frames.len() > min_depth {
            let defers = match self.frames.last_mut() {
                Some(f) => std::mem::take(&mut f.defers),
                None => break,
            };
            for defer in defers.into_iter().rev() {
                self.run_defer(defer, reason);
            }
            if let Some(frame) = self.frames.pop() {
                self.close_upvalues(frame.base);
            }
        }
        self.unprotect(1);
    }

    /// Defers never abort the surrounding exit path: a failing defer is
    /// reported through the error handler and the walk continues.
    fn run_defer(&mut self, closure: Handle, reason: Value) {
        if let Err(defer_err) = self.run_closure(closure, &[reason]) {
            let msg = format!("error in deferred block: {}", defer_err);
            (self.error_handler)(&msg, defer_err.line());
        }
    }

    /// Call a closure from native context: frame is pushed above the live
    /// stack, run to completion, single result returned.
    pub fn run_closure(&mut self, closure: Handle, args: &[Value]) -> Result<Value, RuntimeError> {
        let scratch = self.stack_top;
        self.ensure_stack(scratch + 2 + args.len());
        self.stack[scratch] = Value::Obj(closure);
        self.stack[scratch + 1] = Value::Nil; // receiver
        for (i, arg) in args.iter().enumerate() {
            self.stack[scratch + 2 + i] = *arg;
        }
        let saved_top = self.stack_top;
        self.stack_top = scratch + 2 + args.len();

        let depth = self.frames.len();
        self.call_value(scratch, (2 + args.len()) as u8, 1, scratch)?;
        let result = if self.frames.len() > depth {
            let r = self.run(depth);
            if let Err(err) = r {
                self.unwind(depth, &err);
                self.stack_top = saved_top;
                return Err(err);
            }
            self.stack[scratch]
        } else {
            // Native callee already wrote its result.
            self.stack[scratch]
        };
        self.stack_top = saved_top;
        Ok(result)
    }

    // ── Call / return machinery ──────────────────────────────────────────────

    /// Invoke the callable at `stack[abs_func]`. `b` is nargs+1 counting the
    /// receiver at abs_func+1 (0 = all values up to stack top); `wanted` is
    /// the result count (MULTRET keeps all); results land at `ret_dest`.
    fn call_value(
        &mut self,
        abs_func: usize,
        b: u8,
        wanted: i32,
        ret_dest: usize,
    ) -> Result<(), RuntimeError> {
        let provided = if b == 0 {
            self.stack_top.saturating_sub(abs_func + 1)
        } else {
            (b - 1) as usize
        };

        let callee = self.stack[abs_func];
        let handle = match callee {
            Value::Obj(h) => h,
            other => {
                return Err(RuntimeError::NotCallable {
                    type_name: self.heap.value_type_name(&other).to_string(),
                    line: self.current_line(),
                })
            }
        };

        enum Callee {
            Closure(Arc<Prototype>),
            Native { arity: usize, variadic: bool, func: NativeFn },
            Other(&'static str),
        }
        let callee_info = match self.heap.get(handle) {
            Object::Closure(c) => Callee::Closure(Arc::clone(&c.proto)),
            Object::Native(n) => Callee::Native {
                arity: n.arity as usize,
                variadic: n.variadic,
                func: std::rc::Rc::clone(&n.func),
            },
            other => Callee::Other(other.type_name()),
        };

        match callee_info {
            Callee::Closure(proto) => {
                if self.frames.len() >= self.config.max_frames {
                    return Err(RuntimeError::StackOverflow {
                        limit: self.config.max_frames,
                        line: self.current_line(),
                    });
                }
                let new_base = abs_func + 1;
                let window = 1 + proto.num_params as usize; // receiver + params
                self.ensure_stack(new_base + proto.max_stack_size as usize);

                // Pad missing receiver/arguments with nil.
                for i in provided..window {
                    self.stack[new_base + i] = Value::Nil;
                }
                if proto.is_vararg {
                    let rest: Vec<Value> = if provided > window {
                        self.stack[new_base + window..new_base + provided].to_vec()
                    } else {
                        Vec::new()
                    };
                    let rest_list = self.allocate_list(rest);
                    self.stack[new_base + window] = Value::Obj(rest_list);
                }
                // Clear the temp region so stale values neither leak into
                // reads nor pin dead objects.
                let first_temp = window + proto.is_vararg as usize;
                for i in new_base + first_temp..new_base + proto.max_stack_size as usize {
                    self.stack[i] = Value::Nil;
                }

                self.stack_top = new_base + proto.max_stack_size as usize;
                self.frames.push(CallFrame {
                    closure: handle,
                    proto,
                    ip: 0,
                    base: new_base,
                    ret_dest,
                    wanted,
                    defers: Vec::new(),
                });
                Ok(())
            }
            Callee::Native { arity, variadic, func } => {
                if (!variadic && provided != arity) || (variadic && provided < arity) {
                    return Err(RuntimeError::Arity {
                        expected: arity,
                        found: provided,
                        line: self.current_line(),
                    });
                }
                let args: Vec<Value> =
                    self.stack[abs_func + 1..abs_func + 1 + provided].to_vec();
                let result = func(self, &args)?;
                self.stack[ret_dest] = result;
                if wanted == MULTRET {
                    self.stack_top = ret_dest + 1;
                } else {
                    for i in 1..wanted.max(0) as usize {
                        self.stack[ret_dest + i] = Value::Nil;
                    }
                }
                Ok(())
            }
            Callee::Other(type_name) => Err(RuntimeError::NotCallable {
                type_name: type_name.to_string(),
                line: self.current_line(),
            }),
        }
    }

    /// Shared return path. Returns the final value once the frame stack is
    /// back at `min_depth`.
    fn do_return(
        &mut self,
        a: u8,
        b: u8,
        min_depth: usize,
    ) -> Result<Option<Value>, RuntimeError> {
        let frame_idx = self.frames.len() - 1;
        let base = self.frames[frame_idx].base;

        // Deferred closures run before the frame goes away, in LIFO order,
        // with a nil reason on the normal path.
        let defers = std::mem::take(&mut self.frames[frame_idx].defers);
        for defer in defers.into_iter().rev() {
            self.run_defer(defer, Value::Nil);
        }

        let start = base + a as usize;
        let count = if b == 0 {
            self.stack_top.saturating_sub(start)
        } else {
            (b - 1) as usize
        };

        let frame = match self.frames.pop() {
            Some(f) => f,
            None => return Ok(Some(Value::Nil)),
        };
        let first = if count > 0 { self.stack[start] } else { Value::Nil };

        // Copy results down into the caller's window before the slots are
        // invalidated, then close upvalues over the dead frame.
        let ret_dest = frame.ret_dest;
        let wanted = frame.wanted;
        let to_copy = if wanted == MULTRET { count } else { (wanted.max(0) as usize).min(count) };
        for i in 0..to_copy {
            self.stack[ret_dest + i] = self.stack[start + i];
        }
        if wanted != MULTRET {
            for i in to_copy..wanted.max(0) as usize {
                self.stack[ret_dest + i] = Value::Nil;
            }
        }
        self.close_upvalues(frame.base);

        if self.frames.len() == min_depth {
            self.stack_top = ret_dest + to_copy;
            return Ok(Some(first));
        }

        // Restore the caller's stack window.
        let caller = &self.frames[self.frames.len() - 1];
        self.stack_top = if wanted == MULTRET {
            ret_dest + to_copy
        } else {
            caller.base + caller.proto.max_stack_size as usize
        };
        Ok(None)
    }

    // ── The dispatch loop ────────────────────────────────────────────────────

    fn run(&mut self, min_depth: usize) -> Result<Value, RuntimeError> {
        loop {
            let frame_idx = self.frames.len() - 1;
            let ip = self.frames[frame_idx].ip;

            if ip >= self.frames[frame_idx].proto.code.len() {
                // Fell off the end: implicit bare return.
                if let Some(v) = self.do_return(0, 1, min_depth)? {
                    return Ok(v);
                }
                continue;
            }

            let instr = self.frames[frame_idx].proto.code[ip];
            self.frames[frame_idx].ip += 1;

            let base = self.frames[frame_idx].base;
            let op = instr.op();
            let a = instr.a() as usize;
            let b = instr.b();
            let c = instr.c();
            let line = self.frames[frame_idx].proto.line_at(ip);

            match op {
                Op::Move => {
                    self.stack[base + a] = self.stack[base + b as usize];
                }
                Op::LoadK => {
                    let v = self.constant_value(frame_idx, instr.bx() as usize);
                    self.stack[base + a] = v;
                }
                Op::LoadBool => {
                    self.stack[base + a] = Value::Bool(b != 0);
                    if c != 0 {
                        self.frames[frame_idx].ip += 1;
                    }
                }
                Op::LoadNil => {
                    for i in 0..=b as usize {
                        self.stack[base + a + i] = Value::Nil;
                    }
                }

                Op::GetUpval => {
                    let cell = self.upvalue_cell(frame_idx, b as usize);
                    self.stack[base + a] = self.read_upvalue(cell);
                }
                Op::SetUpval => {
                    let cell = self.upvalue_cell(frame_idx, b as usize);
                    let v = self.stack[base + a];
                    self.write_upvalue(cell, v);
                }

                Op::GetField => {
                    let obj = self.stack[base + b as usize];
                    let name = self.constant_string(frame_idx, c as usize);
                    let v = self.get_field(obj, &name, line)?;
                    self.stack[base + a] = v;
                }
                Op::SetField => {
                    let obj = self.stack[base + a];
                    let name = self.constant_string(frame_idx, b as usize);
                    let v = self.stack[base + c as usize];
                    self.set_field(obj, &name, v, line)?;
                }
                Op::GetIndex => {
                    let obj = self.stack[base + b as usize];
                    let key = self.stack[base + c as usize];
                    let v = self.get_index(obj, key, line)?;
                    self.stack[base + a] = v;
                }
                Op::SetIndex => {
                    let obj = self.stack[base + a];
                    let key = self.stack[base + b as usize];
                    let v = self.stack[base + c as usize];
                    self.set_index(obj, key, v, line)?;
                }

                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::IDiv | Op::Mod => {
                    let lhs = self.stack[base + b as usize];
                    let rhs = self.stack[base + c as usize];
                    let v = self.arith(op, lhs, rhs, line)?;
                    self.stack[base + a] = v;
                }
                Op::Concat => {
                    let lhs = self.stack[base + b as usize];
                    let rhs = self.stack[base + c as usize];
                    let v = self.concat(lhs, rhs, line)?;
                    self.stack[base + a] = v;
                }
                Op::Unm => {
                    let v = self.stack[base + b as usize];
                    self.stack[base + a] = match v {
                        Value::Int(n) => Value::Int(n.wrapping_neg()),
                        Value::Float(f) => Value::Float(-f),
                        other => {
                            return Err(RuntimeError::Type {
                                message: format!(
                                    "cannot negate a {}",
                                    self.heap.value_type_name(&other)
                                ),
                                line,
                            })
                        }
                    };
                }
                Op::AddI => {
                    let imm = c as i8 as i64;
                    let v = self.stack[base + b as usize];
                    self.stack[base + a] = match v {
                        Value::Int(n) => Value::Int(n.wrapping_add(imm)),
                        Value::Float(f) => Value::Float(f + imm as f64),
                        other => {
                            return Err(RuntimeError::Type {
                                message: format!(
                                    "cannot add to a {}",
                                    self.heap.value_type_name(&other)
                                ),
                                line,
                            })
                        }
                    };
                }

                // Comparisons skip the following JMP when the result differs
                // from K (operand C).
                Op::Eq => {
                    let lhs = self.stack[base + a];
                    let rhs = self.stack[base + b as usize];
                    let result = self.heap.values_equal(&lhs, &rhs);
                    if result != (c != 0) {
                        self.frames[frame_idx].ip += 1;
                    }
                }
                Op::Lt | Op::Le => {
                    let lhs = self.stack[base + a];
                    let rhs = self.stack[base + b as usize];
                    let result = self.order_compare(op == Op::Le, lhs, rhs, line)?;
                    if result != (c != 0) {
                        self.frames[frame_idx].ip += 1;
                    }
                }
                Op::EqI => {
                    let lhs = self.stack[base + a];
                    let imm = b as i8 as i64;
                    let result = lhs.prim_eq(&Value::Int(imm));
                    if result != (c != 0) {
                        self.frames[frame_idx].ip += 1;
                    }
                }
                Op::EqK => {
                    let lhs = self.stack[base + a];
                    let k = self.constant_value(frame_idx, b as usize);
                    let result = self.heap.values_equal(&lhs, &k);
                    if result != (c != 0) {
                        self.frames[frame_idx].ip += 1;
                    }
                }
                Op::LtI | Op::LeI => {
                    let lhs = self.stack[base + a];
                    let imm = Value::Int(b as i8 as i64);
                    let result = self.order_compare(op == Op::LeI, lhs, imm, line)?;
                    if result != (c != 0) {
                        self.frames[frame_idx].ip += 1;
                    }
                }

                Op::Test => {
                    let truthy = self.stack[base + a].is_truthy();
                    if truthy != (c != 0) {
                        self.frames[frame_idx].ip += 1;
                    }
                }
                Op::Jmp => {
                    let ip = self.frames[frame_idx].ip;
                    self.frames[frame_idx].ip = (ip as i64 + instr.sbx() as i64) as usize;
                }

                Op::Call => {
                    let wanted = c as i32 - 1;
                    self.call_value(base + a, b, wanted, base + a)?;
                }
                Op::Invoke => {
                    let receiver = self.stack[base + a + 1];
                    let name = self.constant_string(frame_idx, c as usize);
                    let method = self.get_field(receiver, &name, line)?;
                    self.stack[base + a] = method;
                    self.call_value(base + a, b, 1, base + a)?;
                }
                Op::Return => {
                    if let Some(v) = self.do_return(a as u8, b, min_depth)? {
                        return Ok(v);
                    }
                }

                Op::Closure => {
                    let closure = self.make_closure(frame_idx, instr.bx())?;
                    self.stack[base + a] = Value::Obj(closure);
                }
                Op::Close => {
                    self.close_upvalues(base + a);
                }

                Op::ForPrep => {
                    self.for_prep(base + a, line)?;
                    let ip = self.frames[frame_idx].ip;
                    self.frames[frame_idx].ip = (ip as i64 + instr.sbx() as i64) as usize;
                }
                Op::ForLoop => {
                    if self.for_loop(base + a, line)? {
                        let ip = self.frames[frame_idx].ip;
                        self.frames[frame_idx].ip = (ip as i64 + instr.sbx() as i64) as usize;
                    }
                }
                Op::IterPrep => {
                    self.iter_prep(base + a, line)?;
                }
                Op::IterNext => {
                    self.iter_next(base + a, b as usize, line)?;
                }

                Op::NewList => {
                    let list = self.allocate_list(Vec::with_capacity(b as usize));
                    self.stack[base + a] = Value::Obj(list);
                }
                Op::NewMap => {
                    let map = self.allocate_map(b as usize);
                    if c == 1 {
                        let root = self.root_env;
                        if let Some(m) = self.heap.as_map_mut(map) {
                            m.env_parent = Some(root);
                        }
                    }
                    self.stack[base + a] = Value::Obj(map);
                }
                Op::NewClass => {
                    let name = self.constant_string(frame_idx, instr.bx() as usize);
                    self.maybe_collect();
                    let class = self.heap.alloc(Object::Class(ClassObject::new(name)));
                    self.stack[base + a] = Value::Obj(class);
                }
                Op::NewObj => {
                    self.new_object(frame_idx, base, a, b as usize, c as usize, line)?;
                }

                Op::Import => {
                    let name = self.constant_string(frame_idx, instr.bx() as usize);
                    let v = self.load_module(&name, None);
                    self.stack[base + a] = v;
                }
                Op::ImportFrom => {
                    let module = self.constant_string(frame_idx, b as usize);
                    let symbol = self.constant_string(frame_idx, c as usize);
                    let v = self.import_symbol(&module, &symbol, line)?;
                    self.stack[base + a] = v;
                }

                Op::Defer => {
                    let v = self.stack[base + a];
                    match v {
                        Value::Obj(h) if matches!(self.heap.get(h), Object::Closure(_)) => {
                            self.frames[frame_idx].defers.push(h);
                        }
                        other => {
                            return Err(RuntimeError::Type {
                                message: format!(
                                    "defer expects a closure, got {}",
                                    self.heap.value_type_name(&other)
                                ),
                                line,
                            })
                        }
                    }
                }
            }
        }
    }

    // ── Dispatch helpers ─────────────────────────────────────────────────────

    fn constant_value(&mut self, frame_idx: usize, idx: usize) -> Value {
        let constant = self.frames[frame_idx].proto.constants.get(idx).cloned();
        match constant {
            Some(ConstantValue::Str(s)) => {
                self.maybe_collect();
                Value::Obj(self.heap.intern_string(&s))
            }
            Some(other) => Value::from(other),
            None => Value::Nil,
        }
    }

    fn constant_string(&self, frame_idx: usize, idx: usize) -> String {
        match self.frames[frame_idx].proto.constants.get(idx) {
            Some(ConstantValue::Str(s)) => s.clone(),
            _ => String::new(),
        }
    }

    fn upvalue_cell(&self, frame_idx: usize, idx: usize) -> Handle {
        let closure = self.frames[frame_idx].closure;
        match self.heap.get(closure) {
            Object::Closure(c) => c.upvalues.get(idx).copied().unwrap_or(Handle(0)),
            _ => Handle(0),
        }
    }

    fn make_closure(&mut self, frame_idx: usize, proto_idx: u16) -> Result<Handle, RuntimeError> {
        let parent = Arc::clone(&self.frames[frame_idx].proto);
        let key = (Arc::as_ptr(&parent) as usize, proto_idx);
        let child = match self.proto_cache.get(&key) {
            Some(p) => Arc::clone(p),
            None => {
                let p = match parent.protos.get(proto_idx as usize) {
                    Some(p) => Arc::new(p.clone()),
                    None => {
                        return Err(RuntimeError::Type {
                            message: "closure references a missing prototype".into(),
                            line: self.current_line(),
                        })
                    }
                };
                self.proto_cache.insert(key, Arc::clone(&p));
                p
            }
        };

        let base = self.frames[frame_idx].base;
        let parent_closure = self.frames[frame_idx].closure;
        let descs = child.upvalues.clone();
        let mut upvalues = Vec::with_capacity(descs.len());
        for desc in &descs {
            if desc.is_local {
                upvalues.push(self.capture_upvalue(base + desc.index as usize));
            } else {
                let cell = match self.heap.get(parent_closure) {
                    Object::Closure(c) => c.upvalues.get(desc.index as usize).copied(),
                    _ => None,
                };
                upvalues.push(cell.unwrap_or(Handle(0)));
            }
        }

        self.maybe_collect();
        Ok(self.heap.alloc(Object::Closure(ClosureObject { proto: child, upvalues })))
    }

    fn arith(&self, op: Op, lhs: Value, rhs: Value, line: u32) -> Result<Value, RuntimeError> {
        use Value::{Float, Int};
        let type_err = |vm: &Vm| RuntimeError::Type {
            message: format!(
                "unsupported operands for arithmetic: {} and {}",
                vm.heap.value_type_name(&lhs),
                vm.heap.value_type_name(&rhs)
            ),
            line,
        };

        match op {
            Op::Add => match (lhs, rhs) {
                (Int(x), Int(y)) => Ok(Int(x.wrapping_add(y))),
                (Float(x), Float(y)) => Ok(Float(x + y)),
                (Int(x), Float(y)) => Ok(Float(x as f64 + y)),
                (Float(x), Int(y)) => Ok(Float(x + y as f64)),
                _ => Err(type_err(self)),
            },
            Op::Sub => match (lhs, rhs) {
                (Int(x), Int(y)) => Ok(Int(x.wrapping_sub(y))),
                (Float(x), Float(y)) => Ok(Float(x - y)),
                (Int(x), Float(y)) => Ok(Float(x as f64 - y)),
                (Float(x), Int(y)) => Ok(Float(x - y as f64)),
                _ => Err(type_err(self)),
            },
            Op::Mul => match (lhs, rhs) {
                (Int(x), Int(y)) => Ok(Int(x.wrapping_mul(y))),
                (Float(x), Float(y)) => Ok(Float(x * y)),
                (Int(x), Float(y)) => Ok(Float(x as f64 * y)),
                (Float(x), Int(y)) => Ok(Float(x * y as f64)),
                _ => Err(type_err(self)),
            },
            Op::Div => {
                let (x, y) = match (lhs.as_float(), rhs.as_float()) {
                    (Some(x), Some(y)) => (x, y),
                    _ => return Err(type_err(self)),
                };
                if y == 0.0 {
                    return Err(RuntimeError::DivisionByZero { line });
                }
                Ok(Float(x / y))
            }
            Op::IDiv => match (lhs, rhs) {
                (Int(_), Int(0)) => Err(RuntimeError::DivisionByZero { line }),
                (Int(x), Int(y)) => Ok(Int(floor_div(x, y))),
                _ => {
                    let (x, y) = match (lhs.as_float(), rhs.as_float()) {
                        (Some(x), Some(y)) => (x, y),
                        _ => return Err(type_err(self)),
                    };
                    if y == 0.0 {
                        return Err(RuntimeError::DivisionByZero { line });
                    }
                    Ok(Float((x / y).floor()))
                }
            },
            Op::Mod => match (lhs, rhs) {
                (Int(_), Int(0)) => Err(RuntimeError::DivisionByZero { line }),
                (Int(x), Int(y)) => Ok(Int(floor_mod(x, y))),
                _ => {
                    let (x, y) = match (lhs.as_float(), rhs.as_float()) {
                        (Some(x), Some(y)) => (x, y),
                        _ => return Err(type_err(self)),
                    };
                    // Result carries the sign of the divisor.
                    Ok(Float(x - (x / y).floor() * y))
                }
            },
            _ => Err(type_err(self)),
        }
    }

    fn order_compare(
        &self,
        or_equal: bool,
        lhs: Value,
        rhs: Value,
        line: u32,
    ) -> Result<bool, RuntimeError> {
        if let (Some(x), Some(y)) = (lhs.as_float(), rhs.as_float()) {
            return Ok(if or_equal { x <= y } else { x < y });
        }
        if let (Value::Obj(ha), Value::Obj(hb)) = (lhs, rhs) {
            if let (Object::Str(sa), Object::Str(sb)) = (self.heap.get(ha), self.heap.get(hb)) {
                return Ok(if or_equal { sa <= sb } else { sa < sb });
            }
        }
        Err(RuntimeError::Type {
            message: format!(
                "cannot order {} and {}",
                self.heap.value_type_name(&lhs),
                self.heap.value_type_name(&rhs)
            ),
            line,
        })
    }

    fn concat(&mut self, lhs: Value, rhs: Value, line: u32) -> Result<Value, RuntimeError> {
        let lhs_is_str =
            matches!(lhs, Value::Obj(h) if matches!(self.heap.get(h), Object::Str(_)));
        let rhs_is_str =
            matches!(rhs, Value::Obj(h) if matches!(self.heap.get(h), Object::Str(_)));
        if !lhs_is_str && !rhs_is_str {
            return Err(RuntimeError::Type {
                message: "concat requires at least one string operand".into(),
                line,
            });
        }
        let left = self.concat_piece(lhs, line)?;
        let right = self.concat_piece(rhs, line)?;
        let joined = format!("{}{}", left, right);
        Ok(Value::Obj(self.allocate_string(&joined)))
    }

    fn concat_piece(&self, v: Value, line: u32) -> Result<String, RuntimeError> {
        match v {
            Value::Obj(h) => match self.heap.get(h) {
                Object::Str(s) => Ok(s.to_string()),
                other => Err(RuntimeError::Type {
                    message: format!("cannot concatenate a {}", other.type_name()),
                    line,
                }),
            },
            Value::Int(n) => Ok(n.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Nil => Ok("nil".to_string()),
        }
    }

    // ── Field / index access ─────────────────────────────────────────────────

    pub(crate) fn get_field(
        &mut self,
        obj: Value,
        name: &str,
        line: u32,
    ) -> Result<Value, RuntimeError> {
        let handle = match obj {
            Value::Obj(h) => h,
            other => {
                return Err(RuntimeError::Type {
                    message: format!(
                        "cannot read field '{}' of {}",
                        name,
                        self.heap.value_type_name(&other)
                    ),
                    line,
                })
            }
        };
        match self.heap.get(handle) {
            Object::Map(_) => {
                let key = MapKey::str(name);
                let mut current = handle;
                let mut is_env_chain = false;
                loop {
                    let map = match self.heap.get(current) {
                        Object::Map(m) => m,
                        _ => break,
                    };
                    if let Some(v) = map.get(&key) {
                        return Ok(v);
                    }
                    is_env_chain = is_env_chain || map.env_parent.is_some();
                    match map.env_parent {
                        Some(parent) => current = parent,
                        None => break,
                    }
                }
                if is_env_chain {
                    // Environment lookups that miss everywhere are undefined
                    // globals, not silent nils.
                    return Err(RuntimeError::UndefinedGlobal { name: name.to_string(), line });
                }
                Ok(Value::Nil)
            }
            Object::Instance(inst) => {
                if let Some(v) = inst.field(name) {
                    return Ok(v);
                }
                let class = inst.class;
                match self.heap.get(class) {
                    Object::Class(cls) => Ok(cls.member(name).unwrap_or(Value::Nil)),
                    _ => Ok(Value::Nil),
                }
            }
            Object::Class(cls) => Ok(cls.member(name).unwrap_or(Value::Nil)),
            other => Err(RuntimeError::Type {
                message: format!("cannot read field '{}' of {}", name, other.type_name()),
                line,
            }),
        }
    }

    fn set_field(
        &mut self,
        obj: Value,
        name: &str,
        value: Value,
        line: u32,
    ) -> Result<(), RuntimeError> {
        let handle = match obj {
            Value::Obj(h) => h,
            other => {
                return Err(RuntimeError::Type {
                    message: format!(
                        "cannot write field '{}' of {}",
                        name,
                        self.heap.value_type_name(&other)
                    ),
                    line,
                })
            }
        };
        match self.heap.get_mut(handle) {
            Object::Map(m) => {
                m.insert(MapKey::str(name), value);
                Ok(())
            }
            Object::Instance(inst) => {
                inst.set_field(name, value);
                Ok(())
            }
            Object::Class(cls) => {
                cls.members.insert(name.to_string(), value);
                Ok(())
            }
            other => Err(RuntimeError::Type {
                message: format!("cannot write field '{}' of {}", name, other.type_name()),
                line,
            }),
        }
    }

    fn get_index(&mut self, obj: Value, key: Value, line: u32) -> Result<Value, RuntimeError> {
        let handle = match obj {
            Value::Obj(h) => h,
            other => {
                return Err(RuntimeError::Type {
                    message: format!("cannot index a {}", self.heap.value_type_name(&other)),
                    line,
                })
            }
        };

        enum Found {
            Value(Value),
            Char(String),
            FieldByName(String),
            OutOfRange(i64, usize),
            BadKey(String),
            NotIndexable(&'static str),
        }
        let found = match self.heap.get(handle) {
            Object::List(items) => match index_of(key) {
                Some(idx) if idx >= 0 && (idx as usize) < items.len() => {
                    Found::Value(items[idx as usize])
                }
                Some(idx) => Found::OutOfRange(idx, items.len()),
                None => Found::BadKey(format!(
                    "list index must be an integer, got {}",
                    self.heap.value_type_name(&key)
                )),
            },
            Object::Str(s) => match index_of(key) {
                Some(idx) => {
                    let chars: Vec<char> = s.chars().collect();
                    if idx >= 0 && (idx as usize) < chars.len() {
                        Found::Char(chars[idx as usize].to_string())
                    } else {
                        Found::OutOfRange(idx, chars.len())
                    }
                }
                None => Found::BadKey("string index must be an integer".into()),
            },
            Object::Map(m) => match self.heap.map_key(&key) {
                Some(MapKey::Str(s)) => Found::FieldByName(s.to_string()),
                Some(map_key) => Found::Value(m.get(&map_key).unwrap_or(Value::Nil)),
                None => Found::BadKey("unhashable map key".into()),
            },
            Object::Instance(_) | Object::Class(_) => {
                let name = match key {
                    Value::Obj(h) => self.heap.as_str(h).map(str::to_string),
                    _ => None,
                };
                match name {
                    Some(name) => Found::FieldByName(name),
                    None => Found::BadKey("instance index must be a string".into()),
                }
            }
            other => Found::NotIndexable(other.type_name()),
        };

        match found {
            Found::Value(v) => Ok(v),
            Found::Char(s) => Ok(Value::Obj(self.allocate_string(&s))),
            Found::FieldByName(name) => self.get_field(obj, &name, line),
            Found::OutOfRange(index, len) => Err(RuntimeError::IndexOutOfRange { index, len, line }),
            Found::BadKey(message) => Err(RuntimeError::Type { message, line }),
            Found::NotIndexable(type_name) => Err(RuntimeError::Type {
                message: format!("cannot index a {}", type_name),
                line,
            }),
        }
    }

    fn set_index(
        &mut self,
        obj: Value,
        key: Value,
        value: Value,
        line: u32,
    ) -> Result<(), RuntimeError> {
        let handle = match obj {
            Value::Obj(h) => h,
            other => {
                return Err(RuntimeError::Type {
                    message: format!("cannot index a {}", self.heap.value_type_name(&other)),
                    line,
                })
            }
        };

        enum Target {
            List(usize),
            Map,
            FieldBearing,
            Bad(&'static str),
        }
        let target = match self.heap.get(handle) {
            Object::List(items) => Target::List(items.len()),
            Object::Map(_) => Target::Map,
            Object::Instance(_) | Object::Class(_) => Target::FieldBearing,
            other => Target::Bad(other.type_name()),
        };

        match target {
            Target::List(len) => {
                let idx = index_of(key).ok_or_else(|| RuntimeError::Type {
                    message: "list index must be an integer".into(),
                    line,
                })?;
                // Writing one past the end appends (list literals build this
                // way); anything further is out of range.
                if idx < 0 || idx as usize > len {
                    return Err(RuntimeError::IndexOutOfRange { index: idx, len, line });
                }
                if let Object::List(items) = self.heap.get_mut(handle) {
                    if idx as usize == len {
                        items.push(value);
                    } else {
                        items[idx as usize] = value;
                    }
                }
                Ok(())
            }
            Target::Map => {
                let map_key = self.heap.map_key(&key).ok_or_else(|| RuntimeError::Type {
                    message: "unhashable map key".into(),
                    line,
                })?;
                if let Some(m) = self.heap.as_map_mut(handle) {
                    m.insert(map_key, value);
                }
                Ok(())
            }
            Target::FieldBearing => {
                let name = match key {
                    Value::Obj(h) => self.heap.as_str(h).map(str::to_string),
                    _ => None,
                };
                match name {
                    Some(name) => self.set_field(obj, &name, value, line),
                    None => Err(RuntimeError::Type {
                        message: "instance index must be a string".into(),
                        line,
                    }),
                }
            }
            Target::Bad(type_name) => Err(RuntimeError::Type {
                message: format!("cannot index a {}", type_name),
                line,
            }),
        }
    }

    // ── Numeric for loops ────────────────────────────────────────────────────

    fn for_prep(&mut self, abs: usize, line: u32) -> Result<(), RuntimeError> {
        for offset in 0..3 {
            let v = self.stack[abs + offset];
            if v.as_float().is_none() {
                let what = ["initial value", "limit", "step"][offset];
                return Err(RuntimeError::Arithmetic {
                    message: format!(
                        "'for' {} must be a number, got {}",
                        what,
                        self.heap.value_type_name(&v)
                    ),
                    line,
                });
            }
        }
        if matches!(self.stack[abs + 2], Value::Int(0))
            || matches!(self.stack[abs + 2], Value::Float(f) if f == 0.0)
        {
            return Err(RuntimeError::Arithmetic { message: "'for' step is zero".into(), line });
        }
        // Pre-decrement so the first ForLoop increment lands on the start.
        let index = self.stack[abs];
        let step = self.stack[abs + 2];
        self.stack[abs] = self.arith(Op::Sub, index, step, line)?;
        Ok(())
    }

    fn for_loop(&mut self, abs: usize, line: u32) -> Result<bool, RuntimeError> {
        let index = self.stack[abs];
        let limit = self.stack[abs + 1];
        let step = self.stack[abs + 2];
        let next = self.arith(Op::Add, index, step, line)?;
        self.stack[abs] = next;

        let ascending = match step {
            Value::Int(n) => n > 0,
            Value::Float(f) => f > 0.0,
            _ => true,
        };
        let keep_going = if ascending {
            self.order_compare(true, next, limit, line)?
        } else {
            self.order_compare(true, limit, next, line)?
        };
        Ok(keep_going)
    }

    // ── Iterators ────────────────────────────────────────────────────────────

    fn iter_prep(&mut self, abs: usize, line: u32) -> Result<(), RuntimeError> {
        let v = self.stack[abs];
        let handle = match v {
            Value::Obj(h) => h,
            other => {
                return Err(RuntimeError::Type {
                    message: format!(
                        "value of type {} is not iterable",
                        self.heap.value_type_name(&other)
                    ),
                    line,
                })
            }
        };
        enum IterKind {
            Callable,
            Cursor(Vec<MapKey>),
            Bad(&'static str),
        }
        let kind = match self.heap.get(handle) {
            // Callables are already iterators by contract.
            Object::Closure(_) | Object::Native(_) => IterKind::Callable,
            Object::List(_) | Object::Str(_) => IterKind::Cursor(Vec::new()),
            Object::Map(m) => IterKind::Cursor(m.entries.keys().cloned().collect()),
            other => IterKind::Bad(other.type_name()),
        };

        match kind {
            IterKind::Callable => Ok(()),
            IterKind::Cursor(keys) => {
                self.maybe_collect();
                let it = self
                    .heap
                    .alloc(Object::Iterator(IterState { target: handle, pos: 0, keys }));
                self.stack[abs] = Value::Obj(it);
                Ok(())
            }
            IterKind::Bad(type_name) => Err(RuntimeError::Type {
                message: format!("value of type {} is not iterable", type_name),
                line,
            }),
        }
    }

    /// Advance the iterator at `abs`, writing `n` results at abs+1.. — a
    /// falsy first result signals exhaustion to the loop's TEST.
    fn iter_next(&mut self, abs: usize, n: usize, line: u32) -> Result<(), RuntimeError> {
        let n = n.max(1);
        let handle = match self.stack[abs] {
            Value::Obj(h) => h,
            _ => {
                return Err(RuntimeError::Type { message: "iterator lost".into(), line });
            }
        };

        let (state_pos, target, key) = match self.heap.get(handle) {
            Object::Iterator(it) => (it.pos, it.target, it.keys.get(it.pos).cloned()),
            // A user-supplied callable: call it, results land directly.
            Object::Closure(_) | Object::Native(_) => {
                let scratch = self.stack_top;
                self.ensure_stack(scratch + 2);
                self.stack[scratch] = self.stack[abs];
                self.stack[scratch + 1] = Value::Nil;
                self.stack_top = scratch + 2;
                let depth = self.frames.len();
                self.call_value(scratch, 2, n as i32, abs + 1)?;
                if self.frames.len() == depth {
                    // Native iterator completed inline; restore the frame's
                    // stack window (closure callees restore it on return).
                    if let Some(f) = self.frames.last() {
                        self.stack_top = f.base + f.proto.max_stack_size as usize;
                    }
                }
                return Ok(());
            }
            _ => {
                return Err(RuntimeError::Type { message: "iterator lost".into(), line });
            }
        };

        enum Step {
            Done,
            Elem(Value),
            Char(String),
            Entry(MapKey, Value),
        }
        let step = match self.heap.get(target) {
            Object::List(items) => {
                if state_pos < items.len() {
                    Step::Elem(items[state_pos])
                } else {
                    Step::Done
                }
            }
            Object::Str(s) => match s.chars().nth(state_pos) {
                Some(ch) => Step::Char(ch.to_string()),
                None => Step::Done,
            },
            Object::Map(m) => match key {
                Some(map_key) => {
                    let entry = m.get(&map_key).unwrap_or(Value::Nil);
                    Step::Entry(map_key, entry)
                }
                None => Step::Done,
            },
            _ => Step::Done,
        };

        let mut results = vec![Value::Nil; n];
        let mut advanced = true;
        match step {
            Step::Done => advanced = false,
            Step::Elem(element) => {
                if n == 1 {
                    results[0] = element;
                } else {
                    results[0] = Value::Int(state_pos as i64);
                    results[1] = element;
                }
            }
            Step::Char(piece) => {
                let piece = Value::Obj(self.allocate_string(&piece));
                if n == 1 {
                    results[0] = piece;
                } else {
                    results[0] = Value::Int(state_pos as i64);
                    results[1] = piece;
                }
            }
            Step::Entry(map_key, entry) => {
                results[0] = self.heap.key_to_value(&map_key);
                if n > 1 {
                    results[1] = entry;
                }
            }
        }

        if advanced {
            if let Object::Iterator(it) = self.heap.get_mut(handle) {
                it.pos += 1;
            }
        }
        for (i, r) in results.into_iter().enumerate() {
            self.stack[abs + 1 + i] = r;
        }
        Ok(())
    }

    // ── Object construction ──────────────────────────────────────────────────

    fn new_object(
        &mut self,
        _frame_idx: usize,
        base: usize,
        a: usize,
        b: usize,
        argc: usize,
        line: u32,
    ) -> Result<(), RuntimeError> {
        let class_value = self.stack[base + b];
        let class_handle = match class_value {
            Value::Obj(h) if matches!(self.heap.get(h), Object::Class(_)) => h,
            other => {
                return Err(RuntimeError::Type {
                    message: format!(
                        "'new' expects a class, got {}",
                        self.heap.value_type_name(&other)
                    ),
                    line,
                })
            }
        };

        self.maybe_collect();
        let instance = self.heap.alloc(Object::Instance(InstanceObject::new(class_handle)));
        self.stack[base + a] = Value::Obj(instance);

        let init = match self.heap.get(class_handle) {
            Object::Class(cls) => cls.member("__init"),
            _ => None,
        };
        if let Some(init_value) = init {
            // Layout reserved by the compiler: [class][receiver][args...].
            // The class slot becomes the callable, the spare slot the
            // receiver; results are discarded.
            let abs_class = base + b;
            self.stack[abs_class] = init_value;
            self.stack[abs_class + 1] = Value::Obj(instance);
            self.call_value(abs_class, (1 + argc + 1) as u8, 0, abs_class)?;
        }
        Ok(())
    }

    // ── Modules (bytecode side) ──────────────────────────────────────────────

    fn import_symbol(
        &mut self,
        module: &str,
        symbol: &str,
        line: u32,
    ) -> Result<Value, RuntimeError> {
        let exports = self.load_module(module, None);
        if let Some(message) = self.error_value_message(&exports) {
            return Err(RuntimeError::Module { message });
        }
        match self.get_field(exports, symbol, line) {
            Ok(v) => Ok(v),
            Err(RuntimeError::UndefinedGlobal { .. }) => Ok(Value::Nil),
            Err(e) => Err(e),
        }
    }

    /// Module-manager error values are `{error: true, message: "..."}` maps.
    pub(crate) fn error_value_message(&self, v: &Value) -> Option<String> {
        let handle = v.as_handle()?;
        let map = self.heap.as_map(handle)?;
        let is_error = map.get(&MapKey::str("error"))?.is_truthy();
        if !is_error {
            return None;
        }
        let msg = map.get(&MapKey::str("message"))?;
        let msg_handle = msg.as_handle()?;
        Some(self.heap.as_str(msg_handle)?.to_string())
    }

    pub(crate) fn make_error_value(&mut self, message: &str) -> Value {
        let map = self.allocate_map(2);
        self.protect(Value::Obj(map));
        let msg = self.allocate_string(message);
        if let Some(m) = self.heap.as_map_mut(map) {
            m.insert(MapKey::str("error"), Value::Bool(true));
            m.insert(MapKey::str("message"), Value::Obj(msg));
        }
        self.unprotect(1);
        Value::Obj(map)
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Modulo with the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

fn index_of(key: Value) -> Option<i64> {
    match key {
        Value::Int(n) => Some(n),
        Value::Float(f) if f.fract() == 0.0 => Some(f as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_div_follows_floor_semantics() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_div(-7, -2), 3);
    }

    #[test]
    fn floor_mod_takes_the_sign_of_the_divisor() {
        assert_eq!(floor_mod(7, 3), 1);
        assert_eq!(floor_mod(-7, 3), 2);
        assert_eq!(floor_mod(7, -3), -2);
        assert_eq!(floor_mod(-7, -3), -1);
    }
}
