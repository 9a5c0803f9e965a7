/// Slab Heap + Stop-The-World Mark-Sweep Collector
///
/// ARCHITECTURE:
///   • Every heap object lives in a typed slab slot addressed by `Handle`
///     (a plain u32 index). Values hold handles, never owning references,
///     so cyclic object graphs — closures capturing closures, instances
///     pointing at classes — fall out naturally.
///   • Freed slots are threaded into a free list through `Object::Free`.
///   • Collection is threshold-based: when bytes allocated since the last
///     cycle exceed the high-water mark, the VM enumerates roots, the heap
///     traces and sweeps, and the threshold grows multiplicatively.
///   • The VM may push values on a protection stack for the duration of a
///     multi-step native operation; protected values are roots.
///
/// The heap never runs a collection on its own: the VM decides when, because
/// only the VM can enumerate roots (value stack, frames, module table, root
/// environment).

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use crate::bytecode::Prototype;
use crate::core::oop::{ClassObject, InstanceObject};
use crate::core::value::{Handle, MapKey, Value};
use crate::errors::RuntimeError;
use crate::vm::Vm;

/// Initial collection threshold (bytes) and growth factor after each cycle.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

/// Nesting cap for display of nested lists/maps.
const DISPLAY_DEPTH: usize = 4;

pub type NativeFn = Rc<dyn Fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>>;

// ---------------------------------------------------------------------------
// Heap object layouts
// ---------------------------------------------------------------------------

/// State of a captured variable cell. All closures capturing the same
/// variable hold the same cell handle; writes go through the cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueState {
    /// Points at a live value-stack slot (absolute index).
    Open(usize),
    /// Owns its value; the stack slot is gone.
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct ClosureObject {
    pub proto: Arc<Prototype>,
    pub upvalues: Vec<Handle>,
}

#[derive(Debug, Clone, Default)]
pub struct MapObject {
    pub entries: HashMap<MapKey, Value>,
    /// Set on module environment maps: missed lookups fall through to the
    /// root environment so scripts can reach registered natives.
    pub env_parent: Option<Handle>,
}

impl MapObject {
    pub fn with_capacity(cap: usize) -> Self {
        MapObject { entries: HashMap::with_capacity(cap), env_parent: None }
    }

    pub fn get(&self, key: &MapKey) -> Option<Value> {
        self.entries.get(key).copied()
    }

    pub fn insert(&mut self, key: MapKey, value: Value) {
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct NativeObject {
    pub name: String,
    /// Expected argument count, counting the implicit receiver.
    pub arity: u8,
    pub variadic: bool,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeObject({}/{}{})", self.name, self.arity, if self.variadic { "+" } else { "" })
    }
}

/// Stateful cursor created by ITERPREP over a list, map or string.
#[derive(Debug, Clone)]
pub struct IterState {
    pub target: Handle,
    pub pos: usize,
    /// Key snapshot for map iteration (hash maps cannot be indexed by pos).
    pub keys: Vec<MapKey>,
}

#[derive(Debug)]
pub enum Object {
    Str(Box<str>),
    List(Vec<Value>),
    Map(MapObject),
    Closure(ClosureObject),
    Upvalue(UpvalueState),
    Class(ClassObject),
    Instance(InstanceObject),
    Native(NativeObject),
    Iterator(IterState),
    /// Slab free-list link.
    Free { next: Option<u32> },
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Str(_) => "string",
            Object::List(_) => "list",
            Object::Map(_) => "map",
            Object::Closure(_) => "function",
            Object::Upvalue(_) => "upvalue",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::Native(_) => "function",
            Object::Iterator(_) => "iterator",
            Object::Free { .. } => "free",
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub collections: u64,
    pub objects_freed: u64,
    pub bytes_allocated: usize,
    pub live_objects: usize,
    pub last_pause_us: u64,
    pub total_pause_us: u64,
}

// ---------------------------------------------------------------------------
// The heap
// ---------------------------------------------------------------------------

struct GcBox {
    marked: bool,
    obj: Object,
}

pub struct Heap {
    slots: Vec<GcBox>,
    free_head: Option<u32>,
    /// Content-interned strings (constants, field names). Entries are purged
    /// when the sweep frees their handle.
    interned: HashMap<Box<str>, Handle>,
    gray: Vec<Handle>,
    bytes_allocated: usize,
    next_gc: usize,
    pub stats: GcStats,
    pub debug: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::with_capacity(256),
            free_head: None,
            interned: HashMap::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            stats: GcStats::default(),
            debug: false,
        }
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    pub fn alloc(&mut self, obj: Object) -> Handle {
        let size = approx_size(&obj);
        self.bytes_allocated += size;
        self.stats.bytes_allocated = self.bytes_allocated;
        match self.free_head {
            Some(idx) => {
                let next = match &self.slots[idx as usize].obj {
                    Object::Free { next } => *next,
                    _ => None,
                };
                self.free_head = next;
                self.slots[idx as usize] = GcBox { marked: false, obj };
                Handle(idx)
            }
            None => {
                self.slots.push(GcBox { marked: false, obj });
                Handle((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Allocate a string, reusing an existing interned handle when possible.
    pub fn intern_string(&mut self, s: &str) -> Handle {
        if let Some(h) = self.interned.get(s) {
            return *h;
        }
        let h = self.alloc(Object::Str(s.into()));
        self.interned.insert(s.into(), h);
        h
    }

    pub fn alloc_string(&mut self, s: impl Into<Box<str>>) -> Handle {
        self.alloc(Object::Str(s.into()))
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> Handle {
        self.alloc(Object::List(items))
    }

    pub fn alloc_map(&mut self, cap_hint: usize) -> Handle {
        self.alloc(Object::Map(MapObject::with_capacity(cap_hint)))
    }

    // ── Access ───────────────────────────────────────────────────────────────

    #[inline]
    pub fn get(&self, h: Handle) -> &Object {
        &self.slots[h.0 as usize].obj
    }

    #[inline]
    pub fn get_mut(&mut self, h: Handle) -> &mut Object {
        &mut self.slots[h.0 as usize].obj
    }

    pub fn as_str(&self, h: Handle) -> Option<&str> {
        match self.get(h) {
            Object::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self, h: Handle) -> Option<&Vec<Value>> {
        match self.get(h) {
            Object::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self, h: Handle) -> Option<&MapObject> {
        match self.get(h) {
            Object::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self, h: Handle) -> Option<&mut MapObject> {
        match self.get_mut(h) {
            Object::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_closure(&self, h: Handle) -> Option<&ClosureObject> {
        match self.get(h) {
            Object::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn value_type_name(&self, v: &Value) -> &'static str {
        match v {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Obj(h) => self.get(*h).type_name(),
        }
    }

    // ── Value semantics that need object access ──────────────────────────────

    /// Equality: structural for primitives, identity for objects, content
    /// for strings.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Obj(ha), Value::Obj(hb)) => {
                if ha == hb {
                    return true;
                }
                match (self.get(*ha), self.get(*hb)) {
                    (Object::Str(sa), Object::Str(sb)) => sa == sb,
                    _ => false,
                }
            }
            _ => a.prim_eq(b),
        }
    }

    /// Build the hashable key form of a value, or None for unhashable ones.
    pub fn map_key(&self, v: &Value) -> Option<MapKey> {
        match v {
            Value::Obj(h) => match self.get(*h) {
                Object::Str(s) => Some(MapKey::Str(s.clone())),
                Object::Free { .. } => None,
                _ => Some(MapKey::Obj(h.0)),
            },
            _ => MapKey::from_primitive(v),
        }
    }

    /// Reverse of `map_key` for iteration; string keys re-enter the heap
    /// through the intern table.
    pub fn key_to_value(&mut self, key: &MapKey) -> Value {
        match key {
            MapKey::Nil => Value::Nil,
            MapKey::Bool(b) => Value::Bool(*b),
            MapKey::Int(n) => Value::Int(*n),
            MapKey::FloatBits(bits) => Value::Float(f64::from_bits(*bits)),
            MapKey::Str(s) => {
                let h = self.intern_string(s);
                Value::Obj(h)
            }
            MapKey::Obj(id) => Value::Obj(Handle(*id)),
        }
    }

    pub fn display_value(&self, v: &Value) -> String {
        self.display_depth(v, 0)
    }

    fn display_depth(&self, v: &Value, depth: usize) -> String {
        match v {
            Value::Nil => "nil".into(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Obj(h) => match self.get(*h) {
                Object::Str(s) => s.to_string(),
                Object::List(items) => {
                    if depth >= DISPLAY_DEPTH {
                        return "[...]".into();
                    }
                    let parts: Vec<String> =
                        items.iter().map(|x| self.display_depth(x, depth + 1)).collect();
                    format!("[{}]", parts.join(", "))
                }
                Object::Map(m) => {
                    if depth >= DISPLAY_DEPTH {
                        return "{...}".into();
                    }
                    let mut parts: Vec<String> = m
                        .entries
                        .iter()
                        .map(|(k, val)| {
                            format!("{}: {}", display_key(k), self.display_depth(val, depth + 1))
                        })
                        .collect();
                    parts.sort();
                    format!("{{{}}}", parts.join(", "))
                }
                Object::Closure(c) => format!("<fn {}>", c.proto.name),
                Object::Native(n) => format!("<native fn {}>", n.name),
                Object::Class(c) => format!("<class {}>", c.name),
                Object::Instance(i) => match self.get(i.class) {
                    Object::Class(c) => format!("<{} instance>", c.name),
                    _ => "<instance>".into(),
                },
                Object::Upvalue(_) => "<upvalue>".into(),
                Object::Iterator(_) => "<iterator>".into(),
                Object::Free { .. } => "<freed>".into(),
            },
        }
    }

    // ── Collection ───────────────────────────────────────────────────────────

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn mark_value(&mut self, v: &Value) {
        if let Value::Obj(h) = v {
            self.mark_handle(*h);
        }
    }

    pub fn mark_handle(&mut self, h: Handle) {
        let slot = &mut self.slots[h.0 as usize];
        if !slot.marked && !matches!(slot.obj, Object::Free { .. }) {
            slot.marked = true;
            self.gray.push(h);
        }
    }

    /// Trace all children of marked objects, then free everything unmarked.
    /// The caller (VM) must have marked every root first. Returns the number
    /// of freed objects.
    pub fn trace_and_sweep(&mut self) -> usize {
        let start = Instant::now();

        while let Some(h) = self.gray.pop() {
            // Children are collected first to release the immutable borrow.
            let mut children: Vec<Handle> = Vec::new();
            match self.get(h) {
                Object::Str(_) | Object::Native(_) | Object::Free { .. } => {}
                Object::List(items) => {
                    children.extend(items.iter().filter_map(|v| v.as_handle()));
                }
                Object::Map(m) => {
                    for (k, v) in &m.entries {
                        if let MapKey::Obj(id) = k {
                            children.push(Handle(*id));
                        }
                        if let Some(ch) = v.as_handle() {
                            children.push(ch);
                        }
                    }
                    if let Some(p) = m.env_parent {
                        children.push(p);
                    }
                }
                Object::Closure(c) => children.extend(c.upvalues.iter().copied()),
                Object::Upvalue(UpvalueState::Closed(v)) => {
                    children.extend(v.as_handle());
                }
                Object::Upvalue(UpvalueState::Open(_)) => {
                    // The stack slot it points at is a root already.
                }
                Object::Class(c) => {
                    children.extend(c.members.values().filter_map(|v| v.as_handle()));
                }
                Object::Instance(i) => {
                    children.push(i.class);
                    children.extend(i.fields.values().filter_map(|v| v.as_handle()));
                }
                Object::Iterator(it) => {
                    children.push(it.target);
                    for k in &it.keys {
                        if let MapKey::Obj(id) = k {
                            children.push(Handle(*id));
                        }
                    }
                }
            }
            for child in children {
                self.mark_handle(child);
            }
        }

        // Sweep.
        let mut freed = 0usize;
        let mut live = 0usize;
        for idx in 0..self.slots.len() {
            let slot = &mut self.slots[idx];
            if matches!(slot.obj, Object::Free { .. }) {
                continue;
            }
            if slot.marked {
                slot.marked = false;
                live += 1;
            } else {
                self.bytes_allocated = self.bytes_allocated.saturating_sub(approx_size(&slot.obj));
                slot.obj = Object::Free { next: self.free_head };
                self.free_head = Some(idx as u32);
                freed += 1;
            }
        }

        // Drop intern entries whose string was freed.
        let slots = &self.slots;
        self.interned
            .retain(|_, h| matches!(slots[h.0 as usize].obj, Object::Str(_)));

        self.next_gc = (self.bytes_allocated * HEAP_GROW_FACTOR).max(FIRST_GC_THRESHOLD);

        let pause = start.elapsed().as_micros() as u64;
        self.stats.collections += 1;
        self.stats.objects_freed += freed as u64;
        self.stats.live_objects = live;
        self.stats.bytes_allocated = self.bytes_allocated;
        self.stats.last_pause_us = pause;
        self.stats.total_pause_us += pause;

        if self.debug {
            eprintln!(
                "[GC] cycle #{}: freed {} objects, {} live, {} KB retained, {} µs",
                self.stats.collections,
                freed,
                live,
                self.bytes_allocated / 1024,
                pause
            );
        }

        freed
    }

    pub fn object_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.obj, Object::Free { .. }))
            .count()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

fn display_key(k: &MapKey) -> String {
    match k {
        MapKey::Nil => "nil".into(),
        MapKey::Bool(b) => b.to_string(),
        MapKey::Int(n) => n.to_string(),
        MapKey::FloatBits(bits) => f64::from_bits(*bits).to_string(),
        MapKey::Str(s) => s.to_string(),
        MapKey::Obj(id) => format!("<obj #{}>", id),
    }
}

fn approx_size(obj: &Object) -> usize {
    let base = std::mem::size_of::<Object>();
    base + match obj {
        Object::Str(s) => s.len(),
        Object::List(items) => items.capacity() * std::mem::size_of::<Value>(),
        Object::Map(m) => m.entries.capacity() * 48,
        Object::Closure(c) => c.upvalues.capacity() * 4,
        Object::Class(c) => c.members.capacity() * 48,
        Object::Instance(i) => i.fields.capacity() * 48,
        Object::Iterator(it) => it.keys.capacity() * 24,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("transient");
        heap.trace_and_sweep(); // nothing marked: everything dies
        let b = heap.alloc_string("recycled");
        assert_eq!(a, b, "the freed slot should be recycled first");
        assert_eq!(heap.as_str(b), Some("recycled"));
    }

    #[test]
    fn marked_objects_survive_and_children_are_traced() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("kept");
        let list = heap.alloc_list(vec![Value::Obj(s)]);
        let doomed = heap.alloc_string("doomed");

        heap.mark_handle(list);
        let freed = heap.trace_and_sweep();

        assert_eq!(freed, 1);
        assert_eq!(heap.as_str(s), Some("kept"));
        assert!(matches!(heap.get(doomed), Object::Free { .. }));
    }

    #[test]
    fn intern_table_is_weak() {
        let mut heap = Heap::new();
        let h = heap.intern_string("ephemeral");
        assert_eq!(heap.intern_string("ephemeral"), h);
        heap.trace_and_sweep();
        // Slot was freed, so a fresh intern must re-allocate rather than
        // hand out a dangling handle.
        let h2 = heap.intern_string("ephemeral");
        assert_eq!(heap.as_str(h2), Some("ephemeral"));
    }

    #[test]
    fn string_equality_is_by_content() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("same");
        let b = heap.alloc_string("same");
        assert_ne!(a, b);
        assert!(heap.values_equal(&Value::Obj(a), &Value::Obj(b)));
    }
}
