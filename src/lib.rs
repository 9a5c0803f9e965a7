/// SPT Script — compiler + register VM core
///
/// Module layout:
///   - ast        — AST node shapes (the front-end collaborator's output)
///   - errors     — compile/runtime/codec error types, InterpretResult
///   - bytecode   — instruction set, encoding, Prototype, CompiledChunk
///   - codegen    — slot & scope manager, upvalue resolution, jump fixup
///   - compiler   — AST lowering onto the code generator
///   - core       — value model (Value, constants, map keys) and OOP layouts
///   - gc         — slab heap, object variants, mark-sweep collector
///   - vm         — register-VM interpreter and host API
///   - serializer — deterministic bytecode codec + file persistence
///   - module     — module manager: resolve, compile, execute, cache, reload
///   - intrinsics — default native-function set

pub mod ast;
pub mod bytecode;
pub mod codegen;
pub mod compiler;
pub mod core;
pub mod errors;
pub mod gc;
pub mod intrinsics;
pub mod module;
pub mod serializer;
pub mod vm;

// ── Re-exports for convenience ────────────────────────────────────────────────
pub use crate::bytecode::{dump_chunk, CompiledChunk, Instr, Op, Prototype};
pub use crate::compiler::Compiler;
pub use crate::core::value::{Handle, Value};
pub use crate::errors::{CodecError, CompileError, InterpretResult, RuntimeError, SourceLocation};
pub use crate::module::{CacheStats, FileSystemLoader, ModuleLoader, ModuleState};
pub use crate::vm::{Vm, VmConfig};
