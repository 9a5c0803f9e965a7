/// SPT Script error types
/// Compile errors accumulate in a list (compilation keeps going best-effort);
/// runtime errors unwind the VM frame stack and carry the source line derived
/// from the prototype's line table.

use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Source locations
// ---------------------------------------------------------------------------

/// A point in the source text, as reported by the front-end collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLocation { line, column }
    }
}

// ---------------------------------------------------------------------------
// Compile errors
// ---------------------------------------------------------------------------

/// A structural problem discovered while lowering the AST.
/// Emission does not stop lowering of unrelated siblings; the chunk is
/// discarded by callers if any error occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub message: String,
    pub filename: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}: {}", self.filename, self.line, self.column, self.message)
    }
}

impl std::error::Error for CompileError {}

// ---------------------------------------------------------------------------
// Runtime errors
// ---------------------------------------------------------------------------

/// Errors raised by opcode handlers. Each carries enough context for the
/// installed error handler; `line` is filled in by the VM from the line table
/// of the faulting prototype.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    #[error("Arithmetic error: {message} (line {line})")]
    Arithmetic { message: String, line: u32 },

    #[error("Division by zero (line {line})")]
    DivisionByZero { line: u32 },

    #[error("Type error: {message} (line {line})")]
    Type { message: String, line: u32 },

    #[error("Attempt to call non-callable value of type '{type_name}' (line {line})")]
    NotCallable { type_name: String, line: u32 },

    #[error("Index {index} out of range (len {len}) (line {line})")]
    IndexOutOfRange { index: i64, len: usize, line: u32 },

    #[error("Expected {expected} arguments, got {found} (line {line})")]
    Arity { expected: usize, found: usize, line: u32 },

    #[error("Undefined global '{name}' (line {line})")]
    UndefinedGlobal { name: String, line: u32 },

    #[error("Module error: {message}")]
    Module { message: String },

    #[error("Call stack overflow — frame limit {limit} exceeded (line {line})")]
    StackOverflow { limit: usize, line: u32 },
}

impl RuntimeError {
    pub fn line(&self) -> u32 {
        match self {
            RuntimeError::Arithmetic { line, .. }
            | RuntimeError::DivisionByZero { line }
            | RuntimeError::Type { line, .. }
            | RuntimeError::NotCallable { line, .. }
            | RuntimeError::IndexOutOfRange { line, .. }
            | RuntimeError::Arity { line, .. }
            | RuntimeError::UndefinedGlobal { line, .. }
            | RuntimeError::StackOverflow { line, .. } => *line,
            RuntimeError::Module { .. } => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec errors
// ---------------------------------------------------------------------------

/// Errors from the bytecode serializer/deserializer.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unexpected end of bytecode stream at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("Invalid bytecode magic: {found:#010x}")]
    BadMagic { found: u32 },

    #[error("Bytecode version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Unknown constant tag {tag} at offset {offset}")]
    BadConstantTag { tag: u8, offset: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Interpret result
// ---------------------------------------------------------------------------

/// Outcome of running a chunk through the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}
