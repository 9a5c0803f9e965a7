/// Bytecode Instruction Set — Register-Based, 32-bit Fixed-Width
///
/// INSTRUCTION FORMATS (Lua 5.x inspired):
///
///   iABC:  |  C: 8  |  B: 8  |  A: 8  | OP: 8  |  — 3 register operands
///   iABx:  |     Bx: 16      |  A: 8  | OP: 8  |  — 1 reg + 16-bit unsigned
///   iAsBx: |    sBx: 16      |  A: 8  | OP: 8  |  — 1 reg + 16-bit signed
///
/// Registers 0..maxStackSize-1 address the current frame's window on the
/// value stack. Constant-pool indices up to 255 fit a byte operand; larger
/// indices go through LoadK into a register and the indexed opcode form.
///
/// Comparison opcodes write no value: when the result differs from the K
/// operand the following instruction (always a Jmp) is skipped.

use crate::core::value::ConstantValue;

pub const BYTECODE_VERSION: u32 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // ── Moves & constants ────────────────────────────────────────────────────
    Move      = 0,  // A, B     → R[A] = R[B]
    LoadK     = 1,  // A, Bx    → R[A] = K[Bx]
    LoadBool  = 2,  // A, B, C  → R[A] = bool(B); if C: ip += 1
    LoadNil   = 3,  // A, B     → R[A..=A+B] = nil

    // ── Upvalues, fields, indexing ───────────────────────────────────────────
    GetUpval  = 4,  // A, B     → R[A] = UV[B]
    SetUpval  = 5,  // A, B     → UV[B] = R[A]
    GetField  = 6,  // A, B, C  → R[A] = R[B].K[C]
    SetField  = 7,  // A, B, C  → R[A].K[B] = R[C]
    GetIndex  = 8,  // A, B, C  → R[A] = R[B][R[C]]
    SetIndex  = 9,  // A, B, C  → R[A][R[B]] = R[C]

    // ── Arithmetic ───────────────────────────────────────────────────────────
    Add       = 10, // A, B, C  → R[A] = R[B] + R[C]
    Sub       = 11,
    Mul       = 12,
    Div       = 13, //            int / int yields float
    IDiv      = 14, //            floor division, int result for int operands
    Mod       = 15, //            result takes the sign of the divisor
    Concat    = 16, // A, B, C  → R[A] = concat(R[B], R[C])
    Unm       = 17, // A, B     → R[A] = -R[B]
    AddI      = 18, // A, B, C  → R[A] = R[B] + imm(C as i8)

    // ── Comparison (skip-next encoding, next instr is always Jmp) ────────────
    Eq        = 19, // A, B, C  → if (R[A] == R[B]) != C: ip += 1
    Lt        = 20, // A, B, C  → if (R[A] <  R[B]) != C: ip += 1
    Le        = 21, // A, B, C  → if (R[A] <= R[B]) != C: ip += 1
    EqI       = 22, // A, B, C  → if (R[A] == imm(B as i8)) != C: ip += 1
    EqK       = 23, // A, B, C  → if (R[A] == K[B]) != C: ip += 1
    LtI       = 24, // A, B, C  → if (R[A] <  imm(B as i8)) != C: ip += 1
    LeI       = 25, // A, B, C  → if (R[A] <= imm(B as i8)) != C: ip += 1

    // ── Control flow ─────────────────────────────────────────────────────────
    Test      = 26, // A, _, C  → if truthy(R[A]) != C: ip += 1
    Jmp       = 27, // sBx      → ip += sBx

    // ── Calls & returns ──────────────────────────────────────────────────────
    /// R[A] = callable, R[A+1] = receiver (nil for bare calls), args follow.
    /// B = nargs+1 counting the receiver (0 = all values up to stack top);
    /// C = nresults+1 (0 = keep all results).
    Call      = 28, // A, B, C
    /// Combined GetField + Call: method K[C] looked up on R[A+1], stored in
    /// R[A], then called with the same layout as Call (B = nargs+1).
    Invoke    = 29, // A, B, C
    Return    = 30, // A, B     → return R[A..A+B-1] (B = nresults+1; 0 = all)

    // ── Closures & loops ─────────────────────────────────────────────────────
    Closure   = 31, // A, Bx    → R[A] = closure(protos[Bx])
    Close     = 32, // A        → close open upvalues at slots >= A
    ForPrep   = 33, // A, sBx   → index -= step; ip += sBx (to ForLoop)
    ForLoop   = 34, // A, sBx   → index += step; if in range: ip += sBx
    IterPrep  = 35, // A        → R[A] = iterator over R[A]
    IterNext  = 36, // A, B     → advance R[A], write B results at R[A+1..]

    // ── Aggregates ───────────────────────────────────────────────────────────
    NewList   = 37, // A, B     → R[A] = list with capacity hint B
    NewMap    = 38, // A, B, C  → R[A] = map (cap hint B; C=1 links root env)
    NewClass  = 39, // A, Bx    → R[A] = class named K[Bx]
    NewObj    = 40, // A, B, C  → R[A] = new R[B](C args at R[B+1..])

    // ── Modules ──────────────────────────────────────────────────────────────
    Import     = 41, // A, Bx    → R[A] = loadModule(K[Bx])
    ImportFrom = 42, // A, B, C  → R[A] = loadModule(K[B]).exports[K[C]]

    // ── Deferred actions ─────────────────────────────────────────────────────
    Defer     = 43, // A        → register closure R[A] with the current scope
}

pub const OP_COUNT: u8 = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::Move => "MOVE",           Op::LoadK => "LOADK",
            Op::LoadBool => "LOADBOOL",   Op::LoadNil => "LOADNIL",
            Op::GetUpval => "GETUPVAL",   Op::SetUpval => "SETUPVAL",
            Op::GetField => "GETFIELD",   Op::SetField => "SETFIELD",
            Op::GetIndex => "GETINDEX",   Op::SetIndex => "SETINDEX",
            Op::Add => "ADD",             Op::Sub => "SUB",
            Op::Mul => "MUL",             Op::Div => "DIV",
            Op::IDiv => "IDIV",           Op::Mod => "MOD",
            Op::Concat => "CONCAT",       Op::Unm => "UNM",
            Op::AddI => "ADDI",           Op::Eq => "EQ",
            Op::Lt => "LT",               Op::Le => "LE",
            Op::EqI => "EQI",             Op::EqK => "EQK",
            Op::LtI => "LTI",             Op::LeI => "LEI",
            Op::Test => "TEST",           Op::Jmp => "JMP",
            Op::Call => "CALL",           Op::Invoke => "INVOKE",
            Op::Return => "RETURN",       Op::Closure => "CLOSURE",
            Op::Close => "CLOSE",         Op::ForPrep => "FORPREP",
            Op::ForLoop => "FORLOOP",     Op::IterPrep => "ITERPREP",
            Op::IterNext => "ITERNEXT",   Op::NewList => "NEWLIST",
            Op::NewMap => "NEWMAP",       Op::NewClass => "NEWCLASS",
            Op::NewObj => "NEWOBJ",       Op::Import => "IMPORT",
            Op::ImportFrom => "IMPORT_FROM", Op::Defer => "DEFER",
        }
    }

    pub fn mode(self) -> OpMode {
        match self {
            Op::LoadK | Op::Closure | Op::NewClass | Op::Import => OpMode::IABx,
            Op::Jmp | Op::ForPrep | Op::ForLoop => OpMode::IAsBx,
            _ => OpMode::IABC,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Op> {
        if byte < OP_COUNT {
            // Discriminants are dense 0..OP_COUNT.
            Some(unsafe { std::mem::transmute::<u8, Op>(byte) })
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Instruction encoding — 32 bits, fixed width
// ---------------------------------------------------------------------------

const SBX_BIAS: i32 = 32768;

/// A 32-bit instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Instr(pub u32);

impl Instr {
    // iABC: op=8, A=8, B=8, C=8
    #[inline]
    pub fn abc(op: Op, a: u8, b: u8, c: u8) -> Self {
        Instr((op as u32) | ((a as u32) << 8) | ((b as u32) << 16) | ((c as u32) << 24))
    }

    // iABx: op=8, A=8, Bx=16 (unsigned)
    #[inline]
    pub fn abx(op: Op, a: u8, bx: u16) -> Self {
        Instr((op as u32) | ((a as u32) << 8) | ((bx as u32) << 16))
    }

    // iAsBx: op=8, A=8, sBx=16 (signed, stored with +32768 bias)
    #[inline]
    pub fn asbx(op: Op, a: u8, sbx: i16) -> Self {
        let biased = (sbx as i32 + SBX_BIAS) as u16;
        Instr((op as u32) | ((a as u32) << 8) | ((biased as u32) << 16))
    }

    #[inline]
    pub fn op(self) -> Op {
        // All emitted instructions carry a valid opcode byte.
        Op::from_u8((self.0 & 0xFF) as u8).unwrap_or(Op::Move)
    }

    #[inline]
    pub fn a(self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    #[inline]
    pub fn b(self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    #[inline]
    pub fn c(self) -> u8 {
        ((self.0 >> 24) & 0xFF) as u8
    }

    #[inline]
    pub fn bx(self) -> u16 {
        ((self.0 >> 16) & 0xFFFF) as u16
    }

    #[inline]
    pub fn sbx(self) -> i16 {
        let raw = ((self.0 >> 16) & 0xFFFF) as u16;
        (raw as i32 - SBX_BIAS) as i16
    }

    /// Patch the signed jump displacement in place (for back-patching).
    #[inline]
    pub fn patch_sbx(&mut self, sbx: i16) {
        let biased = (sbx as i32 + SBX_BIAS) as u16;
        self.0 = (self.0 & 0x0000_FFFF) | ((biased as u32) << 16);
    }
}

impl std::fmt::Debug for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = self.op();
        match op.mode() {
            OpMode::IABC => write!(
                f,
                "{:<12} A={:<3} B={:<3} C={:<3}",
                op.name(),
                self.a(),
                self.b(),
                self.c()
            ),
            OpMode::IABx => write!(f, "{:<12} A={:<3} Bx={:<5}", op.name(), self.a(), self.bx()),
            OpMode::IAsBx => {
                write!(f, "{:<12} A={:<3} sBx={:<6}", op.name(), self.a(), self.sbx())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prototype — the compiled body of a function
// ---------------------------------------------------------------------------

/// Descriptor of a captured variable: index into the enclosing function's
/// locals (is_local) or into its upvalue array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
}

/// An immutable compiled function body. Shared by reference after
/// compilation; the VM never mutates one.
#[derive(Debug, Clone, PartialEq)]
pub struct Prototype {
    pub name: String,
    pub source: String,
    pub line_defined: u32,
    pub last_line_defined: u32,
    /// Declared parameter count, not counting the implicit receiver slot.
    pub num_params: u8,
    pub num_upvalues: u8,
    pub max_stack_size: u8,
    pub is_vararg: bool,
    pub code: Vec<Instr>,
    pub constants: Vec<ConstantValue>,
    /// Source line per instruction, parallel to `code`.
    pub line_info: Vec<u32>,
    pub upvalues: Vec<UpvalueDesc>,
    pub protos: Vec<Prototype>,
}

impl Prototype {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Prototype {
            name: name.into(),
            source: source.into(),
            line_defined: 0,
            last_line_defined: 0,
            num_params: 0,
            num_upvalues: 0,
            max_stack_size: 0,
            is_vararg: false,
            code: Vec::new(),
            constants: Vec::new(),
            line_info: Vec::new(),
            upvalues: Vec::new(),
            protos: Vec::new(),
        }
    }

    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// CompiledChunk — a compiled module
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledChunk {
    pub version: u32,
    pub module_name: String,
    pub exports: Vec<String>,
    pub main_proto: Prototype,
}

impl CompiledChunk {
    pub fn new(module_name: impl Into<String>, main_proto: Prototype) -> Self {
        CompiledChunk {
            version: BYTECODE_VERSION,
            module_name: module_name.into(),
            exports: Vec::new(),
            main_proto,
        }
    }

    /// Module names referenced by Import/ImportFrom anywhere in the chunk,
    /// in first-occurrence order. Used by the module manager to pre-load
    /// dependencies before executing the module body.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = Vec::new();
        collect_deps(&self.main_proto, &mut deps);
        deps
    }
}

fn collect_deps(proto: &Prototype, deps: &mut Vec<String>) {
    for instr in &proto.code {
        let idx = match instr.op() {
            Op::Import => Some(instr.bx() as usize),
            Op::ImportFrom => Some(instr.b() as usize),
            _ => None,
        };
        if let Some(idx) = idx {
            if let Some(ConstantValue::Str(name)) = proto.constants.get(idx) {
                if !deps.iter().any(|d| d == name) {
                    deps.push(name.clone());
                }
            }
        }
    }
    for child in &proto.protos {
        collect_deps(child, deps);
    }
}

// ---------------------------------------------------------------------------
// Disassembler
// ---------------------------------------------------------------------------

/// Render a chunk as human-readable text (for `--dump`-style tooling and
/// debugging sessions).
pub fn dump_chunk(chunk: &CompiledChunk) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "chunk '{}' (version {}, {} exports)\n",
        chunk.module_name,
        chunk.version,
        chunk.exports.len()
    ));
    for exp in &chunk.exports {
        out.push_str(&format!("  export {}\n", exp));
    }
    dump_prototype(&chunk.main_proto, "main", &mut out);
    out
}

fn dump_prototype(proto: &Prototype, label: &str, out: &mut String) {
    out.push_str(&format!(
        "\n=== {} '{}' ({} params, {} slots, {} upvalues{}) ===\n",
        label,
        proto.name,
        proto.num_params,
        proto.max_stack_size,
        proto.num_upvalues,
        if proto.is_vararg { ", vararg" } else { "" }
    ));
    for (pc, instr) in proto.code.iter().enumerate() {
        out.push_str(&format!("  {:4}  [{:4}]  {:?}\n", pc, proto.line_at(pc), instr));
    }
    if !proto.constants.is_empty() {
        out.push_str("  constants:\n");
        for (i, c) in proto.constants.iter().enumerate() {
            out.push_str(&format!("    K[{}] = {:?}\n", i, c));
        }
    }
    for (i, uv) in proto.upvalues.iter().enumerate() {
        out.push_str(&format!(
            "  upvalue {} <- {} {}\n",
            i,
            if uv.is_local { "local" } else { "upvalue" },
            uv.index
        ));
    }
    for (i, child) in proto.protos.iter().enumerate() {
        dump_prototype(child, &format!("{}.proto[{}]", label, i), out);
    }
}
