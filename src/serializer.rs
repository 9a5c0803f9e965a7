/// Bytecode codec — deterministic binary serialization of compiled chunks.
///
/// Little-endian, length-prefixed. Identical input AST and compiler version
/// produce a byte-identical image, so compiled modules can be shipped and
/// hot-swapped.
///
/// File layout:
///   u32  magic = 0x58454C46
///   u32  version
///   u32  module-name-length; bytes
///   u32  export-count; (u32 length; bytes) * count
///   Prototype root
///
/// Prototype layout:
///   u32 name-length; bytes
///   u32 source-length; bytes
///   u32 line-defined; u32 last-line-defined
///   u8  num-params; u8 num-upvalues; u8 max-stack-size; u8 is-vararg
///   u32 code-len;      u32 * code-len
///   u32 const-count;   Constant * const-count
///   u32 line-count;    u32 * line-count
///   u8  upvalue-count; {u8 index, u8 is-local} * upvalue-count
///   u32 proto-count;   Prototype * proto-count
///
/// Constant: u8 tag, then 0 = nil (no payload), 1 = bool (u8),
/// 2 = i64 LE, 3 = f64 IEEE754 LE, 4 = string (u32 len; bytes).

use std::fs;
use std::path::Path;

use crate::bytecode::{CompiledChunk, Instr, Prototype, UpvalueDesc, BYTECODE_VERSION};
use crate::core::value::ConstantValue;
use crate::errors::CodecError;

const MAGIC: u32 = 0x5845_4C46;

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Writer {
    buffer: Vec<u8>,
}

impl Writer {
    fn write_u8(&mut self, v: u8) {
        self.buffer.push(v);
    }

    fn write_u32(&mut self, v: u32) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    fn write_i64(&mut self, v: i64) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    fn write_f64(&mut self, v: f64) {
        self.buffer.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buffer.extend_from_slice(s.as_bytes());
    }

    fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::UnexpectedEof { offset: self.pos });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    fn read_f64(&mut self) -> Result<f64, CodecError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(f64::from_bits(u64::from_le_bytes(buf)))
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

fn write_constant(w: &mut Writer, val: &ConstantValue) {
    match val {
        ConstantValue::Nil => w.write_u8(0),
        ConstantValue::Bool(b) => {
            w.write_u8(1);
            w.write_u8(*b as u8);
        }
        ConstantValue::Int(n) => {
            w.write_u8(2);
            w.write_i64(*n);
        }
        ConstantValue::Float(f) => {
            w.write_u8(3);
            w.write_f64(*f);
        }
        ConstantValue::Str(s) => {
            w.write_u8(4);
            w.write_string(s);
        }
    }
}

fn read_constant(r: &mut Reader) -> Result<ConstantValue, CodecError> {
    let offset = r.pos;
    let tag = r.read_u8()?;
    match tag {
        0 => Ok(ConstantValue::Nil),
        1 => Ok(ConstantValue::Bool(r.read_u8()? != 0)),
        2 => Ok(ConstantValue::Int(r.read_i64()?)),
        3 => Ok(ConstantValue::Float(r.read_f64()?)),
        4 => Ok(ConstantValue::Str(r.read_string()?)),
        _ => Err(CodecError::BadConstantTag { tag, offset }),
    }
}

// ---------------------------------------------------------------------------
// Prototypes
// ---------------------------------------------------------------------------

fn write_prototype(w: &mut Writer, proto: &Prototype) {
    w.write_string(&proto.name);
    w.write_string(&proto.source);
    w.write_u32(proto.line_defined);
    w.write_u32(proto.last_line_defined);
    w.write_u8(proto.num_params);
    w.write_u8(proto.num_upvalues);
    w.write_u8(proto.max_stack_size);
    w.write_u8(proto.is_vararg as u8);

    w.write_u32(proto.code.len() as u32);
    for instr in &proto.code {
        w.write_u32(instr.0);
    }

    w.write_u32(proto.constants.len() as u32);
    for c in &proto.constants {
        write_constant(w, c);
    }

    w.write_u32(proto.line_info.len() as u32);
    for line in &proto.line_info {
        w.write_u32(*line);
    }

    w.write_u8(proto.upvalues.len() as u8);
    for uv in &proto.upvalues {
        w.write_u8(uv.index);
        w.write_u8(uv.is_local as u8);
    }

    w.write_u32(proto.protos.len() as u32);
    for child in &proto.protos {
        write_prototype(w, child);
    }
}

fn read_prototype(r: &mut Reader) -> Result<Prototype, CodecError> {
    let mut proto = Prototype::new("", "");
    proto.name = r.read_string()?;
    proto.source = r.read_string()?;
    proto.line_defined = r.read_u32()?;
    proto.last_line_defined = r.read_u32()?;
    proto.num_params = r.read_u8()?;
    proto.num_upvalues = r.read_u8()?;
    proto.max_stack_size = r.read_u8()?;
    proto.is_vararg = r.read_u8()? != 0;

    let code_len = r.read_u32()? as usize;
    proto.code.reserve(code_len);
    for _ in 0..code_len {
        proto.code.push(Instr(r.read_u32()?));
    }

    let const_count = r.read_u32()? as usize;
    proto.constants.reserve(const_count);
    for _ in 0..const_count {
        proto.constants.push(read_constant(r)?);
    }

    let line_count = r.read_u32()? as usize;
    proto.line_info.reserve(line_count);
    for _ in 0..line_count {
        proto.line_info.push(r.read_u32()?);
    }

    let uv_count = r.read_u8()? as usize;
    proto.upvalues.reserve(uv_count);
    for _ in 0..uv_count {
        let index = r.read_u8()?;
        let is_local = r.read_u8()? != 0;
        proto.upvalues.push(UpvalueDesc { index, is_local });
    }

    let proto_count = r.read_u32()? as usize;
    proto.protos.reserve(proto_count);
    for _ in 0..proto_count {
        proto.protos.push(read_prototype(r)?);
    }

    Ok(proto)
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

pub fn serialize(chunk: &CompiledChunk) -> Vec<u8> {
    let mut w = Writer::default();
    w.write_u32(MAGIC);
    w.write_u32(chunk.version);
    w.write_string(&chunk.module_name);

    w.write_u32(chunk.exports.len() as u32);
    for exp in &chunk.exports {
        w.write_string(exp);
    }

    write_prototype(&mut w, &chunk.main_proto);
    w.finish()
}

pub fn deserialize(data: &[u8]) -> Result<CompiledChunk, CodecError> {
    let mut r = Reader::new(data);

    let magic = r.read_u32()?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic { found: magic });
    }

    let version = r.read_u32()?;
    if version != BYTECODE_VERSION {
        return Err(CodecError::VersionMismatch { found: version, expected: BYTECODE_VERSION });
    }

    let module_name = r.read_string()?;

    let export_count = r.read_u32()? as usize;
    let mut exports = Vec::with_capacity(export_count);
    for _ in 0..export_count {
        exports.push(r.read_string()?);
    }

    let main_proto = read_prototype(&mut r)?;

    Ok(CompiledChunk { version, module_name, exports, main_proto })
}

pub fn save_to_file(chunk: &CompiledChunk, path: impl AsRef<Path>) -> Result<(), CodecError> {
    let data = serialize(chunk);
    fs::write(path, data)?;
    Ok(())
}

pub fn load_from_file(path: impl AsRef<Path>) -> Result<CompiledChunk, CodecError> {
    let data = fs::read(path)?;
    deserialize(&data)
}

/// Quick sniff used by the CLI to tell compiled chunks from source files.
pub fn looks_like_chunk(data: &[u8]) -> bool {
    data.len() >= 4 && u32::from_le_bytes([data[0], data[1], data[2], data[3]]) == MAGIC
}
