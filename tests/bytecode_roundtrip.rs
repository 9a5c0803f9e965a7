/// Codec properties: structural round-trips, byte-level determinism, loud
/// failure on bad magic/version, and file persistence.

mod common;

use common::*;
use sptscript::ast::BinaryOp;
use sptscript::errors::CodecError;
use sptscript::serializer;
use sptscript::{dump_chunk, CompiledChunk};

/// A chunk exercising most of the instruction set: nested closures, a class,
/// loops, imports, string/float/int constants.
fn representative_chunk() -> CompiledChunk {
    compile(vec![
        import_named("mathx", vec!["square"]),
        var("greeting", str_("hello")),
        var("pi", float(3.14159)),
        func(
            "adder",
            vec!["x"],
            vec![ret(vec![lambda(
                vec!["y"],
                vec![ret(vec![binary(BinaryOp::Add, ident("x"), ident("y"))])],
            )])],
        ),
        class(
            "Pair",
            vec![
                method(
                    "__init",
                    vec!["a", "b"],
                    vec![
                        assign(member(this(), "a"), ident("a")),
                        assign(member(this(), "b"), ident("b")),
                    ],
                ),
            ],
        ),
        counting_for(
            "i",
            int(0),
            int(10),
            int(1),
            vec![print_stmt(ident("i"))],
        ),
    ])
}

#[test]
fn deserialize_of_serialize_is_structurally_identical() {
    let chunk = representative_chunk();
    let bytes = serializer::serialize(&chunk);
    let back = serializer::deserialize(&bytes).expect("deserialize");
    assert_eq!(back, chunk);
}

#[test]
fn identical_input_produces_byte_identical_output() {
    // Constant-pool insertion order follows AST traversal, so two fresh
    // compilations of the same tree must serialize identically.
    let a = serializer::serialize(&representative_chunk());
    let b = serializer::serialize(&representative_chunk());
    assert_eq!(a, b);
}

#[test]
fn roundtrip_then_serialize_is_byte_stable() {
    let bytes = serializer::serialize(&representative_chunk());
    let back = serializer::deserialize(&bytes).expect("deserialize");
    assert_eq!(serializer::serialize(&back), bytes);
}

#[test]
fn exports_survive_the_roundtrip() {
    let chunk = compile(vec![
        var_exported("answer", int(42)),
        func_exported("id", vec!["x"], vec![ret(vec![ident("x")])]),
    ]);
    let back = serializer::deserialize(&serializer::serialize(&chunk)).expect("deserialize");
    assert_eq!(back.exports, vec!["answer".to_string(), "id".to_string()]);
}

#[test]
fn corrupted_magic_is_rejected() {
    let mut bytes = serializer::serialize(&representative_chunk());
    bytes[2] ^= 0x55;
    assert!(matches!(serializer::deserialize(&bytes), Err(CodecError::BadMagic { .. })));
}

#[test]
fn future_version_is_rejected() {
    let mut bytes = serializer::serialize(&representative_chunk());
    bytes[4] = 0x7F;
    assert!(matches!(
        serializer::deserialize(&bytes),
        Err(CodecError::VersionMismatch { .. })
    ));
}

#[test]
fn file_persistence_roundtrip() {
    let chunk = representative_chunk();
    let path = std::env::temp_dir().join(format!("sptscript_codec_{}.flxc", std::process::id()));

    serializer::save_to_file(&chunk, &path).expect("save");
    let back = serializer::load_from_file(&path).expect("load");
    std::fs::remove_file(&path).ok();

    assert_eq!(back, chunk);
}

#[test]
fn deserialized_chunk_still_runs() {
    let chunk = compile(vec![
        func("twice", vec!["x"], vec![ret(vec![binary(BinaryOp::Mul, ident("x"), int(2))])]),
        print_stmt(call_name("twice", vec![int(21)])),
    ]);
    let back = serializer::deserialize(&serializer::serialize(&chunk)).expect("deserialize");

    let (mut vm, output) = capture_vm();
    assert_eq!(vm.interpret(&back), sptscript::errors::InterpretResult::Ok);
    assert_eq!(output.lock().as_str(), "42\n");
}

#[test]
fn disassembly_names_the_emitted_opcodes() {
    let text = dump_chunk(&representative_chunk());
    for expected in ["NEWMAP", "CLOSURE", "NEWCLASS", "FORPREP", "FORLOOP", "IMPORT_FROM", "RETURN"] {
        assert!(text.contains(expected), "dump should mention {}:\n{}", expected, text);
    }
}

#[test]
fn dependencies_are_scanned_from_import_constants() {
    let chunk = compile(vec![
        import_named("mathx", vec!["square"]),
        import_namespace("strutil", "s"),
        import_named("mathx", vec!["cube"]),
    ]);
    assert_eq!(chunk.dependencies(), vec!["mathx".to_string(), "strutil".to_string()]);
}
