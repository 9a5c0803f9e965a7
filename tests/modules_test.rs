/// Module manager behavior: resolution through a host loader, named and
/// namespace imports, caching and stats, circular-dependency detection,
/// error values, LRU eviction, and in-place hot reload.
///
/// The loader is an in-memory map so the tests control file contents and
/// timestamps; the front-end hook turns source markers into hand-built ASTs,
/// standing in for the external parser.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::*;
use parking_lot::Mutex;

use sptscript::ast::{BinaryOp, Block};
use sptscript::core::value::{MapKey, Value};
use sptscript::errors::InterpretResult;
use sptscript::intrinsics;
use sptscript::module::ModuleLoader;
use sptscript::vm::{Vm, VmConfig};

// ─── In-memory loader ─────────────────────────────────────────────────────────

type FileTable = Arc<Mutex<HashMap<String, (String, u64)>>>;

struct MemoryLoader {
    files: FileTable,
}

impl ModuleLoader for MemoryLoader {
    fn resolve_path(&self, module_name: &str, _from_path: Option<&str>) -> Option<String> {
        if self.files.lock().contains_key(module_name) {
            Some(format!("mem://{}", module_name))
        } else {
            None
        }
    }

    fn load_source(&self, path: &str) -> Result<Vec<u8>, String> {
        let name = path.trim_start_matches("mem://");
        self.files
            .lock()
            .get(name)
            .map(|(source, _)| source.clone().into_bytes())
            .ok_or_else(|| format!("missing {}", path))
    }

    fn exists(&self, path: &str) -> bool {
        let name = path.trim_start_matches("mem://");
        self.files.lock().contains_key(name)
    }

    fn get_timestamp(&self, path: &str) -> u64 {
        let name = path.trim_start_matches("mem://");
        self.files.lock().get(name).map(|(_, ts)| *ts).unwrap_or(0)
    }
}

/// The stand-in parser: source markers map to pre-built module ASTs.
fn build_ast(marker: &str) -> Option<Block> {
    let stmts = match marker.trim() {
        "mathx" => vec![func_exported(
            "square",
            vec!["n"],
            vec![ret(vec![binary(BinaryOp::Mul, ident("n"), ident("n"))])],
        )],
        "uses_math" => vec![
            import_named("mathx", vec!["square"]),
            var_exported("result", call_name("square", vec![int(4)])),
        ],
        "cycle_a" => vec![import_namespace("cycle_b", "b")],
        "cycle_b" => vec![import_namespace("cycle_a", "a")],
        "counter_v1" => vec![var_exported("value", int(1))],
        "counter_v2" => vec![var_exported("value", int(2))],
        "m1" => vec![var_exported("tag", int(1))],
        "m2" => vec![var_exported("tag", int(2))],
        "m3" => vec![var_exported("tag", int(3))],
        "broken" => vec![brk()],
        _ => return None,
    };
    Some(Block::new(stmts))
}

fn module_vm(
    files: &[(&str, &str, u64)],
    hot_reload: bool,
    max_cache: usize,
) -> (Vm, Arc<Mutex<String>>, FileTable) {
    let config = VmConfig {
        enable_hot_reload: hot_reload,
        max_module_cache: max_cache,
        ..Default::default()
    };
    let mut vm = Vm::new(config);
    intrinsics::install_core(&mut vm);

    let output = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&output);
    vm.set_print_handler(Box::new(move |msg| sink.lock().push_str(msg)));
    vm.set_error_handler(Box::new(|_, _| {}));

    let table: FileTable = Arc::new(Mutex::new(
        files
            .iter()
            .map(|(name, source, ts)| (name.to_string(), (source.to_string(), *ts)))
            .collect(),
    ));
    vm.modules().set_loader(Box::new(MemoryLoader { files: Arc::clone(&table) }));
    vm.modules().set_front_end(Box::new(|source, _path| build_ast(source)));

    (vm, output, table)
}

fn export_value(vm: &Vm, exports: Value, name: &str) -> Option<Value> {
    let handle = exports.as_handle()?;
    vm.heap().as_map(handle)?.get(&MapKey::str(name))
}

fn error_message(vm: &Vm, v: Value) -> Option<String> {
    let handle = v.as_handle()?;
    let map = vm.heap().as_map(handle)?;
    if !map.get(&MapKey::str("error"))?.is_truthy() {
        return None;
    }
    let msg = map.get(&MapKey::str("message"))?.as_handle()?;
    vm.heap().as_str(msg).map(str::to_string)
}

// ─── Imports from script code ─────────────────────────────────────────────────

#[test]
fn named_import_binds_the_exported_symbol() {
    let (mut vm, output, _) = module_vm(&[("mathx", "mathx", 1)], false, 64);
    let chunk = compile(vec![
        import_named("mathx", vec!["square"]),
        print_stmt(call_name("square", vec![int(9)])),
    ]);
    assert_eq!(vm.interpret(&chunk), InterpretResult::Ok);
    assert_eq!(output.lock().as_str(), "81\n");
}

#[test]
fn namespace_import_reaches_exports_through_the_alias() {
    let (mut vm, output, _) = module_vm(&[("mathx", "mathx", 1)], false, 64);
    let chunk = compile(vec![
        import_namespace("mathx", "m"),
        print_stmt(method_call(ident("m"), "square", vec![int(9)])),
    ]);
    assert_eq!(vm.interpret(&chunk), InterpretResult::Ok);
    assert_eq!(output.lock().as_str(), "81\n");
}

#[test]
fn missing_export_imports_as_nil() {
    let (mut vm, output, _) = module_vm(&[("mathx", "mathx", 1)], false, 64);
    let chunk = compile(vec![
        import_named("mathx", vec!["no_such_symbol"]),
        print_stmt(ident("no_such_symbol")),
    ]);
    assert_eq!(vm.interpret(&chunk), InterpretResult::Ok);
    assert_eq!(output.lock().as_str(), "nil\n");
}

// ─── Host-level loading ───────────────────────────────────────────────────────

#[test]
fn load_module_returns_the_exports_map() {
    let (mut vm, _, _) = module_vm(&[("m1", "m1", 1)], false, 64);
    let exports = vm.load_module("m1", None);
    assert_eq!(export_value(&vm, exports, "tag"), Some(Value::Int(1)));
}

#[test]
fn module_not_found_is_a_returned_error_value() {
    let (mut vm, _, _) = module_vm(&[], false, 64);
    let result = vm.load_module("ghost", None);
    let message = error_message(&vm, result).expect("should be an error value");
    assert!(message.contains("Module not found: ghost"), "{}", message);
}

#[test]
fn circular_import_fails_without_recursing_forever() {
    let (mut vm, _, _) =
        module_vm(&[("cycle_a", "cycle_a", 1), ("cycle_b", "cycle_b", 1)], false, 64);
    let result = vm.load_module("cycle_a", None);
    let message = error_message(&vm, result).expect("should be an error value");
    assert!(message.contains("Circular"), "{}", message);
}

#[test]
fn dependencies_load_depth_first_before_the_importer_runs() {
    let (mut vm, _, _) =
        module_vm(&[("mathx", "mathx", 1), ("uses_math", "uses_math", 1)], false, 64);
    let exports = vm.load_module("uses_math", None);
    assert_eq!(export_value(&vm, exports, "result"), Some(Value::Int(16)));
    assert_eq!(vm.modules().get_dependencies("uses_math", false), vec!["mathx".to_string()]);
    assert!(!vm.modules().has_circular_dependency("uses_math"));
}

#[test]
fn compile_errors_surface_as_module_errors() {
    let (mut vm, _, _) = module_vm(&[("broken", "broken", 1)], false, 64);
    let result = vm.load_module("broken", None);
    let message = error_message(&vm, result).expect("should be an error value");
    assert!(message.contains("Compilation failed"), "{}", message);
}

#[test]
fn unparseable_source_is_a_parse_error() {
    let (mut vm, _, _) = module_vm(&[("weird", "unknown_marker", 1)], false, 64);
    let result = vm.load_module("weird", None);
    let message = error_message(&vm, result).expect("should be an error value");
    assert!(message.contains("Parse failed"), "{}", message);
}

// ─── Cache behavior ───────────────────────────────────────────────────────────

#[test]
fn repeat_loads_hit_the_cache() {
    let (mut vm, _, _) = module_vm(&[("m1", "m1", 1)], false, 64);
    vm.load_module("m1", None);
    vm.load_module("m1", None);
    let stats = vm.modules().get_cache_stats();
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.hit_count, 1);
    assert_eq!(stats.loaded_modules, 1);
    assert!(stats.total_bytes > 0);
}

#[test]
fn errors_are_cached_and_not_retried() {
    let (mut vm, _, _) = module_vm(&[("broken", "broken", 1)], false, 64);
    let first = vm.load_module("broken", None);
    let second = vm.load_module("broken", None);
    assert_eq!(error_message(&vm, first), error_message(&vm, second));
    assert_eq!(vm.modules().get_cache_stats().miss_count, 1);
}

#[test]
fn clear_cache_forces_a_fresh_load() {
    let (mut vm, _, _) = module_vm(&[("m1", "m1", 1)], false, 64);
    vm.load_module("m1", None);
    vm.modules().clear_cache(None);
    vm.load_module("m1", None);
    assert_eq!(vm.modules().get_cache_stats().miss_count, 2);
}

#[test]
fn lru_eviction_drops_the_oldest_module() {
    let (mut vm, _, _) = module_vm(
        &[("m1", "m1", 1), ("m2", "m2", 1), ("m3", "m3", 1)],
        false,
        2,
    );
    vm.load_module("m1", None);
    vm.load_module("m2", None);
    vm.load_module("m3", None);

    let stats = vm.modules().get_cache_stats();
    assert_eq!(stats.total_modules, 2);
    assert!(vm.modules().get_metadata("m1").is_none(), "oldest module should be evicted");
    assert!(vm.modules().get_metadata("m3").is_some());
}

#[test]
fn preload_warms_the_cache() {
    let (mut vm, _, _) = module_vm(&[("m2", "m2", 1)], false, 64);
    vm.preload_module("m2");
    vm.load_module("m2", None);
    let stats = vm.modules().get_cache_stats();
    assert_eq!((stats.miss_count, stats.hit_count), (1, 1));
}

// ─── Hot reload ───────────────────────────────────────────────────────────────

#[test]
fn stale_module_reloads_in_place_on_next_load() {
    let (mut vm, _, files) = module_vm(&[("counter", "counter_v1", 1)], true, 64);

    let exports = vm.load_module("counter", None);
    assert_eq!(export_value(&vm, exports, "value"), Some(Value::Int(1)));

    // The file changes on disk; the next load sees the newer timestamp.
    files.lock().insert("counter".into(), ("counter_v2".into(), 99));
    let reloaded = vm.load_module("counter", None);
    assert_eq!(export_value(&vm, reloaded, "value"), Some(Value::Int(2)));

    // The previously returned map reflects the new bindings in place, and a
    // full collection must not free it.
    vm.collect_garbage();
    assert_eq!(export_value(&vm, exports, "value"), Some(Value::Int(2)));
}

#[test]
fn check_for_updates_reloads_every_stale_module() {
    let (mut vm, _, files) =
        module_vm(&[("counter", "counter_v1", 1), ("m1", "m1", 1)], true, 64);
    vm.load_module("counter", None);
    vm.load_module("m1", None);

    files.lock().insert("counter".into(), ("counter_v2".into(), 50));
    let updated = vm.check_for_updates();
    assert_eq!(updated, vec!["counter".to_string()]);

    let exports = vm.load_module("counter", None);
    assert_eq!(export_value(&vm, exports, "value"), Some(Value::Int(2)));
}

#[test]
fn hot_reload_disabled_keeps_the_cached_version() {
    let (mut vm, _, files) = module_vm(&[("counter", "counter_v1", 1)], false, 64);
    vm.load_module("counter", None);

    files.lock().insert("counter".into(), ("counter_v2".into(), 99));
    let exports = vm.load_module("counter", None);
    assert_eq!(export_value(&vm, exports, "value"), Some(Value::Int(1)));
    assert!(vm.check_for_updates().is_empty());
}

#[test]
fn dump_modules_reports_cache_contents() {
    let (mut vm, _, _) = module_vm(&[("m1", "m1", 1)], false, 64);
    vm.load_module("m1", None);
    let dump = vm.modules().dump_modules();
    assert!(dump.contains("m1"));
    assert!(dump.contains("Loaded"));
}
