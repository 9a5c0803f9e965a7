/// Module manager — resolve, compile, execute, cache, hot-reload.
///
/// Modules are addressed by canonical name. Loading is depth-first: a
/// module's dependencies (scanned from IMPORT/IMPORT_FROM constants in its
/// compiled chunk) are fully LOADED before its body executes. A module name
/// appearing twice in the active resolution chain is a circular dependency
/// and fails without recursing.
///
/// Failures are returned, not thrown: `load_module` hands importers a
/// `{error: true, message: "..."}` map they can introspect. Errors stick in
/// the cache so repeat loads do not retry until the cache is cleared.
///
/// Hot reload re-runs the load for a fresh module, then overwrites the
/// cached exports map contents in place — holders of the old map reference
/// keep seeing the latest bindings.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::ast;
use crate::bytecode::{CompiledChunk, Prototype};
use crate::compiler::Compiler;
use crate::core::value::{Handle, MapKey, Value};
use crate::serializer;
use crate::vm::{Vm, VmConfig};

/// Extensions tried during resolution, in order; first hit wins.
const EXTENSIONS: [&str; 3] = [".flx", ".spt", ".flxc"];
const DEFAULT_ROOTS: [&str; 3] = [".", "./lib", "./modules"];

/// Front-end hook: turns source text into an AST. Parsing lives outside
/// this crate; a `None` result is the ParseError case.
pub type FrontEnd = Box<dyn Fn(&str, &str) -> Option<ast::Block>>;

// ---------------------------------------------------------------------------
// Loader abstraction
// ---------------------------------------------------------------------------

pub trait ModuleLoader {
    /// Resolve a module name to a loadable path, trying `from_path`'s
    /// directory first when given, then the configured roots.
    fn resolve_path(&self, module_name: &str, from_path: Option<&str>) -> Option<String>;
    fn load_source(&self, path: &str) -> Result<Vec<u8>, String>;
    fn exists(&self, path: &str) -> bool;
    /// Millisecond modification timestamp; 0 when unknown.
    fn get_timestamp(&self, path: &str) -> u64;
}

pub struct FileSystemLoader {
    search_paths: Vec<PathBuf>,
}

impl FileSystemLoader {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        let mut paths = search_paths;
        if paths.is_empty() {
            paths.push(PathBuf::from("."));
        }
        FileSystemLoader { search_paths: paths }
    }

    pub fn with_defaults(extra: &[String]) -> Self {
        let mut paths: Vec<PathBuf> = DEFAULT_ROOTS.iter().map(PathBuf::from).collect();
        paths.extend(extra.iter().map(PathBuf::from));
        FileSystemLoader { search_paths: paths }
    }

    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    fn absolute(path: &Path) -> String {
        std::fs::canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned()
    }
}

impl ModuleLoader for FileSystemLoader {
    fn resolve_path(&self, module_name: &str, from_path: Option<&str>) -> Option<String> {
        if let Some(from) = from_path {
            if let Some(parent) = Path::new(from).parent() {
                for ext in EXTENSIONS {
                    let candidate = parent.join(format!("{}{}", module_name, ext));
                    if candidate.exists() {
                        return Some(Self::absolute(&candidate));
                    }
                }
            }
        }

        for root in &self.search_paths {
            for ext in EXTENSIONS {
                let candidate = root.join(format!("{}{}", module_name, ext));
                if candidate.exists() {
                    return Some(Self::absolute(&candidate));
                }
            }
        }

        let raw = Path::new(module_name);
        if raw.exists() {
            return Some(Self::absolute(raw));
        }
        None
    }

    fn load_source(&self, path: &str) -> Result<Vec<u8>, String> {
        std::fs::read(path).map_err(|e| format!("Cannot open file {}: {}", path, e))
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn get_timestamp(&self, path: &str) -> u64 {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Module records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleMetadata {
    pub name: String,
    pub path: String,
    pub timestamp: u64,
    pub byte_size: usize,
    pub dependencies: Vec<String>,
    pub exports: Vec<String>,
}

pub struct Module {
    pub metadata: ModuleMetadata,
    pub chunk: Option<CompiledChunk>,
    pub exports_table: Option<Handle>,
    pub state: ModuleState,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModuleManagerConfig {
    pub enable_cache: bool,
    pub enable_hot_reload: bool,
    pub max_cache_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_modules: usize,
    pub loaded_modules: usize,
    pub total_bytes: usize,
    pub hit_count: usize,
    pub miss_count: usize,
}

// ---------------------------------------------------------------------------
// The manager
// ---------------------------------------------------------------------------

pub struct ModuleManager {
    pub(crate) config: ModuleManagerConfig,
    pub(crate) loader: Box<dyn ModuleLoader>,
    pub(crate) front_end: Option<FrontEnd>,
    pub(crate) cache: HashMap<String, Module>,
    path_to_name: HashMap<String, String>,
    load_order: Vec<String>,
    pub(crate) loading_stack: Vec<String>,
    pub(crate) hit_count: usize,
    pub(crate) miss_count: usize,
}

impl ModuleManager {
    pub fn new(config: &VmConfig) -> Self {
        ModuleManager {
            config: ModuleManagerConfig {
                enable_cache: true,
                enable_hot_reload: config.enable_hot_reload,
                max_cache_size: config.max_module_cache,
            },
            loader: Box::new(FileSystemLoader::with_defaults(&config.module_paths)),
            front_end: None,
            cache: HashMap::new(),
            path_to_name: HashMap::new(),
            load_order: Vec::new(),
            loading_stack: Vec::new(),
            hit_count: 0,
            miss_count: 0,
        }
    }

    pub fn set_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.loader = loader;
    }

    pub fn set_front_end(&mut self, front_end: FrontEnd) {
        self.front_end = Some(front_end);
    }

    pub fn set_hot_reload_enabled(&mut self, enabled: bool) {
        self.config.enable_hot_reload = enabled;
    }

    pub fn get_metadata(&self, module_name: &str) -> Option<&ModuleMetadata> {
        self.cache.get(module_name).map(|m| &m.metadata)
    }

    pub fn clear_cache(&mut self, module_name: Option<&str>) {
        match module_name {
            None => {
                self.cache.clear();
                self.path_to_name.clear();
                self.load_order.clear();
            }
            Some(name) => {
                if let Some(module) = self.cache.remove(name) {
                    self.path_to_name.remove(&module.metadata.path);
                }
                self.load_order.retain(|n| n != name);
            }
        }
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            total_modules: self.cache.len(),
            hit_count: self.hit_count,
            miss_count: self.miss_count,
            ..Default::default()
        };
        for module in self.cache.values() {
            if module.state == ModuleState::Loaded {
                stats.loaded_modules += 1;
            }
            stats.total_bytes += module.metadata.byte_size;
        }
        stats
    }

    pub fn get_dependencies(&self, module_name: &str, recursive: bool) -> Vec<String> {
        let Some(module) = self.cache.get(module_name) else { return Vec::new() };
        let mut result = module.metadata.dependencies.clone();
        if recursive {
            let mut visited = HashSet::new();
            self.collect_deps(module_name, &mut visited, &mut result);
        }
        result
    }

    fn collect_deps(&self, name: &str, visited: &mut HashSet<String>, out: &mut Vec<String>) {
        if !visited.insert(name.to_string()) {
            return;
        }
        let Some(module) = self.cache.get(name) else { return };
        for dep in &module.metadata.dependencies {
            out.push(dep.clone());
            self.collect_deps(dep, visited, out);
        }
    }

    pub fn has_circular_dependency(&self, module_name: &str) -> bool {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        self.detect_circular(module_name, &mut visited, &mut stack)
    }

    fn detect_circular(
        &self,
        name: &str,
        visited: &mut HashSet<String>,
        stack: &mut HashSet<String>,
    ) -> bool {
        if stack.contains(name) {
            return true;
        }
        if !visited.insert(name.to_string()) {
            return false;
        }
        stack.insert(name.to_string());
        if let Some(module) = self.cache.get(name) {
            for dep in &module.metadata.dependencies {
                if self.detect_circular(dep, visited, stack) {
                    return true;
                }
            }
        }
        stack.remove(name);
        false
    }

    pub fn dump_modules(&self) -> String {
        let mut out = String::new();
        out.push_str("=== Module Manager Status ===\n");
        out.push_str(&format!("Total modules: {}\n", self.cache.len()));
        out.push_str(&format!("Cache hits: {}, misses: {}\n", self.hit_count, self.miss_count));
        for (name, module) in &self.cache {
            out.push_str(&format!("  [{:?}] {}\n", module.state, name));
            out.push_str(&format!("    Path: {}\n", module.metadata.path));
            out.push_str(&format!(
                "    Exports: {}, Dependencies: {}\n",
                module.metadata.exports.len(),
                module.metadata.dependencies.len()
            ));
            out.push_str(&format!("    Size: {} bytes\n", module.metadata.byte_size));
        }
        out
    }

    /// Live exports tables; these are GC roots.
    pub(crate) fn export_tables(&self) -> Vec<Handle> {
        self.cache.values().filter_map(|m| m.exports_table).collect()
    }

    fn insert(&mut self, name: &str, module: Module) {
        if !self.config.enable_cache {
            return;
        }
        self.path_to_name.insert(module.metadata.path.clone(), name.to_string());
        self.cache.insert(name.to_string(), module);
        self.load_order.retain(|n| n != name);
        self.load_order.push(name.to_string());

        while self.cache.len() > self.config.max_cache_size && !self.load_order.is_empty() {
            let oldest = self.load_order.remove(0);
            if let Some(evicted) = self.cache.remove(&oldest) {
                self.path_to_name.remove(&evicted.metadata.path);
            }
        }
    }

    fn insert_error(&mut self, name: &str, message: &str) {
        let module = Module {
            metadata: ModuleMetadata { name: name.to_string(), ..Default::default() },
            chunk: None,
            exports_table: None,
            state: ModuleState::Error,
            error_message: Some(message.to_string()),
        };
        self.insert(name, module);
    }
}

fn code_byte_size(proto: &Prototype) -> usize {
    proto.code.len() * 4 + proto.protos.iter().map(code_byte_size).sum::<usize>()
}

// ---------------------------------------------------------------------------
// Load orchestration — needs the VM for compilation, execution and the heap
// ---------------------------------------------------------------------------

impl Vm {
    /// Load (or fetch from cache) a module and return its exports map, or a
    /// `{error, message}` map on failure.
    pub fn load_module(&mut self, name: &str, from_path: Option<&str>) -> Value {
        if self.modules.config.enable_cache {
            let cached = self.modules.cache.get(name).map(|m| {
                (m.state, m.metadata.path.clone(), m.metadata.timestamp, m.error_message.clone())
            });
            if let Some((state, path, timestamp, error_message)) = cached {
                match state {
                    ModuleState::Loaded => {
                        self.modules.hit_count += 1;
                        if self.modules.config.enable_hot_reload
                            && self.modules.loader.get_timestamp(&path) > timestamp
                        {
                            self.reload_module(name);
                        }
                        if let Some(h) =
                            self.modules.cache.get(name).and_then(|m| m.exports_table)
                        {
                            return Value::Obj(h);
                        }
                        return Value::Nil;
                    }
                    ModuleState::Error => {
                        let msg =
                            error_message.unwrap_or_else(|| "Module load failed".to_string());
                        return self.make_error_value(&msg);
                    }
                    ModuleState::Unloaded | ModuleState::Loading => {}
                }
            }
        }

        self.modules.miss_count += 1;
        match self.load_module_internal(name, from_path) {
            Ok(exports) => Value::Obj(exports),
            Err(message) => {
                self.modules.insert_error(name, &message);
                self.make_error_value(&message)
            }
        }
    }

    pub fn preload_module(&mut self, name: &str) {
        self.load_module(name, None);
    }

    fn load_module_internal(
        &mut self,
        name: &str,
        from_path: Option<&str>,
    ) -> Result<Handle, String> {
        if self.modules.loading_stack.iter().any(|n| n == name) {
            return Err(format!("Circular dependency detected: {}", name));
        }

        let resolved = self
            .modules
            .loader
            .resolve_path(name, from_path)
            .ok_or_else(|| format!("Module not found: {}", name))?;

        self.modules.loading_stack.push(name.to_string());
        let result = self.load_module_resolved(name, &resolved);
        self.modules.loading_stack.pop();
        result
    }

    fn load_module_resolved(&mut self, name: &str, path: &str) -> Result<Handle, String> {
        let timestamp = self.modules.loader.get_timestamp(path);
        let bytes = self
            .modules
            .loader
            .load_source(path)
            .map_err(|e| format!("Failed to load source: {}", e))?;

        let chunk = if serializer::looks_like_chunk(&bytes) {
            serializer::deserialize(&bytes)
                .map_err(|e| format!("Failed to load compiled module: {}", e))?
        } else {
            let source = String::from_utf8_lossy(&bytes).into_owned();
            let ast = match self.modules.front_end.as_ref() {
                Some(front_end) => front_end(&source, path),
                None => None,
            };
            let ast = ast.ok_or_else(|| format!("Parse failed: {}", name))?;

            let mut compiler = Compiler::new(name, path);
            let chunk = compiler.compile(&ast);
            if compiler.has_error() {
                let mut msg = String::from("Compilation failed:\n");
                for err in compiler.errors() {
                    msg.push_str(&format!("Line {}: {}\n", err.line, err.message));
                }
                return Err(msg);
            }
            chunk
        };

        // Depth-first dependency resolution: everything this chunk imports is
        // LOADED before the body runs.
        let dependencies = chunk.dependencies();
        for dep in &dependencies {
            match self.modules.cache.get(dep) {
                Some(m) if m.state == ModuleState::Loaded => continue,
                Some(m) if m.state == ModuleState::Error => {
                    let inner = m
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "Module load failed".to_string());
                    return Err(format!("Failed to load dependency '{}': {}", dep, inner));
                }
                _ => {}
            }
            self.load_module_internal(dep, Some(path))
                .map_err(|e| format!("Failed to load dependency '{}': {}", dep, e))?;
        }

        let env = self
            .execute_chunk(&chunk)
            .map_err(|e| format!("Module execution failed: {}", e))?;
        self.protect(env);
        let exports_table = self.build_exports_table(env, &chunk.exports);
        self.unprotect(1);

        let module = Module {
            metadata: ModuleMetadata {
                name: name.to_string(),
                path: path.to_string(),
                timestamp,
                byte_size: code_byte_size(&chunk.main_proto),
                dependencies,
                exports: chunk.exports.clone(),
            },
            chunk: Some(chunk),
            exports_table: Some(exports_table),
            state: ModuleState::Loaded,
            error_message: None,
        };
        self.modules.insert(name, module);
        Ok(exports_table)
    }

    /// Copy each exported binding out of the module's `__env`. Names the
    /// module never assigned are omitted, not an error.
    fn build_exports_table(&mut self, env: Value, exports: &[String]) -> Handle {
        let table = self.allocate_map(exports.len());
        self.protect(Value::Obj(table));

        let env_map = env.as_handle();
        for export_name in exports {
            let value = env_map
                .and_then(|h| self.heap.as_map(h))
                .and_then(|m| m.get(&MapKey::str(export_name.as_str())));
            if let Some(value) = value {
                if !value.is_nil() {
                    if let Some(t) = self.heap.as_map_mut(table) {
                        t.insert(MapKey::str(export_name.as_str()), value);
                    }
                }
            }
        }

        self.unprotect(1);
        table
    }

    /// Re-run the full load for a fresh module, then overwrite the cached
    /// exports map contents in place so existing holders see new bindings.
    pub fn reload_module(&mut self, name: &str) -> bool {
        let old_exports = match self.modules.cache.get(name) {
            Some(m) if m.state == ModuleState::Loaded => m.exports_table,
            _ => None,
        };
        let Some(old_exports) = old_exports else { return false };

        match self.load_module_internal(name, None) {
            Ok(new_exports) => {
                let new_entries = self.heap.as_map(new_exports).map(|m| m.entries.clone());
                if let (Some(entries), Some(old_map)) =
                    (new_entries, self.heap.as_map_mut(old_exports))
                {
                    old_map.entries = entries;
                }
                // Future loads keep handing out the stable table.
                if let Some(module) = self.modules.cache.get_mut(name) {
                    module.exports_table = Some(old_exports);
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Poll every cached module's timestamp and reload the stale ones.
    /// Returns the names that were reloaded.
    pub fn check_for_updates(&mut self) -> Vec<String> {
        let mut updated = Vec::new();
        if !self.modules.config.enable_hot_reload {
            return updated;
        }

        let candidates: Vec<(String, String, u64)> = self
            .modules
            .cache
            .iter()
            .filter(|(_, m)| m.state == ModuleState::Loaded)
            .map(|(name, m)| (name.clone(), m.metadata.path.clone(), m.metadata.timestamp))
            .collect();

        for (name, path, timestamp) in candidates {
            if self.modules.loader.get_timestamp(&path) > timestamp && self.reload_module(&name) {
                updated.push(name);
            }
        }
        updated
    }
}
