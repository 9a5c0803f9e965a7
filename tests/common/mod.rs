//! Shared helpers for integration tests: terse AST constructors (standing in
//! for the front-end collaborator) and a script runner that captures print
//! output.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use sptscript::ast::*;
use sptscript::compiler::Compiler;
use sptscript::errors::{InterpretResult, SourceLocation};
use sptscript::intrinsics;
use sptscript::vm::{Vm, VmConfig};
use sptscript::CompiledChunk;

pub fn loc() -> SourceLocation {
    SourceLocation::default()
}

// ── Expressions ──────────────────────────────────────────────────────────────

pub fn int(value: i64) -> Expr {
    Expr::Int { value, loc: loc() }
}

pub fn float(value: f64) -> Expr {
    Expr::Float { value, loc: loc() }
}

pub fn str_(value: &str) -> Expr {
    Expr::Str { value: value.into(), loc: loc() }
}

pub fn boolean(value: bool) -> Expr {
    Expr::Bool { value, loc: loc() }
}

pub fn nil() -> Expr {
    Expr::Nil { loc: loc() }
}

pub fn ident(name: &str) -> Expr {
    Expr::Identifier { name: name.into(), loc: loc() }
}

pub fn this() -> Expr {
    Expr::This { loc: loc() }
}

pub fn list(elements: Vec<Expr>) -> Expr {
    Expr::List { elements, loc: loc() }
}

pub fn map(entries: Vec<(Expr, Expr)>) -> Expr {
    Expr::Map { entries, loc: loc() }
}

pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary { op, left: Box::new(left), right: Box::new(right), loc: loc() }
}

pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
    Expr::Unary { op, operand: Box::new(operand), loc: loc() }
}

pub fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call { callee: Box::new(callee), args, loc: loc() }
}

pub fn call_name(name: &str, args: Vec<Expr>) -> Expr {
    call(ident(name), args)
}

pub fn method_call(object: Expr, method: &str, args: Vec<Expr>) -> Expr {
    call(member(object, method), args)
}

pub fn member(object: Expr, name: &str) -> Expr {
    Expr::MemberAccess { object: Box::new(object), member: name.into(), loc: loc() }
}

pub fn index(object: Expr, idx: Expr) -> Expr {
    Expr::Index { object: Box::new(object), index: Box::new(idx), loc: loc() }
}

pub fn lambda(params: Vec<&str>, body: Vec<Stmt>) -> Expr {
    Expr::Lambda {
        params: params.into_iter().map(String::from).collect(),
        is_variadic: false,
        body: Block::new(body),
        loc: loc(),
    }
}

pub fn new_(class_name: &str, args: Vec<Expr>) -> Expr {
    Expr::New { class_name: class_name.into(), args, loc: loc() }
}

// ── Statements ───────────────────────────────────────────────────────────────

pub fn block(stmts: Vec<Stmt>) -> Block {
    Block::new(stmts)
}

pub fn var(name: &str, init: Expr) -> Stmt {
    Stmt::VarDecl { name: name.into(), initializer: Some(init), exported: false, loc: loc() }
}

pub fn var_exported(name: &str, init: Expr) -> Stmt {
    Stmt::VarDecl { name: name.into(), initializer: Some(init), exported: true, loc: loc() }
}

pub fn multi_var(names: Vec<&str>, init: Expr) -> Stmt {
    Stmt::MultiVarDecl {
        names: names.into_iter().map(String::from).collect(),
        initializer: Some(init),
        exported: false,
        loc: loc(),
    }
}

pub fn func(name: &str, params: Vec<&str>, body: Vec<Stmt>) -> Stmt {
    Stmt::FunctionDecl {
        name: name.into(),
        params: params.into_iter().map(String::from).collect(),
        is_variadic: false,
        body: Block::new(body),
        exported: false,
        loc: loc(),
    }
}

pub fn func_exported(name: &str, params: Vec<&str>, body: Vec<Stmt>) -> Stmt {
    Stmt::FunctionDecl {
        name: name.into(),
        params: params.into_iter().map(String::from).collect(),
        is_variadic: false,
        body: Block::new(body),
        exported: true,
        loc: loc(),
    }
}

pub fn method(name: &str, params: Vec<&str>, body: Vec<Stmt>) -> ClassMember {
    ClassMember::Method {
        name: name.into(),
        params: params.into_iter().map(String::from).collect(),
        is_variadic: false,
        body: Block::new(body),
        loc: loc(),
    }
}

pub fn field(name: &str, init: Option<Expr>) -> ClassMember {
    ClassMember::Field { name: name.into(), initializer: init, loc: loc() }
}

pub fn class(name: &str, members: Vec<ClassMember>) -> Stmt {
    Stmt::ClassDecl { name: name.into(), members, exported: false, loc: loc() }
}

pub fn ret(values: Vec<Expr>) -> Stmt {
    Stmt::Return { values, loc: loc() }
}

pub fn assign(target: Expr, value: Expr) -> Stmt {
    Stmt::Assignment { targets: vec![target], values: vec![value], loc: loc() }
}

pub fn update(target: Expr, op: BinaryOp, value: Expr) -> Stmt {
    Stmt::UpdateAssignment { target, op, value, loc: loc() }
}

pub fn expr_stmt(expr: Expr) -> Stmt {
    Stmt::ExprStmt { expr, loc: loc() }
}

pub fn print_stmt(value: Expr) -> Stmt {
    expr_stmt(call_name("print", vec![value]))
}

pub fn if_stmt(condition: Expr, then_block: Vec<Stmt>, else_block: Option<Vec<Stmt>>) -> Stmt {
    Stmt::If {
        condition,
        then_block: Block::new(then_block),
        else_ifs: vec![],
        else_block: else_block.map(Block::new),
        loc: loc(),
    }
}

pub fn while_stmt(condition: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::While { condition, body: Block::new(body), loc: loc() }
}

pub fn for_each(vars: Vec<&str>, iterable: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::ForEach {
        vars: vars.into_iter().map(String::from).collect(),
        iterable,
        body: Block::new(body),
        loc: loc(),
    }
}

pub fn counting_for(var_name: &str, from: Expr, below: Expr, step: Expr, body: Vec<Stmt>) -> Stmt {
    Stmt::ForC {
        initializer: Some(ForInit::Decls(vec![var(var_name, from)])),
        condition: Some(binary(BinaryOp::Lt, ident(var_name), below)),
        updates: vec![update(ident(var_name), BinaryOp::Add, step)],
        body: Block::new(body),
        loc: loc(),
    }
}

pub fn defer(body: Vec<Stmt>) -> Stmt {
    Stmt::Defer { body: Block::new(body), loc: loc() }
}

pub fn brk() -> Stmt {
    Stmt::Break { loc: loc() }
}

pub fn cont() -> Stmt {
    Stmt::Continue { loc: loc() }
}

pub fn import_named(module: &str, names: Vec<&str>) -> Stmt {
    Stmt::ImportNamed {
        module: module.into(),
        specifiers: names
            .into_iter()
            .map(|n| ImportSpecifier { imported: n.into(), alias: None })
            .collect(),
        loc: loc(),
    }
}

pub fn import_namespace(module: &str, alias: &str) -> Stmt {
    Stmt::ImportNamespace { module: module.into(), alias: alias.into(), loc: loc() }
}

// ── Running ──────────────────────────────────────────────────────────────────

pub fn compile(stmts: Vec<Stmt>) -> CompiledChunk {
    let mut compiler = Compiler::new("main", "test.flx");
    let chunk = compiler.compile(&Block::new(stmts));
    assert!(!compiler.has_error(), "unexpected compile errors: {:?}", compiler.errors());
    chunk
}

pub fn capture_vm() -> (Vm, Arc<Mutex<String>>) {
    let mut vm = Vm::new(VmConfig::default());
    intrinsics::install_core(&mut vm);
    let output = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&output);
    vm.set_print_handler(Box::new(move |msg| sink.lock().push_str(msg)));
    // Keep test failures quiet on stderr; the result code carries the error.
    vm.set_error_handler(Box::new(|_, _| {}));
    (vm, output)
}

/// Compile + run, returning the interpret result and everything printed.
pub fn run_script(stmts: Vec<Stmt>) -> (InterpretResult, String) {
    let chunk = compile(stmts);
    let (mut vm, output) = capture_vm();
    let result = vm.interpret(&chunk);
    let text = output.lock().clone();
    (result, text)
}

/// Run a script that must succeed; returns the printed output.
pub fn run_ok(stmts: Vec<Stmt>) -> String {
    let (result, text) = run_script(stmts);
    assert_eq!(result, InterpretResult::Ok, "script failed; output so far: {:?}", text);
    text
}
