/// End-to-end interpreter scenarios: closures and upvalue sharing, iteration,
/// classes, defer ordering, arithmetic rules, control flow, error paths.
/// Each test hand-builds the AST the front-end would produce, compiles it,
/// runs it, and checks the concatenated print output.

mod common;

use common::*;
use sptscript::ast::{BinaryOp, UnaryOp};
use sptscript::errors::InterpretResult;

// ─── Closures & upvalues ──────────────────────────────────────────────────────

#[test]
fn closure_captures_a_mutated_local() {
    // var make = function() {
    //   var n = 0;
    //   return function() { n = n + 1; return n; };
    // };
    // var c = make(); print(c()); print(c()); print(c());
    let make_body = vec![
        var("n", int(0)),
        ret(vec![lambda(
            vec![],
            vec![
                assign(ident("n"), binary(BinaryOp::Add, ident("n"), int(1))),
                ret(vec![ident("n")]),
            ],
        )]),
    ];
    let output = run_ok(vec![
        var("make", lambda(vec![], make_body)),
        var("c", call_name("make", vec![])),
        print_stmt(call_name("c", vec![])),
        print_stmt(call_name("c", vec![])),
        print_stmt(call_name("c", vec![])),
    ]);
    assert_eq!(output, "1\n2\n3\n");
}

#[test]
fn sibling_closures_share_the_same_upvalue_cell() {
    // Two closures made in the same scope see each other's writes.
    let make_body = vec![
        var("n", int(0)),
        var(
            "inc",
            lambda(
                vec![],
                vec![
                    assign(ident("n"), binary(BinaryOp::Add, ident("n"), int(1))),
                    ret(vec![ident("n")]),
                ],
            ),
        ),
        var("get", lambda(vec![], vec![ret(vec![ident("n")])])),
        ret(vec![list(vec![ident("inc"), ident("get")])]),
    ];
    let output = run_ok(vec![
        var("make", lambda(vec![], make_body)),
        var("fns", call_name("make", vec![])),
        expr_stmt(call(index(ident("fns"), int(0)), vec![])),
        expr_stmt(call(index(ident("fns"), int(0)), vec![])),
        print_stmt(call(index(ident("fns"), int(1)), vec![])),
    ]);
    assert_eq!(output, "2\n");
}

#[test]
fn three_level_nested_capture() {
    // outer(a) -> middle(b) -> inner(c) -> a + b + c
    let inner = lambda(
        vec!["c"],
        vec![ret(vec![binary(
            BinaryOp::Add,
            binary(BinaryOp::Add, ident("a"), ident("b")),
            ident("c"),
        )])],
    );
    let middle = lambda(vec!["b"], vec![ret(vec![inner])]);
    let output = run_ok(vec![
        var("outer", lambda(vec!["a"], vec![ret(vec![middle])])),
        var("m", call_name("outer", vec![int(1)])),
        var("i", call_name("m", vec![int(2)])),
        print_stmt(call_name("i", vec![int(3)])),
    ]);
    assert_eq!(output, "6\n");
}

#[test]
fn shadowing_initializer_sees_the_outer_binding() {
    // var x = 10; { var x = x + 1; print(x); } print(x);
    let output = run_ok(vec![
        var("x", int(10)),
        sptscript::ast::Stmt::Block(block(vec![
            var("x", binary(BinaryOp::Add, ident("x"), int(1))),
            print_stmt(ident("x")),
        ])),
        print_stmt(ident("x")),
    ]);
    assert_eq!(output, "11\n10\n");
}

// ─── Iteration ────────────────────────────────────────────────────────────────

#[test]
fn foreach_over_list_unpacks_index_and_value() {
    let output = run_ok(vec![
        var("xs", list(vec![int(10), int(20), int(30)])),
        for_each(
            vec!["i", "v"],
            ident("xs"),
            vec![print_stmt(ident("i")), print_stmt(ident("v"))],
        ),
    ]);
    assert_eq!(output, "0\n10\n1\n20\n2\n30\n");
}

#[test]
fn foreach_single_variable_yields_elements() {
    let output = run_ok(vec![
        var("xs", list(vec![int(7), int(8)])),
        for_each(vec!["v"], ident("xs"), vec![print_stmt(ident("v"))]),
    ]);
    assert_eq!(output, "7\n8\n");
}

#[test]
fn foreach_over_map_yields_key_value_pairs() {
    let output = run_ok(vec![
        var("m", map(vec![(str_("a"), int(1))])),
        for_each(
            vec!["k", "v"],
            ident("m"),
            vec![print_stmt(ident("k")), print_stmt(ident("v"))],
        ),
    ]);
    assert_eq!(output, "a\n1\n");
}

#[test]
fn numeric_for_counts_with_constant_step() {
    let output = run_ok(vec![
        var("sum", int(0)),
        counting_for(
            "i",
            int(0),
            int(5),
            int(1),
            vec![update(ident("sum"), BinaryOp::Add, ident("i"))],
        ),
        print_stmt(ident("sum")),
    ]);
    assert_eq!(output, "10\n");
}

#[test]
fn general_for_with_descending_update() {
    // for (var i = 10; i > 0; i = i - 2) — not the canonical form, general path
    let loop_stmt = sptscript::ast::Stmt::ForC {
        initializer: Some(sptscript::ast::ForInit::Decls(vec![var("i", int(10))])),
        condition: Some(binary(BinaryOp::Gt, ident("i"), int(0))),
        updates: vec![assign(ident("i"), binary(BinaryOp::Sub, ident("i"), int(2)))],
        body: block(vec![update(ident("sum"), BinaryOp::Add, ident("i"))]),
        loc: loc(),
    };
    let output = run_ok(vec![var("sum", int(0)), loop_stmt, print_stmt(ident("sum"))]);
    assert_eq!(output, "30\n");
}

#[test]
fn while_with_break_and_continue() {
    // skip i == 3, stop after i > 5
    let body = vec![
        update(ident("i"), BinaryOp::Add, int(1)),
        if_stmt(binary(BinaryOp::Eq, ident("i"), int(3)), vec![cont()], None),
        if_stmt(binary(BinaryOp::Gt, ident("i"), int(5)), vec![brk()], None),
        update(ident("sum"), BinaryOp::Add, ident("i")),
    ];
    let output = run_ok(vec![
        var("i", int(0)),
        var("sum", int(0)),
        while_stmt(binary(BinaryOp::Lt, ident("i"), int(10)), body),
        print_stmt(ident("sum")),
    ]);
    assert_eq!(output, "12\n");
}

// ─── Classes ──────────────────────────────────────────────────────────────────

#[test]
fn class_with_constructor_and_method() {
    // class Point { x; y; __init(x, y) {...}; sum() { return this.x + this.y } }
    let point = class(
        "Point",
        vec![
            field("x", None),
            field("y", None),
            method(
                "__init",
                vec!["x", "y"],
                vec![
                    assign(member(this(), "x"), ident("x")),
                    assign(member(this(), "y"), ident("y")),
                ],
            ),
            method(
                "sum",
                vec![],
                vec![ret(vec![binary(
                    BinaryOp::Add,
                    member(this(), "x"),
                    member(this(), "y"),
                )])],
            ),
        ],
    );
    let output = run_ok(vec![
        point,
        var("p", new_("Point", vec![int(3), int(4)])),
        print_stmt(method_call(ident("p"), "sum", vec![])),
    ]);
    assert_eq!(output, "7\n");
}

#[test]
fn instance_field_reads_fall_back_to_class_initializers() {
    let counter = class(
        "Counter",
        vec![
            field("start", Some(int(100))),
            method("bump", vec![], vec![
                assign(
                    member(this(), "start"),
                    binary(BinaryOp::Add, member(this(), "start"), int(1)),
                ),
                ret(vec![member(this(), "start")]),
            ]),
        ],
    );
    let output = run_ok(vec![
        counter,
        var("a", new_("Counter", vec![])),
        var("b", new_("Counter", vec![])),
        print_stmt(method_call(ident("a"), "bump", vec![])),
        print_stmt(method_call(ident("a"), "bump", vec![])),
        // b's own field is untouched by a's writes
        print_stmt(method_call(ident("b"), "bump", vec![])),
    ]);
    assert_eq!(output, "101\n102\n101\n");
}

// ─── Defer ────────────────────────────────────────────────────────────────────

#[test]
fn defers_run_lifo_on_normal_exit() {
    let output = run_ok(vec![
        defer(vec![print_stmt(str_("a"))]),
        defer(vec![print_stmt(str_("b"))]),
        print_stmt(str_("c")),
    ]);
    assert_eq!(output, "c\nb\na\n");
}

#[test]
fn defers_run_during_error_unwinding() {
    let (result, output) = run_script(vec![
        defer(vec![print_stmt(str_("cleanup"))]),
        var("x", binary(BinaryOp::Div, int(1), int(0))),
        print_stmt(str_("unreachable")),
    ]);
    assert_eq!(result, InterpretResult::RuntimeError);
    assert_eq!(output, "cleanup\n");
}

#[test]
fn function_scope_defer_runs_at_function_return() {
    let f = func(
        "work",
        vec![],
        vec![
            defer(vec![print_stmt(str_("closing"))]),
            print_stmt(str_("working")),
            ret(vec![int(9)]),
        ],
    );
    let output = run_ok(vec![f, print_stmt(call_name("work", vec![]))]);
    assert_eq!(output, "working\nclosing\n9\n");
}

// ─── Arithmetic & values ──────────────────────────────────────────────────────

#[test]
fn arithmetic_promotion_rules() {
    let output = run_ok(vec![
        print_stmt(binary(BinaryOp::Add, int(2), int(3))),
        print_stmt(binary(BinaryOp::Add, int(2), float(0.5))),
        print_stmt(binary(BinaryOp::Div, int(7), int(2))),
        print_stmt(binary(BinaryOp::IDiv, int(7), int(2))),
        print_stmt(binary(BinaryOp::IDiv, unary(UnaryOp::Neg, int(7)), int(2))),
        print_stmt(binary(BinaryOp::Mod, unary(UnaryOp::Neg, int(7)), int(3))),
        print_stmt(binary(BinaryOp::Mul, int(3), float(1.5))),
    ]);
    assert_eq!(output, "5\n2.5\n3.5\n3\n-4\n2\n4.5\n");
}

#[test]
fn int_add_wraps_modulo_two_to_the_64() {
    let output = run_ok(vec![
        var("big", int(i64::MAX)),
        print_stmt(binary(BinaryOp::Add, ident("big"), int(1))),
    ]);
    assert_eq!(output, format!("{}\n", i64::MIN));
}

#[test]
fn concat_converts_the_non_string_operand() {
    let output = run_ok(vec![
        print_stmt(binary(BinaryOp::Concat, str_("n="), int(42))),
        print_stmt(binary(BinaryOp::Concat, float(2.5), str_("!"))),
        print_stmt(binary(BinaryOp::Concat, str_("is "), boolean(true))),
        print_stmt(binary(BinaryOp::Concat, str_("got "), nil())),
    ]);
    assert_eq!(output, "n=42\n2.5!\nis true\ngot nil\n");
}

#[test]
fn concat_of_two_numbers_is_a_type_error() {
    let (result, _) = run_script(vec![print_stmt(binary(BinaryOp::Concat, int(1), int(2)))]);
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn comparisons_as_values() {
    let output = run_ok(vec![
        print_stmt(binary(BinaryOp::Lt, int(1), int(2))),
        print_stmt(binary(BinaryOp::Ge, int(1), int(2))),
        print_stmt(binary(BinaryOp::Ne, str_("a"), str_("b"))),
        print_stmt(binary(BinaryOp::Eq, int(3), float(3.0))),
    ]);
    assert_eq!(output, "true\nfalse\ntrue\ntrue\n");
}

#[test]
fn short_circuit_returns_the_deciding_operand() {
    let output = run_ok(vec![
        print_stmt(binary(BinaryOp::And, int(1), int(2))),
        print_stmt(binary(BinaryOp::And, boolean(false), int(2))),
        print_stmt(binary(BinaryOp::Or, nil(), int(3))),
        print_stmt(binary(BinaryOp::Or, int(4), int(5))),
    ]);
    assert_eq!(output, "2\nfalse\n3\n4\n");
}

#[test]
fn short_circuit_skips_the_right_hand_side() {
    // false && boom() must not call boom
    let boom = func("boom", vec![], vec![print_stmt(str_("boom")), ret(vec![boolean(true)])]);
    let output = run_ok(vec![
        boom,
        print_stmt(binary(BinaryOp::And, boolean(false), call_name("boom", vec![]))),
    ]);
    assert_eq!(output, "false\n");
}

#[test]
fn zero_is_truthy_only_nil_and_false_are_falsy() {
    let output = run_ok(vec![
        if_stmt(int(0), vec![print_stmt(str_("zero-truthy"))], None),
        if_stmt(nil(), vec![print_stmt(str_("bad"))], Some(vec![print_stmt(str_("nil-falsy"))])),
    ]);
    assert_eq!(output, "zero-truthy\nnil-falsy\n");
}

#[test]
fn map_literal_keys_stay_numeric() {
    // {1: "x", 1.5: "y"} — numeric keys are not coerced to strings
    let output = run_ok(vec![
        var("m", map(vec![(int(1), str_("x")), (float(1.5), str_("y"))])),
        print_stmt(index(ident("m"), int(1))),
        print_stmt(index(ident("m"), float(1.5))),
        print_stmt(call_name("len", vec![ident("m")])),
    ]);
    assert_eq!(output, "x\ny\n2\n");
}

#[test]
fn string_indexing_and_len() {
    let output = run_ok(vec![
        var("s", binary(BinaryOp::Concat, str_("foo"), int(42))),
        print_stmt(ident("s")),
        print_stmt(index(ident("s"), int(1))),
        print_stmt(call_name("len", vec![ident("s")])),
    ]);
    assert_eq!(output, "foo42\no\n5\n");
}

// ─── Multi-value forms ────────────────────────────────────────────────────────

#[test]
fn multi_declaration_from_a_multi_return_call() {
    let pair = func("pair", vec![], vec![ret(vec![int(1), int(2)])]);
    let output = run_ok(vec![
        pair,
        multi_var(vec!["a", "b"], call_name("pair", vec![])),
        print_stmt(ident("a")),
        print_stmt(ident("b")),
    ]);
    assert_eq!(output, "1\n2\n");
}

#[test]
fn multi_declaration_from_a_plain_expression_pads_with_nil() {
    let output = run_ok(vec![
        multi_var(vec!["a", "b"], int(5)),
        print_stmt(ident("a")),
        print_stmt(ident("b")),
    ]);
    assert_eq!(output, "5\nnil\n");
}

// ─── Error paths ──────────────────────────────────────────────────────────────

#[test]
fn division_by_zero_is_a_runtime_error() {
    let (result, _) = run_script(vec![print_stmt(binary(BinaryOp::Div, int(1), int(0)))]);
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn calling_a_non_callable_is_a_runtime_error() {
    let (result, _) = run_script(vec![var("x", int(3)), expr_stmt(call_name("x", vec![]))]);
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn undefined_global_read_is_a_runtime_error() {
    let (result, _) = run_script(vec![print_stmt(ident("no_such_name"))]);
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn list_index_out_of_range_is_a_runtime_error() {
    let (result, _) = run_script(vec![
        var("xs", list(vec![int(1)])),
        print_stmt(index(ident("xs"), int(5))),
    ]);
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn native_arity_mismatch_is_a_runtime_error() {
    // len() is strict about its single argument
    let (result, _) = run_script(vec![expr_stmt(call_name("len", vec![int(1), int(2)]))]);
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn infinite_recursion_hits_the_frame_limit() {
    let f = func("spin", vec![], vec![ret(vec![call_name("spin", vec![])])]);
    let (result, _) = run_script(vec![f, expr_stmt(call_name("spin", vec![]))]);
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn execution_continues_across_runs_of_the_same_vm() {
    // Nested interpret support: one VM, two chunks, shared root environment.
    let chunk_a = compile(vec![print_stmt(str_("first"))]);
    let chunk_b = compile(vec![print_stmt(str_("second"))]);
    let (mut vm, output) = capture_vm();
    assert_eq!(vm.interpret(&chunk_a), InterpretResult::Ok);
    assert_eq!(vm.interpret(&chunk_b), InterpretResult::Ok);
    assert_eq!(output.lock().as_str(), "first\nsecond\n");
}

// ─── GC under allocation pressure ─────────────────────────────────────────────

#[test]
fn collector_runs_under_allocation_pressure_without_corruption() {
    // Churn enough short-lived strings to cross the collection threshold;
    // the live closure state must survive every cycle.
    let body = vec![
        var("s", binary(BinaryOp::Concat, str_("chunk-of-garbage-"), ident("i"))),
        update(ident("keep"), BinaryOp::Add, int(1)),
        expr_stmt(ident("s")),
    ];
    let output = run_ok(vec![
        var("keep", int(0)),
        counting_for("i", int(0), int(40000), int(1), body),
        print_stmt(ident("keep")),
    ]);
    assert_eq!(output, "40000\n");
}
