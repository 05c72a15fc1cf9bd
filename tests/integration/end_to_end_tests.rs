//! End-to-end coverage of the full `parse -> analyze -> compile -> link ->
//! run` pipeline (spec.md §8's scenarios S1-S6), driven entirely through
//! the crate's public surface.

use rho::compiler::{compile, CompilerContext};
use rho::linker::Linker;
use rho::runtime::value::Value;
use rho::runtime::vm::Vm;
use rho::syntax::parse;

fn run_one(src: &str) -> Value {
    let program = parse(src).expect("parses");
    let mut ctx = CompilerContext::new();
    let out = compile(&program, "main", &mut ctx, true);
    assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
    let module = out.module.expect("compiles");
    let mut linker = Linker::new();
    let linked = linker.link(vec![module], "main").expect("links");
    Vm::new().run(&linked).expect("runs")
}

fn as_decimal(value: Value) -> String {
    match value {
        Value::Number(n) => n.to_decimal_string(),
        other => panic!("expected a number, got {other:?}"),
    }
}

#[test]
fn s1_integer_arithmetic_respects_operator_precedence() {
    assert_eq!(as_decimal(run_one("1 + 2 * 3 - 4 / 2;")), "5");
}

#[test]
fn s2_closure_capture_and_mutation_persists_between_calls() {
    let result = run_one(
        "var mk_counter = fun (start) {\n  fun () { start = start + 1; start }\n};\nvar c1 = mk_counter(0);\nvar c2 = mk_counter(100);\nc1(); c1(); c2();\nc1() + c2();",
    );
    // c1: 1,2,3,4 (4 calls total including the one folded into the sum) =>
    // last c1() call returns 4; c2: 101, then 102 on the summed call.
    assert_eq!(as_decimal(result), "106");
}

#[test]
fn s3_tail_recursive_sum_runs_without_stack_growth() {
    assert_eq!(
        as_decimal(run_one(
            "var sum = fun (n, acc) { if n == 0 then acc else $(n - 1, acc + n) };\nsum(100000, 0);"
        )),
        "5000050000"
    );
}

#[test]
fn s4_match_with_repeated_pattern_variables() {
    let matched = run_one(
        "match '(7 8 7) {\n  case '(x y x) => x * 100 + y;\n  else => -1;\n}",
    );
    assert_eq!(as_decimal(matched), "708");

    let unmatched = run_one(
        "match '(7 8 9) {\n  case '(x y x) => x * 100 + y;\n  else => -1;\n}",
    );
    assert_eq!(as_decimal(unmatched), "-1");
}

#[test]
fn match_arm_body_pattern_var_reference_is_not_clobbered_by_preceding_locals() {
    // `a` claims local slot 0 before the match runs, so `x`/`y`'s pattern
    // slots must be offset past it rather than colliding with it.
    let result = run_one(
        "var f = fun (n) {\n  let a = n in\n  match '(3 . 4) {\n    case '(x . y) => x + y + a;\n    else => 0;\n  }\n};\nf(10);",
    );
    assert_eq!(as_decimal(result), "17");
}

#[test]
fn s5_cross_module_import_resolves_an_exported_binding() {
    let program_a = parse("module Geometry;\nvar square = fun (x) { x * x };\nexport (square);").unwrap();
    let program_b = parse("module Main;\nimport Geometry;\nGeometry:square(9);").unwrap();

    let mut ctx = CompilerContext::new();
    let out_a = compile(&program_a, "Geometry", &mut ctx, true);
    assert!(out_a.diagnostics.is_empty(), "{:?}", out_a.diagnostics);
    let out_b = compile(&program_b, "Main", &mut ctx, true);
    assert!(out_b.diagnostics.is_empty(), "{:?}", out_b.diagnostics);

    let mut linker = Linker::new();
    let linked = linker
        .link(
            vec![out_a.module.expect("compiles"), out_b.module.expect("compiles")],
            "Main",
        )
        .expect("links");
    let result = Vm::new().run(&linked).expect("runs");
    assert_eq!(as_decimal(result), "81");
}

#[test]
fn s6_string_formatting_with_percent_and_precision_block() {
    let formatted = run_one("\"{0}: {1}\" % [\"total\", 42];");
    match formatted {
        Value::Str(_) => {}
        other => panic!("expected a string, got {other:?}"),
    }

    // A `precision` block rounds float literals evaluated inside it to the
    // stated number of decimal digits (spec.md §3/§4.4's micro-frames).
    let rounded = run_one("2:prec { 1.0 / 3.0 };");
    match rounded {
        Value::Number(n) => assert_eq!(n.to_decimal_string(), "0.33"),
        other => panic!("expected a number, got {other:?}"),
    }
}

#[test]
fn repl_style_incremental_compilation_sees_earlier_global_bindings() {
    // Mirrors the REPL driver's loop: each line compiles through the same
    // `CompilerContext`/`Linker`, seeding `known_globals` from the
    // previous line's `global_names` before the next line compiles.
    let mut ctx = CompilerContext::new();
    let mut linker = Linker::new();
    let mut vm = Vm::new();

    let line1 = parse("var total = 10;").unwrap();
    let out1 = compile(&line1, "#this#", &mut ctx, true);
    assert!(out1.diagnostics.is_empty(), "{:?}", out1.diagnostics);
    for (name, idx) in out1.global_names {
        ctx.known_globals.insert(name, idx);
    }
    let linked1 = linker
        .link(vec![out1.module.expect("compiles")], "#this#")
        .expect("links");
    vm.run(&linked1).expect("runs");

    let line2 = parse("total + 5;").unwrap();
    let out2 = compile(&line2, "#this#", &mut ctx, true);
    assert!(out2.diagnostics.is_empty(), "{:?}", out2.diagnostics);
    let linked2 = linker
        .link(vec![out2.module.expect("compiles")], "#this#")
        .expect("links");
    let result = vm.run(&linked2).expect("runs");
    assert_eq!(as_decimal(result), "15");
}
