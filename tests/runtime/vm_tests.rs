//! Black-box coverage of the virtual machine (spec.md §3, §4.6, §6),
//! driven end to end through `parse -> compile -> link -> run` since the
//! VM has no public bytecode-assembly entry point of its own.

use rho::compiler::{compile, CompilerContext};
use rho::linker::Linker;
use rho::runtime::value::Value;
use rho::runtime::vm::Vm;
use rho::syntax::parse;

fn run(src: &str) -> Value {
    let program = parse(src).expect("parses");
    let mut ctx = CompilerContext::new();
    let out = compile(&program, "main", &mut ctx, true);
    assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
    let module = out.module.expect("compiles");
    let mut linker = Linker::new();
    let linked = linker.link(vec![module], "main").expect("links");
    let mut vm = Vm::new();
    vm.run(&linked).expect("runs")
}

fn run_vm(src: &str) -> (Value, Vm) {
    let program = parse(src).expect("parses");
    let mut ctx = CompilerContext::new();
    let out = compile(&program, "main", &mut ctx, true);
    assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
    let module = out.module.expect("compiles");
    let mut linker = Linker::new();
    let linked = linker.link(vec![module], "main").expect("links");
    let mut vm = Vm::new();
    let value = vm.run(&linked).expect("runs");
    (value, vm)
}

#[test]
fn closure_over_a_mutated_upvalue_accumulates_across_calls() {
    // S2: a counter closure whose captured `x` is both read and written.
    let result = run("var mk = fun (x) { fun () { x = x + 1; x } };\nvar c = mk(10);\nc(); c(); c()");
    match result {
        Value::Number(n) => assert_eq!(n.to_decimal_string(), "13"),
        other => panic!("expected a number, got {other:?}"),
    }
}

#[test]
fn deep_tail_recursion_does_not_overflow_the_stack() {
    // S3: a self-tail-call (`$`) accumulator run deep enough that a naive
    // non-tail-call implementation would blow the stack.
    let result = run(
        "var loop = fun (n, acc) { if n == 0 then acc else $(n - 1, acc + 1) };\nloop(200000, 0);",
    );
    match result {
        Value::Number(n) => assert_eq!(n.to_decimal_string(), "200000"),
        other => panic!("expected a number, got {other:?}"),
    }
}

#[test]
fn pattern_match_binds_repeated_variables_only_when_equal() {
    // S4: `'(x . (y . x))` against `'(1 . (2 . 1))` binds x=1, y=2.
    let result = run(
        "match '(1 . (2 . 1)) {\n  case '(x . (y . x)) => x + y;\n  else => -1;\n}",
    );
    match result {
        Value::Number(n) => assert_eq!(n.to_decimal_string(), "3"),
        other => panic!("expected a number, got {other:?}"),
    }

    let mismatch = run(
        "match '(1 . (2 . 9)) {\n  case '(x . (y . x)) => x + y;\n  else => -1;\n}",
    );
    match mismatch {
        Value::Number(n) => assert_eq!(n.to_decimal_string(), "-1"),
        other => panic!("expected a number, got {other:?}"),
    }
}

#[test]
fn string_percent_interpolates_positional_list_arguments() {
    let (result, vm) = run_vm("\"{0} has {1} messages\" % [\"world\", 5];");
    assert_eq!(result.display(vm.heap()), "world has 5 messages");
}

#[test]
fn vectors_support_get_and_set() {
    let result = run("var v = [1, 2, 3];\nv[1] = 9;\nv[1];");
    match result {
        Value::Number(n) => assert_eq!(n.to_decimal_string(), "9"),
        other => panic!("expected a number, got {other:?}"),
    }
}

#[test]
fn len_builtin_counts_vector_elements_and_list_length() {
    assert_eq!(run("len([1, 2, 3]);"), Value::Number(rho::numeric::Num::from_i64(3)));
    assert_eq!(run("len('(1 2));"), Value::Number(rho::numeric::Num::from_i64(2)));
}

#[test]
fn automatic_collection_mid_loop_does_not_corrupt_live_state() {
    // Each tail-call iteration discards the previous `acc` string and
    // allocates a fresh one; past the GC's 400-allocation threshold this
    // forces at least one automatic `collect_garbage` mid-run (§9). The
    // accumulator itself stays live across every collection via the
    // still-executing frame's stack slot, so the final length must still
    // be exactly right if the collector didn't reclaim anything live.
    let result = run(
        "var build = fun (n, acc) { if n == 0 then acc else $(n - 1, acc % \"x\") };\nlen(build(600, \"\"));",
    );
    match result {
        Value::Number(n) => assert_eq!(n.to_decimal_string(), "0"),
        other => panic!("expected a number, got {other:?}"),
    }
}
