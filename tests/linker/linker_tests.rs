//! Black-box coverage of the linker (spec.md §4.5): page assignment,
//! import-dependency ordering, REPL re-linking onto a fixed page, and the
//! unresolved-import failure mode — each through the crate's public
//! compile/link surface rather than hand-built `Module` fixtures.

use rho::compiler::{compile, CompilerContext};
use rho::linker::{Linker, REPL_MODULE_NAME, REPL_PAGE};
use rho::syntax::parse;

fn compile_module(ctx: &mut CompilerContext, src: &str, name: &str) -> rho::bytecode::Module {
    let program = parse(src).expect("parses");
    let out = compile(&program, name, ctx, true);
    assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
    out.module.expect("compiles")
}

#[test]
fn independently_compiled_modules_get_distinct_pages() {
    let mut ctx = CompilerContext::new();
    let a = compile_module(&mut ctx, "var v = 1;", "A");
    let b = compile_module(&mut ctx, "var v = 2;", "B");

    let mut linker = Linker::new();
    linker.link(vec![a, b], "A").unwrap();
    let pa = linker.page_of("A").expect("A resident");
    let pb = linker.page_of("B").expect("B resident");
    assert_ne!(pa, pb);
    assert_ne!(pa, REPL_PAGE);
    assert_ne!(pb, REPL_PAGE);
}

#[test]
fn linking_without_the_imported_module_present_fails() {
    let mut ctx = CompilerContext::new();
    // Compiling `A` through this context registers its exports, so `B`
    // compiles cleanly against a real `Gv` relocation targeting "A" — but
    // `A` itself is never handed to this `Linker`, so it can't resolve.
    let _a = compile_module(&mut ctx, "module A;\nvar v = 41;\nexport (v);", "A");
    let b = compile_module(&mut ctx, "module B;\nimport A;\nA:v;", "B");

    let mut linker = Linker::new();
    let result = linker.link(vec![b], "B");
    assert!(result.is_err(), "linking against a never-resident import must fail");
}

#[test]
fn cross_module_import_resolves_once_the_dependency_is_compiled_first() {
    let mut ctx = CompilerContext::new();
    let a = compile_module(&mut ctx, "module A;\nvar v = 41;\nexport (v);", "A");
    let b = compile_module(&mut ctx, "module B;\nimport A;\nA:v + 1;", "B");

    let mut linker = Linker::new();
    let linked = linker.link(vec![a, b], "B").unwrap();
    assert!(linked.page_names.contains(&"A".to_string()));
    assert!(linked.page_names.contains(&"B".to_string()));
}

#[test]
fn repl_reentry_always_relinks_onto_the_reserved_repl_page() {
    let mut ctx = CompilerContext::new();
    let mut linker = Linker::new();

    let program1 = parse("var x = 1;").unwrap();
    let out1 = compile(&program1, REPL_MODULE_NAME, &mut ctx, true);
    assert!(out1.diagnostics.is_empty(), "{:?}", out1.diagnostics);
    for (name, idx) in out1.global_names {
        ctx.known_globals.insert(name, idx);
    }
    let linked1 = linker
        .link(vec![out1.module.expect("compiles")], REPL_MODULE_NAME)
        .unwrap();
    assert_eq!(linker.page_of(REPL_MODULE_NAME), Some(REPL_PAGE));
    assert_eq!(linked1.entry_offset, 0);

    // A second REPL line referencing `x` must resolve it via the
    // `known_globals` seeded from the first line's output, not redeclare it.
    let line2 = compile_module(&mut ctx, "x + 1;", REPL_MODULE_NAME);
    let linked2 = linker.link(vec![line2], REPL_MODULE_NAME).unwrap();
    assert_eq!(linker.page_of(REPL_MODULE_NAME), Some(REPL_PAGE));
    assert!(linked2.entry_offset > linked1.entry_offset, "each REPL input appends past the last");
}
