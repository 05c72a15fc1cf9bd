//! Command-line driver (spec.md §6): compiles and links a batch of files
//! into one program and runs it, or — given no files — opens a
//! read-eval-print loop over stdin, mirroring `examples/sger-flux`'s own
//! split between a batch `run_files` entry point and an interactive shell
//! built on the same compile/link/execute pipeline.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use rho::ast::{NodeKind, Program};
use rho::compiler::{compile, CompilerContext};
use rho::linker::{Linker, REPL_MODULE_NAME};
use rho::runtime::vm::Vm;
use rho::syntax::parse;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let trace = args.iter().any(|a| a == "--trace");
    let files: Vec<String> = args.into_iter().filter(|a| !a.starts_with('-')).collect();

    if files.is_empty() {
        repl(trace);
        return ExitCode::SUCCESS;
    }

    match run_files(&files, trace) {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::from(255),
    }
}

fn print_usage() {
    println!("rho [options] file...");
    println!();
    println!("options:");
    println!("  --help, -h   print this message and exit");
    println!("  --trace      print each executed instruction to stderr");
    println!();
    println!("with no files, starts a read-eval-print loop");
}

/// Every file's name, as derived for module-registration purposes: an
/// explicit `module Name;` statement wins, else the file's stem (§4.4
/// "Imports & atoms" assumes every module has a stable name to import by).
fn module_name_of(program: &Program, fallback: &str) -> String {
    for stmt in &program.stmts {
        if let NodeKind::Module(name) = &stmt.kind {
            return name.clone();
        }
    }
    fallback.to_string()
}

/// Every name a program's top-level `import`s (and `namespace` bodies'
/// `import`s) depend on, gathered the same way the analyzer's PREPASS
/// walks a scope's statements looking for declarations (§4.2).
fn imports_of(program: &Program) -> Vec<String> {
    fn walk(stmts: &[rho::ast::Node], out: &mut Vec<String>) {
        for stmt in stmts {
            match &stmt.kind {
                NodeKind::Import(name) => out.push(name.clone()),
                NodeKind::Namespace { body, .. } => walk(body, out),
                _ => {}
            }
        }
    }
    let mut out = Vec::new();
    walk(&program.stmts, &mut out);
    out
}

/// Parses every file, orders them so each module compiles only after every
/// module it imports has already registered its exports in `ctx.modules`
/// (spec.md §4.4 scenario S5, "Cross-module import"), then compiles,
/// links, and runs the batch. The last file named on the command line is
/// the program's entry module.
fn run_files(paths: &[String], trace: bool) -> Result<(), ()> {
    let mut parsed: Vec<(String, Program)> = Vec::with_capacity(paths.len());
    for path in paths {
        let src = std::fs::read_to_string(path).map_err(|e| {
            eprintln!("rho: cannot read {path}: {e}");
        })?;
        let program = parse(&src).map_err(|e| {
            eprintln!("rho: {path}: {e}");
        })?;
        let stem = std::path::Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        let name = module_name_of(&program, &stem);
        parsed.push((name, program));
    }

    let entry_name = parsed.last().map(|(name, _)| name.clone()).unwrap();
    let order = topo_order(&parsed).map_err(|cycle| {
        eprintln!("rho: import cycle detected among: {}", cycle.join(", "));
    })?;

    let mut ctx = CompilerContext::new();
    let mut modules = Vec::with_capacity(parsed.len());
    for idx in order {
        let (name, program) = &parsed[idx];
        let out = compile(program, name, &mut ctx, true);
        if !out.diagnostics.is_empty() {
            eprint!("{}", out.diagnostics.render_all());
        }
        if out.diagnostics.has_errors() {
            return Err(());
        }
        modules.push(out.module.expect("no errors implies a compiled module"));
    }

    let mut linker = Linker::new();
    let linked = linker.link(modules, &entry_name).map_err(|e| {
        eprintln!("rho: link error: {e}");
    })?;

    let mut vm = Vm::new();
    vm.set_trace(trace);
    match vm.run(&linked) {
        Ok(_) => Ok(()),
        Err(e) => {
            eprintln!("rho: {e}");
            Err(())
        }
    }
}

/// A dependency-respecting compile order over a batch of parsed files: a
/// plain topological sort of the import graph restricted to names the
/// batch itself defines (an import of a module outside the batch is left
/// for the linker/runtime to complain about, same as a single-file run).
fn topo_order(parsed: &[(String, Program)]) -> Result<Vec<usize>, Vec<String>> {
    let index_of: std::collections::HashMap<&str, usize> = parsed
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();

    let mut color = vec![0u8; parsed.len()];
    let mut order = Vec::with_capacity(parsed.len());

    fn visit(
        i: usize,
        parsed: &[(String, Program)],
        index_of: &std::collections::HashMap<&str, usize>,
        color: &mut [u8],
        order: &mut Vec<usize>,
    ) -> Result<(), Vec<String>> {
        match color[i] {
            2 => return Ok(()),
            1 => return Err(vec![parsed[i].0.clone()]),
            _ => {}
        }
        color[i] = 1;
        for dep in imports_of(&parsed[i].1) {
            if let Some(&j) = index_of.get(dep.as_str()) {
                visit(j, parsed, index_of, color, order)?;
            }
        }
        color[i] = 2;
        order.push(i);
        Ok(())
    }

    for i in 0..parsed.len() {
        visit(i, parsed, &index_of, &mut color, &mut order)?;
    }
    Ok(order)
}

/// Reads one line at a time from stdin, compiling and running each as its
/// own incremental slice of the `#this#` REPL module (spec.md §4.4's
/// "Known globals" / §7): a runtime fault prints and is swallowed rather
/// than ending the session, matching a conventional REPL's tolerance for
/// a bad line.
fn repl(trace: bool) {
    let mut ctx = CompilerContext::new();
    let mut linker = Linker::new();
    let mut vm = Vm::new();
    vm.set_trace(trace);
    let stdin = io::stdin();
    print!("> ");
    let _ = io::stdout().flush();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            print!("> ");
            let _ = io::stdout().flush();
            continue;
        }

        match parse(&line) {
            Ok(program) => {
                let out = compile(&program, REPL_MODULE_NAME, &mut ctx, true);
                if !out.diagnostics.is_empty() {
                    eprint!("{}", out.diagnostics.render_all());
                }
                if !out.diagnostics.has_errors() {
                    if let Some(module) = out.module {
                        match linker.link(vec![module], REPL_MODULE_NAME) {
                            Ok(linked) => match vm.run(&linked) {
                                Ok(value) => println!("{}", value.display(vm.heap())),
                                Err(e) => eprintln!("rho: {e}"),
                            },
                            Err(e) => eprintln!("rho: link error: {e}"),
                        }
                        for (name, idx) in out.global_names {
                            ctx.known_globals.insert(name, idx);
                        }
                    }
                }
            }
            Err(e) => eprintln!("rho: {e}"),
        }

        print!("> ");
        let _ = io::stdout().flush();
    }
}
