//! Linker (spec.md §4.5): orders compiled modules by import dependency,
//! assigns each a page index, concatenates their bytecode into one
//! buffer, and fixes up `Gp`/`Gv` relocations. A single
//! [`Linker`] instance persists across a REPL session's incremental
//! single-module links, exactly as it persists across the multiple files
//! named on a batch `rho file1 file2` invocation.

use std::collections::{HashMap, HashSet};

use crate::bytecode::codegen::RelocationKind;
use crate::bytecode::module::Module;
use crate::bytecode::OpCode;
use crate::diagnostics::{Diagnostic, FatalError};

/// Page index reserved for the REPL's own top-level module (`#this#`);
/// every incremental REPL input relinks onto this same page.
pub const REPL_PAGE: u32 = 0;
pub const REPL_MODULE_NAME: &str = "#this#";

#[derive(Debug, Clone)]
pub struct LinkedProgram {
    /// Cumulative code buffer across every module this [`Linker`] has
    /// ever linked (pages concatenated in link order).
    pub code: Vec<u8>,
    /// Page index -> module name, dense from 0.
    pub page_names: Vec<String>,
    /// Byte offset in `code` to begin executing for *this* link call: the
    /// start of whatever new code this call appended (spec §3 "Program
    /// image ... suitable for the VM to execute from offset 0" — for a
    /// freshly constructed `Linker` linking a whole batch in one call,
    /// this is exactly `0`, so the VM runs every dependency module's
    /// top-level in order before the entry module's; for an incremental
    /// REPL re-link it is the start of that single new increment, so
    /// already-resident modules' top levels are not re-executed).
    pub entry_offset: u32,
}

#[derive(Debug, Clone, Copy)]
struct Resident {
    page: u32,
    /// Byte offset in the cumulative code buffer where this module's
    /// most recent link appended its code.
    base: u32,
}

#[derive(Debug, Default)]
pub struct Linker {
    resident: HashMap<String, Resident>,
    page_names: Vec<String>,
    code: Vec<u8>,
    next_page: u32,
}

impl Linker {
    pub fn new() -> Self {
        Self {
            resident: HashMap::new(),
            page_names: Vec::new(),
            code: Vec::new(),
            next_page: REPL_PAGE + 1,
        }
    }

    pub fn page_of(&self, module_name: &str) -> Option<u32> {
        self.resident.get(module_name).map(|r| r.page)
    }

    /// Links `modules` (a batch, e.g. the files named on a CLI
    /// invocation, or a single REPL input) against whatever this linker
    /// already has resident. Already-resident modules (other than
    /// `#this#`, which always relinks) are left untouched — they keep
    /// their original page and contribute no new code.
    ///
    /// Per spec §4.5 Layout, modules newly linked by this call are
    /// concatenated in dependency order with a `pop` between each pair so
    /// only the last one's top-level result survives on the stack, and a
    /// trailing `exit` closes the batch; `entry` (must be one of
    /// `modules`' names, or `#this#` for a REPL input) is the last module
    /// in that order by construction of the import-dependency topo sort,
    /// so its result is exactly what a run starting at `entry_offset`
    /// leaves on top of the stack.
    pub fn link(&mut self, modules: Vec<Module>, entry: &str) -> Result<LinkedProgram, FatalError> {
        let pool: HashMap<String, Module> =
            modules.into_iter().map(|m| (m.name.clone(), m)).collect();

        let order = self.topo_order(&pool)?;
        let to_link: Vec<&String> = order
            .iter()
            .filter(|name| {
                let is_repl_reentry = pool[*name].name == REPL_MODULE_NAME;
                is_repl_reentry || !self.resident.contains_key(*name)
            })
            .collect();

        let entry_offset = self.code.len() as u32;
        for (i, name) in to_link.iter().enumerate() {
            self.link_one(&pool[*name])?;
            if i + 1 < to_link.len() {
                self.code.push(OpCode::Pop as u8);
            }
        }
        if !to_link.is_empty() {
            self.code.push(OpCode::Exit as u8);
        }

        if !self.resident.contains_key(entry) {
            return Err(fatal(format!("link entry '{entry}' was not compiled")));
        }

        Ok(LinkedProgram {
            code: self.code.clone(),
            page_names: self.page_names.clone(),
            entry_offset,
        })
    }

    /// Assigns `module` a page (reusing page 0 for repeated `#this#`
    /// relinks), appends its code, and fixes up its relocations in
    /// place.
    fn link_one(&mut self, module: &Module) -> Result<(), FatalError> {
        let page = if module.name == REPL_MODULE_NAME {
            REPL_PAGE
        } else if let Some(r) = self.resident.get(&module.name) {
            r.page
        } else {
            let p = self.next_page;
            self.next_page += 1;
            p
        };

        let base = self.code.len() as u32;
        let mut code = module.code.clone();

        for reloc in &module.relocations {
            match reloc.kind {
                RelocationKind::Gp => patch_u16(&mut code, reloc.offset, page as u16),
                RelocationKind::Gv => {
                    let target_page = self
                        .resident
                        .get(&reloc.target)
                        .map(|r| r.page)
                        .ok_or_else(|| {
                            fatal(format!(
                                "module '{}' imports unresolved '{}'",
                                module.name, reloc.target
                            ))
                        })?;
                    patch_u16(&mut code, reloc.offset, target_page as u16);
                }
                RelocationKind::CodeBase => patch_i32_add(&mut code, reloc.offset, base as i32),
                RelocationKind::Atom => {}
            }
        }

        self.code.extend_from_slice(&code);
        if page as usize == self.page_names.len() {
            self.page_names.push(module.name.clone());
        } else if (page as usize) < self.page_names.len() {
            self.page_names[page as usize] = module.name.clone();
        } else {
            // A page was somehow assigned out of order; pad so indices
            // stay dense (should not happen given monotonic next_page).
            self.page_names
                .resize(page as usize + 1, String::new());
            self.page_names[page as usize] = module.name.clone();
        }
        self.resident
            .insert(module.name.clone(), Resident { page, base });
        Ok(())
    }

    /// Tri-color DFS over `modules`' `.imports` edges, erroring on a
    /// cycle. Already-resident dependencies are leaves (no edges
    /// followed past them, since their code is already linked).
    fn topo_order(&self, pool: &HashMap<String, Module>) -> Result<Vec<String>, FatalError> {
        #[derive(PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color: HashMap<String, Color> = HashMap::new();
        let mut order = Vec::new();

        fn visit(
            name: &str,
            pool: &HashMap<String, Module>,
            resident: &HashMap<String, Resident>,
            color: &mut HashMap<String, Color>,
            order: &mut Vec<String>,
        ) -> Result<(), FatalError> {
            match color.get(name) {
                Some(Color::Black) => return Ok(()),
                Some(Color::Gray) => {
                    return Err(fatal(format!(
                        "import cycle detected involving module '{name}'"
                    )))
                }
                _ => {}
            }
            let Some(module) = pool.get(name) else {
                // Not part of this batch: either already resident
                // (fine, leaf) or genuinely unresolved (caught later
                // during relocation fixup with the precise offending
                // module attached).
                let _ = resident;
                return Ok(());
            };
            color.insert(name.to_string(), Color::Gray);
            for dep in &module.imports {
                visit(dep, pool, resident, color, order)?;
            }
            color.insert(name.to_string(), Color::Black);
            order.push(name.to_string());
            Ok(())
        }

        let mut names: Vec<&String> = pool.keys().collect();
        names.sort();
        for name in names {
            visit(name, pool, &self.resident, &mut color, &mut order)?;
        }
        Ok(order)
    }
}

fn patch_u16(code: &mut [u8], offset: u32, value: u16) {
    let o = offset as usize;
    code[o..o + 2].copy_from_slice(&value.to_le_bytes());
}

fn patch_i32_add(code: &mut [u8], offset: u32, delta: i32) {
    let o = offset as usize;
    let current = i32::from_le_bytes(code[o..o + 4].try_into().unwrap());
    code[o..o + 4].copy_from_slice(&(current + delta).to_le_bytes());
}

fn fatal(message: String) -> FatalError {
    FatalError(Diagnostic::fatal(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompilerContext};
    use crate::syntax::parse;

    fn compile_module(src: &str, name: &str) -> Module {
        let program = parse(src).expect("parses");
        let mut ctx = CompilerContext::new();
        let out = compile(&program, name, &mut ctx, true);
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        out.module.expect("compiles")
    }

    #[test]
    fn single_module_links_to_page_zero_on_repl_reentry() {
        let mut linker = Linker::new();
        let m1 = compile_module("1;", REPL_MODULE_NAME);
        let linked = linker.link(vec![m1], REPL_MODULE_NAME).unwrap();
        assert_eq!(linker.page_of(REPL_MODULE_NAME), Some(REPL_PAGE));
        assert_eq!(linked.entry_offset, 0);

        let m2 = compile_module("2;", REPL_MODULE_NAME);
        let linked2 = linker.link(vec![m2], REPL_MODULE_NAME).unwrap();
        assert!(linked2.entry_offset > 0);
        assert_eq!(linker.page_of(REPL_MODULE_NAME), Some(REPL_PAGE));
    }

    #[test]
    fn import_cycle_is_rejected() {
        let mut a = compile_module("1;", "A");
        a.imports.push("B".to_string());
        let mut b = compile_module("2;", "B");
        b.imports.push("A".to_string());

        let mut linker = Linker::new();
        let result = linker.link(vec![a, b], "A");
        assert!(result.is_err());
    }

    #[test]
    fn two_independent_modules_get_distinct_pages() {
        let a = compile_module("1;", "A");
        let b = compile_module("2;", "B");
        let mut linker = Linker::new();
        linker.link(vec![a, b], "A").unwrap();
        assert_ne!(linker.page_of("A"), linker.page_of("B"));
    }
}
