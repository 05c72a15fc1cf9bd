//! Module object (spec.md §3, §6): the compiler's output unit, consumed
//! by the linker.

pub use crate::bytecode::codegen::RelocationKind;

#[derive(Debug, Clone)]
pub struct Relocation {
    pub kind: RelocationKind,
    pub offset: u32,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub imports: Vec<String>,
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub atoms: Vec<String>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            imports: Vec::new(),
            code: Vec::new(),
            relocations: Vec::new(),
            atoms: Vec::new(),
        }
    }
}
