pub mod analysis;
pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod diagnostics;
pub mod linker;
pub mod numeric;
pub mod runtime;
pub mod syntax;
