pub mod codegen;
pub mod module;
pub mod op_code;

pub use codegen::CodeGenerator;
pub use module::{Module, Relocation, RelocationKind};
pub use op_code::OpCode;
