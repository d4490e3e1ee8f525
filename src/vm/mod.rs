//! Bytecode execution: the interpreter and the tiering fast path.

mod interpreter;
mod machine;
mod tiering;

pub use interpreter::{Interpreter, NoTemplates, TemplateResolver};
pub use tiering::{Execution, FastPath, Tier, TieringCompiler};
