//! Noodle: an embeddable scripting language. Source text goes through the
//! lexer, the macro preprocessor and the compiler into a flat instruction
//! list, which cooperative [`Thread`]s execute against an immutable [`Engine`].

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod diagnostics;
pub mod engine;
pub mod environment;
pub mod heap;
pub mod lexer;
pub mod parser;
pub mod preprocessor;
pub mod registry;
pub mod repl;
pub mod runtime;
pub mod stdlib;
pub mod template;
pub mod value;

pub use bytecode::{GlobalInfo, Instruction, Program};
pub use diagnostics::{CodeLocation, Diagnostic, DiagnosticKind, NoodleError, Result};
pub use engine::{Engine, EngineBuilder, EngineConfig};
pub use registry::{CallTarget, NativeContext, NativeFunction, PropertyTarget};
pub use repl::Repl;
pub use runtime::{Thread, ThreadState};
pub use template::{ObjectTemplate, TemplateBuilder};
pub use value::{ObjectRef, Primitive, TemplateId};
