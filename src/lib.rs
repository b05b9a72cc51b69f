pub mod bytecode;
pub mod compiler;
pub mod component;
pub mod diagnostic;
pub mod host;
pub mod lexer;
pub mod script;
pub mod value;
pub mod vm;

pub use bytecode::{Chunk, ChunkId, ChunkKind, DeclType, Op};
pub use compiler::{CompileError, compile, compile_source};
pub use component::{Component, OWNER_NAME, Phase, Scope};
pub use diagnostic::{Diagnostic, Severity};
pub use host::{EventArgs, HostRegistry, World};
pub use lexer::{LexError, Token, lex};
pub use script::{ScriptDefinition, ScriptLibrary};
pub use value::{EntityId, Kind, UserObject, UserRef, Value};
pub use vm::{MAX_CALL_DEPTH, RuntimeError, Vm, VmResult};
