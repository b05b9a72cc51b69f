use std::fmt::Write;

use serde::Serialize;

use super::{Chunk, ChunkKind, Op, VarInit};
use crate::script::ScriptDefinition;

/// One decoded instruction. `constant` is the rendered pool value for opcodes
/// that carry an index operand.
#[derive(Debug, Clone, Serialize)]
pub struct Instruction {
    pub offset: usize,
    pub op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operand: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VariableListing {
    pub name: String,
    pub ty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
}

/// Decoded view of one chunk, ready for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkListing {
    pub name: String,
    pub kind: &'static str,
    pub initial: bool,
    pub variables: Vec<VariableListing>,
    pub constants: Vec<String>,
    pub instructions: Vec<Instruction>,
}

pub fn listing(def: &ScriptDefinition) -> Vec<ChunkListing> {
    def.chunks
        .iter()
        .map(|chunk| chunk_listing(chunk, &def.chunks))
        .collect()
}

fn chunk_listing(chunk: &Chunk, arena: &[Chunk]) -> ChunkListing {
    let kind = match chunk.kind {
        ChunkKind::Global => "global",
        ChunkKind::State => "state",
        ChunkKind::Event => "event",
    };
    let variables = chunk
        .variables
        .iter()
        .map(|(name, decl)| VariableListing {
            name: name.clone(),
            ty: decl.ty.name().to_string(),
            init: render_init(&decl.init),
        })
        .collect();
    ChunkListing {
        name: chunk.qualified_name(arena),
        kind,
        initial: chunk.is_initial_state,
        variables,
        constants: chunk.constants.iter().map(|v| v.to_string()).collect(),
        instructions: decode(chunk),
    }
}

fn render_init(init: &VarInit) -> Option<String> {
    match init {
        VarInit::Value(value) => Some(value.to_string()),
        VarInit::Object(name) => Some(format!("\"{name}\"")),
        VarInit::Construct { type_name, .. } => Some(format!("{type_name}(..)")),
        VarInit::Default => None,
    }
}

/// Walks the byte stream, pairing index-operand opcodes with their pool slot.
/// Never panics on malformed code: unknown bytes and truncated operands are
/// listed as-is.
fn decode(chunk: &Chunk) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut ip = 0usize;
    while ip < chunk.code.len() {
        let offset = ip;
        let byte = chunk.code[ip];
        ip += 1;
        let Some(op) = Op::from_byte(byte) else {
            out.push(Instruction {
                offset,
                op: "??",
                operand: Some(byte),
                constant: None,
                line: chunk.line_for(offset as u32),
            });
            continue;
        };
        let operand = if op.has_operand() {
            let index = chunk.code.get(ip).copied();
            ip += 1;
            index
        } else {
            None
        };
        let constant = operand
            .and_then(|index| chunk.constants.get(index as usize))
            .map(|v| v.to_string());
        out.push(Instruction {
            offset,
            op: op.name(),
            operand,
            constant,
            line: chunk.line_for(offset as u32),
        });
    }
    out
}

/// Human-readable listing of every chunk in the definition.
pub fn disassemble(def: &ScriptDefinition) -> String {
    let mut out = String::new();
    for chunk in &def.chunks {
        let listing = chunk_listing(chunk, &def.chunks);
        let _ = write!(out, "== {} ({})", listing.name, listing.kind);
        if listing.initial {
            out.push_str(" [initial]");
        }
        out.push('\n');
        for var in &listing.variables {
            match &var.init {
                Some(init) => {
                    let _ = writeln!(out, "   var {} {} = {}", var.ty, var.name, init);
                }
                None => {
                    let _ = writeln!(out, "   var {} {}", var.ty, var.name);
                }
            }
        }
        let mut last_line = None;
        for ins in &listing.instructions {
            let _ = write!(out, "{:04} {:<14}", ins.offset, ins.op);
            if let Some(index) = ins.operand {
                let _ = write!(out, " [{index}]");
            }
            if let Some(constant) = &ins.constant {
                let _ = write!(out, " {constant}");
            }
            if ins.line.is_some() && ins.line != last_line {
                let _ = write!(out, "   ; line {}", ins.line.unwrap());
                last_line = ins.line;
            }
            out.push('\n');
        }
        out.push('\n');
    }
    out
}
