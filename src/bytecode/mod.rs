use crate::value::{Kind, Value};

pub mod disasm;

/// Index of a chunk inside its definition's arena.
pub type ChunkId = usize;

/// Constant-pool indices are encoded as one byte in the code stream. The top
/// two codes never name a pool slot, which caps the pool at 254 entries.
pub const MAX_CONSTANTS: usize = 254;
pub const INDEX_PLACEHOLDER: u8 = 0xFE;
pub const INDEX_SENTINEL: u8 = 0xFF;

// ── Opcodes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Constant = 0,
    ConstantUser = 1,
    ConstantVec2 = 2,
    ConstantVec3 = 3,
    Define = 4,
    Get = 5,
    Assign = 6,
    MemberGet = 7,
    MemberAssign = 8,
    MemberCall = 9,
    If = 10,
    Jump = 11,
    Return = 12,
    ChangeState = 13,
    And = 14,
    Or = 15,
    Negate = 16,
    Not = 17,
    Add = 18,
    Sub = 19,
    Mul = 20,
    Div = 21,
    Eq = 22,
    Ne = 23,
    Gt = 24,
    Ge = 25,
    Lt = 26,
    Le = 27,
    Call = 28,
}

impl Op {
    pub fn from_byte(byte: u8) -> Option<Op> {
        Some(match byte {
            0 => Op::Constant,
            1 => Op::ConstantUser,
            2 => Op::ConstantVec2,
            3 => Op::ConstantVec3,
            4 => Op::Define,
            5 => Op::Get,
            6 => Op::Assign,
            7 => Op::MemberGet,
            8 => Op::MemberAssign,
            9 => Op::MemberCall,
            10 => Op::If,
            11 => Op::Jump,
            12 => Op::Return,
            13 => Op::ChangeState,
            14 => Op::And,
            15 => Op::Or,
            16 => Op::Negate,
            17 => Op::Not,
            18 => Op::Add,
            19 => Op::Sub,
            20 => Op::Mul,
            21 => Op::Div,
            22 => Op::Eq,
            23 => Op::Ne,
            24 => Op::Gt,
            25 => Op::Ge,
            26 => Op::Lt,
            27 => Op::Le,
            28 => Op::Call,
            _ => return None,
        })
    }

    /// True for ops followed by a one-byte constant-pool index in the stream.
    /// Everything else takes its inputs from the operand stack.
    pub fn has_operand(self) -> bool {
        matches!(
            self,
            Op::Constant | Op::ConstantUser | Op::Define | Op::Get | Op::Assign
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Constant => "CONSTANT",
            Op::ConstantUser => "CONSTANT_USER",
            Op::ConstantVec2 => "CONSTANT_VEC2",
            Op::ConstantVec3 => "CONSTANT_VEC3",
            Op::Define => "DEFINE",
            Op::Get => "GET",
            Op::Assign => "ASSIGN",
            Op::MemberGet => "MEMBER_GET",
            Op::MemberAssign => "MEMBER_ASSIGN",
            Op::MemberCall => "MEMBER_CALL",
            Op::If => "IF",
            Op::Jump => "JUMP",
            Op::Return => "RETURN",
            Op::ChangeState => "CHANGE_STATE",
            Op::And => "AND",
            Op::Or => "OR",
            Op::Negate => "NEGATE",
            Op::Not => "NOT",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Eq => "EQ",
            Op::Ne => "NE",
            Op::Gt => "GT",
            Op::Ge => "GE",
            Op::Lt => "LT",
            Op::Le => "LE",
            Op::Call => "CALL",
        }
    }
}

// ── Variable declarations ────────────────────────────────────────────

/// Declared type of a script variable.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclType {
    Number,
    Str,
    Bool,
    Vec2,
    Vec3,
    Entity,
    User(String),
}

impl DeclType {
    pub fn kind(&self) -> Kind {
        match self {
            DeclType::Number => Kind::Number,
            DeclType::Str => Kind::Str,
            DeclType::Bool => Kind::Bool,
            DeclType::Vec2 => Kind::Vec2,
            DeclType::Vec3 => Kind::Vec3,
            DeclType::Entity => Kind::Handle,
            DeclType::User(_) => Kind::User,
        }
    }

    /// The name scripts use for this type.
    pub fn name(&self) -> &str {
        match self {
            DeclType::Number => "Number",
            DeclType::Str => "String",
            DeclType::Bool => "Bool",
            DeclType::Vec2 => "Vec2",
            DeclType::Vec3 => "Vec3",
            DeclType::Entity => "Entity",
            DeclType::User(name) => name,
        }
    }

    /// Maps a source-level type name; `Entity` arrives as its own keyword and
    /// user types are resolved against the host registry by the compiler.
    pub fn from_name(name: &str) -> Option<DeclType> {
        Some(match name {
            "Number" => DeclType::Number,
            "String" => DeclType::Str,
            "Bool" => DeclType::Bool,
            "Vec2" => DeclType::Vec2,
            "Vec3" => DeclType::Vec3,
            _ => return None,
        })
    }
}

/// How a declared variable gets its first value when a scope is seeded.
#[derive(Debug, Clone, PartialEq)]
pub enum VarInit {
    /// Literal initializer, stored ready to copy.
    Value(Value),
    /// Entity reference by object name, resolved once the scene exists.
    Object(String),
    /// User-type construction through the host factory at seed time.
    Construct {
        type_name: String,
        args: Vec<(String, Value)>,
    },
    /// Tag-specific zero value.
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub ty: DeclType,
    pub init: VarInit,
}

// ── Chunk ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Global,
    State,
    Event,
}

/// One compiled lexical unit: the whole-script global scope, a state, or an
/// event/function body. Chunks live in an arena owned by the script
/// definition; `parent` and `handlers` refer to other arena slots.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub name: String,
    pub kind: ChunkKind,
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    /// Declaration order is preserved so scope seeding is deterministic.
    pub variables: Vec<(String, VarDecl)>,
    pub is_initial_state: bool,
    pub parent: Option<ChunkId>,
    /// Child chunks lexically owned by this one, by bare name: states and
    /// functions under the global chunk, handlers under a state.
    pub handlers: Vec<(String, ChunkId)>,
    /// Sparse (code offset, source line) pairs, one per line change.
    pub lines: Vec<(u32, u32)>,
    /// Slots handed out raw for backpatching. Interning skips them: a literal
    /// that aliased an unpatched placeholder would be rewritten by the patch.
    pinned: Vec<u8>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChunkError {
    #[error("constant pool overflow in '{chunk}' (limit {MAX_CONSTANTS})")]
    PoolOverflow { chunk: String },
}

impl Chunk {
    pub fn new(name: impl Into<String>, kind: ChunkKind, parent: Option<ChunkId>) -> Self {
        Chunk {
            name: name.into(),
            kind,
            code: Vec::new(),
            constants: Vec::new(),
            variables: Vec::new(),
            is_initial_state: false,
            parent,
            handlers: Vec::new(),
            lines: Vec::new(),
            pinned: Vec::new(),
        }
    }

    /// Interns a constant, reusing an existing scalar slot when possible.
    /// Pinned (backpatch) slots are never reuse candidates.
    pub fn add_constant(&mut self, value: Value) -> Result<u8, ChunkError> {
        for (i, existing) in self.constants.iter().enumerate() {
            if self.pinned.contains(&(i as u8)) {
                continue;
            }
            let same = match (existing, &value) {
                (Value::Number(a), Value::Number(b)) => (a - b).abs() < f64::EPSILON,
                (Value::Str(a), Value::Str(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                _ => false,
            };
            if same {
                return Ok(i as u8);
            }
        }
        self.push_constant(value)
    }

    /// Appends without interning and pins the slot so later interning can't
    /// alias it. Backpatch placeholders must use this: a shared slot would be
    /// rewritten under every other use site.
    pub fn add_constant_raw(&mut self, value: Value) -> Result<u8, ChunkError> {
        let idx = self.push_constant(value)?;
        self.pinned.push(idx);
        Ok(idx)
    }

    fn push_constant(&mut self, value: Value) -> Result<u8, ChunkError> {
        if self.constants.len() >= MAX_CONSTANTS {
            return Err(ChunkError::PoolOverflow {
                chunk: self.name.clone(),
            });
        }
        let idx = self.constants.len() as u8;
        self.constants.push(value);
        Ok(idx)
    }

    pub fn patch_constant(&mut self, index: u8, value: Value) {
        self.constants[index as usize] = value;
    }

    pub fn emit(&mut self, op: Op, line: u32) {
        self.mark_line(line);
        self.code.push(op as u8);
    }

    pub fn emit_with(&mut self, op: Op, operand: u8, line: u32) {
        self.mark_line(line);
        self.code.push(op as u8);
        self.code.push(operand);
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    fn mark_line(&mut self, line: u32) {
        let offset = self.code.len() as u32;
        match self.lines.last() {
            Some((_, last)) if *last == line => {}
            _ => self.lines.push((offset, line)),
        }
    }

    /// Source line owning the instruction at `offset`, if any was recorded.
    pub fn line_for(&self, offset: u32) -> Option<u32> {
        match self.lines.binary_search_by_key(&offset, |(o, _)| *o) {
            Ok(i) => Some(self.lines[i].1),
            Err(0) => None,
            Err(i) => Some(self.lines[i - 1].1),
        }
    }

    /// Dotted name including every ancestor, e.g. `guard.Idle.OnEnter`.
    /// Diagnostics and disassembly only; scope resolution never uses it.
    pub fn qualified_name(&self, arena: &[Chunk]) -> String {
        let mut parts = vec![self.name.as_str()];
        let mut parent = self.parent;
        while let Some(id) = parent {
            parts.push(arena[id].name.as_str());
            parent = arena[id].parent;
        }
        parts.reverse();
        parts.join(".")
    }
}
