use crate::bytecode::{Chunk, ChunkId, Op};
use crate::component::{Scope, initial_value};
use crate::host::{EventArgs, HostRegistry};
use crate::script::ScriptDefinition;
use crate::value::{EntityId, Kind, Value, numbers_equal};

/// Nested script calls beyond this depth are cut off. Recursion through
/// ChangeState/function chains is otherwise unbounded.
pub const MAX_CALL_DEPTH: u32 = 64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: String },
    #[error("cannot assign {found} to '{name}' (declared {expected})")]
    AssignMismatch {
        name: String,
        expected: Kind,
        found: Kind,
    },
    #[error("argument '{name}' is {found}, expected {expected}")]
    ArgMismatch {
        name: String,
        expected: Kind,
        found: Kind,
    },
    #[error("unsupported operands for '{op}': {left} and {right}")]
    Binary {
        op: &'static str,
        left: Kind,
        right: Kind,
    },
    #[error("unsupported operand for '{op}': {kind}")]
    Unary { op: &'static str, kind: Kind },
    #[error("cannot use {kind} as a boolean")]
    NotBoolean { kind: Kind },
    #[error("division by zero")]
    DivisionByZero,
    #[error("{kind} has no members")]
    NoMembers { kind: Kind },
    #[error("no member '{member}' on {on}")]
    UnknownMember { on: String, member: String },
    #[error("cannot set '{member}' on {on}")]
    CannotSetMember { on: String, member: String },
    #[error("no method '{method}' on {type_name}")]
    UnknownMethod { type_name: String, method: String },
    #[error("cannot call a method on {kind}")]
    NotCallable { kind: Kind },
    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },
    #[error("unknown user type '{type_name}'")]
    UnknownUserType { type_name: String },
    #[error("unknown state '{name}'")]
    UnknownState { name: String },
    #[error("stale handle {id}")]
    DeadHandle { id: EntityId },
    #[error("'{name}' is already executing")]
    Reentrant { name: String },
    #[error("user object is already in use")]
    ObjectBusy,
    #[error("function calls nested too deeply")]
    CallDepthExceeded,
    #[error("operand stack underflow")]
    StackUnderflow,
    #[error("invalid opcode {byte:#04x}")]
    BadOpcode { byte: u8 },
    #[error("invalid constant index {index}")]
    BadConstant { index: u8 },
    #[error("bytecode ended mid-instruction")]
    Truncated,
    #[error("expected {expected}, found {found}")]
    Expected { expected: Kind, found: Kind },
    #[error("{message}")]
    Host { message: String },
}

pub type VmResult<T> = Result<T, RuntimeError>;

/// How a chunk run finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    /// Ran off the end of the bytecode.
    End,
    /// Hit an explicit return.
    Return,
    /// Requested a state transition; truncates every enclosing handler.
    ChangeState(String),
}

/// Single-use interpreter over one chunk. Borrows the component's scopes for
/// the duration of a run; the operand stack is private to the instance, so
/// nested calls each get their own.
pub struct Vm<'a> {
    script: &'a ScriptDefinition,
    globals: &'a mut Scope,
    state: Option<&'a mut Scope>,
    args: Option<&'a mut EventArgs>,
    active_state: Option<ChunkId>,
    owner: EntityId,
    host: &'a mut dyn HostRegistry,
    depth: u32,
    stack: Vec<Value>,
    locals: Scope,
}

impl<'a> Vm<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        script: &'a ScriptDefinition,
        globals: &'a mut Scope,
        state: Option<&'a mut Scope>,
        args: Option<&'a mut EventArgs>,
        active_state: Option<ChunkId>,
        owner: EntityId,
        host: &'a mut dyn HostRegistry,
    ) -> Self {
        Vm {
            script,
            globals,
            state,
            args,
            active_state,
            owner,
            host,
            depth: 0,
            stack: Vec::new(),
            locals: Scope::new(),
        }
    }

    /// Executes the chunk to RETURN, CHANGE_STATE or end of bytes, then writes
    /// locals whose names match argument keys back into the bag.
    pub fn run(&mut self, chunk: ChunkId) -> VmResult<Halt> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(RuntimeError::CallDepthExceeded);
        }
        self.seed_locals(chunk)?;
        let halt = self.execute(chunk)?;
        self.write_back();
        Ok(halt)
    }

    /// Parameters first, then the argument bag on top: declared names are
    /// tag-checked against their declaration, undeclared bag keys are copied
    /// in as readable locals.
    fn seed_locals(&mut self, chunk: ChunkId) -> VmResult<()> {
        let script = self.script;
        let decls = &script.chunk(chunk).variables;
        for (name, decl) in decls {
            let value = initial_value(decl, self.host)?;
            self.locals.insert(name.clone(), value);
        }
        let incoming: Vec<(String, Value)> = match self.args.as_deref() {
            Some(args) => args.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            None => Vec::new(),
        };
        for (key, value) in incoming {
            if let Some((_, decl)) = decls.iter().find(|(n, _)| *n == key) {
                let expected = decl.ty.kind();
                if value.kind() != expected {
                    return Err(RuntimeError::ArgMismatch {
                        name: key,
                        expected,
                        found: value.kind(),
                    });
                }
            }
            self.locals.insert(key, value);
        }
        Ok(())
    }

    fn execute(&mut self, chunk_id: ChunkId) -> VmResult<Halt> {
        let script = self.script;
        let chunk = script.chunk(chunk_id);
        let code = &chunk.code;
        let mut ip = 0usize;

        while ip < code.len() {
            let byte = code[ip];
            ip += 1;
            let op = Op::from_byte(byte).ok_or(RuntimeError::BadOpcode { byte })?;
            match op {
                Op::Constant => {
                    let value = Self::constant_at(chunk, code, &mut ip)?;
                    self.stack.push(value);
                }
                Op::ConstantUser => {
                    let type_name = Self::name_at(chunk, code, &mut ip)?;
                    let mut bag = self.pop_bag()?;
                    let value = self.host.create_user_type(&type_name, &mut bag)?;
                    self.stack.push(value);
                }
                Op::ConstantVec2 => {
                    let y = self.pop_number()?;
                    let x = self.pop_number()?;
                    self.stack.push(Value::Vec2(glam::DVec2::new(x, y)));
                }
                Op::ConstantVec3 => {
                    let z = self.pop_number()?;
                    let y = self.pop_number()?;
                    let x = self.pop_number()?;
                    self.stack.push(Value::Vec3(glam::DVec3::new(x, y, z)));
                }
                Op::Define => {
                    let name = Self::name_at(chunk, code, &mut ip)?;
                    let value = self.pop()?;
                    self.locals.insert(name, value);
                }
                Op::Get => {
                    let name = Self::name_at(chunk, code, &mut ip)?;
                    let value = self.load(&name)?;
                    self.stack.push(value);
                }
                Op::Assign => {
                    let name = Self::name_at(chunk, code, &mut ip)?;
                    let value = self.pop()?;
                    self.store(&name, value)?;
                }
                Op::MemberGet => {
                    let (base, members) = self.pop_chain()?;
                    let value = self.read_chain(&base, &members)?;
                    self.stack.push(value);
                }
                Op::MemberAssign => {
                    let (base, members) = self.pop_chain()?;
                    let value = self.pop()?;
                    self.write_chain(&base, &members, value)?;
                }
                Op::MemberCall => {
                    if let Some(halt) = self.member_call()? {
                        return Ok(halt);
                    }
                }
                Op::If => {
                    let skip = self.pop_count()?;
                    let cond = self.pop()?;
                    let truthy = cond.truthy().ok_or(RuntimeError::NotBoolean {
                        kind: cond.kind(),
                    })?;
                    if !truthy {
                        ip += skip;
                    }
                }
                Op::Jump => {
                    ip += self.pop_count()?;
                }
                Op::Return => return Ok(Halt::Return),
                Op::ChangeState => {
                    let name = self.pop_str()?;
                    return Ok(Halt::ChangeState(name));
                }
                Op::And | Op::Or => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let ta = a
                        .truthy()
                        .ok_or(RuntimeError::NotBoolean { kind: a.kind() })?;
                    let tb = b
                        .truthy()
                        .ok_or(RuntimeError::NotBoolean { kind: b.kind() })?;
                    let out = if matches!(op, Op::And) { ta && tb } else { ta || tb };
                    self.stack.push(Value::Bool(out));
                }
                Op::Negate => {
                    let v = self.pop()?;
                    let out = match v {
                        Value::Number(n) => Value::Number(-n),
                        Value::Vec2(v) => Value::Vec2(-v),
                        Value::Vec3(v) => Value::Vec3(-v),
                        other => {
                            return Err(RuntimeError::Unary {
                                op: "-",
                                kind: other.kind(),
                            });
                        }
                    };
                    self.stack.push(out);
                }
                Op::Not => {
                    let v = self.pop()?;
                    let truthy = v.truthy().ok_or(RuntimeError::Unary {
                        op: "!",
                        kind: v.kind(),
                    })?;
                    self.stack.push(Value::Bool(!truthy));
                }
                Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Eq
                | Op::Ne
                | Op::Gt
                | Op::Ge
                | Op::Lt
                | Op::Le => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let value = binary(op, a, b)?;
                    self.stack.push(value);
                }
                Op::Call => {
                    if let Some(halt) = self.call()? {
                        return Ok(halt);
                    }
                }
            }
        }
        Ok(Halt::End)
    }

    // ── Scope access ─────────────────────────────────────────────────

    /// Local → state → global, same order for reads and writes.
    fn load(&self, name: &str) -> VmResult<Value> {
        if let Some(v) = self.locals.get(name) {
            return Ok(v.clone());
        }
        if let Some(v) = self.state.as_deref().and_then(|s| s.get(name)) {
            return Ok(v.clone());
        }
        if let Some(v) = self.globals.get(name) {
            return Ok(v.clone());
        }
        Err(RuntimeError::UndefinedVariable {
            name: name.to_string(),
        })
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut Value> {
        if self.locals.contains_key(name) {
            return self.locals.get_mut(name);
        }
        if self.state.as_deref().is_some_and(|s| s.contains_key(name)) {
            if let Some(state) = self.state.as_deref_mut() {
                return state.get_mut(name);
            }
        }
        if self.globals.contains_key(name) {
            return self.globals.get_mut(name);
        }
        None
    }

    /// Assignment never changes a variable's tag.
    fn store(&mut self, name: &str, value: Value) -> VmResult<()> {
        let found = value.kind();
        let Some(slot) = self.slot_mut(name) else {
            return Err(RuntimeError::UndefinedVariable {
                name: name.to_string(),
            });
        };
        let expected = slot.kind();
        if expected != found {
            return Err(RuntimeError::AssignMismatch {
                name: name.to_string(),
                expected,
                found,
            });
        }
        *slot = value;
        Ok(())
    }

    // ── Member chains ────────────────────────────────────────────────

    fn pop_chain(&mut self) -> VmResult<(String, Vec<String>)> {
        let count = self.pop_count()?;
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            members.push(self.pop_str()?);
        }
        members.reverse();
        let base = self.pop_str()?;
        Ok((base, members))
    }

    fn read_chain(&mut self, base: &str, members: &[String]) -> VmResult<Value> {
        let mut value = self.load(base)?;
        for member in members {
            value = self.member_get(value, member)?;
        }
        Ok(value)
    }

    fn member_get(&mut self, value: Value, member: &str) -> VmResult<Value> {
        match value {
            Value::Vec2(v) => match member {
                "x" => Ok(Value::Number(v.x)),
                "y" => Ok(Value::Number(v.y)),
                _ => Err(RuntimeError::UnknownMember {
                    on: "Vec2".to_string(),
                    member: member.to_string(),
                }),
            },
            Value::Vec3(v) => match member {
                "x" => Ok(Value::Number(v.x)),
                "y" => Ok(Value::Number(v.y)),
                "z" => Ok(Value::Number(v.z)),
                _ => Err(RuntimeError::UnknownMember {
                    on: "Vec3".to_string(),
                    member: member.to_string(),
                }),
            },
            Value::Handle(id) => self.object_global(id, member),
            Value::User(obj) => {
                let guard = obj.try_borrow().map_err(|_| RuntimeError::ObjectBusy)?;
                guard
                    .get_member(member)
                    .ok_or_else(|| RuntimeError::UnknownMember {
                        on: guard.type_name().to_string(),
                        member: member.to_string(),
                    })
            }
            other => Err(RuntimeError::NoMembers { kind: other.kind() }),
        }
    }

    /// A handle hop reads a named global on the target object's component.
    /// The owner's own handle short-circuits to the scopes already borrowed.
    fn object_global(&mut self, id: EntityId, member: &str) -> VmResult<Value> {
        if id.is_none() {
            return Err(RuntimeError::DeadHandle { id });
        }
        if id == self.owner {
            return self
                .globals
                .get(member)
                .cloned()
                .ok_or_else(|| RuntimeError::UndefinedVariable {
                    name: member.to_string(),
                });
        }
        let rc = self
            .host
            .component(id)
            .cloned()
            .ok_or(RuntimeError::DeadHandle { id })?;
        let comp = rc
            .try_borrow()
            .map_err(|_| RuntimeError::Reentrant {
                name: id.to_string(),
            })?;
        comp.globals
            .get(member)
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedVariable {
                name: member.to_string(),
            })
    }

    /// Vectors are copied out of their scope slot, mutated, and written back;
    /// handles write through to the target component; user objects are shared,
    /// so their mutation is visible without a write-back.
    fn write_chain(&mut self, base: &str, members: &[String], value: Value) -> VmResult<()> {
        if members.is_empty() {
            return self.store(base, value);
        }
        let mut root = match self.slot_mut(base) {
            Some(slot) => slot.clone(),
            None => {
                return Err(RuntimeError::UndefinedVariable {
                    name: base.to_string(),
                });
            }
        };
        self.assign_member(&mut root, members, value)?;
        if let Some(slot) = self.slot_mut(base) {
            *slot = root;
        }
        Ok(())
    }

    fn assign_member(
        &mut self,
        target: &mut Value,
        members: &[String],
        value: Value,
    ) -> VmResult<()> {
        let Some((head, rest)) = members.split_first() else {
            return Ok(());
        };
        match target {
            Value::Vec2(v) => {
                let slot = match head.as_str() {
                    "x" => &mut v.x,
                    "y" => &mut v.y,
                    _ => {
                        return Err(RuntimeError::UnknownMember {
                            on: "Vec2".to_string(),
                            member: head.clone(),
                        });
                    }
                };
                if !rest.is_empty() {
                    return Err(RuntimeError::NoMembers { kind: Kind::Number });
                }
                let found = value.kind();
                let n = value.as_number().ok_or(RuntimeError::AssignMismatch {
                    name: head.clone(),
                    expected: Kind::Number,
                    found,
                })?;
                *slot = n;
                Ok(())
            }
            Value::Vec3(v) => {
                let slot = match head.as_str() {
                    "x" => &mut v.x,
                    "y" => &mut v.y,
                    "z" => &mut v.z,
                    _ => {
                        return Err(RuntimeError::UnknownMember {
                            on: "Vec3".to_string(),
                            member: head.clone(),
                        });
                    }
                };
                if !rest.is_empty() {
                    return Err(RuntimeError::NoMembers { kind: Kind::Number });
                }
                let found = value.kind();
                let n = value.as_number().ok_or(RuntimeError::AssignMismatch {
                    name: head.clone(),
                    expected: Kind::Number,
                    found,
                })?;
                *slot = n;
                Ok(())
            }
            Value::User(obj) => {
                if rest.is_empty() {
                    let mut guard =
                        obj.try_borrow_mut().map_err(|_| RuntimeError::ObjectBusy)?;
                    if guard.set_member(head, value) {
                        Ok(())
                    } else {
                        Err(RuntimeError::CannotSetMember {
                            on: guard.type_name().to_string(),
                            member: head.clone(),
                        })
                    }
                } else {
                    let mut next = {
                        let guard = obj.try_borrow().map_err(|_| RuntimeError::ObjectBusy)?;
                        guard
                            .get_member(head)
                            .ok_or_else(|| RuntimeError::UnknownMember {
                                on: guard.type_name().to_string(),
                                member: head.clone(),
                            })?
                    };
                    self.assign_member(&mut next, rest, value)?;
                    let mut guard =
                        obj.try_borrow_mut().map_err(|_| RuntimeError::ObjectBusy)?;
                    if guard.set_member(head, next) {
                        Ok(())
                    } else {
                        Err(RuntimeError::CannotSetMember {
                            on: guard.type_name().to_string(),
                            member: head.clone(),
                        })
                    }
                }
            }
            Value::Handle(id) => {
                let id = *id;
                if id.is_none() {
                    return Err(RuntimeError::DeadHandle { id });
                }
                if id == self.owner {
                    return self.assign_own_global(head, rest, value);
                }
                let rc = self
                    .host
                    .component(id)
                    .cloned()
                    .ok_or(RuntimeError::DeadHandle { id })?;
                if rest.is_empty() {
                    let mut comp = rc.try_borrow_mut().map_err(|_| RuntimeError::Reentrant {
                        name: id.to_string(),
                    })?;
                    let found = value.kind();
                    let Some(slot) = comp.globals.get_mut(head) else {
                        return Err(RuntimeError::UndefinedVariable { name: head.clone() });
                    };
                    let expected = slot.kind();
                    if expected != found {
                        return Err(RuntimeError::AssignMismatch {
                            name: head.clone(),
                            expected,
                            found,
                        });
                    }
                    *slot = value;
                    Ok(())
                } else {
                    let mut next = {
                        let comp = rc.try_borrow().map_err(|_| RuntimeError::Reentrant {
                            name: id.to_string(),
                        })?;
                        comp.globals
                            .get(head)
                            .cloned()
                            .ok_or_else(|| RuntimeError::UndefinedVariable {
                                name: head.clone(),
                            })?
                    };
                    self.assign_member(&mut next, rest, value)?;
                    let mut comp = rc.try_borrow_mut().map_err(|_| RuntimeError::Reentrant {
                        name: id.to_string(),
                    })?;
                    if let Some(slot) = comp.globals.get_mut(head) {
                        *slot = next;
                    }
                    Ok(())
                }
            }
            other => Err(RuntimeError::NoMembers { kind: other.kind() }),
        }
    }

    fn assign_own_global(
        &mut self,
        head: &str,
        rest: &[String],
        value: Value,
    ) -> VmResult<()> {
        if rest.is_empty() {
            let found = value.kind();
            let Some(slot) = self.globals.get_mut(head) else {
                return Err(RuntimeError::UndefinedVariable {
                    name: head.to_string(),
                });
            };
            let expected = slot.kind();
            if expected != found {
                return Err(RuntimeError::AssignMismatch {
                    name: head.to_string(),
                    expected,
                    found,
                });
            }
            *slot = value;
            Ok(())
        } else {
            let mut next = self.globals.get(head).cloned().ok_or_else(|| {
                RuntimeError::UndefinedVariable {
                    name: head.to_string(),
                }
            })?;
            self.assign_member(&mut next, rest, value)?;
            if let Some(slot) = self.globals.get_mut(head) {
                *slot = next;
            }
            Ok(())
        }
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// Host operation or own-script event. Returns a halt only when a nested
    /// ChangeState has to truncate this chunk too; backfill is skipped in that
    /// case because the call never returned normally.
    fn call(&mut self) -> VmResult<Option<Halt>> {
        let callee = self.pop_str()?;
        let backfill = self.pop_backfill()?;
        let mut bag = self.pop_bag()?;

        if self.host.is_operation_registered(&callee) {
            self.host.invoke_operation(&callee, &mut bag)?;
        } else if let Some(chunk) = self.script.resolve_event(self.active_state, &callee) {
            if let Halt::ChangeState(name) = self.run_nested(chunk, &mut bag)? {
                return Ok(Some(Halt::ChangeState(name)));
            }
        } else {
            return Err(RuntimeError::UnknownFunction { name: callee });
        }

        self.apply_backfill(&backfill, &bag)?;
        Ok(None)
    }

    /// Method on a user object, or an event fired at another component. A
    /// chain ending on the owner's own handle dispatches locally, so a
    /// ChangeState from it propagates like a plain call.
    fn member_call(&mut self) -> VmResult<Option<Halt>> {
        let (base, mut members) = self.pop_chain()?;
        let backfill = self.pop_backfill()?;
        let mut bag = self.pop_bag()?;
        let Some(method) = members.pop() else {
            return Err(RuntimeError::UnknownFunction { name: base });
        };
        let target = self.read_chain(&base, &members)?;

        match target {
            Value::User(obj) => {
                let mut guard = obj.try_borrow_mut().map_err(|_| RuntimeError::ObjectBusy)?;
                if !guard.call_method(&method, &mut bag) {
                    return Err(RuntimeError::UnknownMethod {
                        type_name: guard.type_name().to_string(),
                        method,
                    });
                }
            }
            Value::Handle(id) => {
                if id.is_none() {
                    return Err(RuntimeError::DeadHandle { id });
                }
                if id == self.owner {
                    let Some(chunk) = self.script.resolve_event(self.active_state, &method)
                    else {
                        return Err(RuntimeError::UnknownFunction { name: method });
                    };
                    if let Halt::ChangeState(name) = self.run_nested(chunk, &mut bag)? {
                        return Ok(Some(Halt::ChangeState(name)));
                    }
                } else {
                    let rc = self
                        .host
                        .component(id)
                        .cloned()
                        .ok_or(RuntimeError::DeadHandle { id })?;
                    let mut comp = rc.try_borrow_mut().map_err(|_| RuntimeError::Reentrant {
                        name: id.to_string(),
                    })?;
                    // Invalid components are skipped, same as host dispatch.
                    if comp.is_valid() && !comp.fire_event(&mut *self.host, &method, &mut bag) {
                        return Err(RuntimeError::UnknownFunction { name: method });
                    }
                }
            }
            other => return Err(RuntimeError::NotCallable { kind: other.kind() }),
        }

        self.apply_backfill(&backfill, &bag)?;
        Ok(None)
    }

    fn run_nested(&mut self, chunk: ChunkId, args: &mut EventArgs) -> VmResult<Halt> {
        let mut vm = Vm {
            script: self.script,
            globals: &mut *self.globals,
            state: self.state.as_deref_mut(),
            args: Some(args),
            active_state: self.active_state,
            owner: self.owner,
            host: &mut *self.host,
            depth: self.depth + 1,
            stack: Vec::new(),
            locals: Scope::new(),
        };
        vm.run(chunk)
    }

    fn pop_bag(&mut self) -> VmResult<EventArgs> {
        let argc = self.pop_count()?;
        let mut pairs = Vec::with_capacity(argc);
        for _ in 0..argc {
            let name = self.pop_str()?;
            let value = self.pop()?;
            pairs.push((name, value));
        }
        pairs.reverse();
        Ok(EventArgs::from_pairs(pairs))
    }

    fn pop_backfill(&mut self) -> VmResult<Vec<(String, String)>> {
        let count = self.pop_count()?;
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let param = self.pop_str()?;
            let var = self.pop_str()?;
            pairs.push((var, param));
        }
        pairs.reverse();
        Ok(pairs)
    }

    /// Bare-identifier arguments pick up whatever the callee left under the
    /// matching parameter name.
    fn apply_backfill(
        &mut self,
        backfill: &[(String, String)],
        bag: &EventArgs,
    ) -> VmResult<()> {
        for (var, param) in backfill {
            if let Some(value) = bag.get(param) {
                self.store(var, value.clone())?;
            }
        }
        Ok(())
    }

    /// Locals back into the bag. The match is deliberately exhaustive: every
    /// tag that crosses this boundary is listed.
    fn write_back(&mut self) {
        let keys: Vec<String> = match self.args.as_deref() {
            Some(args) => args.iter().map(|(k, _)| k.to_string()).collect(),
            None => return,
        };
        for key in keys {
            let Some(local) = self.locals.get(&key) else {
                continue;
            };
            let value = match local {
                Value::Bool(_)
                | Value::Number(_)
                | Value::Str(_)
                | Value::Vec2(_)
                | Value::Vec3(_)
                | Value::Handle(_)
                | Value::User(_) => local.clone(),
                Value::Error => continue,
            };
            if let Some(args) = self.args.as_deref_mut() {
                args.set(key, value);
            }
        }
    }

    // ── Stack and operand helpers ────────────────────────────────────

    fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    fn pop_str(&mut self) -> VmResult<String> {
        match self.pop()? {
            Value::Str(s) => Ok(s),
            v => Err(RuntimeError::Expected {
                expected: Kind::Str,
                found: v.kind(),
            }),
        }
    }

    fn pop_number(&mut self) -> VmResult<f64> {
        let v = self.pop()?;
        v.as_number().ok_or(RuntimeError::Expected {
            expected: Kind::Number,
            found: v.kind(),
        })
    }

    fn pop_count(&mut self) -> VmResult<usize> {
        Ok(self.pop_number()? as usize)
    }

    fn operand(code: &[u8], ip: &mut usize) -> VmResult<u8> {
        let byte = *code.get(*ip).ok_or(RuntimeError::Truncated)?;
        *ip += 1;
        Ok(byte)
    }

    fn constant_at(chunk: &Chunk, code: &[u8], ip: &mut usize) -> VmResult<Value> {
        let index = Self::operand(code, ip)?;
        chunk
            .constants
            .get(index as usize)
            .cloned()
            .ok_or(RuntimeError::BadConstant { index })
    }

    fn name_at(chunk: &Chunk, code: &[u8], ip: &mut usize) -> VmResult<String> {
        match Self::constant_at(chunk, code, ip)? {
            Value::Str(s) => Ok(s),
            v => Err(RuntimeError::Expected {
                expected: Kind::Str,
                found: v.kind(),
            }),
        }
    }
}

// ── Binary operators ─────────────────────────────────────────────────

fn binary(op: Op, a: Value, b: Value) -> VmResult<Value> {
    use Value::{Number, Str, Vec2, Vec3};
    let (left, right) = (a.kind(), b.kind());
    match op {
        Op::Add => match (a, b) {
            (Number(x), Number(y)) => Ok(Number(x + y)),
            (Vec2(x), Vec2(y)) => Ok(Vec2(x + y)),
            (Vec3(x), Vec3(y)) => Ok(Vec3(x + y)),
            // Either side being a string concatenates both rendered forms.
            (x @ Str(_), y) | (x, y @ Str(_)) => Ok(Str(format!("{x}{y}"))),
            _ => Err(RuntimeError::Binary {
                op: "+",
                left,
                right,
            }),
        },
        Op::Sub => match (a, b) {
            (Number(x), Number(y)) => Ok(Number(x - y)),
            (Vec2(x), Vec2(y)) => Ok(Vec2(x - y)),
            (Vec3(x), Vec3(y)) => Ok(Vec3(x - y)),
            _ => Err(RuntimeError::Binary {
                op: "-",
                left,
                right,
            }),
        },
        Op::Mul => match (a, b) {
            (Number(x), Number(y)) => Ok(Number(x * y)),
            (Vec2(v), Number(s)) | (Number(s), Vec2(v)) => Ok(Vec2(v * s)),
            (Vec3(v), Number(s)) | (Number(s), Vec3(v)) => Ok(Vec3(v * s)),
            _ => Err(RuntimeError::Binary {
                op: "*",
                left,
                right,
            }),
        },
        Op::Div => match (a, b) {
            (Number(x), Number(y)) => {
                if y == 0.0 {
                    Err(RuntimeError::DivisionByZero)
                } else {
                    Ok(Number(x / y))
                }
            }
            (Vec2(v), Number(s)) => {
                if s == 0.0 {
                    Err(RuntimeError::DivisionByZero)
                } else {
                    Ok(Vec2(v / s))
                }
            }
            (Vec3(v), Number(s)) => {
                if s == 0.0 {
                    Err(RuntimeError::DivisionByZero)
                } else {
                    Ok(Vec3(v / s))
                }
            }
            _ => Err(RuntimeError::Binary {
                op: "/",
                left,
                right,
            }),
        },
        Op::Eq => Ok(Value::Bool(equality(&a, &b)?)),
        Op::Ne => Ok(Value::Bool(!equality(&a, &b)?)),
        Op::Gt => compare(">", a, b, |o| o == std::cmp::Ordering::Greater),
        Op::Ge => compare(">=", a, b, |o| o != std::cmp::Ordering::Less),
        Op::Lt => compare("<", a, b, |o| o == std::cmp::Ordering::Less),
        Op::Le => compare("<=", a, b, |o| o != std::cmp::Ordering::Greater),
        _ => unreachable!("dispatched on a binary opcode"),
    }
}

/// Per-tag equality; the only cross-tag form is against a Bool, which
/// compares through truthiness.
fn equality(a: &Value, b: &Value) -> VmResult<bool> {
    use Value::*;
    match (a, b) {
        (Bool(x), Bool(y)) => Ok(x == y),
        (Bool(x), other) | (other, Bool(x)) => {
            let truthy = other.truthy().ok_or(RuntimeError::Binary {
                op: "==",
                left: a.kind(),
                right: b.kind(),
            })?;
            Ok(*x == truthy)
        }
        (Number(x), Number(y)) => Ok(numbers_equal(*x, *y)),
        (Str(x), Str(y)) => Ok(x == y),
        (Vec2(x), Vec2(y)) => Ok(x.abs_diff_eq(*y, crate::value::EPSILON)),
        (Vec3(x), Vec3(y)) => Ok(x.abs_diff_eq(*y, crate::value::EPSILON)),
        (Handle(x), Handle(y)) => Ok(x == y),
        (User(x), User(y)) => Ok(std::rc::Rc::ptr_eq(x, y)),
        _ => Err(RuntimeError::Binary {
            op: "==",
            left: a.kind(),
            right: b.kind(),
        }),
    }
}

fn compare(
    op: &'static str,
    a: Value,
    b: Value,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> VmResult<Value> {
    let ordering = match (&a, &b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        _ => None,
    };
    match ordering {
        Some(ordering) => Ok(Value::Bool(accept(ordering))),
        None => Err(RuntimeError::Binary {
            op,
            left: a.kind(),
            right: b.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::host::World;
    use glam::DVec2;

    fn compile(world: &World, source: &str) -> ScriptDefinition {
        let def = compile_source("t", source, world);
        assert!(def.valid, "compile failed: {:?}", def.errors);
        def
    }

    /// Runs one lifecycle handler of one state against caller-owned scopes.
    fn run_handler(
        world: &mut World,
        def: &ScriptDefinition,
        state: &str,
        event: &str,
        globals: &mut Scope,
        state_scope: &mut Scope,
        args: Option<&mut EventArgs>,
    ) -> VmResult<Halt> {
        let sid = def.find_state(state).unwrap();
        let chunk = def.handler_of(sid, event).unwrap();
        Vm::new(
            def,
            globals,
            Some(state_scope),
            args,
            Some(sid),
            EntityId::NONE,
            world,
        )
        .run(chunk)
    }

    #[test]
    fn arithmetic_lands_in_globals() {
        let mut world = World::new();
        let def = compile(&world, "Number x = 0 State S { OnEnter() { x = 1 + 2 * 3 } }");
        let mut globals = Scope::from([("x".to_string(), Value::Number(0.0))]);
        let mut state = Scope::new();
        let halt =
            run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None)
                .unwrap();
        assert_eq!(halt, Halt::End);
        assert_eq!(globals["x"], Value::Number(7.0));
    }

    #[test]
    fn vector_addition() {
        let mut world = World::new();
        let def = compile(
            &world,
            "Vec2 v = Vec2(x: 0, y: 0) State S { OnEnter() { v = Vec2(x: 1, y: 2) + Vec2(x: 3, y: 4) } }",
        );
        let mut globals = Scope::from([("v".to_string(), Value::Vec2(DVec2::ZERO))]);
        let mut state = Scope::new();
        run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["v"], Value::Vec2(DVec2::new(4.0, 6.0)));
    }

    #[test]
    fn string_concatenation_renders_numbers() {
        let mut world = World::new();
        let def = compile(
            &world,
            r#"String s = "" State S { OnEnter() { s = "a" + 1 } }"#,
        );
        let mut globals = Scope::from([("s".to_string(), Value::Str(String::new()))]);
        let mut state = Scope::new();
        run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["s"], Value::Str("a1".to_string()));
    }

    #[test]
    fn division_by_zero_stops_the_chunk() {
        let mut world = World::new();
        let def = compile(
            &world,
            "Number x = 0 State S { OnEnter() { x = 1 / 0 x = 5 } }",
        );
        let mut globals = Scope::from([("x".to_string(), Value::Number(0.0))]);
        let mut state = Scope::new();
        let err =
            run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None)
                .unwrap_err();
        assert_eq!(err, RuntimeError::DivisionByZero);
        // The statement after the failure never ran.
        assert_eq!(globals["x"], Value::Number(0.0));
    }

    #[test]
    fn false_condition_skips_the_whole_block() {
        let mut world = World::new();
        let def = compile(
            &world,
            "Number x = 0 State S { OnEnter() { if (x == 1) { x = 100 } x = x + 10 } }",
        );
        let mut globals = Scope::from([("x".to_string(), Value::Number(0.0))]);
        let mut state = Scope::new();
        run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["x"], Value::Number(10.0));
    }

    #[test]
    fn else_branch_runs_when_condition_fails() {
        let mut world = World::new();
        let def = compile(
            &world,
            r#"String s = "" State S { OnEnter() { if (1 > 2) { s = "then" } else { s = "else" } } }"#,
        );
        let mut globals = Scope::from([("s".to_string(), Value::Str(String::new()))]);
        let mut state = Scope::new();
        run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["s"], Value::Str("else".to_string()));
    }

    #[test]
    fn reads_prefer_local_over_state_over_global() {
        let mut world = World::new();
        let def = compile(
            &world,
            "Number x = 1 Number y = 0 State S { OnEnter() { Number x = 3 y = x } OnExit() { y = x } }",
        );
        let mut globals = Scope::from([
            ("x".to_string(), Value::Number(1.0)),
            ("y".to_string(), Value::Number(0.0)),
        ]);
        let mut state = Scope::from([("x".to_string(), Value::Number(2.0))]);

        run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["y"], Value::Number(3.0));

        // No local declaration in OnExit, so the state scope wins.
        run_handler(&mut world, &def, "S", "OnExit", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["y"], Value::Number(2.0));

        // Without the state entry the read falls through to the global.
        let mut empty_state = Scope::new();
        run_handler(&mut world, &def, "S", "OnExit", &mut globals, &mut empty_state, None)
            .unwrap();
        assert_eq!(globals["y"], Value::Number(1.0));
    }

    #[test]
    fn host_operation_results_backfill_bare_arguments() {
        let mut world = World::new();
        let boss = world.spawn("Boss");
        let def = compile(
            &world,
            r#"Entity r = null State S { OnEnter() { Find(name: "Boss", result: r) } }"#,
        );
        let mut globals = Scope::from([("r".to_string(), Value::Handle(EntityId::NONE))]);
        let mut state = Scope::new();
        run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["r"], Value::Handle(boss));
    }

    #[test]
    fn script_function_call_round_trips_parameters() {
        let mut world = World::new();
        let def = compile(
            &world,
            "Number x = 5 Function Double(Number n) { n = n * 2 } State S { OnEnter() { Double(n: x) } }",
        );
        let mut globals = Scope::from([("x".to_string(), Value::Number(5.0))]);
        let mut state = Scope::new();
        run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["x"], Value::Number(10.0));
    }

    #[test]
    fn change_state_truncates_the_calling_handler() {
        let mut world = World::new();
        let def = compile(
            &world,
            "Number x = 0 Function Go() { ChangeState(Next) } State S { OnEnter() { Go() x = 9 } } State Next { }",
        );
        let mut globals = Scope::from([("x".to_string(), Value::Number(0.0))]);
        let mut state = Scope::new();
        let halt =
            run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None)
                .unwrap();
        assert_eq!(halt, Halt::ChangeState("Next".to_string()));
        assert_eq!(globals["x"], Value::Number(0.0));
    }

    #[test]
    fn vector_member_assignment_writes_through() {
        let mut world = World::new();
        let def = compile(
            &world,
            "Vec2 pos = Vec2(x: 0, y: 3) Number x = 0 State S { OnEnter() { pos.x = 5 x = pos.y } }",
        );
        let mut globals = Scope::from([
            ("pos".to_string(), Value::Vec2(DVec2::new(0.0, 3.0))),
            ("x".to_string(), Value::Number(0.0)),
        ]);
        let mut state = Scope::new();
        run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["pos"], Value::Vec2(DVec2::new(5.0, 3.0)));
        assert_eq!(globals["x"], Value::Number(3.0));
    }

    #[test]
    fn runaway_recursion_is_cut_off() {
        let mut world = World::new();
        let def = compile(
            &world,
            "Function Loop() { Loop() } State S { OnEnter() { Loop() } }",
        );
        let mut globals = Scope::new();
        let mut state = Scope::new();
        let err =
            run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None)
                .unwrap_err();
        assert_eq!(err, RuntimeError::CallDepthExceeded);
    }

    #[test]
    fn undefined_reads_and_mismatched_assignments_error() {
        let mut world = World::new();
        let def = compile(
            &world,
            r#"Number x = 0 String s = "" State S { OnEnter() { x = y } OnExit() { x = s } }"#,
        );
        let mut globals = Scope::from([
            ("x".to_string(), Value::Number(0.0)),
            ("s".to_string(), Value::Str("hi".to_string())),
        ]);
        let mut state = Scope::new();
        let err =
            run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None)
                .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::UndefinedVariable {
                name: "y".to_string()
            }
        );

        let err =
            run_handler(&mut world, &def, "S", "OnExit", &mut globals, &mut state, None)
                .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::AssignMismatch {
                name: "x".to_string(),
                expected: Kind::Number,
                found: Kind::Str,
            }
        );
    }

    #[test]
    fn boolean_operators_coerce_and_reject() {
        let mut world = World::new();
        let def = compile(
            &world,
            r#"Bool b = false State S { OnEnter() { b = 1 && "yes" } OnExit() { b = null && true } }"#,
        );
        let mut globals = Scope::from([("b".to_string(), Value::Bool(false))]);
        let mut state = Scope::new();
        run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["b"], Value::Bool(true));

        let err =
            run_handler(&mut world, &def, "S", "OnExit", &mut globals, &mut state, None)
                .unwrap_err();
        assert_eq!(err, RuntimeError::NotBoolean { kind: Kind::Handle });
    }

    #[test]
    fn equality_against_bool_coerces_the_other_side() {
        let mut world = World::new();
        let def = compile(
            &world,
            "Bool b = false State S { OnEnter() { b = 3 == true } OnExit() { b = 1 == Vec2(x: 1, y: 1) } }",
        );
        let mut globals = Scope::from([("b".to_string(), Value::Bool(false))]);
        let mut state = Scope::new();
        run_handler(&mut world, &def, "S", "OnEnter", &mut globals, &mut state, None).unwrap();
        assert_eq!(globals["b"], Value::Bool(true));

        let err =
            run_handler(&mut world, &def, "S", "OnExit", &mut globals, &mut state, None)
                .unwrap_err();
        assert!(matches!(err, RuntimeError::Binary { op: "==", .. }));
    }
}
