use std::collections::HashMap;

use glam::{DVec2, DVec3};

use crate::bytecode::{Chunk, ChunkId, ChunkKind, DeclType, Op, VarDecl, VarInit};
use crate::component::OWNER_NAME;
use crate::host::HostRegistry;
use crate::lexer::{Token, lex};
use crate::script::ScriptDefinition;
use crate::value::{EntityId, Value};

#[derive(Debug, Clone, thiserror::Error)]
#[error("{script}:{line}: {message}")]
pub struct CompileError {
    pub script: String,
    pub line: u32,
    pub message: String,
}

type Result<T> = std::result::Result<T, CompileError>;

/// Compile a token stream into a script definition. Never fails outright: a
/// bad script yields a definition with `valid == false` and the error attached.
pub fn compile(name: &str, tokens: &[(Token, u32)], host: &dyn HostRegistry) -> ScriptDefinition {
    let mut parser = Parser::new(name, tokens, host);
    match parser.parse_script() {
        Ok(()) => ScriptDefinition::from_chunks(name, parser.chunks),
        Err(error) => ScriptDefinition::invalid(name, vec![error]),
    }
}

/// Lex + compile in one step.
pub fn compile_source(name: &str, source: &str, host: &dyn HostRegistry) -> ScriptDefinition {
    match lex(source) {
        Ok(tokens) => compile(name, &tokens, host),
        Err(e) => ScriptDefinition::invalid(
            name,
            vec![CompileError {
                script: name.to_string(),
                line: e.line,
                message: format!("unrecognized input '{}'", e.snippet),
            }],
        ),
    }
}

/// Which kind of block the statement dispatcher is currently inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    Global,
    State,
    Event,
}

struct Parser<'a> {
    script: &'a str,
    tokens: &'a [(Token, u32)],
    pos: usize,
    /// Line of the most recently consumed token; emitted opcodes are tagged
    /// with it.
    cur_line: u32,
    host: &'a dyn HostRegistry,
    chunks: Vec<Chunk>,
    /// Body locals defined so far per event chunk, for assignment checking.
    locals: HashMap<ChunkId, Vec<String>>,
    saw_initial: bool,
}

impl<'a> Parser<'a> {
    fn new(script: &'a str, tokens: &'a [(Token, u32)], host: &'a dyn HostRegistry) -> Self {
        Parser {
            script,
            tokens,
            pos: 0,
            cur_line: 1,
            host,
            chunks: Vec::new(),
            locals: HashMap::new(),
            saw_initial: false,
        }
    }

    // ---- Token helpers ----

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn token_at(&self, idx: usize) -> Option<&Token> {
        self.tokens.get(idx).map(|(t, _)| t)
    }

    /// Line for error reporting: where the next token sits, or where the
    /// stream ended.
    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .map(|(_, l)| *l)
            .unwrap_or(self.cur_line)
    }

    fn advance(&mut self) -> Option<&Token> {
        let entry = self.tokens.get(self.pos);
        if let Some((_, line)) = entry {
            self.cur_line = *line;
            self.pos += 1;
        }
        entry.map(|(t, _)| t)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            match self.peek() {
                Some(found) => Err(self.error(format!("expected {what}, found {found:?}"))),
                None => Err(self.error(format!("expected {what}, found end of script"))),
            }
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            Some(found) => Err(self.error(format!("expected {what}, found {found:?}"))),
            None => Err(self.error(format!("expected {what}, found end of script"))),
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            script: self.script.to_string(),
            line: self.line(),
            message: message.into(),
        }
    }

    // ---- Emission helpers ----

    fn emit(&mut self, chunk: ChunkId, op: Op) {
        let line = self.cur_line;
        self.chunks[chunk].emit(op, line);
    }

    fn emit_with(&mut self, chunk: ChunkId, op: Op, operand: u8) {
        let line = self.cur_line;
        self.chunks[chunk].emit_with(op, operand, line);
    }

    fn constant(&mut self, chunk: ChunkId, value: Value) -> Result<u8> {
        let line = self.cur_line;
        self.chunks[chunk].add_constant(value).map_err(|e| CompileError {
            script: self.script.to_string(),
            line,
            message: e.to_string(),
        })
    }

    /// Un-interned slot for backpatch placeholders.
    fn constant_raw(&mut self, chunk: ChunkId, value: Value) -> Result<u8> {
        let line = self.cur_line;
        self.chunks[chunk]
            .add_constant_raw(value)
            .map_err(|e| CompileError {
                script: self.script.to_string(),
                line,
                message: e.to_string(),
            })
    }

    fn emit_constant(&mut self, chunk: ChunkId, value: Value) -> Result<()> {
        let idx = self.constant(chunk, value)?;
        self.emit_with(chunk, Op::Constant, idx);
        Ok(())
    }

    // ---- Top level ----

    fn parse_script(&mut self) -> Result<()> {
        self.chunks
            .push(Chunk::new(self.script, ChunkKind::Global, None));
        while !self.at_end() {
            self.parse_statement(Ctx::Global, 0)?;
        }
        Ok(())
    }

    fn parse_statement(&mut self, ctx: Ctx, chunk: ChunkId) -> Result<()> {
        match self.peek() {
            Some(Token::State) => self.parse_state(ctx),
            Some(Token::Function) => self.parse_function(ctx, chunk),
            Some(Token::OnEnter | Token::OnExit | Token::OnUpdate) => {
                self.parse_lifecycle(ctx, chunk)
            }
            Some(Token::ChangeState) => self.parse_change_state(ctx, chunk),
            Some(Token::If) => self.parse_if(ctx, chunk),
            Some(Token::Return) => {
                if ctx != Ctx::Event {
                    return Err(self.error("return is only allowed inside an event handler"));
                }
                self.advance();
                self.emit(chunk, Op::Return);
                Ok(())
            }
            Some(Token::Entity) => self.parse_declaration(ctx, chunk),
            Some(Token::Ident(_)) if self.is_declaration() => self.parse_declaration(ctx, chunk),
            Some(Token::Ident(_)) => {
                if ctx != Ctx::Event {
                    return Err(self.error("statements are only allowed inside event handlers"));
                }
                self.parse_expression_statement(chunk)
            }
            Some(found) => Err(self.error(format!("unexpected {found:?}"))),
            None => Err(self.error("unexpected end of script")),
        }
    }

    /// `Type name` starts a declaration; `name =`, `name(` and `name.` do not.
    fn is_declaration(&self) -> bool {
        matches!(self.peek(), Some(Token::Ident(_)))
            && matches!(self.token_at(self.pos + 1), Some(Token::Ident(_)))
    }

    /// True when `name` is declared somewhere on the lexical chain: a body
    /// local defined above this point, a parameter, the enclosing state's
    /// variables, or a global.
    fn is_assignable(&self, chunk: ChunkId, name: &str) -> bool {
        if self
            .locals
            .get(&chunk)
            .is_some_and(|locals| locals.iter().any(|n| n == name))
        {
            return true;
        }
        let mut cursor = Some(chunk);
        while let Some(id) = cursor {
            let owner = &self.chunks[id];
            if owner.variables.iter().any(|(n, _)| n == name) {
                return true;
            }
            cursor = owner.parent;
        }
        false
    }

    // ---- Blocks ----

    fn parse_state(&mut self, ctx: Ctx) -> Result<()> {
        match ctx {
            Ctx::Global => {}
            Ctx::State => {
                return Err(self.error("a State cannot be declared inside another State"));
            }
            Ctx::Event => {
                return Err(self.error("a State cannot be declared inside an event handler"));
            }
        }
        self.advance();
        let name = self.expect_ident("a state name")?;
        if self.chunks[0].handlers.iter().any(|(n, _)| *n == name) {
            return Err(self.error(format!("duplicate definition of '{name}'")));
        }

        let id = self.chunks.len();
        let mut state = Chunk::new(name.clone(), ChunkKind::State, Some(0));
        // The first state in the file is where instantiated components start.
        if !self.saw_initial {
            state.is_initial_state = true;
            self.saw_initial = true;
        }
        self.chunks.push(state);
        self.chunks[0].handlers.push((name, id));

        self.expect(&Token::LBrace, "'{' after the state name")?;
        while !self.check(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error("unclosed State block"));
            }
            self.parse_statement(Ctx::State, id)?;
        }
        self.advance();
        Ok(())
    }

    fn parse_function(&mut self, ctx: Ctx, owner: ChunkId) -> Result<()> {
        if ctx == Ctx::Event {
            return Err(self.error("a Function cannot be declared inside an event handler"));
        }
        self.advance();
        let name = self.expect_ident("a function name")?;
        if self.host.is_operation_registered(&name) {
            return Err(self.error(format!(
                "function '{name}' collides with a registered host operation"
            )));
        }
        if self.chunks[owner].handlers.iter().any(|(n, _)| *n == name) {
            return Err(self.error(format!("duplicate definition of '{name}'")));
        }

        let id = self.chunks.len();
        self.chunks
            .push(Chunk::new(name.clone(), ChunkKind::Event, Some(owner)));
        self.chunks[owner].handlers.push((name, id));

        self.expect(&Token::LParen, "'(' after the function name")?;
        self.parse_params(id)?;
        self.expect(&Token::RParen, "')' after the parameter list")?;
        self.parse_block(id)
    }

    fn parse_params(&mut self, chunk: ChunkId) -> Result<()> {
        if self.check(&Token::RParen) {
            return Ok(());
        }
        loop {
            let ty = self.parse_type_name()?;
            let name = self.expect_ident("a parameter name")?;
            if name == OWNER_NAME {
                return Err(self.error(format!("'{OWNER_NAME}' is reserved")));
            }
            if self.chunks[chunk].variables.iter().any(|(n, _)| *n == name) {
                return Err(self.error(format!("parameter '{name}' is already declared")));
            }
            self.chunks[chunk].variables.push((
                name,
                VarDecl {
                    ty,
                    init: VarInit::Default,
                },
            ));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(())
    }

    fn parse_lifecycle(&mut self, ctx: Ctx, owner: ChunkId) -> Result<()> {
        let name = match self.peek() {
            Some(Token::OnEnter) => "OnEnter",
            Some(Token::OnExit) => "OnExit",
            Some(Token::OnUpdate) => "OnUpdate",
            _ => unreachable!("dispatched on lifecycle token"),
        };
        if ctx != Ctx::State {
            return Err(self.error(format!(
                "{name} is only allowed directly inside a State block"
            )));
        }
        self.advance();
        if self.chunks[owner].handlers.iter().any(|(n, _)| n == name) {
            return Err(self.error(format!("duplicate {name} handler")));
        }

        let id = self.chunks.len();
        self.chunks
            .push(Chunk::new(name, ChunkKind::Event, Some(owner)));
        self.chunks[owner].handlers.push((name.to_string(), id));

        self.expect(&Token::LParen, "'(' after the handler name")?;
        self.expect(&Token::RParen, "')' (lifecycle handlers take no parameters)")?;
        self.parse_block(id)
    }

    fn parse_block(&mut self, chunk: ChunkId) -> Result<()> {
        self.expect(&Token::LBrace, "'{'")?;
        while !self.check(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error("unclosed block"));
            }
            self.parse_statement(Ctx::Event, chunk)?;
        }
        self.advance();
        Ok(())
    }

    // ---- Event statements ----

    fn parse_change_state(&mut self, ctx: Ctx, chunk: ChunkId) -> Result<()> {
        if ctx != Ctx::Event {
            return Err(self.error("ChangeState is only allowed inside an event handler"));
        }
        self.advance();
        self.expect(&Token::LParen, "'(' after ChangeState")?;
        let state = self.expect_ident("a state name")?;
        self.expect(&Token::RParen, "')' after the state name")?;
        self.emit_constant(chunk, Value::Str(state))?;
        self.emit(chunk, Op::ChangeState);
        Ok(())
    }

    /// Two-phase if/else: the skip distances are backpatched pool constants.
    ///
    /// Layout: `cond, CONSTANT skip, IF, <body>, CONSTANT jump, JUMP, <else>`.
    /// After patching, `skip` equals the byte count from just after IF to the
    /// first instruction past JUMP (body plus the fixed 3-byte jump), and
    /// `jump` equals the else block's byte count (zero when absent).
    fn parse_if(&mut self, ctx: Ctx, chunk: ChunkId) -> Result<()> {
        if ctx != Ctx::Event {
            return Err(self.error("if is only allowed inside an event handler"));
        }
        self.advance();
        self.expect(&Token::LParen, "'(' after if")?;

        // Reserve the placeholder before the condition compiles.
        let skip_idx = self.constant_raw(chunk, Value::Number(0.0))?;
        self.parse_expression(chunk)?;
        self.expect(&Token::RParen, "')' after the condition")?;
        self.emit_with(chunk, Op::Constant, skip_idx);
        self.emit(chunk, Op::If);

        let body_start = self.chunks[chunk].len();
        self.parse_block(chunk)?;

        let jump_idx = self.constant_raw(chunk, Value::Number(0.0))?;
        self.emit_with(chunk, Op::Constant, jump_idx);
        self.emit(chunk, Op::Jump);

        let after_jump = self.chunks[chunk].len();
        self.chunks[chunk]
            .patch_constant(skip_idx, Value::Number((after_jump - body_start) as f64));

        if self.eat(&Token::Else) {
            if self.check(&Token::If) {
                self.parse_if(Ctx::Event, chunk)?;
            } else {
                self.parse_block(chunk)?;
            }
        }
        let else_len = self.chunks[chunk].len() - after_jump;
        self.chunks[chunk].patch_constant(jump_idx, Value::Number(else_len as f64));
        Ok(())
    }

    fn parse_expression_statement(&mut self, chunk: ChunkId) -> Result<()> {
        let Some(Token::Ident(name)) = self.peek().cloned() else {
            return Err(self.error("expected a statement"));
        };
        self.advance();

        if self.eat(&Token::Assign) {
            if name == OWNER_NAME {
                return Err(self.error(format!("'{OWNER_NAME}' is read-only")));
            }
            if !self.is_assignable(chunk, &name) {
                return Err(self.error(format!(
                    "assignment to undeclared variable '{name}'"
                )));
            }
            self.parse_expression(chunk)?;
            let idx = self.constant(chunk, Value::Str(name))?;
            self.emit_with(chunk, Op::Assign, idx);
            Ok(())
        } else if self.check(&Token::LParen) {
            if name == "Vec2" {
                self.parse_vector_ctor(chunk, 2)
            } else if name == "Vec3" {
                self.parse_vector_ctor(chunk, 3)
            } else if self.host.is_user_type(&name) {
                self.parse_user_ctor(chunk, &name)
            } else {
                self.parse_call_statement(chunk, name)
            }
        } else if self.check(&Token::Dot) {
            let members = self.parse_member_chain()?;
            if self.check(&Token::LParen) {
                // Argument block first, then the chain; the opcode pops the
                // chain before collecting the arguments.
                let (argc, backfill) = self.parse_named_args(chunk, true)?;
                self.emit_constant(chunk, Value::Number(argc as f64))?;
                for (var, param) in &backfill {
                    self.emit_constant(chunk, Value::Str(var.clone()))?;
                    self.emit_constant(chunk, Value::Str(param.clone()))?;
                }
                self.emit_constant(chunk, Value::Number(backfill.len() as f64))?;
                self.emit_member_chain(chunk, &name, &members)?;
                self.emit(chunk, Op::MemberCall);
                Ok(())
            } else if self.eat(&Token::Assign) {
                self.parse_expression(chunk)?;
                self.emit_member_chain(chunk, &name, &members)?;
                self.emit(chunk, Op::MemberAssign);
                Ok(())
            } else {
                self.emit_member_chain(chunk, &name, &members)?;
                self.emit(chunk, Op::MemberGet);
                Ok(())
            }
        } else {
            Err(self.error("expected '=', '(' or '.' after identifier"))
        }
    }

    fn parse_call_statement(&mut self, chunk: ChunkId, callee: String) -> Result<()> {
        let (argc, backfill) = self.parse_named_args(chunk, true)?;
        self.emit_constant(chunk, Value::Number(argc as f64))?;
        for (var, param) in &backfill {
            self.emit_constant(chunk, Value::Str(var.clone()))?;
            self.emit_constant(chunk, Value::Str(param.clone()))?;
        }
        self.emit_constant(chunk, Value::Number(backfill.len() as f64))?;
        self.emit_constant(chunk, Value::Str(callee))?;
        self.emit(chunk, Op::Call);
        Ok(())
    }

    /// `name: expr, ...` between parentheses. Every argument emits its value
    /// then its parameter name. Bare-identifier arguments are additionally
    /// recorded so the call can write results back into them afterwards.
    fn parse_named_args(
        &mut self,
        chunk: ChunkId,
        record_backfill: bool,
    ) -> Result<(u8, Vec<(String, String)>)> {
        self.expect(&Token::LParen, "'('")?;
        let mut argc: u8 = 0;
        let mut backfill = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                let param = self.expect_ident("an argument name")?;
                self.expect(&Token::Colon, "':' after the argument name")?;

                let bare = matches!(self.peek(), Some(Token::Ident(_)))
                    && matches!(
                        self.token_at(self.pos + 1),
                        Some(Token::Comma | Token::RParen)
                    );
                if bare && record_backfill {
                    let Some(Token::Ident(var)) = self.peek().cloned() else {
                        unreachable!("checked above");
                    };
                    self.advance();
                    let idx = self.constant(chunk, Value::Str(var.clone()))?;
                    self.emit_with(chunk, Op::Get, idx);
                    backfill.push((var, param.clone()));
                } else {
                    self.parse_expression(chunk)?;
                }
                self.emit_constant(chunk, Value::Str(param))?;
                argc = argc.saturating_add(1);

                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen, "')' after the arguments")?;
        Ok((argc, backfill))
    }

    fn parse_member_chain(&mut self) -> Result<Vec<String>> {
        let mut members = Vec::new();
        while self.eat(&Token::Dot) {
            members.push(self.expect_ident("a member name")?);
        }
        Ok(members)
    }

    fn emit_member_chain(
        &mut self,
        chunk: ChunkId,
        base: &str,
        members: &[String],
    ) -> Result<()> {
        self.emit_constant(chunk, Value::Str(base.to_string()))?;
        for member in members {
            self.emit_constant(chunk, Value::Str(member.clone()))?;
        }
        self.emit_constant(chunk, Value::Number(members.len() as f64))?;
        Ok(())
    }

    // ---- Declarations ----

    fn parse_type_name(&mut self) -> Result<DeclType> {
        match self.peek().cloned() {
            Some(Token::Entity) => {
                self.advance();
                Ok(DeclType::Entity)
            }
            Some(Token::Ident(name)) => {
                if let Some(ty) = DeclType::from_name(&name) {
                    self.advance();
                    Ok(ty)
                } else if self.host.is_user_type(&name) {
                    self.advance();
                    Ok(DeclType::User(name))
                } else {
                    Err(self.error(format!("unknown type '{name}'")))
                }
            }
            _ => Err(self.error("expected a type name")),
        }
    }

    fn parse_declaration(&mut self, ctx: Ctx, chunk: ChunkId) -> Result<()> {
        let ty = self.parse_type_name()?;
        let name = self.expect_ident("a variable name")?;
        if name == OWNER_NAME {
            return Err(self.error(format!(
                "'{OWNER_NAME}' is reserved and cannot be redeclared"
            )));
        }

        if ctx == Ctx::Event {
            // Locals are defined at runtime, initializers are full expressions.
            if self.eat(&Token::Assign) {
                self.parse_expression(chunk)?;
            } else {
                self.emit_default(chunk, &ty)?;
            }
            self.locals.entry(chunk).or_default().push(name.clone());
            let idx = self.constant(chunk, Value::Str(name))?;
            self.emit_with(chunk, Op::Define, idx);
            return Ok(());
        }

        if self.chunks[chunk].variables.iter().any(|(n, _)| *n == name) {
            return Err(self.error(format!("variable '{name}' is already declared")));
        }
        let init = if self.eat(&Token::Assign) {
            let init = self.parse_literal_init(&ty, &name)?;
            // `Number x = 1 + 2` reads the 1 fine; a trailing operator means
            // the initializer was really an expression.
            if matches!(
                self.peek(),
                Some(
                    Token::Plus
                        | Token::Minus
                        | Token::Star
                        | Token::Slash
                        | Token::EqEq
                        | Token::NotEq
                        | Token::Greater
                        | Token::GreaterEq
                        | Token::Less
                        | Token::LessEq
                        | Token::AndAnd
                        | Token::OrOr
                )
            ) {
                return Err(self.error(format!(
                    "initializer for '{name}' must be a {} literal",
                    ty.name()
                )));
            }
            init
        } else {
            VarInit::Default
        };
        self.chunks[chunk].variables.push((name, VarDecl { ty, init }));
        Ok(())
    }

    /// Global and state variables seed scopes before any bytecode runs, so
    /// their initializers must be literals.
    fn parse_literal_init(&mut self, ty: &DeclType, name: &str) -> Result<VarInit> {
        let fail = |p: &Self| {
            p.error(format!(
                "initializer for '{}' must be a {} literal",
                name,
                ty.name()
            ))
        };
        match ty {
            DeclType::Number => Ok(VarInit::Value(Value::Number(
                self.parse_number_literal().map_err(|_| fail(self))?,
            ))),
            DeclType::Str => match self.peek().cloned() {
                Some(Token::Str(s)) => {
                    self.advance();
                    Ok(VarInit::Value(Value::Str(s)))
                }
                _ => Err(fail(self)),
            },
            DeclType::Bool => {
                if self.eat(&Token::True) {
                    Ok(VarInit::Value(Value::Bool(true)))
                } else if self.eat(&Token::False) {
                    Ok(VarInit::Value(Value::Bool(false)))
                } else {
                    Err(fail(self))
                }
            }
            DeclType::Entity => match self.peek().cloned() {
                // An entity initializer names an object to look up later.
                Some(Token::Str(s)) => {
                    self.advance();
                    Ok(VarInit::Object(s))
                }
                Some(Token::Null) => {
                    self.advance();
                    Ok(VarInit::Value(Value::Handle(EntityId::NONE)))
                }
                _ => Err(fail(self)),
            },
            DeclType::Vec2 => {
                let parts = self.parse_vector_literal("Vec2", &["x", "y"]).map_err(|e| {
                    if e.message.starts_with("initializer") { e } else { fail(self) }
                })?;
                Ok(VarInit::Value(Value::Vec2(DVec2::new(parts[0], parts[1]))))
            }
            DeclType::Vec3 => {
                let parts = self
                    .parse_vector_literal("Vec3", &["x", "y", "z"])
                    .map_err(|e| {
                        if e.message.starts_with("initializer") { e } else { fail(self) }
                    })?;
                Ok(VarInit::Value(Value::Vec3(DVec3::new(
                    parts[0], parts[1], parts[2],
                ))))
            }
            DeclType::User(type_name) => {
                match self.peek().cloned() {
                    Some(Token::Ident(n)) if n == *type_name => {}
                    _ => return Err(fail(self)),
                }
                self.advance();
                self.expect(&Token::LParen, "'('")?;
                let mut args = Vec::new();
                if !self.check(&Token::RParen) {
                    loop {
                        let key = self.expect_ident("an argument name")?;
                        self.expect(&Token::Colon, "':'")?;
                        let value = self.parse_scalar_literal()?;
                        args.push((key, value));
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen, "')'")?;
                Ok(VarInit::Construct {
                    type_name: type_name.clone(),
                    args,
                })
            }
        }
    }

    fn parse_vector_literal(&mut self, ctor: &str, keys: &[&str]) -> Result<Vec<f64>> {
        match self.peek().cloned() {
            Some(Token::Ident(n)) if n == ctor => {}
            _ => return Err(self.error(format!("expected {ctor}(..)"))),
        }
        self.advance();
        self.expect(&Token::LParen, "'('")?;
        let mut parts = Vec::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            let got = self.expect_ident("a component name")?;
            if got != *key {
                return Err(self.error(format!(
                    "{ctor} takes its components in {} order",
                    keys.join(", ")
                )));
            }
            self.expect(&Token::Colon, "':'")?;
            parts.push(self.parse_number_literal()?);
            if i + 1 < keys.len() {
                self.expect(&Token::Comma, "','")?;
            }
        }
        self.expect(&Token::RParen, "')'")?;
        Ok(parts)
    }

    fn parse_number_literal(&mut self) -> Result<f64> {
        let negative = self.eat(&Token::Minus);
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.advance();
                Ok(if negative { -n } else { n })
            }
            _ => Err(self.error("expected a number literal")),
        }
    }

    fn parse_scalar_literal(&mut self) -> Result<Value> {
        match self.peek().cloned() {
            Some(Token::Str(s)) => {
                self.advance();
                Ok(Value::Str(s))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Value::Bool(true))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Value::Bool(false))
            }
            Some(Token::Null) => {
                self.advance();
                Ok(Value::Handle(EntityId::NONE))
            }
            Some(Token::Number(_) | Token::Minus) => {
                Ok(Value::Number(self.parse_number_literal()?))
            }
            _ => Err(self.error("expected a literal")),
        }
    }

    fn emit_default(&mut self, chunk: ChunkId, ty: &DeclType) -> Result<()> {
        match ty {
            DeclType::Number => self.emit_constant(chunk, Value::Number(0.0)),
            DeclType::Str => self.emit_constant(chunk, Value::Str(String::new())),
            DeclType::Bool => self.emit_constant(chunk, Value::Bool(false)),
            DeclType::Entity => self.emit_constant(chunk, Value::Handle(EntityId::NONE)),
            DeclType::Vec2 => {
                self.emit_constant(chunk, Value::Number(0.0))?;
                self.emit_constant(chunk, Value::Number(0.0))?;
                self.emit(chunk, Op::ConstantVec2);
                Ok(())
            }
            DeclType::Vec3 => {
                self.emit_constant(chunk, Value::Number(0.0))?;
                self.emit_constant(chunk, Value::Number(0.0))?;
                self.emit_constant(chunk, Value::Number(0.0))?;
                self.emit(chunk, Op::ConstantVec3);
                Ok(())
            }
            DeclType::User(type_name) => {
                self.emit_constant(chunk, Value::Number(0.0))?;
                let idx = self.constant(chunk, Value::Str(type_name.clone()))?;
                self.emit_with(chunk, Op::ConstantUser, idx);
                Ok(())
            }
        }
    }

    // ---- Expressions ----
    //
    // Precedence, loosest first: || < && < == != < > >= < <= < + - < * / <
    // unary. Assignment is handled at statement level: bytecode is emitted as
    // tokens stream past, so assignment targets need the two-token lookahead
    // there rather than a reparse here.

    fn parse_expression(&mut self, chunk: ChunkId) -> Result<()> {
        self.parse_or(chunk)
    }

    fn parse_or(&mut self, chunk: ChunkId) -> Result<()> {
        self.parse_and(chunk)?;
        while self.eat(&Token::OrOr) {
            self.parse_and(chunk)?;
            self.emit(chunk, Op::Or);
        }
        Ok(())
    }

    fn parse_and(&mut self, chunk: ChunkId) -> Result<()> {
        self.parse_equality(chunk)?;
        while self.eat(&Token::AndAnd) {
            self.parse_equality(chunk)?;
            self.emit(chunk, Op::And);
        }
        Ok(())
    }

    fn parse_equality(&mut self, chunk: ChunkId) -> Result<()> {
        self.parse_comparison(chunk)?;
        loop {
            if self.eat(&Token::EqEq) {
                self.parse_comparison(chunk)?;
                self.emit(chunk, Op::Eq);
            } else if self.eat(&Token::NotEq) {
                self.parse_comparison(chunk)?;
                self.emit(chunk, Op::Ne);
            } else {
                return Ok(());
            }
        }
    }

    fn parse_comparison(&mut self, chunk: ChunkId) -> Result<()> {
        self.parse_term(chunk)?;
        loop {
            let op = match self.peek() {
                Some(Token::Greater) => Op::Gt,
                Some(Token::GreaterEq) => Op::Ge,
                Some(Token::Less) => Op::Lt,
                Some(Token::LessEq) => Op::Le,
                _ => return Ok(()),
            };
            self.advance();
            self.parse_term(chunk)?;
            self.emit(chunk, op);
        }
    }

    fn parse_term(&mut self, chunk: ChunkId) -> Result<()> {
        self.parse_factor(chunk)?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => Op::Add,
                Some(Token::Minus) => Op::Sub,
                _ => return Ok(()),
            };
            self.advance();
            self.parse_factor(chunk)?;
            self.emit(chunk, op);
        }
    }

    fn parse_factor(&mut self, chunk: ChunkId) -> Result<()> {
        self.parse_unary(chunk)?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => Op::Mul,
                Some(Token::Slash) => Op::Div,
                _ => return Ok(()),
            };
            self.advance();
            self.parse_unary(chunk)?;
            self.emit(chunk, op);
        }
    }

    fn parse_unary(&mut self, chunk: ChunkId) -> Result<()> {
        if self.eat(&Token::Bang) {
            self.parse_unary(chunk)?;
            self.emit(chunk, Op::Not);
            Ok(())
        } else if self.eat(&Token::Minus) {
            self.parse_unary(chunk)?;
            self.emit(chunk, Op::Negate);
            Ok(())
        } else {
            self.parse_primary(chunk)
        }
    }

    fn parse_primary(&mut self, chunk: ChunkId) -> Result<()> {
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.advance();
                self.emit_constant(chunk, Value::Number(n))
            }
            Some(Token::Str(s)) => {
                self.advance();
                self.emit_constant(chunk, Value::Str(s))
            }
            Some(Token::True) => {
                self.advance();
                self.emit_constant(chunk, Value::Bool(true))
            }
            Some(Token::False) => {
                self.advance();
                self.emit_constant(chunk, Value::Bool(false))
            }
            Some(Token::Null) => {
                self.advance();
                self.emit_constant(chunk, Value::Handle(EntityId::NONE))
            }
            Some(Token::LParen) => {
                self.advance();
                self.parse_expression(chunk)?;
                self.expect(&Token::RParen, "')'")
            }
            Some(Token::Ident(name)) => {
                self.advance();
                if self.check(&Token::LParen) {
                    if name == "Vec2" {
                        self.parse_vector_ctor(chunk, 2)
                    } else if name == "Vec3" {
                        self.parse_vector_ctor(chunk, 3)
                    } else if self.host.is_user_type(&name) {
                        self.parse_user_ctor(chunk, &name)
                    } else {
                        Err(self.error(format!(
                            "'{name}(..)' has no value here; call it as a statement \
                             (results come back through its arguments)"
                        )))
                    }
                } else if self.check(&Token::Dot) {
                    let members = self.parse_member_chain()?;
                    if self.check(&Token::LParen) {
                        return Err(self.error(
                            "a member call has no value here; call it as a statement",
                        ));
                    }
                    self.emit_member_chain(chunk, &name, &members)?;
                    self.emit(chunk, Op::MemberGet);
                    Ok(())
                } else {
                    let idx = self.constant(chunk, Value::Str(name))?;
                    self.emit_with(chunk, Op::Get, idx);
                    Ok(())
                }
            }
            Some(found) => Err(self.error(format!("expected an expression, found {found:?}"))),
            None => Err(self.error("expected an expression, found end of script")),
        }
    }

    /// `Vec2(x: expr, y: expr)`. Components are emitted in declared order and
    /// popped in reverse by the opcode.
    fn parse_vector_ctor(&mut self, chunk: ChunkId, dims: usize) -> Result<()> {
        let keys: &[&str] = if dims == 2 { &["x", "y"] } else { &["x", "y", "z"] };
        let ctor = if dims == 2 { "Vec2" } else { "Vec3" };
        self.expect(&Token::LParen, "'('")?;
        for (i, key) in keys.iter().enumerate() {
            let got = self.expect_ident("a component name")?;
            if got != *key {
                return Err(self.error(format!(
                    "{ctor} takes its components in {} order",
                    keys.join(", ")
                )));
            }
            self.expect(&Token::Colon, "':'")?;
            self.parse_expression(chunk)?;
            if i + 1 < keys.len() {
                self.expect(&Token::Comma, "','")?;
            }
        }
        self.expect(&Token::RParen, "')'")?;
        self.emit(
            chunk,
            if dims == 2 {
                Op::ConstantVec2
            } else {
                Op::ConstantVec3
            },
        );
        Ok(())
    }

    fn parse_user_ctor(&mut self, chunk: ChunkId, type_name: &str) -> Result<()> {
        let (argc, _) = self.parse_named_args(chunk, false)?;
        self.emit_constant(chunk, Value::Number(argc as f64))?;
        let idx = self.constant(chunk, Value::Str(type_name.to_string()))?;
        self.emit_with(chunk, Op::ConstantUser, idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::World;

    fn compile_ok(source: &str) -> ScriptDefinition {
        let world = World::new();
        let def = compile_source("test", source, &world);
        assert!(def.valid, "compile failed: {:?}", def.errors);
        def
    }

    fn compile_err(source: &str) -> CompileError {
        let world = World::new();
        let def = compile_source("test", source, &world);
        assert!(!def.valid, "expected a compile error");
        def.errors[0].clone()
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let source = r#"
Number hp = 100
Entity target = "Boss"

State Idle {
    OnEnter() {
        hp = hp - 1
        if (hp > 50) {
            ChangeState(Alert)
        } else {
            Log(message: "low")
        }
    }
}
State Alert {
    OnUpdate() {
    }
}
"#;
        let a = compile_ok(source);
        let b = compile_ok(source);
        assert_eq!(a.chunks.len(), b.chunks.len());
        for (ca, cb) in a.chunks.iter().zip(&b.chunks) {
            assert_eq!(ca.name, cb.name);
            assert_eq!(ca.code, cb.code);
            assert_eq!(ca.constants, cb.constants);
        }
    }

    #[test]
    fn if_skip_lengths_are_patched_exactly() {
        let def = compile_ok("State S { OnEnter() { if (true) { return } } }");
        let state = def.find_state("S").unwrap();
        let chunk = def.chunk(def.handler_of(state, "OnEnter").unwrap());
        // cond(2) CONSTANT skip(2) IF(1) RETURN(1) CONSTANT jump(2) JUMP(1)
        assert_eq!(
            chunk.code,
            vec![
                Op::Constant as u8,
                1,
                Op::Constant as u8,
                0,
                Op::If as u8,
                Op::Return as u8,
                Op::Constant as u8,
                2,
                Op::Jump as u8,
            ]
        );
        // Skip = body (1) + jump-over-else (3); jump = 0 with no else.
        assert_eq!(chunk.constants[0], Value::Number(4.0));
        assert_eq!(chunk.constants[1], Value::Bool(true));
        assert_eq!(chunk.constants[2], Value::Number(0.0));
    }

    #[test]
    fn else_jump_measures_the_else_block() {
        let def =
            compile_ok("Number x = 0 State S { OnEnter() { if (false) { return } else { x = 1 } } }");
        let state = def.find_state("S").unwrap();
        let chunk = def.chunk(def.handler_of(state, "OnEnter").unwrap());
        // The else block is CONSTANT(2) ASSIGN(2) = 4 bytes.
        let jump_value = chunk
            .constants
            .iter()
            .filter_map(|v| v.as_number())
            .find(|n| *n == 4.0);
        assert_eq!(jump_value, Some(4.0));
    }

    #[test]
    fn else_literals_never_alias_the_jump_placeholder() {
        // `x = 0` compiles while the jump placeholder still holds 0.0; the
        // literal must get its own slot or the patch would rewrite it.
        let def = compile_ok(
            "Number x = 9 State S { OnEnter() { if (x == 1) { x = 2 } else { x = 0 } } }",
        );
        let state = def.find_state("S").unwrap();
        let chunk = def.chunk(def.handler_of(state, "OnEnter").unwrap());
        // Code tail is the else block: CONSTANT <zero> ASSIGN <x>.
        let len = chunk.code.len();
        assert_eq!(chunk.code[len - 4], Op::Constant as u8);
        let zero_idx = chunk.code[len - 3] as usize;
        assert_eq!(chunk.constants[zero_idx], Value::Number(0.0));
    }

    #[test]
    fn call_emits_argument_and_backfill_tables() {
        let def = compile_ok(
            r#"
Number hp = 10
Entity e = null
State S {
    OnEnter() {
        Heal(target: e, amount: 5)
    }
}
"#,
        );
        let state = def.find_state("S").unwrap();
        let chunk = def.chunk(def.handler_of(state, "OnEnter").unwrap());
        assert_eq!(*chunk.code.last().unwrap(), Op::Call as u8);
        let strs: Vec<&str> = chunk
            .constants
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(strs.contains(&"Heal"));
        assert!(strs.contains(&"target"));
        assert!(strs.contains(&"amount"));
        assert!(strs.contains(&"e"));
        // argc 2, backfill count 1, literal 5.
        let nums: Vec<f64> = chunk.constants.iter().filter_map(|v| v.as_number()).collect();
        assert!(nums.contains(&2.0));
        assert!(nums.contains(&1.0));
        assert!(nums.contains(&5.0));
    }

    #[test]
    fn first_state_is_initial() {
        let def = compile_ok("State A { } State B { }");
        assert_eq!(def.initial_state(), def.find_state("A"));
        assert!(!def.chunk(def.find_state("B").unwrap()).is_initial_state);
    }

    #[test]
    fn nested_state_is_rejected() {
        let err = compile_err("State A { State B { } }");
        assert!(err.message.contains("inside another State"), "{err}");
        assert_eq!(err.script, "test");
    }

    #[test]
    fn lifecycle_outside_state_is_rejected() {
        let err = compile_err("OnEnter() { }");
        assert!(err.message.contains("inside a State"), "{err}");
    }

    #[test]
    fn change_state_outside_event_is_rejected() {
        let err = compile_err("State A { ChangeState(B) }");
        assert!(err.message.contains("event handler"), "{err}");
    }

    #[test]
    fn function_shadowing_host_operation_is_rejected() {
        let err = compile_err("Function Heal() { }");
        assert!(err.message.contains("host operation"), "{err}");
    }

    #[test]
    fn owner_cannot_be_redeclared() {
        let err = compile_err("Number Owner = 1");
        assert!(err.message.contains("reserved"), "{err}");
    }

    #[test]
    fn owner_cannot_be_assigned() {
        let err = compile_err("State S { OnEnter() { Owner = null } }");
        assert!(err.message.contains("read-only"), "{err}");
    }

    #[test]
    fn assignment_targets_must_be_declared() {
        let err = compile_err("State S { OnEnter() { missing = 1 } }");
        assert!(
            err.message.contains("undeclared variable 'missing'"),
            "{err}"
        );
        // Locals only count once they exist.
        let err = compile_err("State S { OnEnter() { x = 1 Number x = 0 } }");
        assert!(err.message.contains("undeclared variable 'x'"), "{err}");
        // Parameters, state variables and globals are all assignable.
        compile_ok(
            "Number g = 0 State S { Number sv = 1 OnEnter() { g = 2 sv = 3 } } Function F(Number p) { p = 4 }",
        );
    }

    #[test]
    fn unknown_declaration_type_is_rejected() {
        let err = compile_err("Sprite s");
        assert!(err.message.contains("unknown type 'Sprite'"), "{err}");
    }

    #[test]
    fn global_initializers_must_be_literals() {
        let err = compile_err("Number x = 1 + 2");
        assert!(err.message.contains("literal"), "{err}");
    }

    #[test]
    fn statements_at_global_scope_are_rejected() {
        let err = compile_err("Number x = 1\nx = 2");
        assert_eq!(err.line, 2);
        assert!(err.message.contains("inside event handlers"), "{err}");
    }

    #[test]
    fn error_lines_point_at_the_problem() {
        let err = compile_err("State A {\n    OnEnter() {\n        State B { }\n    }\n}");
        assert_eq!(err.line, 3);
        assert_eq!(err.to_string(), format!("test:3: {}", err.message));
    }

    #[test]
    fn constant_pool_overflow_fails_the_compile() {
        let mut body = String::new();
        for i in 0..300 {
            body.push_str(&format!("x = {i}.5\n"));
        }
        let source = format!("Number x = 0 State S {{ OnEnter() {{ {body} }} }}");
        let err = compile_err(&source);
        assert!(err.message.contains("constant pool overflow"), "{err}");
    }

    #[test]
    fn entity_declarations_record_object_references() {
        let def = compile_ok(r#"Entity boss = "Boss""#);
        let (name, decl) = &def.chunk(def.global).variables[0];
        assert_eq!(name, "boss");
        assert_eq!(decl.ty, DeclType::Entity);
        assert_eq!(decl.init, VarInit::Object("Boss".to_string()));
    }

    #[test]
    fn user_type_declarations_capture_factory_args() {
        let def = compile_ok(r#"Timer t = Timer(duration: 3)"#);
        let (_, decl) = &def.chunk(def.global).variables[0];
        assert_eq!(decl.ty, DeclType::User("Timer".to_string()));
        assert_eq!(
            decl.init,
            VarInit::Construct {
                type_name: "Timer".to_string(),
                args: vec![("duration".to_string(), Value::Number(3.0))],
            }
        );
    }

    #[test]
    fn calls_in_expression_position_are_rejected() {
        let err = compile_err("Number x = 0 State S { OnEnter() { x = Heal(target: x) } }");
        assert!(err.message.contains("no value"), "{err}");
    }

    #[test]
    fn lex_failures_surface_as_compile_errors() {
        let err = compile_err("Number x = 1\n@");
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unrecognized input"), "{err}");
    }
}
