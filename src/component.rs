use std::collections::HashMap;
use std::rc::Rc;

use glam::{DVec2, DVec3};

use crate::bytecode::{ChunkId, DeclType, VarDecl, VarInit};
use crate::host::{EventArgs, HostRegistry};
use crate::script::ScriptDefinition;
use crate::value::{EntityId, Value};
use crate::vm::{Halt, MAX_CALL_DEPTH, RuntimeError, Vm};

/// Implicit global holding the owning object's handle. Scripts read it, never
/// declare or assign it.
pub const OWNER_NAME: &str = "Owner";

/// One variable map. Components hold one for globals and one per state.
pub type Scope = HashMap<String, Value>;

/// Lifecycle of a bound script instance. `Invalid` is terminal except through
/// `rebind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created but not yet bound to an object.
    Uninitialized,
    /// Bound and seeded; the initial state's OnEnter has not run yet.
    Initialized,
    /// At least one state has been entered.
    Active,
    /// A runtime error stopped this component for good.
    Invalid,
}

/// Live binding of a script definition to one game object: its variable
/// scopes, its active state, and the state-machine plumbing between them.
pub struct Component {
    script: Rc<ScriptDefinition>,
    pub globals: Scope,
    state_scopes: HashMap<ChunkId, Scope>,
    owner: EntityId,
    active_state: Option<ChunkId>,
    phase: Phase,
    last_error: Option<String>,
}

impl Component {
    pub fn new(script: Rc<ScriptDefinition>) -> Self {
        Component {
            script,
            globals: Scope::new(),
            state_scopes: HashMap::new(),
            owner: EntityId::NONE,
            active_state: None,
            phase: Phase::Uninitialized,
            last_error: None,
        }
    }

    pub fn script(&self) -> &Rc<ScriptDefinition> {
        &self.script
    }

    pub fn name(&self) -> &str {
        &self.script.name
    }

    pub fn owner(&self) -> EntityId {
        self.owner
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bound and not failed. Invalid components are skipped by update and
    /// event dispatch for the rest of their lifetime.
    pub fn is_valid(&self) -> bool {
        matches!(self.phase, Phase::Initialized | Phase::Active)
    }

    pub fn state_name(&self) -> Option<&str> {
        self.active_state.map(|id| self.script.chunk(id).name.as_str())
    }

    pub fn error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Seeds every scope from the script's declarations plus the override
    /// bag, points the component at the initial state, and arms the first
    /// OnEnter. Object-reference initializers stay null until
    /// `resolve_entity_refs` runs.
    pub fn bind(&mut self, owner: EntityId, overrides: &EventArgs, host: &mut dyn HostRegistry) {
        self.owner = owner;
        self.globals = Scope::new();
        self.state_scopes = HashMap::new();
        self.active_state = None;
        self.last_error = None;
        self.phase = Phase::Uninitialized;

        if !self.script.valid {
            let detail = self
                .script
                .errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "script failed to compile".to_string());
            self.fail(&detail);
            return;
        }

        let script = Rc::clone(&self.script);
        let global = script.chunk(script.global);
        for (name, decl) in &global.variables {
            match initial_value(decl, host) {
                Ok(value) => {
                    self.globals.insert(name.clone(), value);
                }
                Err(e) => {
                    self.fail(&e.to_string());
                    return;
                }
            }
        }
        for (key, value) in overrides.iter() {
            if let Some((_, decl)) = global.variables.iter().find(|(n, _)| n == key) {
                if decl.ty.kind() != value.kind() {
                    let e = RuntimeError::ArgMismatch {
                        name: key.to_string(),
                        expected: decl.ty.kind(),
                        found: value.kind(),
                    };
                    self.fail(&e.to_string());
                    return;
                }
            }
            self.globals.insert(key.to_string(), value.clone());
        }
        self.globals
            .insert(OWNER_NAME.to_string(), Value::Handle(owner));

        for (_, state_id) in script.states() {
            let mut scope = Scope::new();
            for (name, decl) in &script.chunk(state_id).variables {
                match initial_value(decl, host) {
                    Ok(value) => {
                        scope.insert(name.clone(), value);
                    }
                    Err(e) => {
                        self.fail(&e.to_string());
                        return;
                    }
                }
            }
            self.state_scopes.insert(state_id, scope);
        }

        self.active_state = script.initial_state();
        self.phase = Phase::Initialized;
    }

    /// Swap in a freshly compiled definition without losing the component's
    /// identity or owner.
    pub fn rebind(
        &mut self,
        script: Rc<ScriptDefinition>,
        overrides: &EventArgs,
        host: &mut dyn HostRegistry,
    ) {
        self.script = script;
        let owner = self.owner;
        self.bind(owner, overrides, host);
    }

    /// Resolves every `Entity name = "Object"` declaration against the host.
    /// Called once all objects in a scene exist; names that still don't
    /// resolve stay null.
    pub fn resolve_entity_refs(&mut self, host: &dyn HostRegistry) {
        if !self.is_valid() {
            return;
        }
        let script = Rc::clone(&self.script);
        let global = script.chunk(script.global);
        for (name, decl) in &global.variables {
            if let VarInit::Object(object_name) = &decl.init {
                if let Some(id) = host.resolve_object(object_name) {
                    self.globals.insert(name.clone(), Value::Handle(id));
                }
            }
        }
        for (_, state_id) in script.states() {
            let Some(scope) = self.state_scopes.get_mut(&state_id) else {
                continue;
            };
            for (name, decl) in &script.chunk(state_id).variables {
                if let VarInit::Object(object_name) = &decl.init {
                    if let Some(id) = host.resolve_object(object_name) {
                        scope.insert(name.clone(), Value::Handle(id));
                    }
                }
            }
        }
    }

    /// Per-frame driver. The first call enters the initial state; later calls
    /// run the active state's OnUpdate with the frame's argument bag.
    pub fn update(&mut self, host: &mut dyn HostRegistry, args: &mut EventArgs) {
        match self.phase {
            Phase::Uninitialized | Phase::Invalid => {}
            Phase::Initialized => {
                self.phase = Phase::Active;
                if let Some(state) = self.active_state {
                    if let Some(chunk) = self.script.handler_of(state, "OnEnter") {
                        self.dispatch(host, chunk, None);
                    }
                }
            }
            Phase::Active => {
                if let Some(state) = self.active_state {
                    if let Some(chunk) = self.script.handler_of(state, "OnUpdate") {
                        self.dispatch(host, chunk, Some(args));
                    }
                }
            }
        }
    }

    /// Runs the named event: the active state's handlers win over top-level
    /// functions. Returns false when the event doesn't exist or the component
    /// isn't runnable.
    pub fn fire_event(
        &mut self,
        host: &mut dyn HostRegistry,
        event: &str,
        args: &mut EventArgs,
    ) -> bool {
        if !self.is_valid() {
            return false;
        }
        let Some(chunk) = self.script.resolve_event(self.active_state, event) else {
            return false;
        };
        self.dispatch(host, chunk, Some(args));
        true
    }

    fn dispatch(&mut self, host: &mut dyn HostRegistry, chunk: ChunkId, args: Option<&mut EventArgs>) {
        match self.run_chunk(host, chunk, args) {
            Ok(Halt::ChangeState(target)) => self.transition(host, &target, 0),
            Ok(_) => {}
            Err(e) => self.fail(&e.to_string()),
        }
    }

    fn run_chunk(
        &mut self,
        host: &mut dyn HostRegistry,
        chunk: ChunkId,
        args: Option<&mut EventArgs>,
    ) -> Result<Halt, RuntimeError> {
        let Self {
            script,
            globals,
            state_scopes,
            owner,
            active_state,
            ..
        } = self;
        let state = *active_state;
        let state_scope = state.and_then(|id| state_scopes.get_mut(&id));
        Vm::new(&**script, globals, state_scope, args, state, *owner, host).run(chunk)
    }

    /// OnExit of the old state, pointer swap, OnEnter of the new state.
    ///
    /// A ChangeState fired from OnExit redirects the transition in flight; the
    /// old state has already exited by then, so its OnExit does not run a
    /// second time. One fired from OnEnter chains onward, exiting the
    /// just-entered state normally. Both paths are depth-capped.
    fn transition(&mut self, host: &mut dyn HostRegistry, target: &str, depth: u32) {
        if depth >= MAX_CALL_DEPTH {
            self.fail("state transitions nested too deeply");
            return;
        }
        let Some(next) = self.script.find_state(target) else {
            let e = RuntimeError::UnknownState {
                name: target.to_string(),
            };
            self.fail(&e.to_string());
            return;
        };

        // Only a state that was actually entered gets exited. Before the first
        // update the initial state is armed but not entered.
        if self.phase == Phase::Active {
            if let Some(old) = self.active_state {
                if let Some(chunk) = self.script.handler_of(old, "OnExit") {
                    match self.run_chunk(host, chunk, None) {
                        Ok(Halt::ChangeState(redirect)) => {
                            self.active_state = None;
                            self.transition(host, &redirect, depth + 1);
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.fail(&e.to_string());
                            return;
                        }
                    }
                }
            }
        }

        self.active_state = Some(next);
        // Disarms the initial OnEnter when an event transitions before the
        // first update.
        self.phase = Phase::Active;

        if let Some(chunk) = self.script.handler_of(next, "OnEnter") {
            match self.run_chunk(host, chunk, None) {
                Ok(Halt::ChangeState(chained)) => self.transition(host, &chained, depth + 1),
                Ok(_) => {}
                Err(e) => self.fail(&e.to_string()),
            }
        }
    }

    /// Fail-stop: one line to stderr tagged with the script name, then the
    /// component never runs again.
    fn fail(&mut self, message: &str) {
        self.phase = Phase::Invalid;
        let line = format!("[{}] {message}", self.script.name);
        eprintln!("{line}");
        self.last_error = Some(line);
    }
}

/// First value for a declared variable when a scope is seeded.
pub(crate) fn initial_value(
    decl: &VarDecl,
    host: &mut dyn HostRegistry,
) -> Result<Value, RuntimeError> {
    match &decl.init {
        VarInit::Value(value) => Ok(value.clone()),
        // Resolved by name in a later pass, once the scene is populated.
        VarInit::Object(_) => Ok(Value::Handle(EntityId::NONE)),
        VarInit::Construct { type_name, args } => {
            let mut bag = EventArgs::from_pairs(args.clone());
            host.create_user_type(type_name, &mut bag)
        }
        VarInit::Default => default_value(&decl.ty, host),
    }
}

fn default_value(ty: &DeclType, host: &mut dyn HostRegistry) -> Result<Value, RuntimeError> {
    Ok(match ty {
        DeclType::Number => Value::Number(0.0),
        DeclType::Str => Value::Str(String::new()),
        DeclType::Bool => Value::Bool(false),
        DeclType::Vec2 => Value::Vec2(DVec2::ZERO),
        DeclType::Vec3 => Value::Vec3(DVec3::ZERO),
        DeclType::Entity => Value::Handle(EntityId::NONE),
        DeclType::User(type_name) => {
            let mut bag = EventArgs::new();
            return host.create_user_type(type_name, &mut bag);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::host::World;

    fn component(world: &mut World, source: &str) -> Component {
        let def = compile_source("t", source, world);
        assert!(def.valid, "compile failed: {:?}", def.errors);
        let owner = world.spawn("t");
        let mut component = Component::new(Rc::new(def));
        component.bind(owner, &EventArgs::new(), world);
        component
    }

    fn number(component: &Component, name: &str) -> f64 {
        component.globals[name].as_number().unwrap()
    }

    #[test]
    fn first_update_enters_then_later_updates_tick() {
        let mut world = World::new();
        let mut c = component(
            &mut world,
            "Number enters = 0 Number ticks = 0 State S { OnEnter() { enters = enters + 1 } OnUpdate() { ticks = ticks + 1 } }",
        );
        assert_eq!(c.phase(), Phase::Initialized);
        let mut args = EventArgs::new();
        c.update(&mut world, &mut args);
        assert_eq!((number(&c, "enters"), number(&c, "ticks")), (1.0, 0.0));
        c.update(&mut world, &mut args);
        c.update(&mut world, &mut args);
        assert_eq!((number(&c, "enters"), number(&c, "ticks")), (1.0, 2.0));
        assert_eq!(c.phase(), Phase::Active);
    }

    #[test]
    fn change_state_swaps_and_stops_the_handler() {
        let mut world = World::new();
        let mut c = component(
            &mut world,
            "Number x = 0 State Idle { OnEnter() { x = 1 } OnUpdate() { if (x == 1) { ChangeState(Moving) x = 99 } } } State Moving { }",
        );
        let mut args = EventArgs::new();
        c.update(&mut world, &mut args);
        assert_eq!(c.state_name(), Some("Idle"));
        c.update(&mut world, &mut args);
        assert_eq!(c.state_name(), Some("Moving"));
        // Nothing after the ChangeState ran.
        assert_eq!(number(&c, "x"), 1.0);
    }

    #[test]
    fn transition_runs_exit_then_enter() {
        let mut world = World::new();
        let mut c = component(
            &mut world,
            r#"
State A {
    OnExit() { Log(message: "exit A") }
}
State B {
    OnEnter() { Log(message: "enter B") }
}
Function Go() { ChangeState(B) }
"#,
        );
        let mut args = EventArgs::new();
        c.update(&mut world, &mut args);
        c.fire_event(&mut world, "Go", &mut EventArgs::new());
        assert_eq!(world.log, vec!["exit A", "enter B"]);
        assert_eq!(c.state_name(), Some("B"));
    }

    #[test]
    fn exit_handler_can_redirect_a_transition() {
        let mut world = World::new();
        let mut c = component(
            &mut world,
            r#"
State A {
    OnExit() { ChangeState(C) }
}
State B {
    OnEnter() { Log(message: "enter B") }
}
State C {
    OnEnter() { Log(message: "enter C") }
}
Function Go() { ChangeState(B) }
"#,
        );
        c.update(&mut world, &mut EventArgs::new());
        c.fire_event(&mut world, "Go", &mut EventArgs::new());
        // OnExit redirected, so B was never entered.
        assert_eq!(c.state_name(), Some("C"));
        assert_eq!(world.log, vec!["enter C"]);
    }

    #[test]
    fn reentering_a_state_keeps_its_scope() {
        let mut world = World::new();
        let mut c = component(
            &mut world,
            r#"
Number seen = 0
State A {
    Number visits = 0
    OnEnter() { visits = visits + 1 seen = visits }
}
State B { }
Function ToB() { ChangeState(B) }
Function ToA() { ChangeState(A) }
"#,
        );
        c.update(&mut world, &mut EventArgs::new());
        assert_eq!(number(&c, "seen"), 1.0);
        c.fire_event(&mut world, "ToB", &mut EventArgs::new());
        c.fire_event(&mut world, "ToA", &mut EventArgs::new());
        assert_eq!(number(&c, "seen"), 2.0);
    }

    #[test]
    fn runtime_errors_invalidate_permanently() {
        let mut world = World::new();
        let mut c = component(
            &mut world,
            "Number x = 0 State S { OnUpdate() { x = 1 / 0 } }",
        );
        let mut args = EventArgs::new();
        c.update(&mut world, &mut args);
        c.update(&mut world, &mut args);
        assert_eq!(c.phase(), Phase::Invalid);
        assert!(c.error().unwrap().contains("division by zero"));
        assert!(c.error().unwrap().contains("[t]"));
        // Dead for good: neither updates nor events run.
        c.update(&mut world, &mut args);
        assert!(!c.fire_event(&mut world, "anything", &mut EventArgs::new()));
        assert_eq!(number(&c, "x"), 0.0);
    }

    #[test]
    fn overrides_replace_declared_initial_values() {
        let mut world = World::new();
        let def = compile_source("t", "Number hp = 100", &world);
        let owner = world.spawn("t");
        let mut c = Component::new(Rc::new(def));
        let overrides = EventArgs::from_pairs(vec![("hp".to_string(), Value::Number(50.0))]);
        c.bind(owner, &overrides, &mut world);
        assert_eq!(number(&c, "hp"), 50.0);

        // A wrongly tagged override is a bind failure, not a silent coercion.
        let overrides = EventArgs::from_pairs(vec![("hp".to_string(), Value::Bool(true))]);
        c.bind(owner, &overrides, &mut world);
        assert_eq!(c.phase(), Phase::Invalid);
    }

    #[test]
    fn owner_handle_is_seeded() {
        let mut world = World::new();
        let c = component(&mut world, "State S { }");
        let owner = c.owner();
        assert_eq!(c.globals[OWNER_NAME], Value::Handle(owner));
        assert!(!owner.is_none());
    }

    #[test]
    fn entity_references_resolve_once_the_scene_exists() {
        let mut world = World::new();
        let mut c = component(&mut world, r#"Entity boss = "Boss""#);
        assert_eq!(c.globals["boss"], Value::Handle(EntityId::NONE));
        let boss = world.spawn("Boss");
        c.resolve_entity_refs(&world);
        assert_eq!(c.globals["boss"], Value::Handle(boss));
    }

    #[test]
    fn rebind_swaps_definitions_and_recovers() {
        let mut world = World::new();
        let mut c = component(&mut world, "Number x = 0 State S { OnUpdate() { x = 1 / 0 } }");
        let mut args = EventArgs::new();
        c.update(&mut world, &mut args);
        c.update(&mut world, &mut args);
        assert_eq!(c.phase(), Phase::Invalid);

        let fixed = compile_source("t", "Number x = 7 State S { }", &world);
        c.rebind(Rc::new(fixed), &EventArgs::new(), &mut world);
        assert_eq!(c.phase(), Phase::Initialized);
        assert_eq!(number(&c, "x"), 7.0);
    }

    #[test]
    fn binding_an_invalid_definition_fails_stop() {
        let mut world = World::new();
        let def = compile_source("broken", "State {", &world);
        assert!(!def.valid);
        let owner = world.spawn("broken");
        let mut c = Component::new(Rc::new(def));
        c.bind(owner, &EventArgs::new(), &mut world);
        assert_eq!(c.phase(), Phase::Invalid);
        assert!(c.error().unwrap().contains("broken"));
    }
}
