use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use glam::{DVec2, DVec3};

use crate::component::Component;
use crate::value::{EntityId, UserObject, Value};
use crate::vm::RuntimeError;

// ── Event arguments ──────────────────────────────────────────────────

/// Ordered name → value bag passed into events, host operations and user-type
/// factories. Insertion order is preserved so iteration is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventArgs {
    entries: Vec<(String, Value)>,
}

impl EventArgs {
    pub fn new() -> Self {
        EventArgs::default()
    }

    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        let mut args = EventArgs::new();
        for (name, value) in pairs {
            args.set(name, value);
        }
        args
    }

    /// Replaces an existing entry in place, otherwise appends.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_number)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn handle(&self, name: &str) -> Option<EntityId> {
        self.get(name).and_then(Value::as_handle)
    }

    pub fn vec2(&self, name: &str) -> Option<DVec2> {
        self.get(name).and_then(Value::as_vec2)
    }

    pub fn vec3(&self, name: &str) -> Option<DVec3> {
        self.get(name).and_then(Value::as_vec3)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Host registry seam ───────────────────────────────────────────────

/// Everything the compiler and VM are allowed to ask of the surrounding
/// engine. Injected at every call site; the crate holds no global state.
pub trait HostRegistry {
    /// Known at compile time too: script functions may not shadow these.
    fn is_operation_registered(&self, name: &str) -> bool;

    /// Fire-and-forget dispatch. Results travel back through `args` keys.
    fn invoke_operation(&mut self, name: &str, args: &mut EventArgs)
    -> Result<(), RuntimeError>;

    fn resolve_object(&self, name: &str) -> Option<EntityId>;

    fn component(&self, id: EntityId) -> Option<&Rc<RefCell<Component>>>;

    fn is_user_type(&self, name: &str) -> bool;

    fn create_user_type(
        &mut self,
        type_name: &str,
        args: &mut EventArgs,
    ) -> Result<Value, RuntimeError>;
}

// ── Reference world ──────────────────────────────────────────────────

struct Slot {
    generation: u32,
    live: bool,
    name: String,
    component: Option<Rc<RefCell<Component>>>,
}

/// Minimal host: a generation-checked slot array of named objects, a few
/// registered operations, and one registered user type. Enough to run scripts
/// from tests and the CLI without an engine.
pub struct World {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_name: HashMap<String, EntityId>,
    rng: fastrand::Rng,
    pub log: Vec<String>,
}

impl World {
    pub fn new() -> Self {
        World {
            slots: Vec::new(),
            free: Vec::new(),
            by_name: HashMap::new(),
            rng: fastrand::Rng::new(),
            log: Vec::new(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        let mut world = World::new();
        world.rng = fastrand::Rng::with_seed(seed);
        world
    }

    pub fn spawn(&mut self, name: &str) -> EntityId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.live = true;
                slot.name = name.to_string();
                slot.component = None;
                EntityId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    live: true,
                    name: name.to_string(),
                    component: None,
                });
                EntityId {
                    index,
                    generation: 0,
                }
            }
        };
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Bumps the slot generation so stale handles stop resolving.
    pub fn despawn(&mut self, id: EntityId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if !slot.live || slot.generation != id.generation {
            return false;
        }
        slot.live = false;
        slot.generation += 1;
        slot.component = None;
        self.by_name.remove(&slot.name);
        self.free.push(id.index);
        true
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|s| s.live && s.generation == id.generation)
    }

    pub fn name_of(&self, id: EntityId) -> Option<&str> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.live && s.generation == id.generation)
            .map(|s| s.name.as_str())
    }

    pub fn attach(&mut self, id: EntityId, component: Component) {
        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            if slot.live && slot.generation == id.generation {
                slot.component = Some(Rc::new(RefCell::new(component)));
            }
        }
    }

    /// Spawn + bind + attach in one step.
    pub fn spawn_scripted(
        &mut self,
        name: &str,
        def: Rc<crate::script::ScriptDefinition>,
        overrides: &EventArgs,
    ) -> EntityId {
        let id = self.spawn(name);
        let mut component = Component::new(def);
        component.bind(id, overrides, self);
        self.attach(id, component);
        id
    }

    pub fn update_entity(&mut self, id: EntityId, args: &mut EventArgs) {
        let Some(rc) = self.component(id).cloned() else {
            return;
        };
        if let Ok(mut component) = rc.try_borrow_mut() {
            component.update(self, args);
        }
    }

    pub fn fire_entity_event(&mut self, id: EntityId, event: &str, args: &mut EventArgs) -> bool {
        let Some(rc) = self.component(id).cloned() else {
            return false;
        };
        match rc.try_borrow_mut() {
            Ok(mut component) => component.fire_event(self, event, args),
            Err(_) => false,
        }
    }

    /// Resolves object-reference variables on every attached component.
    /// Called once after a scene's objects have all been spawned.
    pub fn resolve_references(&mut self) {
        let components: Vec<Rc<RefCell<Component>>> = self
            .slots
            .iter()
            .filter(|s| s.live)
            .filter_map(|s| s.component.clone())
            .collect();
        for rc in components {
            if let Ok(mut component) = rc.try_borrow_mut() {
                component.resolve_entity_refs(self);
            }
        }
    }

    fn op_log(&mut self, args: &mut EventArgs) -> Result<(), RuntimeError> {
        let message = args.get("message").ok_or_else(|| RuntimeError::Host {
            message: "Log needs a 'message' argument".to_string(),
        })?;
        let rendered = message.to_string();
        println!("{rendered}");
        self.log.push(rendered);
        Ok(())
    }

    fn op_random(&mut self, args: &mut EventArgs) -> Result<(), RuntimeError> {
        let min = args.number("min").unwrap_or(0.0);
        let max = args.number("max").unwrap_or(1.0);
        let value = min + self.rng.f64() * (max - min);
        args.set("value", Value::Number(value));
        Ok(())
    }

    fn op_distance(&mut self, args: &mut EventArgs) -> Result<(), RuntimeError> {
        let value = match (args.get("a"), args.get("b")) {
            (Some(Value::Vec2(a)), Some(Value::Vec2(b))) => (*a - *b).length(),
            (Some(Value::Vec3(a)), Some(Value::Vec3(b))) => (*a - *b).length(),
            _ => {
                return Err(RuntimeError::Host {
                    message: "Distance needs 'a' and 'b' vectors of the same size".to_string(),
                });
            }
        };
        args.set("value", Value::Number(value));
        Ok(())
    }

    fn op_find(&mut self, args: &mut EventArgs) -> Result<(), RuntimeError> {
        let name = args.string("name").ok_or_else(|| RuntimeError::Host {
            message: "Find needs a 'name' argument".to_string(),
        })?;
        let id = self.resolve_object(name).unwrap_or(EntityId::NONE);
        args.set("result", Value::Handle(id));
        Ok(())
    }

    fn op_heal(&mut self, args: &mut EventArgs) -> Result<(), RuntimeError> {
        let target = args.handle("target").ok_or_else(|| RuntimeError::Host {
            message: "Heal needs a 'target' handle".to_string(),
        })?;
        let amount = args.number("amount").ok_or_else(|| RuntimeError::Host {
            message: "Heal needs a numeric 'amount'".to_string(),
        })?;
        let rc = self
            .component(target)
            .cloned()
            .ok_or(RuntimeError::DeadHandle { id: target })?;
        let mut component = rc.try_borrow_mut().map_err(|_| RuntimeError::Reentrant {
            name: self.name_of(target).unwrap_or("?").to_string(),
        })?;
        match component.globals.get_mut("hp") {
            Some(Value::Number(hp)) => {
                *hp += amount;
                Ok(())
            }
            _ => Err(RuntimeError::Host {
                message: "Heal target has no numeric 'hp'".to_string(),
            }),
        }
    }
}

impl Default for World {
    fn default() -> Self {
        World::new()
    }
}

impl HostRegistry for World {
    fn is_operation_registered(&self, name: &str) -> bool {
        matches!(name, "Log" | "Random" | "Distance" | "Find" | "Heal")
    }

    fn invoke_operation(
        &mut self,
        name: &str,
        args: &mut EventArgs,
    ) -> Result<(), RuntimeError> {
        match name {
            "Log" => self.op_log(args),
            "Random" => self.op_random(args),
            "Distance" => self.op_distance(args),
            "Find" => self.op_find(args),
            "Heal" => self.op_heal(args),
            _ => Err(RuntimeError::UnknownFunction {
                name: name.to_string(),
            }),
        }
    }

    fn resolve_object(&self, name: &str) -> Option<EntityId> {
        self.by_name.get(name).copied().filter(|id| self.contains(*id))
    }

    fn component(&self, id: EntityId) -> Option<&Rc<RefCell<Component>>> {
        let slot = self.slots.get(id.index as usize)?;
        if !slot.live || slot.generation != id.generation {
            return None;
        }
        slot.component.as_ref()
    }

    fn is_user_type(&self, name: &str) -> bool {
        name == "Timer"
    }

    fn create_user_type(
        &mut self,
        type_name: &str,
        args: &mut EventArgs,
    ) -> Result<Value, RuntimeError> {
        match type_name {
            "Timer" => {
                let duration = args.number("duration").unwrap_or(0.0);
                Ok(Value::User(Rc::new(RefCell::new(Timer {
                    duration,
                    elapsed: 0.0,
                }))))
            }
            _ => Err(RuntimeError::UnknownUserType {
                type_name: type_name.to_string(),
            }),
        }
    }
}

// ── Timer ────────────────────────────────────────────────────────────

/// The one registered user type: a countdown exercising every part of the
/// UserObject surface (members, rejection of bad tags, methods, bag results).
pub struct Timer {
    pub duration: f64,
    pub elapsed: f64,
}

impl UserObject for Timer {
    fn type_name(&self) -> &str {
        "Timer"
    }

    fn get_member(&self, name: &str) -> Option<Value> {
        match name {
            "duration" => Some(Value::Number(self.duration)),
            "elapsed" => Some(Value::Number(self.elapsed)),
            "done" => Some(Value::Bool(self.elapsed >= self.duration)),
            _ => None,
        }
    }

    fn set_member(&mut self, name: &str, value: Value) -> bool {
        let Value::Number(n) = value else {
            return false;
        };
        match name {
            "duration" => self.duration = n,
            "elapsed" => self.elapsed = n,
            // `done` is derived, not writable.
            _ => return false,
        }
        true
    }

    fn call_method(&mut self, name: &str, args: &mut EventArgs) -> bool {
        match name {
            "Reset" => {
                self.elapsed = 0.0;
                true
            }
            "Advance" => {
                let dt = args.number("dt").unwrap_or(0.0);
                self.elapsed += dt;
                args.set("done", Value::Bool(self.elapsed >= self.duration));
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_args_preserve_insertion_order() {
        let mut args = EventArgs::new();
        args.set("b", Value::Number(2.0));
        args.set("a", Value::Number(1.0));
        args.set("b", Value::Number(3.0));
        let names: Vec<&str> = args.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(args.number("b"), Some(3.0));
    }

    #[test]
    fn stale_handles_stop_resolving_after_despawn() {
        let mut world = World::new();
        let id = world.spawn("guard");
        assert!(world.contains(id));
        assert_eq!(world.resolve_object("guard"), Some(id));

        assert!(world.despawn(id));
        assert!(!world.contains(id));
        assert_eq!(world.resolve_object("guard"), None);

        // The slot is reused under a new generation; the old handle stays dead.
        let reborn = world.spawn("archer");
        assert_eq!(reborn.index, id.index);
        assert_ne!(reborn.generation, id.generation);
        assert!(!world.contains(id));
        assert!(world.contains(reborn));
    }

    #[test]
    fn random_op_is_deterministic_under_a_seed() {
        let run = |seed| {
            let mut world = World::with_seed(seed);
            let mut args = EventArgs::new();
            args.set("min", Value::Number(0.0));
            args.set("max", Value::Number(10.0));
            world.invoke_operation("Random", &mut args).unwrap();
            args.number("value").unwrap()
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn find_op_reports_missing_objects_as_null() {
        let mut world = World::new();
        let mut args = EventArgs::new();
        args.set("name", Value::Str("nobody".into()));
        world.invoke_operation("Find", &mut args).unwrap();
        assert_eq!(args.handle("result"), Some(EntityId::NONE));
    }

    #[test]
    fn distance_op_rejects_mixed_sizes() {
        let mut world = World::new();
        let mut args = EventArgs::new();
        args.set("a", Value::Vec2(DVec2::new(0.0, 0.0)));
        args.set("b", Value::Vec3(DVec3::new(1.0, 0.0, 0.0)));
        assert!(world.invoke_operation("Distance", &mut args).is_err());
    }

    #[test]
    fn timer_members_and_methods() {
        let mut timer = Timer {
            duration: 2.0,
            elapsed: 0.0,
        };
        assert_eq!(timer.get_member("duration"), Some(Value::Number(2.0)));
        assert_eq!(timer.get_member("done"), Some(Value::Bool(false)));
        assert_eq!(timer.get_member("nope"), None);

        assert!(timer.set_member("elapsed", Value::Number(1.5)));
        assert!(!timer.set_member("elapsed", Value::Str("bad".into())));
        assert!(!timer.set_member("done", Value::Number(1.0)));

        let mut args = EventArgs::new();
        args.set("dt", Value::Number(0.5));
        assert!(timer.call_method("Advance", &mut args));
        assert_eq!(args.boolean("done"), Some(true));
        assert!(timer.call_method("Reset", &mut args));
        assert_eq!(timer.get_member("elapsed"), Some(Value::Number(0.0)));
        assert!(!timer.call_method("Explode", &mut args));
    }

    #[test]
    fn resolve_references_wires_up_named_entities() {
        let mut world = World::new();
        let def = Rc::new(crate::compiler::compile_source(
            "pair",
            r#"Entity other = "B""#,
            &world,
        ));
        world.spawn_scripted("A", def, &EventArgs::new());
        // "B" does not exist yet when A binds, so the reference starts null.
        let a = world.resolve_object("A").unwrap();
        {
            let component = world.component(a).unwrap().borrow();
            assert_eq!(component.globals["other"], Value::Handle(EntityId::NONE));
        }

        let b = world.spawn("B");
        world.resolve_references();
        let component = world.component(a).unwrap().borrow();
        assert_eq!(component.globals["other"], Value::Handle(b));
    }
}
