use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use glam::{DVec2, DVec3};

use crate::host::EventArgs;

/// Absolute tolerance used for Number and vector equality.
pub const EPSILON: f64 = 1e-6;

/// Generation-checked index naming one addressable game object.
///
/// A handle whose generation no longer matches the world's slot simply fails to
/// resolve; it can never dangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId {
    pub index: u32,
    pub generation: u32,
}

impl EntityId {
    /// The "no object" handle. This is what the `null` literal evaluates to.
    pub const NONE: EntityId = EntityId {
        index: u32::MAX,
        generation: 0,
    };

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "null")
        } else {
            write!(f, "entity#{}v{}", self.index, self.generation)
        }
    }
}

/// Host-implemented object behind `Value::User`.
///
/// The trait doubles as the per-type metadata surface: a member exists iff
/// `get_member` returns `Some`, a method exists iff `call_method` returns true.
/// Methods communicate results by writing keys into the argument bag, the same
/// convention host operations use.
pub trait UserObject {
    fn type_name(&self) -> &str;
    fn get_member(&self, name: &str) -> Option<Value>;
    /// Returns false if the member does not exist or rejects the value's kind.
    fn set_member(&mut self, name: &str, value: Value) -> bool;
    /// Returns false if no such method exists.
    fn call_method(&mut self, name: &str, args: &mut EventArgs) -> bool;
}

pub type UserRef = Rc<RefCell<dyn UserObject>>;

/// The dynamic value type the language manipulates.
///
/// Everything is copied by value except `User`, which shares a reference to a
/// host-owned object. `Error` is the failure sentinel: no expression ever
/// legitimately produces it, and every VM boundary checks for it.
#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
    Vec2(DVec2),
    Vec3(DVec3),
    Handle(EntityId),
    User(UserRef),
    Error,
}

/// Value tags, used for declaration types and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Bool,
    Number,
    Str,
    Vec2,
    Vec3,
    Handle,
    User,
    Error,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Language-level names, as they appear in declarations.
        let name = match self {
            Kind::Bool => "Bool",
            Kind::Number => "Number",
            Kind::Str => "String",
            Kind::Vec2 => "Vec2",
            Kind::Vec3 => "Vec3",
            Kind::Handle => "Entity",
            Kind::User => "user type",
            Kind::Error => "error",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Bool(_) => Kind::Bool,
            Value::Number(_) => Kind::Number,
            Value::Str(_) => Kind::Str,
            Value::Vec2(_) => Kind::Vec2,
            Value::Vec3(_) => Kind::Vec3,
            Value::Handle(_) => Kind::Handle,
            Value::User(_) => Kind::User,
            Value::Error => Kind::Error,
        }
    }

    /// Boolean coercion, defined for Bool, Number (zero test) and String
    /// (empty test) only. `None` means the kind has no truth value.
    pub fn truthy(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(*n != 0.0),
            Value::Str(s) => Some(!s.is_empty()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vec2(&self) -> Option<DVec2> {
        match self {
            Value::Vec2(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vec3(&self) -> Option<DVec3> {
        match self {
            Value::Vec3(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<EntityId> {
        match self {
            Value::Handle(id) => Some(*id),
            _ => None,
        }
    }
}

pub fn numbers_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

impl PartialEq for Value {
    /// Same-tag comparison with the language's tolerances. Cross-tag compares
    /// are simply unequal here; the VM reports them as errors before this is
    /// ever consulted.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => numbers_equal(*a, *b),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Vec2(a), Value::Vec2(b)) => a.abs_diff_eq(*b, EPSILON),
            (Value::Vec3(a), Value::Vec3(b)) => a.abs_diff_eq(*b, EPSILON),
            (Value::Handle(a), Value::Handle(b)) => a == b,
            (Value::User(a), Value::User(b)) => Rc::ptr_eq(a, b),
            (Value::Error, Value::Error) => true,
            _ => false,
        }
    }
}

fn write_number(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n == (n as i64) as f64 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write_number(f, *n),
            Value::Str(s) => f.write_str(s),
            Value::Vec2(v) => {
                f.write_str("(")?;
                write_number(f, v.x)?;
                f.write_str(", ")?;
                write_number(f, v.y)?;
                f.write_str(")")
            }
            Value::Vec3(v) => {
                f.write_str("(")?;
                write_number(f, v.x)?;
                f.write_str(", ")?;
                write_number(f, v.y)?;
                f.write_str(", ")?;
                write_number(f, v.z)?;
                f.write_str(")")
            }
            Value::Handle(id) => write!(f, "{}", id),
            Value::User(obj) => match obj.try_borrow() {
                Ok(obj) => write!(f, "<{}>", obj.type_name()),
                Err(_) => f.write_str("<user object>"),
            },
            Value::Error => f.write_str("<error>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::User(obj) => match obj.try_borrow() {
                Ok(obj) => write!(f, "User({})", obj.type_name()),
                Err(_) => f.write_str("User(..)"),
            },
            Value::Error => f.write_str("Error"),
            other => write!(f, "{}({})", kind_tag(other.kind()), other),
        }
    }
}

fn kind_tag(kind: Kind) -> &'static str {
    match kind {
        Kind::Bool => "Bool",
        Kind::Number => "Number",
        Kind::Str => "Str",
        Kind::Vec2 => "Vec2",
        Kind::Vec3 => "Vec3",
        Kind::Handle => "Handle",
        Kind::User => "User",
        Kind::Error => "Error",
    }
}
