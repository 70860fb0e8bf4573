//! Runtime values and heap object layouts.
//!
//! Immediates (null, booleans, longs, doubles) are stored inline in
//! [`Value`]; everything else lives in the [`Heap`](super::heap::Heap) and is
//! referenced by handle.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use super::chunk::FunctionDef;
use super::heap::HeapId;
use super::natives::NativeFn;

/// A runtime value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    /// A heap object.
    Ref(HeapId),
}

impl Value {
    pub fn heap_id(self) -> Option<HeapId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_null(self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// DJB2 over the UTF-8 bytes.
pub fn djb2(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(5381u32, |hash, b| hash.wrapping_mul(33).wrapping_add(*b as u32))
}

/// An immutable string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrObject {
    pub text: Rc<str>,
    /// Fixed at construction.
    pub hash: u32,
}

impl StrObject {
    pub fn new(text: impl Into<Rc<str>>) -> Self {
        let text = text.into();
        let hash = djb2(text.as_bytes());
        Self { text, hash }
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// A map key: maps are keyed by strings or longs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Str(Rc<str>),
    Long(i64),
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Str(s) => write!(f, "\"{}\"", s),
            MapKey::Long(n) => write!(f, "{}", n),
        }
    }
}

/// Ordered hash map used for maps, properties and class members.
pub type ValueMap = IndexMap<MapKey, Value, ahash::RandomState>;

/// Name-keyed table for instance properties and class members.
pub type Members = IndexMap<Rc<str>, Value, ahash::RandomState>;

/// A builtin implemented in Rust.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: Rc<str>,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native {}>", self.name)
    }
}

/// A callable.
#[derive(Debug, Clone)]
pub enum FunctionObject {
    Native(NativeFunction),
    /// A compiled function; `unit` identifies the loaded program whose
    /// symbol and constant tables its instructions index into.
    Lang { def: Rc<FunctionDef>, unit: usize },
}

impl FunctionObject {
    pub fn name(&self) -> &str {
        match self {
            FunctionObject::Native(native) => &native.name,
            FunctionObject::Lang { def, .. } => &def.name,
        }
    }
}

/// A class: methods plus an optional base class.
#[derive(Debug, Clone)]
pub struct ClassObject {
    pub name: Rc<str>,
    pub base: Option<HeapId>,
    pub members: Members,
}

/// An instance. `class` and `base_instance` are traced by the collector but
/// do not hold a reference count.
#[derive(Debug, Clone)]
pub struct InstanceObject {
    pub class: HeapId,
    pub properties: Members,
    /// The parallel instance of the base class, if the class has one.
    pub base_instance: Option<HeapId>,
}

/// Payload of a heap cell.
#[derive(Debug, Clone)]
pub enum HeapData {
    Str(StrObject),
    Array(Vec<Value>),
    Map(ValueMap),
    Function(FunctionObject),
    Class(ClassObject),
    Instance(InstanceObject),
}

impl HeapData {
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapData::Str(_) => "string",
            HeapData::Array(_) => "array",
            HeapData::Map(_) => "map",
            HeapData::Function(_) => "function",
            HeapData::Class(_) => "class",
            HeapData::Instance(_) => "instance",
        }
    }

    /// Handles this object holds a reference count on.
    pub fn owned_children(&self, out: &mut Vec<HeapId>) {
        match self {
            HeapData::Str(_) | HeapData::Function(_) => {}
            HeapData::Array(items) => out.extend(items.iter().filter_map(|v| v.heap_id())),
            HeapData::Map(map) => out.extend(map.values().filter_map(|v| v.heap_id())),
            HeapData::Class(class) => {
                out.extend(class.base);
                out.extend(class.members.values().filter_map(|v| v.heap_id()));
            }
            HeapData::Instance(instance) => {
                out.extend(instance.properties.values().filter_map(|v| v.heap_id()));
            }
        }
    }

    /// Every handle reachable in one step, owned or not.
    pub fn traced_children(&self, out: &mut Vec<HeapId>) {
        self.owned_children(out);
        if let HeapData::Instance(instance) = self {
            out.push(instance.class);
            out.extend(instance.base_instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_djb2_known_values() {
        assert_eq!(djb2(b""), 5381);
        assert_eq!(djb2(b"a"), 5381 * 33 + 97);
        assert_eq!(StrObject::new("a").hash, djb2(b"a"));
    }

    #[test]
    fn test_str_length_counts_chars() {
        let s = StrObject::new("héllo");
        assert_eq!(s.len(), 5);
        assert!(!s.is_empty());
    }

    #[test]
    fn test_map_key_display() {
        assert_eq!(MapKey::Str("a".into()).to_string(), "\"a\"");
        assert_eq!(MapKey::Long(3).to_string(), "3");
    }
}
