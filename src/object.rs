use super::chunk::Chunk;
use super::heap::Gc;
use super::table::Table;
use super::value::Value;
use super::vm::Vm;

/// FNV-1a, the hash every interned string carries.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash = 2166136261u32;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

pub enum Obj {
    Str(Str),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    Bound(BoundMethod),
    Native(Native),
    Array(Array),
}

/// An interned, immutable byte string.
pub struct Str {
    pub bytes: Box<str>,
    pub hash: u32,
}

/// A compiled function: the chunk plus the metadata the VM needs to build a
/// closure over it. `name` is `None` for the top-level script.
pub struct Function {
    pub name: Option<Gc>,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
}

pub struct Closure {
    pub function: Gc,
    pub upvalues: Vec<Gc>,
}

/// Open while the captured stack slot is live, closed once the slot leaves
/// scope. Open upvalues thread a list ordered by descending slot.
pub struct Upvalue {
    pub state: UpvalueState,
    pub next: Option<Gc>,
}

#[derive(Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct Class {
    pub name: Gc,
    pub methods: Table,
    /// Mirrors the method table entry for `"init"` so construction skips a
    /// lookup.
    pub initializer: Value,
}

pub struct Instance {
    pub class: Gc,
    pub fields: Table,
}

pub struct BoundMethod {
    pub receiver: Value,
    pub method: Gc,
}

pub struct Native {
    pub name: Gc,
    pub arity: u8,
    pub function: NativeFn,
}

pub struct Array {
    pub items: Vec<Value>,
}

impl Array {
    /// Capacity rounds up to a power of two.
    pub fn from_slice(values: &[Value]) -> Self {
        let capacity = values.len().next_power_of_two();
        let mut items = Vec::with_capacity(capacity);
        items.extend_from_slice(values);
        Array { items }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(hash_bytes(b""), 2166136261);
        assert_eq!(hash_bytes(b"a"), 0xe40c292c);
        assert_eq!(hash_bytes(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn array_capacity_rounds_to_power_of_two() {
        let values = [Value::Nil; 5];
        let array = Array::from_slice(&values);
        assert_eq!(array.items.len(), 5);
        assert!(array.items.capacity() >= 8);
    }
}
