use super::object::{hash_bytes, Obj, Str, UpvalueState};
use super::table::Table;
use super::value::Value;
use std::mem;

const HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC: usize = 1024 * 1024;
pub const GLOBALS_MAX: usize = 1 << 15;

/// A heap handle. Plain data, compared by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gc(u32);

struct Slot {
    marked: bool,
    obj: Obj,
}

/// The extra roots an allocation site contributes: the VM's value stack,
/// the call-frame closures, and the head of the open upvalue list. The
/// heap's own roots (globals buffer, protect list, `"init"`) are implicit.
#[derive(Clone, Copy)]
pub struct Roots<'a> {
    pub values: &'a [Value],
    pub objects: &'a [Gc],
    pub upvalues: Option<Gc>,
}

impl Default for Roots<'_> {
    fn default() -> Self {
        Roots {
            values: &[],
            objects: &[],
            upvalues: None,
        }
    }
}

pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<Gc>,
    stress: bool,
    /// Keeps compile-time allocations alive while no stack roots them yet.
    protect: Vec<Gc>,
    /// Weak set of every interned string.
    strings: Table,
    /// Paired `(name, value)` slots; even indices hold the interned names.
    globals: Vec<Value>,
    global_names: Table,
    consts: Table,
    init_string: Gc,
}

impl Heap {
    pub fn new() -> Self {
        let mut heap = Heap {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
            gray: Vec::new(),
            stress: false,
            protect: Vec::new(),
            strings: Table::new(),
            globals: Vec::new(),
            global_names: Table::new(),
            consts: Table::new(),
            init_string: Gc(0),
        };
        heap.init_string = heap.intern("init", Roots::default());
        heap
    }

    /// Collect on every allocation; used to prove GC safety in tests.
    pub fn enable_stress(&mut self) {
        self.stress = true;
    }

    pub fn init_string(&self) -> Gc {
        self.init_string
    }

    //>> Object access
    fn slot(&self, handle: Gc) -> &Slot {
        self.slots[handle.0 as usize].as_ref().unwrap()
    }

    pub fn obj(&self, handle: Gc) -> &Obj {
        &self.slot(handle).obj
    }

    fn obj_mut(&mut self, handle: Gc) -> &mut Obj {
        &mut self.slots[handle.0 as usize].as_mut().unwrap().obj
    }

    pub fn string(&self, handle: Gc) -> &str {
        match self.obj(handle) {
            Obj::Str(s) => &s.bytes,
            _ => unreachable!(),
        }
    }

    pub fn string_hash(&self, handle: Gc) -> u32 {
        match self.obj(handle) {
            Obj::Str(s) => s.hash,
            _ => unreachable!(),
        }
    }

    pub fn function(&self, handle: Gc) -> &super::object::Function {
        match self.obj(handle) {
            Obj::Function(f) => f,
            _ => unreachable!(),
        }
    }

    pub fn closure(&self, handle: Gc) -> &super::object::Closure {
        match self.obj(handle) {
            Obj::Closure(c) => c,
            _ => unreachable!(),
        }
    }

    pub fn upvalue(&self, handle: Gc) -> &super::object::Upvalue {
        match self.obj(handle) {
            Obj::Upvalue(u) => u,
            _ => unreachable!(),
        }
    }

    pub fn upvalue_mut(&mut self, handle: Gc) -> &mut super::object::Upvalue {
        match self.obj_mut(handle) {
            Obj::Upvalue(u) => u,
            _ => unreachable!(),
        }
    }

    pub fn class(&self, handle: Gc) -> &super::object::Class {
        match self.obj(handle) {
            Obj::Class(c) => c,
            _ => unreachable!(),
        }
    }

    pub fn class_mut(&mut self, handle: Gc) -> &mut super::object::Class {
        match self.obj_mut(handle) {
            Obj::Class(c) => c,
            _ => unreachable!(),
        }
    }

    pub fn instance(&self, handle: Gc) -> &super::object::Instance {
        match self.obj(handle) {
            Obj::Instance(i) => i,
            _ => unreachable!(),
        }
    }

    pub fn instance_mut(&mut self, handle: Gc) -> &mut super::object::Instance {
        match self.obj_mut(handle) {
            Obj::Instance(i) => i,
            _ => unreachable!(),
        }
    }

    pub fn array_mut(&mut self, handle: Gc) -> &mut super::object::Array {
        match self.obj_mut(handle) {
            Obj::Array(a) => a,
            _ => unreachable!(),
        }
    }
    //<<

    //>> Allocation
    fn size_of(obj: &Obj) -> usize {
        let payload = match obj {
            Obj::Str(s) => s.bytes.len(),
            Obj::Function(f) => f.chunk.len() + f.chunk.constants().len() * mem::size_of::<Value>(),
            Obj::Closure(c) => c.upvalues.len() * mem::size_of::<Gc>(),
            Obj::Upvalue(_) => 0,
            Obj::Class(_) => 64,
            Obj::Instance(_) => 64,
            Obj::Bound(_) => 0,
            Obj::Native(_) => 0,
            Obj::Array(a) => a.items.capacity() * mem::size_of::<Value>(),
        };
        mem::size_of::<Slot>() + payload
    }

    pub fn alloc(&mut self, obj: Obj, roots: Roots) -> Gc {
        self.bytes_allocated += Self::size_of(&obj);
        if self.stress || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }

        let slot = Slot { marked: false, obj };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                Gc(idx)
            }
            None => {
                self.slots.push(Some(slot));
                Gc(self.slots.len() as u32 - 1)
            }
        }
    }

    /// Allocation rooted by the protect list rather than the value stack;
    /// the compiler uses this for everything it creates mid-compile.
    pub fn alloc_protected(&mut self, obj: Obj) -> Gc {
        let handle = self.alloc(obj, Roots::default());
        self.protect.push(handle);
        handle
    }

    pub fn intern(&mut self, bytes: &str, roots: Roots) -> Gc {
        let hash = hash_bytes(bytes.as_bytes());
        if let Some(existing) = self.strings.find_string(hash, |r| self.string(r) == bytes) {
            return existing;
        }

        let handle = self.alloc(
            Obj::Str(Str {
                bytes: bytes.into(),
                hash,
            }),
            roots,
        );
        self.strings.set(handle, hash, Value::Nil);
        handle
    }

    pub fn intern_protected(&mut self, bytes: &str) -> Gc {
        let handle = self.intern(bytes, Roots::default());
        self.protect.push(handle);
        handle
    }

    pub fn release_protected(&mut self) {
        self.protect.clear();
    }
    //<<

    //>> Globals buffer
    /// Index of the value slot paired with `name`, allocating the
    /// `(name, undefined)` pair on first sight.
    pub fn global_slot(&mut self, name: Gc) -> Result<u16, ()> {
        let hash = self.string_hash(name);
        if let Some(Value::Number(idx)) = self.global_names.get(name, hash) {
            return Ok(idx as u16);
        }

        if self.globals.len() / 2 >= GLOBALS_MAX {
            return Err(());
        }
        self.globals.push(Value::Obj(name));
        self.globals.push(Value::Undefined);
        let idx = (self.globals.len() - 1) as u16;
        self.global_names.set(name, hash, Value::Number(idx as f64));
        Ok(idx)
    }

    pub fn global(&self, slot: u16) -> Value {
        self.globals[slot as usize]
    }

    pub fn set_global(&mut self, slot: u16, value: Value) {
        self.globals[slot as usize] = value;
    }

    pub fn global_name(&self, slot: u16) -> Gc {
        match self.globals[slot as usize - 1] {
            Value::Obj(name) => name,
            _ => unreachable!(),
        }
    }

    pub fn mark_const(&mut self, name: Gc) {
        let hash = self.string_hash(name);
        self.consts.set(name, hash, Value::Bool(true));
    }

    pub fn is_const(&self, name: Gc) -> bool {
        self.consts.get(name, self.string_hash(name)).is_some()
    }
    //<<

    //>> Mark and sweep
    fn is_marked(&self, handle: Gc) -> bool {
        self.slot(handle).marked
    }

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    fn mark_object(&mut self, handle: Gc) {
        let slot = self.slots[handle.0 as usize].as_mut().unwrap();
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(handle);
    }

    fn blacken(&mut self, handle: Gc) {
        let mut values: Vec<Value> = Vec::new();
        let mut objects: Vec<Gc> = Vec::new();

        match self.obj(handle) {
            Obj::Str(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    objects.push(name);
                }
                values.extend_from_slice(f.chunk.constants());
            }
            Obj::Closure(c) => {
                objects.push(c.function);
                objects.extend(c.upvalues.iter().copied());
            }
            Obj::Upvalue(u) => {
                if let UpvalueState::Closed(value) = u.state {
                    values.push(value);
                }
                if let Some(next) = u.next {
                    objects.push(next);
                }
            }
            Obj::Class(c) => {
                objects.push(c.name);
                values.push(c.initializer);
                for (key, value) in c.methods.iter() {
                    objects.push(key);
                    values.push(value);
                }
            }
            Obj::Instance(i) => {
                objects.push(i.class);
                for (key, value) in i.fields.iter() {
                    objects.push(key);
                    values.push(value);
                }
            }
            Obj::Bound(b) => {
                values.push(b.receiver);
                objects.push(b.method);
            }
            Obj::Native(n) => {
                objects.push(n.name);
            }
            Obj::Array(a) => {
                values.extend_from_slice(&a.items);
            }
        }

        for value in values {
            self.mark_value(value);
        }
        for object in objects {
            self.mark_object(object);
        }
    }

    pub fn collect(&mut self, roots: Roots) {
        // mark roots
        for &value in roots.values {
            self.mark_value(value);
        }
        for &object in roots.objects {
            self.mark_object(object);
        }
        if let Some(upvalue) = roots.upvalues {
            self.mark_object(upvalue);
        }
        for i in 0..self.protect.len() {
            let handle = self.protect[i];
            self.mark_object(handle);
        }
        for i in 0..self.globals.len() {
            let value = self.globals[i];
            self.mark_value(value);
        }
        let name_keys: Vec<Gc> = self.global_names.iter().map(|(key, _)| key).collect();
        for key in name_keys {
            self.mark_object(key);
        }
        let const_keys: Vec<Gc> = self.consts.iter().map(|(key, _)| key).collect();
        for key in const_keys {
            self.mark_object(key);
        }
        self.mark_object(self.init_string);

        // trace
        while let Some(handle) = self.gray.pop() {
            self.blacken(handle);
        }

        // the intern table is weak: unmarked strings drop out before sweep
        let mut strings = std::mem::take(&mut self.strings);
        strings.retain_keys(|key| self.is_marked(key));
        self.strings = strings;

        // sweep
        let mut freed = 0usize;
        for idx in 0..self.slots.len() {
            match &mut self.slots[idx] {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    freed += Self::size_of(&slot.obj);
                    self.slots[idx] = None;
                    self.free.push(idx as u32);
                }
                None => {}
            }
        }

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
    }
    //<<

    //>> Rendering
    pub fn show(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Undefined => "undefined".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Obj(handle) => self.show_object(handle),
        }
    }

    fn show_function(&self, handle: Gc) -> String {
        match self.function(handle).name {
            Some(name) => format!("<fn {}>", self.string(name)),
            None => "<script>".to_string(),
        }
    }

    fn show_object(&self, handle: Gc) -> String {
        match self.obj(handle) {
            Obj::Str(s) => s.bytes.to_string(),
            Obj::Function(_) => self.show_function(handle),
            Obj::Closure(c) => self.show_function(c.function),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.string(c.name).to_string(),
            Obj::Instance(i) => format!("{} instance", self.string(self.class(i.class).name)),
            Obj::Bound(b) => self.show_function(self.closure(b.method).function),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Array(a) => {
                let items: Vec<String> = a.items.iter().map(|&item| self.show(item)).collect();
                format!("[{}]", items.join(", "))
            }
        }
    }
    //<<

    #[cfg(any(test, feature = "debug-execution"))]
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(feature = "debug-bytecode")]
impl Heap {
    pub fn disassemble(&self, chunk: &super::chunk::Chunk, name: &str) -> String {
        use super::chunk::Instruction::{self, *};
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "== {name} ==");
        let mut ip = 0;
        let mut cur_line = 0;
        while ip < chunk.len() {
            let instr = Instruction::from(chunk.byte(ip));
            let line = chunk.line_at(ip);
            if line != cur_line {
                let _ = write!(out, "{line:>4} | ");
                cur_line = line;
            } else {
                let _ = write!(out, "     | ");
            }
            let _ = write!(out, "{ip:<05} {:20}", format!("{instr:?}"));
            ip += match instr {
                NIL | TRUE | FALSE | POP | DUPLICATE | EQUAL | GREATER | LESS | ADD | SUBTRACT
                | MULTIPLY | DIVIDE | MODULO | NOT | NEGATE | PRINT | CLOSE_UPVALUE | RETURN
                | INHERIT | ARRAY_GET | ARRAY_SET => {
                    let _ = writeln!(out);
                    1
                }
                POPN | DEFINE_GLOBAL | GET_GLOBAL | SET_GLOBAL | GET_LOCAL | SET_LOCAL
                | GET_UPVALUE | SET_UPVALUE | ARRAY => {
                    let _ = writeln!(out, " {}", chunk.read_u16(ip + 1));
                    3
                }
                JUMP | JUMP_IF_FALSE => {
                    let offset = chunk.read_u16(ip + 1) as usize;
                    let _ = writeln!(out, " {offset} (to {})", ip + 3 + offset);
                    3
                }
                LOOP => {
                    let offset = chunk.read_u16(ip + 1) as usize;
                    let _ = writeln!(out, " {offset} (to {})", ip + 3 - offset);
                    3
                }
                CONSTANT | GET_PROPERTY | SET_PROPERTY | GET_SUPER | CLASS | METHOD => {
                    let idx = chunk.read_u24(ip + 1);
                    let _ = writeln!(out, " {idx} ({})", self.show(chunk.constant(idx)));
                    4
                }
                CALL => {
                    let _ = writeln!(out, " {}", chunk.byte(ip + 1));
                    2
                }
                INVOKE | INVOKE_SUPER => {
                    let idx = chunk.read_u24(ip + 1);
                    let _ = writeln!(
                        out,
                        " {idx} ({}) argc {}",
                        self.show(chunk.constant(idx)),
                        chunk.byte(ip + 4)
                    );
                    5
                }
                CLOSURE => {
                    let idx = chunk.read_u24(ip + 1);
                    let function = match chunk.constant(idx) {
                        Value::Obj(f) => f,
                        _ => unreachable!(),
                    };
                    let count = self.function(function).upvalue_count;
                    let _ = writeln!(out, " {idx} ({})", self.show(chunk.constant(idx)));
                    for pair in 0..count {
                        let _ = writeln!(
                            out,
                            "     |       is_local: {}, index: {}",
                            chunk.byte(ip + 4 + pair * 2) != 0,
                            chunk.byte(ip + 5 + pair * 2)
                        );
                    }
                    4 + count * 2
                }
                UNKNOWN => unreachable!(),
            };
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Array, Obj};

    #[test]
    fn interning_is_idempotent() {
        let mut heap = Heap::new();
        let a = heap.intern("hello", Roots::default());
        let b = heap.intern("hello", Roots::default());
        let c = heap.intern("world", Roots::default());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        let before = heap.live_objects();
        heap.alloc(Obj::Array(Array { items: Vec::new() }), Roots::default());
        assert_eq!(heap.live_objects(), before + 1);

        heap.collect(Roots::default());
        assert_eq!(heap.live_objects(), before);
    }

    #[test]
    fn rooted_objects_survive_collection() {
        let mut heap = Heap::new();
        let array = heap.alloc(Obj::Array(Array { items: Vec::new() }), Roots::default());
        let stack = [Value::Obj(array)];
        heap.collect(Roots {
            values: &stack,
            ..Roots::default()
        });
        assert!(matches!(heap.obj(array), Obj::Array(_)));
    }

    #[test]
    fn intern_table_is_weak() {
        let mut heap = Heap::new();
        heap.intern("transient", Roots::default());
        let before = heap.live_objects();
        heap.collect(Roots::default());
        assert_eq!(heap.live_objects(), before - 1);

        // a fresh intern after the sweep gets a fresh object
        let again = heap.intern("transient", Roots::default());
        assert_eq!(heap.string(again), "transient");
    }

    #[test]
    fn protected_objects_survive_until_released() {
        let mut heap = Heap::new();
        let name = heap.intern_protected("held");
        heap.collect(Roots::default());
        assert_eq!(heap.string(name), "held");

        heap.release_protected();
        let before = heap.live_objects();
        heap.collect(Roots::default());
        assert_eq!(heap.live_objects(), before - 1);
    }

    #[test]
    fn globals_are_paired_and_start_undefined() {
        let mut heap = Heap::new();
        let name = heap.intern_protected("answer");
        let slot = heap.global_slot(name).unwrap();
        assert_eq!(slot % 2, 1);
        assert!(heap.global(slot).is_undefined());
        assert_eq!(heap.global_name(slot), name);

        // resolving again reuses the pair
        assert_eq!(heap.global_slot(name).unwrap(), slot);

        heap.set_global(slot, Value::Number(42.0));
        assert_eq!(heap.global(slot), Value::Number(42.0));
    }

    #[test]
    fn reachable_graph_survives_stress_collection() {
        let mut heap = Heap::new();
        heap.enable_stress();
        let hello = heap.intern_protected("hello");
        let array = heap.alloc_protected(Obj::Array(Array {
            items: vec![Value::Obj(hello), Value::Number(1.0)],
        }));
        // every one of these interns collects first
        for i in 0..32 {
            heap.intern_protected(&format!("filler{i}"));
        }
        match heap.obj(array) {
            Obj::Array(a) => assert_eq!(a.items[0], Value::Obj(hello)),
            _ => unreachable!(),
        }
        assert_eq!(heap.string(hello), "hello");
    }
}
