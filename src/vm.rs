use super::chunk::Chunk;
use super::chunk::Instruction::{self, *};
use super::compiler::Compiler;
use super::heap::{Gc, Heap, Roots};
use super::natives;
use super::object::{Array, BoundMethod, Class, Closure, NativeFn, Obj, Upvalue, UpvalueState};
use super::reporter::{Phase, Report, Reporter};
use super::table::Table;
use super::value::Value;
use std::io::{self, Write};
use std::mem;
use std::time::Instant;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

/// One invocation: the closure being run, the next instruction offset into
/// its chunk, and the stack slot where its slot 0 lives.
struct CallFrame {
    closure: Gc,
    ip: usize,
    base: usize,
}

enum CalleeKind {
    Closure,
    Class { initializer: Value },
    Bound { receiver: Value, method: Gc },
    Native { arity: u8, function: NativeFn },
    NotCallable,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Head of the open upvalue list, strictly decreasing by stack slot.
    open_upvalues: Option<Gc>,
    pub heap: Heap,
    created_at: Instant,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: None,
            heap: Heap::new(),
            created_at: Instant::now(),
            out,
        };
        natives::install(&mut vm);
        vm
    }

    /// Compiles and runs `source` to completion. Globals persist across
    /// calls, which is what gives the REPL its state.
    pub fn interpret(
        &mut self,
        source: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<(), InterpretError> {
        let function = match Compiler::new(source, &mut self.heap, reporter).compile() {
            Ok(function) => function,
            Err(()) => {
                self.heap.release_protected();
                return Err(InterpretError::Compile);
            }
        };

        self.push(Value::Obj(function)).unwrap();
        let closure = self.alloc(Obj::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        let top = self.stack.len() - 1;
        self.stack[top] = Value::Obj(closure);
        self.heap.release_protected();

        if let Err(msg) = self.call_closure(closure, 0) {
            self.runtime_error(&msg, reporter);
            return Err(InterpretError::Runtime);
        }
        self.run(reporter).map_err(|_| InterpretError::Runtime)
    }

    pub(crate) fn uptime(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64()
    }

    //>> Allocation with the VM's roots
    fn alloc(&mut self, obj: Obj) -> Gc {
        let closures: Vec<Gc> = self.frames.iter().map(|frame| frame.closure).collect();
        let Vm {
            heap,
            stack,
            open_upvalues,
            ..
        } = self;
        heap.alloc(
            obj,
            Roots {
                values: stack.as_slice(),
                objects: &closures,
                upvalues: *open_upvalues,
            },
        )
    }

    pub(crate) fn intern(&mut self, bytes: &str) -> Gc {
        let closures: Vec<Gc> = self.frames.iter().map(|frame| frame.closure).collect();
        let Vm {
            heap,
            stack,
            open_upvalues,
            ..
        } = self;
        heap.intern(
            bytes,
            Roots {
                values: stack.as_slice(),
                objects: &closures,
                upvalues: *open_upvalues,
            },
        )
    }

    pub(crate) fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let name_ref = self.heap.intern_protected(name);
        let slot = self.heap.global_slot(name_ref).unwrap();
        let native = self.alloc(Obj::Native(super::object::Native {
            name: name_ref,
            arity,
            function,
        }));
        self.heap.set_global(slot, Value::Obj(native));
    }
    //<<

    //>> Stack manipulation
    fn push(&mut self, value: Value) -> Result<(), String> {
        if self.stack.len() == STACK_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }
    //<<

    //>> Frame plumbing
    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn current_chunk(&self) -> &Chunk {
        let frame = self.frame();
        &self.heap.function(self.heap.closure(frame.closure).function).chunk
    }

    fn read_byte_oper(&self, offset: usize) -> u8 {
        self.current_chunk().byte(self.frame().ip + offset)
    }

    fn read_u16_oper(&self, offset: usize) -> u16 {
        self.current_chunk().read_u16(self.frame().ip + offset)
    }

    fn read_u24_oper(&self, offset: usize) -> usize {
        self.current_chunk().read_u24(self.frame().ip + offset)
    }

    /// Reads a u24 constant operand holding an interned name.
    fn read_string_oper(&self, offset: usize) -> Gc {
        match self.current_chunk().constant(self.read_u24_oper(offset)) {
            Value::Obj(handle) => handle,
            _ => unreachable!(),
        }
    }
    //<<

    //>> Errors
    fn runtime_error(&mut self, msg: &str, reporter: &mut dyn Reporter) {
        let mut trace = Vec::new();
        for (idx, frame) in self.frames.iter().enumerate().rev() {
            let function = self.heap.closure(frame.closure).function;
            // caller frames already advanced past their call instruction
            let offset = if idx == self.frames.len() - 1 {
                frame.ip
            } else {
                frame.ip.saturating_sub(1)
            };
            let line = self.heap.function(function).chunk.line_at(offset);
            trace.push(match self.heap.function(function).name {
                Some(name) => format!("[line {}] in {}()", line, self.heap.string(name)),
                None => format!("[line {line}] in script"),
            });
        }
        reporter.error(Report::with_trace(Phase::Runtime, msg.to_string(), trace));

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }
    //<<

    //>> Calling
    fn call_closure(&mut self, closure: Gc, argc: usize) -> Result<(), String> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity as usize;
        if argc != arity {
            return Err(format!("Expected {arity} arguments but got {argc}."));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), String> {
        let handle = match callee {
            Value::Obj(handle) => handle,
            _ => return Err("Can only call functions and classes.".to_string()),
        };

        let kind = match self.heap.obj(handle) {
            Obj::Closure(_) => CalleeKind::Closure,
            Obj::Class(c) => CalleeKind::Class {
                initializer: c.initializer,
            },
            Obj::Bound(b) => CalleeKind::Bound {
                receiver: b.receiver,
                method: b.method,
            },
            Obj::Native(n) => CalleeKind::Native {
                arity: n.arity,
                function: n.function,
            },
            _ => CalleeKind::NotCallable,
        };

        match kind {
            CalleeKind::Closure => self.call_closure(handle, argc),
            CalleeKind::Class { initializer } => {
                let base = self.stack.len() - argc - 1;
                let instance = self.alloc(Obj::Instance(super::object::Instance {
                    class: handle,
                    fields: Table::new(),
                }));
                self.stack[base] = Value::Obj(instance);

                if let Value::Obj(init) = initializer {
                    self.call_closure(init, argc)
                } else if argc != 0 {
                    Err(format!("Expected 0 arguments but got {argc}."))
                } else {
                    Ok(())
                }
            }
            CalleeKind::Bound { receiver, method } => {
                let base = self.stack.len() - argc - 1;
                self.stack[base] = receiver;
                self.call_closure(method, argc)
            }
            CalleeKind::Native { arity, function } => {
                if argc != arity as usize {
                    return Err(format!("Expected {arity} arguments but got {argc}."));
                }
                let base = self.stack.len() - argc - 1;
                let args: Vec<Value> = self.stack[base + 1..].to_vec();
                let result = function(self, &args)?;
                self.stack.truncate(base);
                self.push(result)
            }
            CalleeKind::NotCallable => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn invoke(&mut self, name: Gc, argc: usize) -> Result<(), String> {
        let receiver = self.peek(argc);
        let instance = match receiver {
            Value::Obj(handle) if matches!(self.heap.obj(handle), Obj::Instance(_)) => handle,
            _ => return Err("Only instances have methods.".to_string()),
        };

        // a field holding a callable shadows any method of the same name
        let hash = self.heap.string_hash(name);
        if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
            let base = self.stack.len() - argc - 1;
            self.stack[base] = field;
            return self.call_value(field, argc);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(&mut self, class: Gc, name: Gc, argc: usize) -> Result<(), String> {
        let hash = self.heap.string_hash(name);
        match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => self.call_closure(method, argc),
            _ => Err(format!("Undefined property '{}'.", self.heap.string(name))),
        }
    }

    fn bind_method(&mut self, class: Gc, name: Gc) -> Result<(), String> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.class(class).methods.get(name, hash) {
            Some(Value::Obj(method)) => method,
            _ => return Err(format!("Undefined property '{}'.", self.heap.string(name))),
        };

        let receiver = self.peek(0);
        let bound = self.alloc(Obj::Bound(BoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound))
    }
    //<<

    //>> Upvalues
    fn capture_upvalue(&mut self, location: usize) -> Gc {
        let mut prev: Option<Gc> = None;
        let mut current = self.open_upvalues;

        while let Some(handle) = current {
            let upvalue = self.heap.upvalue(handle);
            let next = upvalue.next;
            let loc = match upvalue.state {
                UpvalueState::Open(loc) => loc,
                UpvalueState::Closed(_) => unreachable!(),
            };
            if loc == location {
                return handle;
            }
            if loc < location {
                break;
            }
            prev = Some(handle);
            current = next;
        }

        let created = self.alloc(Obj::Upvalue(Upvalue {
            state: UpvalueState::Open(location),
            next: current,
        }));
        match prev {
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Closes every open upvalue at or above `watermark`, copying the stack
    /// value into the upvalue so it outlives its slot.
    fn close_upvalues(&mut self, watermark: usize) {
        while let Some(handle) = self.open_upvalues {
            let upvalue = self.heap.upvalue(handle);
            let next = upvalue.next;
            let location = match upvalue.state {
                UpvalueState::Open(location) => location,
                UpvalueState::Closed(_) => unreachable!(),
            };
            if location < watermark {
                break;
            }

            let value = self.stack[location];
            let upvalue = self.heap.upvalue_mut(handle);
            upvalue.state = UpvalueState::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }
    //<<

    //>> Arithmetic helpers
    fn numbers(&mut self) -> Result<(f64, f64), String> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            _ => Err("Operands must be numbers.".to_string()),
        }
    }

    fn is_string(&self, handle: Gc) -> bool {
        matches!(self.heap.obj(handle), Obj::Str(_))
    }
    //<<

    fn run(&mut self, reporter: &mut dyn Reporter) -> Result<(), ()> {
        loop {
            let ip = self.frame().ip;
            let instr = Instruction::from(self.current_chunk().byte(ip));

            if cfg!(feature = "debug-execution") {
                eprintln!("[DEBUG] {ip:05} {instr:?} (stack {})", self.stack.len());
            }

            match self.execute(instr) {
                Ok(advance) => {
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.frame_mut().ip += advance;
                }
                Err(msg) => {
                    self.runtime_error(&msg, reporter);
                    return Err(());
                }
            }
        }
    }

    /// Executes one instruction, returning how far to advance the ip.
    /// Instructions that retarget it themselves return 0.
    fn execute(&mut self, instr: Instruction) -> Result<usize, String> {
        match instr {
            CONSTANT => {
                let value = self.current_chunk().constant(self.read_u24_oper(1));
                self.push(value)?;
                Ok(4)
            }
            NIL => {
                self.push(Value::Nil)?;
                Ok(1)
            }
            TRUE => {
                self.push(Value::Bool(true))?;
                Ok(1)
            }
            FALSE => {
                self.push(Value::Bool(false))?;
                Ok(1)
            }
            POP => {
                self.pop();
                Ok(1)
            }
            POPN => {
                let n = self.read_u16_oper(1) as usize;
                let len = self.stack.len();
                self.stack.truncate(len - n);
                Ok(3)
            }
            DUPLICATE => {
                let value = self.peek(0);
                self.push(value)?;
                Ok(1)
            }
            DEFINE_GLOBAL => {
                let slot = self.read_u16_oper(1);
                let value = self.pop();
                self.heap.set_global(slot, value);
                Ok(3)
            }
            GET_GLOBAL => {
                let slot = self.read_u16_oper(1);
                let value = self.heap.global(slot);
                if value.is_undefined() {
                    let name = self.heap.global_name(slot);
                    return Err(format!("Undefined variable '{}'.", self.heap.string(name)));
                }
                self.push(value)?;
                Ok(3)
            }
            SET_GLOBAL => {
                let slot = self.read_u16_oper(1);
                if self.heap.global(slot).is_undefined() {
                    let name = self.heap.global_name(slot);
                    return Err(format!("Undefined variable '{}'.", self.heap.string(name)));
                }
                let value = self.peek(0);
                self.heap.set_global(slot, value);
                Ok(3)
            }
            GET_LOCAL => {
                let slot = self.read_u16_oper(1) as usize;
                let value = self.stack[self.frame().base + slot];
                self.push(value)?;
                Ok(3)
            }
            SET_LOCAL => {
                let slot = self.read_u16_oper(1) as usize;
                let idx = self.frame().base + slot;
                self.stack[idx] = self.peek(0);
                Ok(3)
            }
            GET_UPVALUE => {
                let slot = self.read_u16_oper(1) as usize;
                let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                let value = match self.heap.upvalue(upvalue).state {
                    UpvalueState::Open(location) => self.stack[location],
                    UpvalueState::Closed(value) => value,
                };
                self.push(value)?;
                Ok(3)
            }
            SET_UPVALUE => {
                let slot = self.read_u16_oper(1) as usize;
                let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                let value = self.peek(0);
                match self.heap.upvalue(upvalue).state {
                    UpvalueState::Open(location) => self.stack[location] = value,
                    UpvalueState::Closed(_) => {
                        self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value)
                    }
                }
                Ok(3)
            }
            GET_PROPERTY => {
                let name = self.read_string_oper(1);
                let instance = match self.peek(0) {
                    Value::Obj(handle) if matches!(self.heap.obj(handle), Obj::Instance(_)) => {
                        handle
                    }
                    _ => return Err("Only instances have properties.".to_string()),
                };

                let hash = self.heap.string_hash(name);
                if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                    self.pop();
                    self.push(value)?;
                } else {
                    let class = self.heap.instance(instance).class;
                    self.bind_method(class, name)?;
                }
                Ok(4)
            }
            SET_PROPERTY => {
                let name = self.read_string_oper(1);
                let instance = match self.peek(1) {
                    Value::Obj(handle) if matches!(self.heap.obj(handle), Obj::Instance(_)) => {
                        handle
                    }
                    _ => return Err("Only instances have fields.".to_string()),
                };

                let hash = self.heap.string_hash(name);
                let value = self.peek(0);
                self.heap.instance_mut(instance).fields.set(name, hash, value);
                let value = self.pop();
                self.pop();
                self.push(value)?;
                Ok(4)
            }
            GET_SUPER => {
                let name = self.read_string_oper(1);
                let superclass = match self.pop() {
                    Value::Obj(handle) => handle,
                    _ => unreachable!(),
                };
                self.bind_method(superclass, name)?;
                Ok(4)
            }
            EQUAL => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b))?;
                Ok(1)
            }
            GREATER => {
                let (a, b) = self.numbers()?;
                self.push(Value::Bool(a > b))?;
                Ok(1)
            }
            LESS => {
                let (a, b) = self.numbers()?;
                self.push(Value::Bool(a < b))?;
                Ok(1)
            }
            ADD => {
                match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b))?;
                    }
                    (Value::Obj(a), Value::Obj(b)) if self.is_string(a) && self.is_string(b) => {
                        // operands stay on the stack while the result interns
                        let bytes = format!("{}{}", self.heap.string(a), self.heap.string(b));
                        let result = self.intern(&bytes);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result))?;
                    }
                    _ => return Err("Operands must be two numbers or two strings.".to_string()),
                }
                Ok(1)
            }
            SUBTRACT => {
                let (a, b) = self.numbers()?;
                self.push(Value::Number(a - b))?;
                Ok(1)
            }
            MULTIPLY => {
                let (a, b) = self.numbers()?;
                self.push(Value::Number(a * b))?;
                Ok(1)
            }
            DIVIDE => {
                let (a, b) = self.numbers()?;
                self.push(Value::Number(a / b))?;
                Ok(1)
            }
            MODULO => {
                let (a, b) = self.numbers()?;
                if a.fract() != 0.0 || b.fract() != 0.0 {
                    return Err("Operands of '%' must be integers.".to_string());
                }
                if b == 0.0 {
                    return Err("Modulo by zero.".to_string());
                }
                self.push(Value::Number(((a as i64) % (b as i64)) as f64))?;
                Ok(1)
            }
            NOT => {
                let value = self.pop();
                self.push(Value::Bool(!value.truthy()))?;
                Ok(1)
            }
            NEGATE => {
                match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n))?;
                    }
                    _ => return Err("Operand must be a number.".to_string()),
                }
                Ok(1)
            }
            PRINT => {
                let value = self.pop();
                let text = self.heap.show(value);
                let _ = writeln!(self.out, "{text}");
                Ok(1)
            }
            JUMP => Ok(3 + self.read_u16_oper(1) as usize),
            JUMP_IF_FALSE => {
                if self.peek(0).truthy() {
                    Ok(3)
                } else {
                    Ok(3 + self.read_u16_oper(1) as usize)
                }
            }
            LOOP => {
                let offset = self.read_u16_oper(1) as usize;
                let ip = self.frame().ip;
                self.frame_mut().ip = ip + 3 - offset;
                Ok(0)
            }
            CALL => {
                let argc = self.read_byte_oper(1) as usize;
                self.frame_mut().ip += 2;
                let callee = self.peek(argc);
                self.call_value(callee, argc)?;
                Ok(0)
            }
            INVOKE => {
                let name = self.read_string_oper(1);
                let argc = self.read_byte_oper(4) as usize;
                self.frame_mut().ip += 5;
                self.invoke(name, argc)?;
                Ok(0)
            }
            INVOKE_SUPER => {
                let name = self.read_string_oper(1);
                let argc = self.read_byte_oper(4) as usize;
                self.frame_mut().ip += 5;
                let superclass = match self.pop() {
                    Value::Obj(handle) => handle,
                    _ => unreachable!(),
                };
                self.invoke_from_class(superclass, name, argc)?;
                Ok(0)
            }
            CLOSURE => {
                let idx = self.read_u24_oper(1);
                let function = match self.current_chunk().constant(idx) {
                    Value::Obj(handle) => handle,
                    _ => unreachable!(),
                };
                let count = self.heap.function(function).upvalue_count;
                let base = self.frame().base;

                let mut upvalues = Vec::with_capacity(count);
                for i in 0..count {
                    let is_local = self.read_byte_oper(4 + i * 2) != 0;
                    let index = self.read_byte_oper(5 + i * 2) as usize;
                    if is_local {
                        upvalues.push(self.capture_upvalue(base + index));
                    } else {
                        let enclosing = self.frame().closure;
                        upvalues.push(self.heap.closure(enclosing).upvalues[index]);
                    }
                }

                let closure = self.alloc(Obj::Closure(Closure { function, upvalues }));
                self.push(Value::Obj(closure))?;
                Ok(4 + count * 2)
            }
            CLOSE_UPVALUE => {
                self.close_upvalues(self.stack.len() - 1);
                self.pop();
                Ok(1)
            }
            RETURN => {
                let result = self.pop();
                let frame = self.frames.pop().unwrap();
                self.close_upvalues(frame.base);
                self.stack.truncate(frame.base);
                if !self.frames.is_empty() {
                    self.push(result)?;
                }
                Ok(0)
            }
            CLASS => {
                let name = self.read_string_oper(1);
                let class = self.alloc(Obj::Class(Class {
                    name,
                    methods: Table::new(),
                    initializer: Value::Nil,
                }));
                self.push(Value::Obj(class))?;
                Ok(4)
            }
            INHERIT => {
                let superclass = match self.peek(1) {
                    Value::Obj(handle) if matches!(self.heap.obj(handle), Obj::Class(_)) => handle,
                    _ => return Err("Superclass must be a class.".to_string()),
                };
                let subclass = match self.peek(0) {
                    Value::Obj(handle) => handle,
                    _ => unreachable!(),
                };

                // copy-down inheritance: subclass methods added later win
                let mut methods = mem::take(&mut self.heap.class_mut(subclass).methods);
                methods.add_all(&self.heap.class(superclass).methods);
                let initializer = self.heap.class(superclass).initializer;
                let class = self.heap.class_mut(subclass);
                class.methods = methods;
                class.initializer = initializer;

                self.pop();
                Ok(1)
            }
            METHOD => {
                let name = self.read_string_oper(1);
                let method = self.peek(0);
                let class = match self.peek(1) {
                    Value::Obj(handle) => handle,
                    _ => unreachable!(),
                };

                let hash = self.heap.string_hash(name);
                self.heap.class_mut(class).methods.set(name, hash, method);
                if name == self.heap.init_string() {
                    self.heap.class_mut(class).initializer = method;
                }
                self.pop();
                Ok(4)
            }
            ARRAY => {
                let n = self.read_u16_oper(1) as usize;
                let start = self.stack.len() - n;
                let array = Array::from_slice(&self.stack[start..]);
                let handle = self.alloc(Obj::Array(array));
                self.stack.truncate(start);
                self.push(Value::Obj(handle))?;
                Ok(3)
            }
            ARRAY_GET => {
                let index = self.pop();
                let array = self.pop();
                let handle = match array {
                    Value::Obj(handle) if matches!(self.heap.obj(handle), Obj::Array(_)) => handle,
                    _ => return Err("Can only index into arrays.".to_string()),
                };
                let idx = match index {
                    Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => n as usize,
                    _ => return Err("Array index must be a non-negative integer.".to_string()),
                };

                let value = match self.heap.obj(handle) {
                    Obj::Array(a) => a.items.get(idx).copied(),
                    _ => unreachable!(),
                };
                match value {
                    Some(value) => {
                        self.push(value)?;
                        Ok(1)
                    }
                    None => Err("Array index out of bounds.".to_string()),
                }
            }
            ARRAY_SET => {
                let value = self.pop();
                let index = self.pop();
                let array = self.pop();
                let handle = match array {
                    Value::Obj(handle) if matches!(self.heap.obj(handle), Obj::Array(_)) => handle,
                    _ => return Err("Can only index into arrays.".to_string()),
                };
                let idx = match index {
                    Value::Number(n) if n.fract() == 0.0 && n >= 0.0 => n as usize,
                    _ => return Err("Array index must be a non-negative integer.".to_string()),
                };

                let items = &mut self.heap.array_mut(handle).items;
                if idx >= items.len() {
                    return Err("Array index out of bounds.".to_string());
                }
                items[idx] = value;
                self.push(value)?;
                Ok(1)
            }
            UNKNOWN => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct ErrorsTracker {
        errors: Vec<Report>,
    }

    impl Reporter for ErrorsTracker {
        fn error(&mut self, report: Report) {
            self.errors.push(report);
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_vm(source: &str, stress: bool) -> (Result<(), InterpretError>, String, Vec<Report>) {
        let sink = SharedSink::default();
        let mut vm = Vm::with_output(Box::new(sink.clone()));
        if stress {
            vm.heap.enable_stress();
        }
        let mut tracker = ErrorsTracker::default();
        let result = vm.interpret(source, &mut tracker);
        assert!(vm.stack.is_empty());
        let output = String::from_utf8(sink.0.borrow().clone()).unwrap();
        (result, output, tracker.errors)
    }

    fn expect_output(source: &str, expected: &str) {
        let (result, output, errors) = run_vm(source, false);
        assert!(result.is_ok(), "errors: {errors:?}");
        assert_eq!(output, expected);
    }

    fn expect_runtime_error(source: &str, msg: &str) {
        let (result, _, errors) = run_vm(source, false);
        assert_eq!(result, Err(InterpretError::Runtime));
        assert_eq!(errors[0].msg, msg);
    }

    #[test]
    fn precedence_and_grouping() {
        expect_output("print 5 + 2 * 3;", "11\n");
        expect_output("print (5 + 2) * 3;", "21\n");
        expect_output("print 10 - 4 / 2;", "8\n");
        expect_output("print -2 * 3;", "-6\n");
        expect_output("print 7 % 3;", "1\n");
        expect_output("print 1 < 2 and 2 <= 2;", "true\n");
        expect_output("print false or 3 > 2;", "true\n");
        expect_output("print !nil == true;", "true\n");
        expect_output("print 1 == 2 ? \"a\" : \"b\";", "b\n");
    }

    #[test]
    fn value_printing() {
        expect_output("print nil;", "nil\n");
        expect_output("print true;", "true\n");
        expect_output("print 2.5;", "2.5\n");
        expect_output("print \"text\";", "text\n");
        expect_output("fun f() {} print f;", "<fn f>\n");
        expect_output("print clock;", "<native fn>\n");
        expect_output("class A {} print A; print A();", "A\nA instance\n");
        expect_output("print [1, \"two\", nil];", "[1, two, nil]\n");
    }

    #[test]
    fn string_concatenation_interns() {
        expect_output("print \"foo\" + \"bar\";", "foobar\n");
        expect_output("print \"foo\" + \"bar\" == \"foobar\";", "true\n");
        expect_output("var a = \"a\"; a = a + a; a = a + a; print a;", "aaaa\n");
    }

    #[test]
    fn operand_type_errors() {
        expect_runtime_error("print 1 + nil;", "Operands must be two numbers or two strings.");
        expect_runtime_error("print \"a\" + 1;", "Operands must be two numbers or two strings.");
        expect_runtime_error("print 1 < \"a\";", "Operands must be numbers.");
        expect_runtime_error("print -true;", "Operand must be a number.");
        expect_runtime_error("print 1.5 % 2;", "Operands of '%' must be integers.");
        expect_runtime_error("print 1 % 0;", "Modulo by zero.");
    }

    #[test]
    fn division_follows_ieee754() {
        expect_output("print 1 / 0;", "inf\n");
        expect_output("print -1 / 0;", "-inf\n");
    }

    #[test]
    fn globals_and_locals() {
        expect_output("var a = 1; var b = 2; print a + b;", "3\n");
        expect_output("var a = 1; a = 2; print a;", "2\n");
        expect_output("var a; print a;", "nil\n");
        expect_output("{ var a = 10; { var a = 20; print a; } print a; }", "20\n10\n");
        expect_output("var a = \"outer\"; { var a = \"inner\"; } print a;", "outer\n");
    }

    #[test]
    fn undefined_variable_errors() {
        expect_runtime_error("print undefinedVar;", "Undefined variable 'undefinedVar'.");
        expect_runtime_error("missing = 1;", "Undefined variable 'missing'.");
        // declared later in the script still counts as undefined at use time
        expect_runtime_error("fun f() { return later; } f(); var later = 1;", "Undefined variable 'later'.");
    }

    #[test]
    fn if_and_while() {
        expect_output(
            "var num = 32; if (num % 2 == 0) { num = num / 16; } print num;\
             var prime = 15; if (prime % 2 == 0) { prime = prime / 2; } else { prime = prime / 3; } print prime;",
            "2\n5\n",
        );
        expect_output("var i = 0; while (i < 10) { i = i + 1; } print i;", "10\n");
        expect_output(
            "var a = 0; var b = 1;\
             while (true) { if (a > 200) { break; } var c = a + b; a = b; b = c; }\
             print a;",
            "233\n",
        );
    }

    #[test]
    fn for_loops() {
        expect_output(
            "for (var i = 0; i < 2; i = i + 1) { for (var j = 0; j < 2; j = j + 1) { print str(i) + str(j); } }",
            "00\n01\n10\n11\n",
        );
        expect_output(
            "var i = 1;\
             for (;;) { if (i == 32) { break; } i = i * 2; } print i;\
             for (var i = 1; ;) { if (i == 32) { break; } i = i * 2; } print i;\
             for (var i = 1; i < 32;) { i = i * 2; } print i;\
             for (var i = 1; i < 32; i = i * 2) {} print i;",
            "32\n32\n32\n32\n",
        );
    }

    #[test]
    fn for_scope_is_isolated() {
        expect_output("var i = 99; for (var i = 0; i < 10; i = i + 1) {} print i;", "99\n");
    }

    #[test]
    fn continue_pops_deep_locals() {
        expect_output(
            "for (var i = 0; i < 5; i = i + 1) {\
                 var a = 2; var b = 3;\
                 if (i % 2 == 0) { continue; }\
                 print a * b * i;\
             }",
            "6\n18\n",
        );
    }

    #[test]
    fn continue_closes_captured_locals() {
        // each closure must keep its own iteration's binding even when
        // continue unwinds the scope instead of the block's normal exit
        expect_output(
            "var cs = [];\
             for (var i = 0; i < 3; i = i + 1) {\
                 var a = i;\
                 fun f() { return a; }\
                 append(cs, f);\
                 continue;\
             }\
             print cs[0](); print cs[1](); print cs[2]();",
            "0\n1\n2\n",
        );
        expect_output(
            "var g; var i = 0;\
             while (i < 2) {\
                 i = i + 1;\
                 var a = i * 10;\
                 fun f() { return a; }\
                 if (i == 1) { g = f; continue; }\
                 a = a + 1;\
             }\
             print g();",
            "10\n",
        );
    }

    #[test]
    fn switch_matches_and_falls_through() {
        let source = "var a = 1;\
             switch(a) {\
                 case 1: print 1;\
                 case 2: print 2;\
                 case 3: print 3; break;\
                 default: print \"default\";\
             }";
        expect_output(source, "1\n2\n3\n");

        let source = "var a = 5;\
             switch(a) {\
                 case 1: print 1; break;\
                 case 2: print 2; break;\
                 default: print \"default\";\
             }";
        expect_output(source, "default\n");
    }

    #[test]
    fn break_targets_innermost_construct() {
        // break in a case exits the switch, break in a loop inside a case
        // exits that loop
        expect_output(
            "switch (2) {\
                 case 2:\
                     print \"in\";\
                     for (var i = 0; i < 9; i = i + 1) { if (i == 1) { break; } print i; }\
                     break;\
                 default: print \"unreached\";\
             }\
             print \"out\";",
            "in\n0\nout\n",
        );
        // and a switch inside a loop doesn't swallow the loop's break
        expect_output(
            "var i = 0;\
             while (true) {\
                 i = i + 1;\
                 switch (i) { case 3: break; }\
                 if (i == 3) { break; }\
             }\
             print i;",
            "3\n",
        );
    }

    #[test]
    fn functions_and_recursion() {
        expect_output(
            "fun fib(n){ if (n<=1) return n; return fib(n-2)+fib(n-1);} print fib(5);",
            "5\n",
        );
        expect_output("fun greet(name) { return \"hi \" + name; } print greet(\"you\");", "hi you\n");
        expect_output("fun nothing() {} print nothing();", "nil\n");
    }

    #[test]
    fn call_errors() {
        expect_runtime_error("var x = 1; x();", "Can only call functions and classes.");
        expect_runtime_error("fun f(a) {} f();", "Expected 1 arguments but got 0.");
        expect_runtime_error("fun f() {} f(1, 2);", "Expected 0 arguments but got 2.");
        expect_runtime_error("fun f() { f(); } f();", "Stack overflow.");
    }

    #[test]
    fn runtime_errors_carry_a_stack_trace() {
        let (result, _, errors) = run_vm("fun inner() { return 1 + nil; } fun outer() { return inner(); } outer();", false);
        assert_eq!(result, Err(InterpretError::Runtime));
        let trace = &errors[0].trace;
        assert_eq!(trace.len(), 3);
        assert!(trace[0].contains("in inner()"));
        assert!(trace[1].contains("in outer()"));
        assert!(trace[2].contains("in script"));
    }

    #[test]
    fn closures_capture_independent_state() {
        expect_output(
            "fun adder(){ var i=0; fun c(x){ i=i+x; print i; } return c; }\
             var p=adder(); var n=adder();\
             for (var i=0;i<3;i=i+1){ p(1); n(-1); }",
            "1\n-1\n2\n-2\n3\n-3\n",
        );
    }

    #[test]
    fn closures_capture_fresh_loop_variable() {
        expect_output(
            "var globalOne; var globalTwo;\
             fun main() {\
                 for (var a = 1; a <= 2; a = a + 1) {\
                     fun closure() { print a; }\
                     if (globalOne == nil) { globalOne = closure; } else { globalTwo = closure; }\
                 }\
             }\
             main(); globalOne(); globalTwo();",
            "1\n2\n",
        );
    }

    #[test]
    fn upvalues_close_on_scope_exit() {
        expect_output(
            "var f;\
             { var a = \"kept\"; fun g() { print a; } f = g; }\
             f();",
            "kept\n",
        );
    }

    #[test]
    fn classes_fields_and_methods() {
        expect_output(
            "class Pair {} var pair = Pair(); pair.first = 1; pair.second = 2; print pair.first + pair.second;",
            "3\n",
        );
        expect_output(
            "class R { init(w,h){this.w=w;this.h=h;} area(){return this.w*this.h;} }\
             print R(7,8).area(); print R(9,9).area();",
            "56\n81\n",
        );
        expect_output(
            "class CoffeeMaker {\
                 init(coffee) { this.coffee = coffee; }\
                 brew() { print \"Enjoy your cup of \" + this.coffee; }\
                 withMuffin() { this.brew(); print \"and with muffin\"; }\
             }\
             var maker = CoffeeMaker(\"coffee and chicory\");\
             maker.brew(); maker.withMuffin();",
            "Enjoy your cup of coffee and chicory\nEnjoy your cup of coffee and chicory\nand with muffin\n",
        );
    }

    #[test]
    fn initializer_returns_the_receiver() {
        expect_output(
            "class A { init() { this.x = 1; return; this.x = 2; } }\
             print A().x;",
            "1\n",
        );
    }

    #[test]
    fn bound_methods_remember_their_receiver() {
        expect_output(
            "class Person {\
                 sayName() { print this.name; }\
                 saySurname() { print this.surname; }\
             }\
             var hank = Person(); hank.name = \"Hank\"; hank.surname = \"Schrader\";\
             var refSurname = hank.saySurname;\
             hank.sayName(); refSurname();",
            "Hank\nSchrader\n",
        );
        expect_output(
            "class Person { sayName() { print this.name; } }\
             var jane = Person(); jane.name = \"Jane\"; jane.sayName();\
             var bill = Person(); bill.name = \"Bill\"; bill.sayName();\
             bill.sayName = jane.sayName; bill.sayName();",
            "Jane\nBill\nJane\n",
        );
    }

    #[test]
    fn fields_holding_functions_are_invocable() {
        expect_output(
            "class Oops { init() { fun f() { print \"not a method\"; } this.field = f; } }\
             var oops = Oops(); oops.field();",
            "not a method\n",
        );
    }

    #[test]
    fn inheritance_and_super() {
        expect_output(
            "class Doughnut { cook() { print \"Fry until golden brown.\"; } }\
             class BostonCream < Doughnut {\
                 cook() { super.cook(); print \"Pipe full of custard and coat with chocolate.\"; }\
             }\
             BostonCream().cook();",
            "Fry until golden brown.\nPipe full of custard and coat with chocolate.\n",
        );
        expect_output(
            "class A { m() { return \"A\"; } }\
             class B < A { m() { return \"B\"; } }\
             class C < A {}\
             print B().m(); print C().m();",
            "B\nA\n",
        );
        expect_output(
            "class Car {\
                 init(cc) { this.cc = cc; }\
                 wheels() { return 4; }\
             }\
             class Semi < Car {\
                 init(cc, extra) { super.init(cc); this.extra = extra; }\
                 wheels() { return super.wheels() + this.extra; }\
             }\
             var semi = Semi(16000, 6);\
             print semi.cc; print semi.wheels();",
            "16000\n10\n",
        );
    }

    #[test]
    fn class_runtime_errors() {
        expect_runtime_error("var NotAClass = 1; class A < NotAClass {}", "Superclass must be a class.");
        expect_runtime_error("class A {} A().missing;", "Undefined property 'missing'.");
        expect_runtime_error("class A {} A().missing();", "Undefined property 'missing'.");
        expect_runtime_error("print 1.field;", "Only instances have properties.");
        expect_runtime_error("var x = 1; x.field = 2;", "Only instances have fields.");
        expect_runtime_error("class A {} A(1);", "Expected 0 arguments but got 1.");
        expect_runtime_error(
            "class A { init(a) {} } A();",
            "Expected 1 arguments but got 0.",
        );
    }

    #[test]
    fn arrays() {
        expect_output("var empty = []; print empty;", "[]\n");
        expect_output(
            "var primes = [2, 3, 5, 7, 11]; print primes[2]; print primes;",
            "5\n[2, 3, 5, 7, 11]\n",
        );
        expect_output(
            "var byte = [0, 0, 0]; byte[1] = 9; print byte;",
            "[0, 9, 0]\n",
        );
        expect_output(
            "var matrix = [];\
             for (var i = 1; i < 4; i = i + 1) {\
                 var sub = [];\
                 for (var j = i; j < 3 * i; j = j + i) { append(sub, j); }\
                 append(matrix, sub);\
             }\
             print matrix;",
            "[[1, 2], [2, 4], [3, 6]]\n",
        );
    }

    #[test]
    fn array_errors() {
        expect_runtime_error("var a = [1]; print a[1];", "Array index out of bounds.");
        expect_runtime_error("var a = [1]; a[3] = 0;", "Array index out of bounds.");
        expect_runtime_error("var a = [1]; print a[-1];", "Array index must be a non-negative integer.");
        expect_runtime_error("var a = [1]; print a[0.5];", "Array index must be a non-negative integer.");
        expect_runtime_error("var a = 1; print a[0];", "Can only index into arrays.");
    }

    #[test]
    fn native_functions() {
        expect_output("print sqrt(16);", "4\n");
        expect_output("print str(42) + \"!\";", "42!\n");
        expect_output("print str([1, 2]);", "[1, 2]\n");
        expect_output("var t = clock(); print t >= 0;", "true\n");
        expect_runtime_error("sqrt(\"x\");", "Argument to 'sqrt' must be a number.");
        expect_runtime_error("sqrt(1, 2);", "Expected 1 arguments but got 2.");
    }

    #[test]
    fn field_reflection_natives() {
        expect_output(
            "class Pair {} var pair = Pair();\
             setField(pair, \"fir\" + \"st\", 1);\
             pair.second = 2;\
             print getField(pair, \"first\") + pair.second;",
            "3\n",
        );
        expect_output(
            "class Pair {} var pair = Pair(); pair.x = 1;\
             deleteField(pair, \"x\");\
             print str(pair) + \" survived\";",
            "Pair instance survived\n",
        );
        expect_runtime_error(
            "class Pair {} var pair = Pair(); pair.x = 1; deleteField(pair, \"x\"); print pair.x;",
            "Undefined property 'x'.",
        );
        expect_runtime_error("getField(1, \"x\");", "Argument to 'getField' must be an instance.");
    }

    #[test]
    fn repl_style_sessions_share_globals() {
        let sink = SharedSink::default();
        let mut vm = Vm::with_output(Box::new(sink.clone()));
        let mut tracker = ErrorsTracker::default();
        vm.interpret("var counter = 1;", &mut tracker).unwrap();
        vm.interpret("counter = counter + 1;", &mut tracker).unwrap();
        vm.interpret("print counter;", &mut tracker).unwrap();
        assert_eq!(String::from_utf8(sink.0.borrow().clone()).unwrap(), "2\n");
    }

    #[test]
    fn deterministic_output() {
        let source = "fun f(n) { if (n == 0) return \"\"; return str(n) + f(n - 1); } print f(9);";
        let (_, first, _) = run_vm(source, false);
        let (_, second, _) = run_vm(source, false);
        assert_eq!(first, second);
    }

    #[test]
    fn collection_at_every_allocation_is_invisible() {
        let source = "class Node { init(value) { this.value = value; this.next = nil; } }\
             fun chain(n) {\
                 var head = Node(0); var cur = head;\
                 for (var i = 1; i < n; i = i + 1) {\
                     cur.next = Node(i);\
                     cur = cur.next;\
                 }\
                 return head;\
             }\
             var list = chain(5);\
             var sum = 0;\
             while (list != nil) { sum = sum + list.value; list = list.next; }\
             print sum;\
             fun adder(){ var i=0; fun c(x){ i=i+x; return i; } return c; }\
             var bump = adder();\
             bump(1); bump(2);\
             print bump(3);\
             print \"still \" + \"here\";";
        let (result, plain, errors) = run_vm(source, false);
        assert!(result.is_ok(), "errors: {errors:?}");
        let (result, stressed, errors) = run_vm(source, true);
        assert!(result.is_ok(), "errors: {errors:?}");
        assert_eq!(plain, stressed);
        assert_eq!(plain, "10\n6\nstill here\n");
    }

    #[test]
    fn garbage_is_actually_collected() {
        let sink = SharedSink::default();
        let mut vm = Vm::with_output(Box::new(sink.clone()));
        let mut tracker = ErrorsTracker::default();
        vm.interpret(
            "var keep = \"kept\";\
             for (var i = 0; i < 100; i = i + 1) { var junk = [str(i), str(i + 1)]; }",
            &mut tracker,
        )
        .unwrap();
        let before = vm.heap.live_objects();
        vm.heap.collect(Roots::default());
        assert!(vm.heap.live_objects() < before);
        // and the survivors are intact
        vm.interpret("print keep;", &mut tracker).unwrap();
        assert_eq!(String::from_utf8(sink.0.borrow().clone()).unwrap(), "kept\n");
    }
}
