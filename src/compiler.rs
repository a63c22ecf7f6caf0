use super::chunk::Instruction::{self, *};
use super::chunk::Chunk;
use super::heap::{Gc, Heap};
use super::object::{Function, Obj};
use super::reporter::{Phase, Report, Reporter};
use super::token::{Token, TokenType};
use super::tokenizer::Tokenizer;
use super::value::Value;
use std::mem;

pub const LOCALS_MAX: usize = 1 << 16;
pub const UPVALUES_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,  // =
    Conditional, // ?:
    Or,          // or
    And,         // and
    Equality,    // == !=
    Comparison,  // < > <= >=
    Term,        // + -
    Factor,      // * / %
    Unary,       // ! -
    Call,        // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Conditional,
            Precedence::Conditional => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

/// Infix precedence per token kind, indexed by `TokenType as usize`.
const PRECEDENCES: [Precedence; TokenType::VARIANT_COUNT] = [
    Precedence::Call,        // LeftParen
    Precedence::None,        // RightParen
    Precedence::None,        // LeftBrace
    Precedence::None,        // RightBrace
    Precedence::Call,        // LeftBracket
    Precedence::None,        // RightBracket
    Precedence::None,        // Comma
    Precedence::Call,        // Dot
    Precedence::None,        // Semicolon
    Precedence::None,        // Colon
    Precedence::Conditional, // Question
    Precedence::Term,        // Minus
    Precedence::Term,        // Plus
    Precedence::Factor,      // Star
    Precedence::Factor,      // Slash
    Precedence::Factor,      // Percent
    Precedence::None,        // Bang
    Precedence::Equality,    // BangEqual
    Precedence::None,        // Equal
    Precedence::Equality,    // EqualEqual
    Precedence::Comparison,  // Greater
    Precedence::Comparison,  // GreaterEqual
    Precedence::Comparison,  // Less
    Precedence::Comparison,  // LessEqual
    Precedence::None,        // Identifier
    Precedence::None,        // String
    Precedence::None,        // Number
    Precedence::And,         // And
    Precedence::Or,          // Or
    Precedence::None,        // Nil
    Precedence::None,        // True
    Precedence::None,        // False
    Precedence::None,        // Var
    Precedence::None,        // Const
    Precedence::None,        // Class
    Precedence::None,        // Fun
    Precedence::None,        // If
    Precedence::None,        // Else
    Precedence::None,        // For
    Precedence::None,        // While
    Precedence::None,        // Return
    Precedence::None,        // Print
    Precedence::None,        // Super
    Precedence::None,        // This
    Precedence::None,        // Break
    Precedence::None,        // Continue
    Precedence::None,        // Switch
    Precedence::None,        // Case
    Precedence::None,        // Default
    Precedence::None,        // Error
    Precedence::None,        // Eof
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// -1 while declared but not yet initialized.
    depth: i32,
    is_const: bool,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct CompUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function lexical state. Slot 0 is reserved: it holds `this` for
/// methods and is unnameable otherwise.
struct FunctionCtx<'src> {
    kind: FunctionKind,
    name: Option<Gc>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
    upvalues: Vec<CompUpvalue>,
    loop_start: i32,
    loop_scope_depth: i32,
    loop_breaks: Vec<usize>,
    switch_breaks: Vec<usize>,
    switch_case_depth: u32,
    switch_scope_depth: i32,
}

impl<'src> FunctionCtx<'src> {
    fn new(kind: FunctionKind, name: Option<Gc>) -> Self {
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        FunctionCtx {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: slot_zero,
                depth: 0,
                is_const: false,
                is_captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
            loop_start: -1,
            loop_scope_depth: -1,
            loop_breaks: Vec::new(),
            switch_breaks: Vec::new(),
            switch_case_depth: 0,
            switch_scope_depth: -1,
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
    method_names: Vec<String>,
}

pub struct Compiler<'a, 'src> {
    tokenizer: Tokenizer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    heap: &'a mut Heap,
    reporter: &'a mut dyn Reporter,
    contexts: Vec<FunctionCtx<'src>>,
    classes: Vec<ClassCtx>,
}

impl<'a, 'src> Compiler<'a, 'src> {
    pub fn new(source: &'src str, heap: &'a mut Heap, reporter: &'a mut dyn Reporter) -> Self {
        Self {
            tokenizer: Tokenizer::new(source),
            previous: Token::empty(),
            current: Token::empty(),
            had_error: false,
            panic_mode: false,
            heap,
            reporter,
            contexts: vec![FunctionCtx::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    /// Compiles the whole script into one top-level function. The function
    /// and everything it references stay on the heap's protect list until
    /// the VM installs them.
    pub fn compile(mut self) -> Result<Gc, ()> {
        self.advance();
        while !self.matches(TokenType::Eof) {
            self.declaration();
        }
        let (function, _) = self.end_context();
        if self.had_error {
            Err(())
        } else {
            Ok(function)
        }
    }

    //>> Error reporting
    fn error_at(&mut self, token: Token<'src>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.typ {
            TokenType::Eof => " at end".to_string(),
            TokenType::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.reporter.error(Report::new(
            Phase::Compile,
            format!("[line {}] Error{}: {}", token.line, location, msg),
        ));
    }

    fn error(&mut self, msg: &str) {
        self.error_at(self.previous, msg);
    }

    fn error_at_current(&mut self, msg: &str) {
        self.error_at(self.current, msg);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.typ != TokenType::Eof {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            match self.current.typ {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::Const
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Switch
                | TokenType::Return => return,
                _ => {}
            }
            self.advance();
        }
    }
    //<<

    //>> Token plumbing
    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.tokenizer.next_token();
            if self.current.typ != TokenType::Error {
                break;
            }
            let msg = self.current.lexeme;
            self.error_at_current(msg);
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if !self.check(typ) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, typ: TokenType, msg: &str) {
        if self.check(typ) {
            self.advance();
            return;
        }
        self.error_at_current(msg);
    }
    //<<

    //>> Emission
    fn ctx(&self) -> &FunctionCtx<'src> {
        self.contexts.last().unwrap()
    }

    fn ctx_mut(&mut self) -> &mut FunctionCtx<'src> {
        self.contexts.last_mut().unwrap()
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.contexts.last_mut().unwrap().chunk
    }

    fn emit(&mut self, instr: Instruction) {
        let line = self.previous.line;
        self.chunk_mut().write_instr(instr, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.chunk_mut().write_u16(value, line);
    }

    fn emit_u24(&mut self, value: usize) {
        let line = self.previous.line;
        if self.chunk_mut().write_u24(value, line).is_err() {
            self.error("Too many constants in one chunk.");
        }
    }

    fn make_constant(&mut self, value: Value) -> usize {
        match self.chunk_mut().add_constant(value) {
            Ok(idx) => idx,
            Err(()) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit(CONSTANT);
        self.emit_u24(idx);
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let handle = self.heap.intern_protected(name);
        self.make_constant(Value::Obj(handle))
    }

    fn emit_jump(&mut self, instr: Instruction) -> usize {
        let line = self.previous.line;
        self.chunk_mut().write_jump(instr, line)
    }

    fn patch_jump(&mut self, operand: usize) {
        if self.chunk_mut().patch_jump(operand).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if self.chunk_mut().write_loop(loop_start, line).is_err() {
            self.error("Loop body too large.");
        }
    }

    fn emit_return(&mut self) {
        if self.ctx().kind == FunctionKind::Initializer {
            self.emit(GET_LOCAL);
            self.emit_u16(0);
        } else {
            self.emit(NIL);
        }
        self.emit(RETURN);
    }

    fn end_context(&mut self) -> (Gc, Vec<CompUpvalue>) {
        self.emit_return();
        let ctx = self.contexts.pop().unwrap();
        let FunctionCtx {
            name,
            arity,
            chunk,
            upvalues,
            ..
        } = ctx;

        #[cfg(feature = "debug-bytecode")]
        if !self.had_error {
            let shown = match name {
                Some(n) => self.heap.string(n).to_string(),
                None => "script".to_string(),
            };
            eprint!("{}", self.heap.disassemble(&chunk, &shown));
        }

        let function = self.heap.alloc_protected(Obj::Function(Function {
            name,
            arity,
            upvalue_count: upvalues.len(),
            chunk,
        }));
        (function, upvalues)
    }
    //<<

    //>> Scopes and variables
    fn begin_scope(&mut self) {
        self.ctx_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx_mut().scope_depth -= 1;

        loop {
            let ctx = self.ctx();
            let pop = match ctx.locals.last() {
                Some(local) if local.depth > ctx.scope_depth => local.is_captured,
                _ => break,
            };
            self.ctx_mut().locals.pop();
            self.emit(if pop { CLOSE_UPVALUE } else { POP });
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.ctx().locals.len() == LOCALS_MAX {
            self.error("Too many local variables in function.");
            return;
        }
        self.ctx_mut().locals.push(Local {
            name,
            depth: -1,
            is_const: false,
            is_captured: false,
        });
    }

    /// Installs an already-initialized local the user can't redeclare;
    /// used for `super` and the switch scrutinee.
    fn add_synthetic_local(&mut self, name: &'src str) {
        let depth = self.ctx().scope_depth;
        if self.ctx().locals.len() == LOCALS_MAX {
            self.error("Too many local variables in function.");
            return;
        }
        self.ctx_mut().locals.push(Local {
            name,
            depth,
            is_const: false,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.ctx().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme;
        let mut duplicate = false;
        {
            let ctx = self.ctx();
            for local in ctx.locals.iter().rev() {
                if local.depth != -1 && local.depth < ctx.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn parse_variable(&mut self, msg: &str) -> u16 {
        self.consume(TokenType::Identifier, msg);

        self.declare_variable();
        if self.ctx().scope_depth > 0 {
            return 0;
        }

        let name = self.heap.intern_protected(self.previous.lexeme);
        match self.heap.global_slot(name) {
            Ok(slot) => slot,
            Err(()) => {
                self.error("Too many global variables.");
                0
            }
        }
    }

    fn mark_initialized(&mut self, is_const: bool) {
        if self.ctx().scope_depth == 0 {
            return;
        }
        let depth = self.ctx().scope_depth;
        let local = self.ctx_mut().locals.last_mut().unwrap();
        local.depth = depth;
        local.is_const = is_const;
    }

    fn define_variable(&mut self, global: u16, name: &str, is_const: bool) {
        if self.ctx().scope_depth > 0 {
            self.mark_initialized(is_const);
            return;
        }

        if is_const {
            let handle = self.heap.intern_protected(name);
            self.heap.mark_const(handle);
        }
        self.emit(DEFINE_GLOBAL);
        self.emit_u16(global);
    }

    fn resolve_local(&mut self, ctx_idx: usize, name: &str) -> Option<u16> {
        let mut found = None;
        let mut uninitialized = false;
        for (idx, local) in self.contexts[ctx_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                uninitialized = local.depth == -1;
                found = Some(idx as u16);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, ctx_idx: usize, index: u16, is_local: bool) -> u16 {
        if index > u8::MAX as u16 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let upvalue = CompUpvalue {
            index: index as u8,
            is_local,
        };

        if let Some(existing) = self.contexts[ctx_idx]
            .upvalues
            .iter()
            .position(|uv| *uv == upvalue)
        {
            return existing as u16;
        }

        if self.contexts[ctx_idx].upvalues.len() == UPVALUES_MAX {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.contexts[ctx_idx].upvalues.push(upvalue);
        (self.contexts[ctx_idx].upvalues.len() - 1) as u16
    }

    fn resolve_upvalue(&mut self, ctx_idx: usize, name: &str) -> Option<u16> {
        if ctx_idx == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(ctx_idx - 1, name) {
            self.contexts[ctx_idx - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(ctx_idx, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(ctx_idx - 1, name) {
            return Some(self.add_upvalue(ctx_idx, upvalue, false));
        }

        None
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let top = self.contexts.len() - 1;

        let (get_op, set_op, arg, const_assign_forbidden);
        if let Some(slot) = self.resolve_local(top, name.lexeme) {
            get_op = GET_LOCAL;
            set_op = SET_LOCAL;
            arg = slot;
            const_assign_forbidden = self.ctx().locals[slot as usize].is_const;
        } else if let Some(slot) = self.resolve_upvalue(top, name.lexeme) {
            get_op = GET_UPVALUE;
            set_op = SET_UPVALUE;
            arg = slot;
            const_assign_forbidden = false;
        } else {
            let handle = self.heap.intern_protected(name.lexeme);
            get_op = GET_GLOBAL;
            set_op = SET_GLOBAL;
            arg = match self.heap.global_slot(handle) {
                Ok(slot) => slot,
                Err(()) => {
                    self.error("Too many global variables.");
                    0
                }
            };
            const_assign_forbidden = self.heap.is_const(handle);
        }

        if can_assign && self.matches(TokenType::Equal) {
            if const_assign_forbidden {
                self.error("Cannot assign to a constant variable.");
                return;
            }
            self.expression();
            self.emit(set_op);
            self.emit_u16(arg);
        } else {
            self.emit(get_op);
            self.emit_u16(arg);
        }
    }
    //<<

    //>> Expressions
    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.typ, can_assign) {
            self.error("Expected an expression.");
            return;
        }

        while precedence <= PRECEDENCES[self.current.typ as usize] {
            self.advance();
            self.infix(self.previous.typ, can_assign);
        }

        if can_assign && self.matches(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, typ: TokenType, can_assign: bool) -> bool {
        match typ {
            TokenType::LeftParen => self.grouping(),
            TokenType::LeftBracket => self.array_literal(),
            TokenType::Minus | TokenType::Bang => self.unary(),
            TokenType::Number => self.number(),
            TokenType::String => self.string(),
            TokenType::Identifier => self.variable(can_assign),
            TokenType::Nil => self.emit(NIL),
            TokenType::True => self.emit(TRUE),
            TokenType::False => self.emit(FALSE),
            TokenType::This => self.this(),
            TokenType::Super => self.super_(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, typ: TokenType, can_assign: bool) {
        match typ {
            TokenType::LeftParen => self.call(),
            TokenType::LeftBracket => self.subscript(can_assign),
            TokenType::Dot => self.dot(can_assign),
            TokenType::Question => self.conditional(),
            TokenType::And => self.and(),
            TokenType::Or => self.or(),
            _ => self.binary(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expected ')' after an expression.");
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let handle = self.heap.intern_protected(&lexeme[1..lexeme.len() - 1]);
        self.emit_constant(Value::Obj(handle));
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn this(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        let line = self.previous.line;
        self.consume(TokenType::Dot, "Expected '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expected superclass method name.");
        let name_idx = self.identifier_constant(self.previous.lexeme);

        self.named_variable(Token::synthetic("this", line), false);
        if self.matches(TokenType::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(Token::synthetic("super", line), false);
            self.emit(INVOKE_SUPER);
            self.emit_u24(name_idx);
            self.emit_byte(argc);
        } else {
            self.named_variable(Token::synthetic("super", line), false);
            self.emit(GET_SUPER);
            self.emit_u24(name_idx);
        }
    }

    fn unary(&mut self) {
        let op = self.previous.typ;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenType::Bang => self.emit(NOT),
            TokenType::Minus => self.emit(NEGATE),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let op = self.previous.typ;
        self.parse_precedence(PRECEDENCES[op as usize].next());

        match op {
            TokenType::BangEqual => {
                self.emit(EQUAL);
                self.emit(NOT);
            }
            TokenType::EqualEqual => self.emit(EQUAL),
            TokenType::Greater => self.emit(GREATER),
            TokenType::GreaterEqual => {
                self.emit(LESS);
                self.emit(NOT);
            }
            TokenType::Less => self.emit(LESS),
            TokenType::LessEqual => {
                self.emit(GREATER);
                self.emit(NOT);
            }
            TokenType::Plus => self.emit(ADD),
            TokenType::Minus => self.emit(SUBTRACT),
            TokenType::Star => self.emit(MULTIPLY),
            TokenType::Slash => self.emit(DIVIDE),
            TokenType::Percent => self.emit(MODULO),
            _ => unreachable!(),
        }
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(JUMP_IF_FALSE);
        self.emit(POP);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(JUMP_IF_FALSE);
        let end_jump = self.emit_jump(JUMP);

        self.patch_jump(else_jump);
        self.emit(POP);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn conditional(&mut self) {
        let else_jump = self.emit_jump(JUMP_IF_FALSE);
        self.emit(POP);
        self.parse_precedence(Precedence::Conditional);

        let end_jump = self.emit_jump(JUMP);
        self.consume(TokenType::Colon, "Expected ':' after '?'.");
        self.patch_jump(else_jump);

        self.emit(POP);
        self.parse_precedence(Precedence::Assignment);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if argc == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argc += 1;
                }
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expected ')' after arguments.");
        argc
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit(CALL);
        self.emit_byte(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expected property name after '.'.");
        let name_idx = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit(SET_PROPERTY);
            self.emit_u24(name_idx);
        } else if self.matches(TokenType::LeftParen) {
            let argc = self.argument_list();
            self.emit(INVOKE);
            self.emit_u24(name_idx);
            self.emit_byte(argc);
        } else {
            self.emit(GET_PROPERTY);
            self.emit_u24(name_idx);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightBracket, "Expected ']' after index.");

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit(ARRAY_SET);
        } else {
            self.emit(ARRAY_GET);
        }
    }

    fn array_literal(&mut self) {
        let mut count: usize = 0;
        if !self.check(TokenType::RightBracket) {
            loop {
                self.expression();
                if count == u16::MAX as usize {
                    self.error("Too many elements in array literal.");
                } else {
                    count += 1;
                }
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightBracket, "Expected ']' after array elements.");
        self.emit(ARRAY);
        self.emit_u16(count as u16);
    }
    //<<

    //>> Declarations
    fn declaration(&mut self) {
        if self.matches(TokenType::Class) {
            self.class_declaration();
        } else if self.matches(TokenType::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenType::Var) {
            self.var_declaration(false);
        } else if self.matches(TokenType::Const) {
            self.var_declaration(true);
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, is_const: bool) {
        let global = self.parse_variable("Expected variable name.");
        let name = self.previous.lexeme;

        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            if is_const {
                self.error("Missing value in the const declaration.");
                return;
            }
            self.emit(NIL);
        }
        self.consume(
            TokenType::Semicolon,
            "Expected ';' after variable declaration.",
        );

        self.define_variable(global, name, is_const);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expected function name.");
        let name = self.previous.lexeme;
        self.mark_initialized(false);
        self.function(FunctionKind::Function);
        self.define_variable(global, name, false);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern_protected(self.previous.lexeme);
        self.contexts.push(FunctionCtx::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expected '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                if self.ctx().arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.ctx_mut().arity += 1;
                }
                let constant = self.parse_variable("Expected parameter name.");
                let param = self.previous.lexeme;
                self.define_variable(constant, param, false);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expected ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expected '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_context();
        let idx = self.make_constant(Value::Obj(function));
        self.emit(CLOSURE);
        self.emit_u24(idx);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expected class name.");
        let class_name = self.previous;
        let name_idx = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        let global = if self.ctx().scope_depth > 0 {
            0
        } else {
            let handle = self.heap.intern_protected(class_name.lexeme);
            match self.heap.global_slot(handle) {
                Ok(slot) => slot,
                Err(()) => {
                    self.error("Too many global variables.");
                    0
                }
            }
        };

        self.emit(CLASS);
        self.emit_u24(name_idx);
        self.define_variable(global, class_name.lexeme, false);

        self.classes.push(ClassCtx {
            has_superclass: false,
            method_names: Vec::new(),
        });

        if self.matches(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expected superclass name.");
            self.variable(false);

            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_synthetic_local("super");

            self.named_variable(class_name, false);
            self.emit(INHERIT);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expected '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expected '}' after class body.");
        self.emit(POP);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expected method name.");
        let name = self.previous.lexeme;
        let name_idx = self.identifier_constant(name);

        let duplicate_init = {
            let class = self.classes.last_mut().unwrap();
            let duplicate = name == "init" && class.method_names.iter().any(|m| m == "init");
            class.method_names.push(name.to_string());
            duplicate
        };
        if duplicate_init {
            self.error("A class can only have one 'init' method.");
        }

        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit(METHOD);
        self.emit_u24(name_idx);
    }
    //<<

    //>> Statements
    fn statement(&mut self) {
        if self.matches(TokenType::Print) {
            self.print_statement();
        } else if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::Break) {
            self.break_statement();
        } else if self.matches(TokenType::Continue) {
            self.continue_statement();
        } else if self.matches(TokenType::Switch) {
            self.switch_statement();
        } else if self.matches(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expected '}' after a block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expected ';' after expression.");
        self.emit(POP);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expected ';' after value.");
        self.emit(PRINT);
    }

    fn return_statement(&mut self) {
        if self.ctx().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.ctx().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expected ';' after return value.");
            self.emit(RETURN);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expected ')' after condition.");

        let then_jump = self.emit_jump(JUMP_IF_FALSE);
        self.emit(POP);
        self.statement();

        let else_jump = self.emit_jump(JUMP);
        self.patch_jump(then_jump);
        self.emit(POP);

        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let start = self.ctx().chunk.len();
        let prev_start = mem::replace(&mut self.ctx_mut().loop_start, start as i32);
        let scope_depth = self.ctx().scope_depth;
        let prev_scope = mem::replace(&mut self.ctx_mut().loop_scope_depth, scope_depth);
        let prev_case_depth = mem::take(&mut self.ctx_mut().switch_case_depth);
        let prev_breaks = mem::take(&mut self.ctx_mut().loop_breaks);

        self.consume(TokenType::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expected ')' after condition.");

        let exit_jump = self.emit_jump(JUMP_IF_FALSE);
        self.emit(POP);
        self.statement();
        self.emit_loop(start);

        self.patch_jump(exit_jump);
        self.emit(POP);

        let breaks = mem::take(&mut self.ctx_mut().loop_breaks);
        for site in breaks {
            self.patch_jump(site);
        }

        let ctx = self.ctx_mut();
        ctx.loop_start = prev_start;
        ctx.loop_scope_depth = prev_scope;
        ctx.switch_case_depth = prev_case_depth;
        ctx.loop_breaks = prev_breaks;
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expected '(' after 'for'.");

        let mut loop_var_slot: i32 = -1;
        let mut loop_var_name: &'src str = "";
        if self.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.matches(TokenType::Var) {
            loop_var_name = self.current.lexeme;
            self.var_declaration(false);
            loop_var_slot = self.ctx().locals.len() as i32 - 1;
        } else {
            self.expression_statement();
        }

        let start = self.ctx().chunk.len();
        let prev_start = mem::replace(&mut self.ctx_mut().loop_start, start as i32);
        let scope_depth = self.ctx().scope_depth;
        let prev_scope = mem::replace(&mut self.ctx_mut().loop_scope_depth, scope_depth);
        let prev_case_depth = mem::take(&mut self.ctx_mut().switch_case_depth);
        let prev_breaks = mem::take(&mut self.ctx_mut().loop_breaks);

        let mut exit_jump: i32 = -1;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expected ';' after loop condition.");

            exit_jump = self.emit_jump(JUMP_IF_FALSE) as i32;
            self.emit(POP);
        }

        if !self.matches(TokenType::RightParen) {
            let body_jump = self.emit_jump(JUMP);
            let increment_start = self.ctx().chunk.len() as i32;
            self.expression();
            self.emit(POP);
            self.consume(TokenType::RightParen, "Expected ')' after for clauses.");

            let back_to = self.ctx().loop_start as usize;
            self.emit_loop(back_to);
            self.ctx_mut().loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        // a fresh binding per iteration, so closures created in the body
        // capture this iteration's value
        let mut shadow_slot: i32 = -1;
        if loop_var_slot != -1 {
            self.begin_scope();
            self.emit(GET_LOCAL);
            self.emit_u16(loop_var_slot as u16);
            self.add_local(loop_var_name);
            self.mark_initialized(false);
            shadow_slot = self.ctx().locals.len() as i32 - 1;
        }

        self.statement();

        if loop_var_slot != -1 {
            self.emit(GET_LOCAL);
            self.emit_u16(shadow_slot as u16);
            self.emit(SET_LOCAL);
            self.emit_u16(loop_var_slot as u16);
            self.emit(POP);
            self.end_scope();
        }

        let back_to = self.ctx().loop_start as usize;
        self.emit_loop(back_to);

        if exit_jump != -1 {
            self.patch_jump(exit_jump as usize);
            self.emit(POP);
        }

        let breaks = mem::take(&mut self.ctx_mut().loop_breaks);
        for site in breaks {
            self.patch_jump(site);
        }

        self.end_scope();

        let ctx = self.ctx_mut();
        ctx.loop_start = prev_start;
        ctx.loop_scope_depth = prev_scope;
        ctx.switch_case_depth = prev_case_depth;
        ctx.loop_breaks = prev_breaks;
    }

    /// Emits the pops a jump out of a construct needs, without disturbing
    /// the compile-time local list.
    fn emit_scope_pops(&mut self, depth: i32) {
        let captured: Vec<bool> = self
            .ctx()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| local.is_captured)
            .collect();
        for is_captured in captured {
            self.emit(if is_captured { CLOSE_UPVALUE } else { POP });
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenType::Semicolon, "Expected ';' after 'break'.");

        let in_switch = self.ctx().switch_case_depth > 0;
        let in_loop = self.ctx().loop_start != -1;
        if !in_switch && !in_loop {
            self.error("Unexpected 'break' outside of switch|for|while statements.");
            return;
        }

        let target_depth = if in_switch {
            self.ctx().switch_scope_depth
        } else {
            self.ctx().loop_scope_depth
        };
        self.emit_scope_pops(target_depth);

        let site = self.emit_jump(JUMP);
        if in_switch {
            self.ctx_mut().switch_breaks.push(site);
        } else {
            self.ctx_mut().loop_breaks.push(site);
        }
    }

    fn continue_statement(&mut self) {
        self.consume(TokenType::Semicolon, "Expected ';' after 'continue'.");

        if self.ctx().loop_start == -1 {
            self.error("Unexpected 'continue' outside of loop.");
            return;
        }

        let depth = self.ctx().loop_scope_depth;
        self.emit_scope_pops(depth);

        let back_to = self.ctx().loop_start as usize;
        self.emit_loop(back_to);
    }

    fn switch_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expected '(' after 'switch'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expected ')' after condition.");
        self.consume(TokenType::LeftBrace, "Expected '{' before 'switch' body.");

        let scope_depth = self.ctx().scope_depth;
        let prev_switch_scope = mem::replace(&mut self.ctx_mut().switch_scope_depth, scope_depth);
        let prev_breaks = mem::take(&mut self.ctx_mut().switch_breaks);

        // the scrutinee stays on the stack for the whole statement
        self.add_synthetic_local("");

        let mut default_compiled = false;
        let mut fallthrough: i32 = -1;
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            if !self.matches(TokenType::Case) && !self.matches(TokenType::Default) {
                self.advance();
                self.error("Unexpected keyword inside 'switch' statement.");
            }

            if self.previous.typ == TokenType::Default {
                if default_compiled {
                    self.error("switch statement can only have 1 default case.");
                }
                default_compiled = true;
                self.emit(TRUE);
            } else {
                self.emit(DUPLICATE);
                self.expression();
                self.emit(EQUAL);
            }

            self.consume(TokenType::Colon, "Expected ':' after switch case.");

            let next_case = self.emit_jump(JUMP_IF_FALSE);
            self.emit(POP);
            if fallthrough != -1 {
                self.patch_jump(fallthrough as usize);
            }

            self.ctx_mut().switch_case_depth += 1;
            while !self.check(TokenType::Case)
                && !self.check(TokenType::Default)
                && !self.check(TokenType::RightBrace)
                && !self.check(TokenType::Eof)
            {
                self.statement();
            }
            self.ctx_mut().switch_case_depth -= 1;

            fallthrough = self.emit_jump(JUMP) as i32;
            self.patch_jump(next_case);
            self.emit(POP);
        }
        self.consume(TokenType::RightBrace, "Expected '}' after switch body.");

        if fallthrough != -1 {
            self.patch_jump(fallthrough as usize);
        }

        let breaks = mem::take(&mut self.ctx_mut().switch_breaks);
        for site in breaks {
            self.patch_jump(site);
        }

        let ctx = self.ctx_mut();
        ctx.switch_scope_depth = prev_switch_scope;
        ctx.switch_breaks = prev_breaks;

        self.end_scope();
    }
    //<<
}
