//! Contains the Oba parser and bytecode compiler.
//!
//! This is a single-pass compiler: it reads the source text exactly once, emitting bytecode as
//! it parses. Expressions are parsed with a Pratt table ([get_rule]); names resolve to local
//! slots, upvalues, or globals at compile time; function bodies compile in nested [FnContext]s
//! so closures can capture variables from any enclosing function.

use static_assertions::const_assert;

use crate::heap::Heap;
use crate::object::{Function, Gc};
use crate::prelude::*;

/////////////////////////////////////////// Public API ////////////////////////////////////////////

/// Compiles the given Oba source code and, if successful, returns the top-level script
/// [Function]. A [Heap] is required because string literals and identifier names are interned
/// into it; the VM that runs the script must own the same heap.
pub fn compile(source: &str, heap: &mut Heap) -> crate::Result<Gc<Function>> {
    let parser = Parser::new(source);
    let compiler = Compiler::new(parser, heap);
    compiler.compile()
}

///////////////////////////////////// Implementation details //////////////////////////////////////

const U8_COUNT: usize = u8::MAX as usize + 1;

/// `GET_LOCAL` and `SET_LOCAL` address slots with a single byte.
const MAX_LOCALS: usize = U8_COUNT;
/// `GET_UPVALUE` and `SET_UPVALUE` address captures with a single byte.
const MAX_UPVALUES: usize = U8_COUNT;

const_assert!(MAX_LOCALS <= U8_COUNT);
const_assert!(MAX_UPVALUES <= U8_COUNT);

/// Contains the compiler state: the [Parser], the interner, and the stack of function contexts
/// being compiled (innermost first).
struct Compiler<'a, 'h> {
    parser: Parser<'a>,
    heap: &'h mut Heap,
    context: Box<FnContext<'a>>,
}

/// Per-function compilation state. Function declarations nest, so contexts form a stack
/// threaded through `enclosing`; name resolution walks outward along it.
struct FnContext<'a> {
    enclosing: Option<Box<FnContext<'a>>>,
    name: Option<Gc<crate::object::ObaString>>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'a>>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: isize,
}

#[derive(Clone)]
struct Local<'a> {
    name: Lexeme<'a>,
    depth: Option<isize>,
    /// Set when some nested function captures this local; the slot must then be closed, not
    /// popped, when it goes out of scope.
    captured: bool,
}

/// One trailing `CLOSURE` descriptor: which enclosing binding a closure captures.
///
/// `is_local` means the capture is a stack slot of the immediately enclosing function;
/// otherwise `index` chains through that function's own upvalues.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct UpvalueDescriptor {
    index: u8,
    is_local: bool,
}

/// Contains the parser state. For some strange reason, this also includes error status.
#[derive(Debug)]
struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Lexeme<'a>,
    previous: Lexeme<'a>,
    had_error: bool,
    panic_mode: bool,
}

/// A rule in the Pratt parser table. See [Compiler::parse_precedence()] for usage.
#[derive(Copy, Clone)]
struct ParserRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

/// Any possible action taken from the parsing table. Actions take the entire compiler state, and
/// convert it, usually emitting bytecode.
type ParserFn = fn(&mut Compiler, bool) -> ();

/// Precedence rules for [Token]s in Oba.
///
/// Precedence rules have a well-defined partial ordering ([PartialOrd]), which is required for
/// use in the Pratt parsing algorithm.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq)]
enum Precedence {
    None,
    /// The level of a whole expression; `=` assignment is only legal here.
    Lowest,
    /// `==` `!=` `<` `>` `<=` `>=`
    Cond,
    /// `+` `-`
    Sum,
    /// `*` `/`
    Product,
    /// `(` as a call
    Call,
}

///////////////////////////////////////// Implementations /////////////////////////////////////////

impl<'a> Parser<'a> {
    /// Creates a new parser for the given source code, primed on the first token.
    fn new(source: &'a str) -> Parser<'a> {
        let scanner = Scanner::new(source);
        let sentinel = scanner.make_sentinel("<before first token>");

        let mut parser = Parser {
            scanner,
            previous: sentinel,
            current: sentinel,
            had_error: false,
            panic_mode: false,
        };
        parser.advance();
        parser
    }

    /// Update self.previous and self.current such that they move one token further in the token
    /// stream.
    fn advance(&mut self) {
        self.previous = self.current;

        // Get tokens until we get a non-error token.
        loop {
            self.current = self.scanner.scan_token();
            if self.current.token() != Token::Error {
                break;
            }

            self.error_at_current(self.current.text())
        }
    }

    /// Scan the next token. If the token is not of the desired type, an error message is printed.
    fn consume(&mut self, desired_token: Token, message: &'static str) {
        if self.current.token() == desired_token {
            return self.advance();
        }

        self.error_at_current(message);
    }

    /// Return true if the current token is equal to the given token.
    fn check(&self, token: Token) -> bool {
        self.current.token() == token
    }

    /// Scan the next token. Advances if the token matches `desired_token`. Returns whether
    /// `desired_token` was matched.
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        if self.check(desired_token) {
            self.advance();
            return true;
        }
        false
    }

    /// Emit a compiler error, located at the previous [Lexeme]. In Pratt parsing, this is the
    /// handler you usually want to call, because the previous lexeme decided which [ParserRule]
    /// was accepted.
    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message)
    }

    /// Emit a compiler error, located at the current [Lexeme].
    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message)
    }

    /// Emit a compiler error, located at the given [Lexeme].
    fn error_at(&mut self, lexeme: Lexeme<'a>, message: &str) {
        // *Attempt* to prevent a deluge of spurious syntax errors:
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        self.had_error = true;

        // Print the actual message:
        eprint!("Error: [line {}]", lexeme.line());
        if lexeme.token() == Token::Eof {
            eprint!(" at end");
        } else if lexeme.token() == Token::Error {
            // Nothing: the message already describes the lexeme.
        } else if lexeme.token() == Token::Newline {
            eprint!(" at end of line");
        } else {
            eprint!(" at '{}'", lexeme.text());
        }
        eprintln!(": {message}");
    }

    /// Synchronize after being in panic mode.
    ///
    /// The heuristic is that we're going to gobble up and discard tokens until we **think**
    /// we're at a point that makes sense in the grammar: just past a statement separator, or
    /// just before a token that begins a statement. We could be wrong!
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.token() != Token::Eof {
            if matches!(self.previous.token(), Token::Newline | Token::Semicolon) {
                return;
            }

            match self.current.token() {
                Token::Let | Token::Fn | Token::Debug | Token::If | Token::Match => return,
                _ => self.advance(),
            }
        }
    }
}

impl<'a> FnContext<'a> {
    fn new(name: Option<Gc<crate::object::ObaString>>) -> FnContext<'a> {
        let mut locals = Vec::with_capacity(MAX_LOCALS);
        // Slot 0 holds the called closure itself. The empty name can never collide with an
        // identifier, so the slot is unreachable from source code.
        locals.push(Local {
            name: Lexeme::synthetic(""),
            depth: Some(0),
            captured: false,
        });

        FnContext {
            enclosing: None,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    /// Finds the slot for a local, searching innermost scope first. Returns `None` if the name
    /// is not a local of this function (either captured, global, or a mistake).
    fn resolve_local(&self, name: &str, errors: &mut Vec<String>) -> Option<u8> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.text() == name {
                if local.is_uninitialized() {
                    errors.push(format!("Cannot use `{name}` in its own initializer"));
                }
                return Some(i as u8);
            }
        }
        None
    }

    /// Finds (or creates) this function's upvalue index for a name bound by some enclosing
    /// function. Marks the originating local as captured.
    fn resolve_upvalue(&mut self, name: &str, errors: &mut Vec<String>) -> Option<u8> {
        let capture = match self.enclosing.as_mut() {
            None => return None,
            Some(parent) => {
                if let Some(slot) = parent.resolve_local(name, errors) {
                    parent.locals[slot as usize].captured = true;
                    Some((slot, true))
                } else {
                    parent
                        .resolve_upvalue(name, errors)
                        .map(|index| (index, false))
                }
            }
        };

        capture.map(|(index, is_local)| self.add_upvalue(index, is_local, errors))
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool, errors: &mut Vec<String>) -> u8 {
        // Capturing the same binding twice reuses the original entry.
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }

        if self.upvalues.len() >= MAX_UPVALUES {
            errors.push("Internal limit reached: too many captured variables in one function".into());
            return 0;
        }

        self.upvalues.push(UpvalueDescriptor { index, is_local });
        (self.upvalues.len() - 1) as u8
    }

    /// Splits the finished context into the compiled [Function] and the upvalue descriptors the
    /// surrounding `CLOSURE` instruction must carry.
    fn into_parts(self) -> (Function, Vec<UpvalueDescriptor>) {
        let FnContext {
            name,
            arity,
            chunk,
            upvalues,
            ..
        } = self;

        let function = Function {
            arity,
            upvalue_count: upvalues.len(),
            name,
            chunk,
        };
        (function, upvalues)
    }
}

impl<'a, 'h> Compiler<'a, 'h> {
    /// Creates a new compiler with the given [Parser], positioned at the top-level script.
    fn new(parser: Parser<'a>, heap: &'h mut Heap) -> Compiler<'a, 'h> {
        Compiler {
            parser,
            heap,
            context: Box::new(FnContext::new(None)),
        }
    }

    /// Takes ownership of the compiler, and returns the compiled script function.
    fn compile(mut self) -> crate::Result<Gc<Function>> {
        while !self.match_and_advance(Token::Eof) {
            // Blank lines between declarations collapse here.
            if self.match_and_advance(Token::Newline) {
                continue;
            }
            self.declaration();
        }
        self.emit_instruction(OpCode::Exit);

        // Print a listing of the bytecode to manually inspect compiled output.
        if cfg!(feature = "print_code") && !self.parser.had_error {
            crate::debug::disassemble_chunk(&self.context.chunk, "script");
        }

        if self.parser.had_error {
            return Err(InterpretationError::CompileError);
        }

        let (function, _) = self.context.into_parts();
        Ok(Gc::new(function))
    }

    //////////////////////////////////////// Declarations /////////////////////////////////////////

    /// Parse a declaration.
    fn declaration(&mut self) {
        if self.match_and_advance(Token::Let) {
            self.let_declaration();
        } else if self.match_and_advance(Token::Fn) {
            self.fn_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    /// Parse a `let` declaration. Assumes `let` has already been consumed.
    fn let_declaration(&mut self) {
        let global = self.parse_variable("expected a variable name after 'let'");
        self.parser
            .consume(Token::Equal, "expected '=' after the variable name");
        self.expression();
        self.define_variable(global);
    }

    /// Parse a `fn` declaration. Assumes `fn` has already been consumed.
    fn fn_declaration(&mut self) {
        let global = self.parse_variable("expected a function name after 'fn'");
        let name = self.parser.previous;

        // The binding is usable before its initializer finishes, so the body can recurse.
        if self.context.scope_depth > 0 {
            self.mark_initialized();
        }

        self.function(name);
        self.define_variable(global);
    }

    /// Compile one function: parameters, body, and the trailing `CLOSURE` emission into the
    /// surrounding chunk. Assumes the name has just been consumed.
    fn function(&mut self, name: Lexeme<'a>) {
        self.begin_function(name);
        self.begin_scope();

        // Parameters are bare identifiers between the name and the body.
        while self.parser.check(Token::Identifier) {
            self.advance();
            if self.context.arity == u8::MAX {
                self.parser.error("Internal limit reached: too many parameters");
            } else {
                self.context.arity += 1;
            }
            self.declare_variable();
            self.mark_initialized();
        }

        let has_tail = if self.match_and_advance(Token::LeftBrace) {
            self.function_block()
        } else if self.parser.check(Token::Bar) {
            self.match_function_body()
        } else {
            self.parser
                .error_at_current("expected '{' or '|' to begin the function body");
            false
        };

        // The implicit return: the body's tail value if it has one, nil otherwise.
        if !has_tail {
            self.emit_instruction(OpCode::Nil);
        }
        self.emit_instruction(OpCode::Return);

        let (function, upvalues) = self.end_function();
        let index = self.make_constant(Value::Function(Gc::new(function)));
        self.emit_instruction(OpCode::Closure).with_operand(index);

        // The VM consumes one (is_local, index) pair per captured variable while building the
        // closure.
        let line = self.line_number_of_prefix();
        for upvalue in upvalues {
            self.current_chunk().write_byte(u8::from(upvalue.is_local), line);
            self.current_chunk().write_byte(upvalue.index, line);
        }
    }

    /// Push a fresh [FnContext] for the function whose name was just consumed.
    fn begin_function(&mut self, name: Lexeme<'a>) {
        let name = self.heap.intern(name.text());
        let enclosing = std::mem::replace(&mut self.context, Box::new(FnContext::new(Some(name))));
        self.context.enclosing = Some(enclosing);
    }

    /// Pop the current [FnContext], returning to the enclosing function.
    fn end_function(&mut self) -> (Function, Vec<UpvalueDescriptor>) {
        let enclosing = self
            .context
            .enclosing
            .take()
            .expect("cannot end the script context");
        let finished = std::mem::replace(&mut self.context, enclosing);

        if cfg!(feature = "print_code") && !self.parser.had_error {
            let name = finished
                .name
                .as_ref()
                .map(|name| name.as_str().to_owned())
                .unwrap_or_default();
            crate::debug::disassemble_chunk(&finished.chunk, &name);
        }

        finished.into_parts()
    }

    ///////////////////////////////////////// Statements //////////////////////////////////////////

    /// Parse a statement.
    fn statement(&mut self) {
        if self.match_and_advance(Token::Debug) {
            self.debug_statement();
        } else if self.match_and_advance(Token::If) {
            self.if_statement();
        } else if self.match_and_advance(Token::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    /// Parse a `debug` statement. Assumes `debug` has already been consumed.
    fn debug_statement(&mut self) {
        self.expression();
        self.emit_instruction(OpCode::Debug);
    }

    /// Parse an `if` statement with optional `else if` chains and `else`. Assumes `if` has
    /// already been consumed.
    ///
    /// The conditional jump leaves the (strictly boolean) condition on the stack, so both paths
    /// pop it explicitly.
    fn if_statement(&mut self) {
        self.expression();
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);

        self.parser
            .consume(Token::LeftBrace, "expected '{' after the condition");
        self.begin_scope();
        self.block();
        self.end_scope();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_instruction(OpCode::Pop);

        if self.match_and_advance(Token::Else) {
            if self.match_and_advance(Token::If) {
                self.if_statement();
            } else {
                self.parser
                    .consume(Token::LeftBrace, "expected '{' after 'else'");
                self.begin_scope();
                self.block();
                self.end_scope();
            }
        }
        self.patch_jump(else_jump);
    }

    /// Parse a block.
    /// Assumes a new scope has already been created for this block.
    fn block(&mut self) {
        self.skip_newlines();
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.declaration();
            self.skip_newlines();
        }

        self.parser
            .consume(Token::RightBrace, "expected '}' to close the block");
    }

    /// Parse a function body block. Unlike an ordinary block, a bare expression that ends the
    /// body is the function's result; returns whether such a tail value was compiled.
    fn function_block(&mut self) -> bool {
        self.skip_newlines();
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            if self.starts_statement() {
                self.declaration();
            } else {
                self.expression();
                if self.parser.panic_mode {
                    self.parser.synchronize();
                }
                self.skip_newlines();
                if self.parser.check(Token::RightBrace) {
                    self.parser.advance();
                    return true;
                }
                // Not the tail: an ordinary expression statement.
                self.emit_instruction(OpCode::Pop);
            }
            self.skip_newlines();
        }

        self.parser
            .consume(Token::RightBrace, "expected '}' to close the function body");
        false
    }

    /// Returns true if the current token can only begin a statement, never an expression.
    fn starts_statement(&self) -> bool {
        matches!(
            self.parser.current.token(),
            Token::Let | Token::Fn | Token::Debug | Token::If | Token::LeftBrace
        )
    }

    /// Parse an expression statement (e.g., assignments, function calls).
    fn expression_statement(&mut self) {
        self.expression();
        // Statements have no stack effect: the expression's value must not leak.
        self.emit_instruction(OpCode::Pop);
    }

    /// Parse an expression.
    fn expression(&mut self) {
        self.parse_precedence(Precedence::Lowest);
    }

    /// Consume any run of newline tokens.
    fn skip_newlines(&mut self) {
        while self.match_and_advance(Token::Newline) {}
    }

    //////////////////////////////////////////// Match ////////////////////////////////////////////

    /// Compile a chain of match arms. The scrutinee must already be on the stack.
    ///
    /// Each arm pushes its pattern; `JUMP_IF_NOT_MATCH` pops the pattern, peeks the scrutinee,
    /// and skips the arm on inequality. A taken arm pops the scrutinee and leaves its body's
    /// value in its place. Falling off the last arm is a runtime error.
    fn match_arms(&mut self) {
        let mut end_jumps = Vec::new();

        self.skip_newlines();
        self.parser
            .consume(Token::Bar, "expected '|' to begin a match arm");

        loop {
            // The pattern is an ordinary expression, parsed above `=` so assignment cannot
            // swallow the arm.
            self.parse_precedence(Precedence::Cond);
            let next_arm = self.emit_jump(OpCode::JumpIfNotMatch);

            // Matched: replace the scrutinee with the arm's value.
            self.emit_instruction(OpCode::Pop);
            self.parser
                .consume(Token::Equal, "expected '=' between a pattern and its arm");
            self.expression();
            end_jumps.push(self.emit_jump(OpCode::Jump));

            self.patch_jump(next_arm);
            self.skip_newlines();
            if self.match_and_advance(Token::Bar) {
                continue;
            }
            self.parser
                .consume(Token::Semicolon, "expected ';' to close the match");
            break;
        }

        // No arm matched: nothing to do but abort at runtime.
        self.emit_instruction(OpCode::NoMatch);
        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    /// Compile a `| pattern = expr ... ;` function body. The implicit scrutinee is the first
    /// parameter, and the match's value is the function's result.
    fn match_function_body(&mut self) -> bool {
        if self.context.arity == 0 {
            self.parser
                .error_at_current("a match-style function body requires at least one parameter");
        }

        self.emit_instruction(OpCode::GetLocal).with_operand(1);
        self.match_arms();
        true
    }

    ///////////////////////////////////// Scopes and variables ////////////////////////////////////

    /// Create a new block scope. Make sure to decrement it later.
    fn begin_scope(&mut self) {
        self.context.scope_depth += 1;
    }

    /// Pop one scope from the block. Locals that were captured by a closure are closed into
    /// their upvalues instead of discarded.
    fn end_scope(&mut self) {
        assert!(self.context.scope_depth > 0);
        self.context.scope_depth -= 1;

        // The compile-time vector of locals parallels the runtime stack, so popping here pops
        // there too.
        while self.has_locals_beyond_current_scope() {
            let local = self.context.locals.pop().unwrap();
            if local.captured {
                self.emit_instruction(OpCode::CloseUpvalue);
            } else {
                self.emit_instruction(OpCode::Pop);
            }
        }
    }

    /// Returns true if there is a local variable at a scope that is no longer accessible.
    fn has_locals_beyond_current_scope(&self) -> bool {
        self.context
            .locals
            .last()
            .and_then(|local| local.depth)
            .map(|depth| depth > self.context.scope_depth)
            .unwrap_or(false)
    }

    /// Add the identifier text to the current chunk's constants table.
    fn identifier_constant(&mut self, lexeme: Lexeme) -> u8 {
        let name = self.heap.intern(lexeme.text());
        self.make_constant(Value::String(name))
    }

    /// Finds the index in the call stack for a local, or returns None if it's not a local
    /// (either captured, global, or a mistake).
    fn resolve_local(&mut self, name: Lexeme) -> Option<u8> {
        let mut errors = Vec::new();
        let slot = self.context.resolve_local(name.text(), &mut errors);
        for message in errors {
            self.parser.error(&message);
        }
        slot
    }

    /// Finds this function's upvalue index for a name bound by an enclosing function, creating
    /// descriptor entries at every level in between.
    fn resolve_upvalue(&mut self, name: Lexeme) -> Option<u8> {
        let mut errors = Vec::new();
        let index = self.context.resolve_upvalue(name.text(), &mut errors);
        for message in errors {
            self.parser.error(&message);
        }
        index
    }

    /// Indicate that we need a slot for another local variable.
    fn declare_variable(&mut self) {
        if self.context.scope_depth == 0 {
            // Global variables don't need to be "declared"
            return;
        }

        let name = self.parser.previous;

        // Check whether we're redefining elements in the local scope:
        for local in self.context.locals.iter().rev() {
            if local.in_outer_scope(self.context.scope_depth) {
                // It's okay to shadow a variable from an outer scope.
                break;
            }

            // We're in the same scope...
            if name.text() == local.text() {
                // Two variables with the same name in the same scope!
                let message = format!("Already a variable called `{}` in this scope", name.text());
                self.parser.error(&message);
            }
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: Lexeme<'a>) {
        if self.context.locals.len() >= MAX_LOCALS {
            self.parser
                .error("Internal limit reached: too many variables declared");
            return;
        }

        assert_eq!(Token::Identifier, name.token());
        let local = Local {
            name,
            depth: None,
            captured: false,
        };
        self.context.locals.push(local);
    }

    /// Consume the next identifier and interpret it as a variable.
    /// Returns the constant for the identifier name (0 in a local scope, where no constant is
    /// needed).
    fn parse_variable(&mut self, error_message: &'static str) -> u8 {
        self.parser.consume(Token::Identifier, error_message);

        self.declare_variable();
        if self.context.scope_depth > 0 {
            // In a local scope.
            return 0;
        }

        self.identifier_constant(self.parser.previous)
    }

    /// Mark the last local as being initialized.
    fn mark_initialized(&mut self) {
        let depth = self.context.scope_depth;
        self.context
            .locals
            .last_mut()
            .unwrap()
            .initialize_scope_with(depth);
    }

    /// Define a new variable.
    fn define_variable(&mut self, global: u8) {
        if self.context.scope_depth > 0 {
            // It's a local variable. Set that it's ready to be used:
            self.mark_initialized();
            return;
        }

        self.emit_instruction(OpCode::DefineGlobal)
            .with_operand(global);
    }

    /// Parse a variable. This could either be a variable access or an assignment, depending on
    /// `can_assign` and the syntactic context.
    fn named_variable(&mut self, name: Lexeme<'a>, can_assign: bool) {
        let (get_op, set_op, arg) = {
            if let Some(slot) = self.resolve_local(name) {
                (OpCode::GetLocal, OpCode::SetLocal, slot)
            } else if let Some(index) = self.resolve_upvalue(name) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
            } else {
                let arg = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, arg)
            }
        };

        // Peek ahead and look if we're assigning.
        // This only works if we're parsing at a lower or equal precedence to assignment.
        if can_assign && self.match_and_advance(Token::Equal) {
            // We're in an assignment expression!
            // Parse the right-hand side:
            self.expression();
            self.emit_instruction(set_op).with_operand(arg);
        } else {
            // A reference to an existing variable.
            self.emit_instruction(get_op).with_operand(arg);
        }
    }

    //////////////////////////////////////// Pratt parsing ////////////////////////////////////////

    /// The core of the Pratt parsing algorithm.
    ///
    /// See: <https://en.wikipedia.org/wiki/Operator-precedence_parser#Pratt_parsing>
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Lowest;

        // First, figure out how to parse the prefix.
        if let Some(prefix_rule) = self.rule_from_previous().prefix {
            prefix_rule(self, can_assign);
        } else {
            self.parser.error("Expected an expression");
            return;
        }

        while precedence <= self.rule_from_current().precedence {
            // current is now previous:
            self.advance();
            let infix_rule = self
                .rule_from_previous()
                .infix
                .expect("a rule with a defined precedence must always have an infix rule");

            infix_rule(self, can_assign);
        }
    }

    /// Parse a comma-separated argument list. Assumes `(` has already been consumed; consumes
    /// the closing `)`. Returns the argument count.
    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.parser.check(Token::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX as usize {
                    self.parser
                        .error("Internal limit reached: too many arguments");
                } else {
                    count += 1;
                }
                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(Token::RightParen, "expected ')' after arguments");
        count as u8
    }

    //////////////////////////////////////// Emit helpers /////////////////////////////////////////

    /// Appends [OpCode::Constant] to current [Chunk], using the given value.
    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_instruction(OpCode::Constant).with_operand(index);
    }

    /// Appends a new constant to the current [Chunk].
    ///
    /// # Error
    ///
    /// When the constant index is greater than 255 (and thus can no longer be represented as a
    /// u8), this signals a compiler error and returns `0u8`. The current [Chunk] can still be
    /// appended to, however, it is invalid, and should not be emitted as a valid program.
    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().add_constant(value) {
            index
        } else {
            self.parser.error("Too many constants in one chunk");
            0
        }
    }

    /// Writes an [OpCode] to the current [Chunk].
    /// Returns a [WrittenOpcode], with which you can write an operand.
    fn emit_instruction(&mut self, opcode: OpCode) -> crate::chunk::WrittenOpcode {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(opcode, line)
    }

    /// Writes a jump with a placeholder operand, and returns the operand's offset for
    /// [Compiler::patch_jump].
    fn emit_jump(&mut self, opcode: OpCode) -> usize {
        let line = self.line_number_of_prefix();
        let chunk = self.current_chunk();
        chunk.write_opcode(opcode, line);
        chunk.write_byte(0xff, line);
        chunk.write_byte(0xff, line);
        chunk.len() - 2
    }

    /// Point the jump whose operand lives at `operand_at` to the current end of the chunk.
    fn patch_jump(&mut self, operand_at: usize) {
        // The -2 accounts for the operand itself: the distance is measured from just past it.
        let distance = self.current_chunk().len() - operand_at - 2;
        if distance > u16::MAX as usize {
            self.parser.error("Too much code to jump over");
            return;
        }

        self.current_chunk().patch_u16(operand_at, distance as u16);
    }

    ///////////////////////////////////////// Aliases /////////////////////////////////////////////

    /// Returns the current [Chunk].
    #[inline(always)]
    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.context.chunk
    }

    /// Advance one token in scanner, such that:
    /// ```text
    /// (previous, current) = (current, scanner.next_token())
    /// ```
    #[inline(always)]
    fn advance(&mut self) {
        self.parser.advance()
    }

    /// Returns the line number of the prefix token, a.k.a., `self.parser.previous`.
    #[inline(always)]
    fn line_number_of_prefix(&self) -> usize {
        self.parser.previous.line()
    }

    /// Delegates to [Parser::match_and_advance]. Returns true if the token was matched.
    #[inline(always)]
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        self.parser.match_and_advance(desired_token)
    }

    /// Returns the rule of the prefix in the process of being parsed.
    #[inline(always)]
    fn rule_from_previous(&self) -> ParserRule {
        get_rule(self.previous_token())
    }

    /// Returns the rule for the upcoming token.
    #[inline(always)]
    fn rule_from_current(&self) -> ParserRule {
        get_rule(self.parser.current.token())
    }

    /// Return the token (type) of the previous value. This is useful in prefix parser functions.
    #[inline(always)]
    fn previous_token(&self) -> Token {
        self.parser.previous.token()
    }
}

impl<'a> Local<'a> {
    /// Returns true if the variable is not available for use yet.
    ///
    /// Use [Local::initialize_scope_with()] to initialize.
    #[inline(always)]
    fn is_uninitialized(&self) -> bool {
        self.depth.is_none()
    }

    /// Set the scope of this local. Re-initializing is fine: `fn` bindings are initialized
    /// before their body compiles and again when defined.
    #[inline]
    fn initialize_scope_with(&mut self, scope_depth: isize) {
        self.depth = Some(scope_depth);
    }

    /// Returns true when the local is in an outer scope (thus, is accessible).
    #[inline(always)]
    fn in_outer_scope(&self, scope_depth: isize) -> bool {
        matches!(self.depth, Some(depth) if depth < scope_depth)
    }

    /// Return the name of this local.
    fn text(&self) -> &'a str {
        self.name.text()
    }
}

////////////////////////////////////////// Parser rules ///////////////////////////////////////////

/// Makes defining [ParserRule]s a bit cleaner looking.
macro_rules! rule {
    ($prefix:expr, $infix:expr, $precedence:expr) => {
        ParserRule {
            prefix: $prefix,
            infix: $infix,
            precedence: $precedence,
        }
    };
}

#[rustfmt::skip]
fn get_rule(token: Token) -> ParserRule {
    use Token::*;
    match token {
        //                       Prefix                  Infix         Precedence
        LeftParen      => rule!{ Some(grouping),         Some(call),   Precedence::Call },
        RightParen     => rule!{ None,                   None,         Precedence::None },
        LeftBrace      => rule!{ None,                   None,         Precedence::None },
        RightBrace     => rule!{ None,                   None,         Precedence::None },
        Comma          => rule!{ None,                   None,         Precedence::None },
        Minus          => rule!{ None,                   Some(binary), Precedence::Sum },
        Plus           => rule!{ None,                   Some(binary), Precedence::Sum },
        Star           => rule!{ None,                   Some(binary), Precedence::Product },
        Slash          => rule!{ None,                   Some(binary), Precedence::Product },
        Bar            => rule!{ None,                   None,         Precedence::None },
        Semicolon      => rule!{ None,                   None,         Precedence::None },
        Bang           => rule!{ Some(unary),            None,         Precedence::None },
        BangEqual      => rule!{ None,                   Some(binary), Precedence::Cond },
        Equal          => rule!{ None,                   None,         Precedence::None },
        EqualEqual     => rule!{ None,                   Some(binary), Precedence::Cond },
        EqualGreater   => rule!{ None,                   None,         Precedence::None },
        Greater        => rule!{ None,                   Some(binary), Precedence::Cond },
        GreaterEqual   => rule!{ None,                   Some(binary), Precedence::Cond },
        Less           => rule!{ None,                   Some(binary), Precedence::Cond },
        LessEqual      => rule!{ None,                   Some(binary), Precedence::Cond },
        Identifier     => rule!{ Some(variable),         None,         Precedence::None },
        StrLiteral     => rule!{ Some(string),           None,         Precedence::None },
        Number         => rule!{ Some(number),           None,         Precedence::None },
        Let            => rule!{ None,                   None,         Precedence::None },
        Fn             => rule!{ None,                   None,         Precedence::None },
        Debug          => rule!{ None,                   None,         Precedence::None },
        If             => rule!{ None,                   None,         Precedence::None },
        Else           => rule!{ None,                   None,         Precedence::None },
        Match          => rule!{ Some(match_expression), None,         Precedence::None },
        True           => rule!{ Some(literal),          None,         Precedence::None },
        False          => rule!{ Some(literal),          None,         Precedence::None },
        Newline        => rule!{ None,                   None,         Precedence::None },
        Error          => rule!{ None,                   None,         Precedence::None },
        Eof            => rule!{ None,                   None,         Precedence::None },
    }
}

/// Parse '(' as a prefix. Assumes '(' has been consumed.
fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::LeftParen, compiler.previous_token());
    compiler.expression();
    compiler
        .parser
        .consume(Token::RightParen, "expected ')' after grouping");
}

/// Parse '(' as an infix: a call expression. The callee is already on the stack.
fn call(compiler: &mut Compiler, _can_assign: bool) {
    let argc = compiler.argument_list();
    compiler.emit_instruction(OpCode::Call).with_operand(argc);
}

/// Parse a number literal as a prefix. Assumes the number has been consumed.
fn number(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::Number, compiler.previous_token());
    let value = compiler
        .parser
        .previous
        .text()
        .parse::<f64>()
        .expect("Internal error: Token::Number MUST parse as a float, but didn't?");
    compiler.emit_constant(value.into());
}

/// Parse an unary operator as a prefix. Assumes the operator has been consumed.
fn unary(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::Bang, compiler.previous_token());

    // Compile the operand, so that it's placed on the stack. Unary binds tighter than any
    // binary operator.
    compiler.parse_precedence(Precedence::Call);
    compiler.emit_instruction(OpCode::Not);
}

/// Parse a binary operator as an infix. Assumes the operator has been consumed.
fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();
    let rule = get_rule(operator);

    // Oba's binary operators are right-associative: the right operand re-enters the parser at
    // the operator's own level, so `1 - 2 - 3` parses as `1 - (2 - 3)`.
    compiler.parse_precedence(rule.precedence);

    match operator {
        Token::BangEqual => compiler.emit_instruction(OpCode::NotEqual),
        Token::EqualEqual => compiler.emit_instruction(OpCode::Equal),
        Token::Greater => compiler.emit_instruction(OpCode::Greater),
        Token::GreaterEqual => compiler.emit_instruction(OpCode::GreaterEqual),
        Token::Less => compiler.emit_instruction(OpCode::Less),
        Token::LessEqual => compiler.emit_instruction(OpCode::LessEqual),
        Token::Plus => compiler.emit_instruction(OpCode::Add),
        Token::Minus => compiler.emit_instruction(OpCode::Subtract),
        Token::Star => compiler.emit_instruction(OpCode::Multiply),
        Token::Slash => compiler.emit_instruction(OpCode::Divide),
        _ => unreachable!(),
    };
}

/// Parse a keyword literal as a prefix. Assumes the keyword has been consumed.
fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.previous_token() {
        Token::False => compiler.emit_instruction(OpCode::False),
        Token::True => compiler.emit_instruction(OpCode::True),
        _ => unreachable!(),
    };
}

/// Parse a string literal. Interns its contents and adds them to the constant pool.
fn string(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::StrLiteral, compiler.previous_token());

    // Access the string contents (without the quotes)
    let literal = compiler.parser.previous.text();
    debug_assert!(literal.len() >= 2);
    debug_assert!(literal.starts_with('"'));
    debug_assert!(literal.ends_with('"'));

    let last_index = literal.len() - 1;
    let contents = &literal[1..last_index];
    let interned = compiler.heap.intern(contents);
    compiler.emit_constant(Value::String(interned));
}

/// Parse a variable. It can be either a variable access or assignment, which is why `can_assign`
/// is required by all callbacks!
fn variable(compiler: &mut Compiler, can_assign: bool) {
    compiler.named_variable(compiler.parser.previous, can_assign);
}

/// Parse a `match` expression as a prefix. Assumes `match` has been consumed.
fn match_expression(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::Match, compiler.previous_token());

    // The scrutinee, compiled exactly once.
    compiler.expression();
    compiler.match_arms();
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::object::ObaString;

    fn compile_ok(source: &str) -> Gc<Function> {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect("program should compile")
    }

    fn compile_err(source: &str) -> InterpretationError {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("program should not compile")
    }

    /// Decode the opcode at a byte offset.
    fn opcode_at(function: &Function, offset: usize) -> OpCode {
        function
            .chunk
            .get(offset)
            .expect("offset in range")
            .as_opcode()
            .expect("a valid opcode")
    }

    fn byte_at(function: &Function, offset: usize) -> u8 {
        function.chunk.get(offset).expect("offset in range").as_byte()
    }

    /// Finds the function constant with the given name in a chunk's pool.
    fn function_constant(function: &Function, name: &str) -> Gc<Function> {
        for i in 0..function.chunk.constants.len() {
            if let Some(Value::Function(inner)) = function.chunk.constants.get(i) {
                let inner_name: Option<&Gc<ObaString>> = inner.name.as_ref();
                if inner_name.map(|n| n.as_str()) == Some(name) {
                    return inner;
                }
            }
        }
        panic!("no function constant named {name}");
    }

    #[test]
    fn precedence_confidence_check() {
        // Comparisons bind looser than arithmetic...
        assert!(Precedence::Cond < Precedence::Sum);
        // ...multiplication binds tighter than addition...
        assert!(Precedence::Sum < Precedence::Product);
        // ...and calls bind tightest of all.
        assert!(Precedence::Product < Precedence::Call);
        // Assignment only happens at the loosest level.
        assert!(Precedence::Lowest < Precedence::Cond);
    }

    #[test]
    fn global_let_emits_define_global() {
        let script = compile_ok("let a = 1");

        assert_eq!(OpCode::Constant, opcode_at(&script, 0));
        assert_eq!(OpCode::DefineGlobal, opcode_at(&script, 2));
        assert_eq!(OpCode::Exit, opcode_at(&script, 4));

        let initializer = script.chunk.get(1).unwrap().resolve_constant().unwrap();
        assert!(initializer.oba_equal(&Value::from(1.0)));
    }

    #[test]
    fn block_locals_resolve_to_slots() {
        let script = compile_ok("{ let a = 1 debug a }");

        // Slot 0 is reserved, so `a` lives in slot 1; the block pops it on exit.
        assert_eq!(OpCode::Constant, opcode_at(&script, 0));
        assert_eq!(OpCode::GetLocal, opcode_at(&script, 2));
        assert_eq!(1, byte_at(&script, 3));
        assert_eq!(OpCode::Debug, opcode_at(&script, 4));
        assert_eq!(OpCode::Pop, opcode_at(&script, 5));
        assert_eq!(OpCode::Exit, opcode_at(&script, 6));
    }

    #[test]
    fn binary_operators_are_right_associative() {
        let script = compile_ok("debug 1 - 2 - 3");

        // All three constants load before either subtraction happens.
        assert_eq!(OpCode::Constant, opcode_at(&script, 0));
        assert_eq!(OpCode::Constant, opcode_at(&script, 2));
        assert_eq!(OpCode::Constant, opcode_at(&script, 4));
        assert_eq!(OpCode::Subtract, opcode_at(&script, 6));
        assert_eq!(OpCode::Subtract, opcode_at(&script, 7));
        assert_eq!(OpCode::Debug, opcode_at(&script, 8));
    }

    #[test]
    fn closures_capture_enclosing_locals() {
        let script = compile_ok("fn make x { fn get { x } get }\nlet g = make(42)\ndebug g()");

        let make = function_constant(&script, "make");
        let get = function_constant(&make, "get");

        assert_eq!(1, make.arity);
        assert_eq!(0, make.upvalue_count);
        assert_eq!(1, get.upvalue_count);

        // make's body: build the closure over slot 1 (the parameter x)...
        assert_eq!(OpCode::Closure, opcode_at(&make, 0));
        assert_eq!(1, byte_at(&make, 2), "descriptor flag: a local capture");
        assert_eq!(1, byte_at(&make, 3), "descriptor index: slot of x");
        // ...then return the local `get` (slot 2) as the tail value.
        assert_eq!(OpCode::GetLocal, opcode_at(&make, 4));
        assert_eq!(2, byte_at(&make, 5));
        assert_eq!(OpCode::Return, opcode_at(&make, 6));

        // get's body reads the capture.
        assert_eq!(OpCode::GetUpvalue, opcode_at(&get, 0));
        assert_eq!(0, byte_at(&get, 1));
        assert_eq!(OpCode::Return, opcode_at(&get, 2));
    }

    #[test]
    fn nested_captures_chain_through_upvalues() {
        let script =
            compile_ok("fn outer x { fn middle { fn inner { x } inner } middle }\nouter(1)");

        let outer = function_constant(&script, "outer");
        let middle = function_constant(&outer, "middle");
        let inner = function_constant(&middle, "inner");

        assert_eq!(1, middle.upvalue_count);
        assert_eq!(1, inner.upvalue_count);

        // middle captures outer's local x directly...
        assert_eq!(OpCode::Closure, opcode_at(&outer, 0));
        assert_eq!(1, byte_at(&outer, 2));
        assert_eq!(1, byte_at(&outer, 3));
        // ...and inner chains through middle's upvalue 0.
        assert_eq!(OpCode::Closure, opcode_at(&middle, 0));
        assert_eq!(0, byte_at(&middle, 2), "descriptor flag: not a local");
        assert_eq!(0, byte_at(&middle, 3), "descriptor index: middle's upvalue 0");
    }

    #[test]
    fn functions_without_a_tail_return_nil() {
        let script = compile_ok("fn noop { let a = 1 }");
        let noop = function_constant(&script, "noop");

        let len = noop.chunk.len();
        assert_eq!(OpCode::Return, opcode_at(&noop, len - 1));
        assert_eq!(OpCode::Nil, opcode_at(&noop, len - 2));
    }

    #[test]
    fn match_falls_through_to_no_match() {
        let script = compile_ok("debug match 1 | 1 = 2 ;");

        // scrutinee, pattern, conditional skip, pop, body, jump to end, NO_MATCH.
        assert_eq!(OpCode::Constant, opcode_at(&script, 0));
        assert_eq!(OpCode::Constant, opcode_at(&script, 2));
        assert_eq!(OpCode::JumpIfNotMatch, opcode_at(&script, 4));
        assert_eq!(OpCode::Pop, opcode_at(&script, 7));
        assert_eq!(OpCode::Constant, opcode_at(&script, 8));
        assert_eq!(OpCode::Jump, opcode_at(&script, 10));
        assert_eq!(OpCode::NoMatch, opcode_at(&script, 13));
        assert_eq!(OpCode::Debug, opcode_at(&script, 14));

        // The failed match lands exactly on NO_MATCH; the taken arm jumps just past it.
        assert_eq!(Some(6), script.chunk.read_u16(5));
        assert_eq!(Some(1), script.chunk.read_u16(11));
    }

    #[test]
    fn match_body_functions_match_on_their_first_parameter() {
        let script = compile_ok("fn fib n | 0 = 0 | 1 = 1 | n = fib(n - 1) + fib(n - 2) ;");
        let fib = function_constant(&script, "fib");

        assert_eq!(1, fib.arity);
        assert_eq!(OpCode::GetLocal, opcode_at(&fib, 0));
        assert_eq!(1, byte_at(&fib, 1), "the scrutinee is parameter slot 1");
    }

    #[test]
    fn error_cases() {
        assert!(matches!(
            compile_err("let = 1"),
            InterpretationError::CompileError
        ));
        assert!(matches!(
            compile_err("debug (1"),
            InterpretationError::CompileError
        ));
        assert!(matches!(
            compile_err("{ let a = 1\nlet a = 2 }"),
            InterpretationError::CompileError
        ));
        assert!(matches!(
            compile_err("{ let a = a }"),
            InterpretationError::CompileError
        ));
        // A match-style body needs a parameter to match on.
        assert!(matches!(
            compile_err("fn nope | 1 = 2 ;"),
            InterpretationError::CompileError
        ));
        // `=>` is reserved but meaningless.
        assert!(matches!(
            compile_err("debug 1 => 2"),
            InterpretationError::CompileError
        ));
    }

    #[test]
    fn errors_do_not_stop_the_parse() {
        // Both statements are broken; the parser must recover at the newline and keep going.
        let mut heap = Heap::new();
        let result = compile("let = 1\nlet = 2", &mut heap);
        assert!(matches!(result, Err(InterpretationError::CompileError)));
    }
}
