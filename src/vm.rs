//! The bytecode virtual machine.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Weak;

use static_assertions::const_assert;

use crate::compiler;
use crate::heap::Heap;
use crate::object::{Closure, Gc, ObaString, Upvalue, UpvalueCell};
use crate::prelude::*;
use crate::table::Table;

/// Value-stack depth. Overflowing it is a runtime error.
const STACK_MAX: usize = 256;
/// Call-frame depth. Overflowing it is a runtime error.
const FRAMES_MAX: usize = 256;
// Every frame needs at least its callee slot on the value stack.
const_assert!(STACK_MAX >= FRAMES_MAX);

/// Maintains state for the Oba virtual machine: the value stack, the call frames, the globals,
/// the string heap, and the open upvalues. One `VM` can [interpret][VM::interpret] any number of
/// programs; globals and interned strings persist between runs.
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    heap: Heap,
    /// Upvalues still pointing into the stack, sorted by descending slot.
    open_upvalues: Vec<UpvalueCell>,
    /// Every upvalue cell this VM ever created, weakly. Upvalue cells are the only mutable
    /// links in the object graph, so emptying them at teardown breaks any closure cycle.
    all_upvalues: Vec<Weak<RefCell<Upvalue>>>,
    /// Where `debug` statements write. Stdout, unless the embedder redirects it.
    debug_sink: Box<dyn Write>,
}

/// A record of one in-progress call: which closure is running, where it is in its chunk, and
/// where its window of stack slots begins.
struct CallFrame {
    closure: Gc<Closure>,
    /// Index into the closure's chunk for the next instruction.
    ip: usize,
    /// Stack index of slot 0 for this call: the callee itself. Arguments follow.
    slot_base: usize,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl VM {
    /// A fresh VM with empty globals and an empty string table, debugging to stdout.
    pub fn new() -> VM {
        VM::with_debug_sink(Box::new(io::stdout()))
    }

    /// A fresh VM whose `debug` statements write to the given sink instead of stdout.
    pub fn with_debug_sink(debug_sink: Box<dyn Write>) -> VM {
        VM {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            heap: Heap::new(),
            open_upvalues: Vec::new(),
            all_upvalues: Vec::new(),
            debug_sink,
        }
    }

    /// Compile `source` and, on success, execute it from the top.
    ///
    /// Whatever the outcome, the stack and frames are clean afterwards, so the same VM can keep
    /// interpreting.
    pub fn interpret(&mut self, source: &str) -> crate::Result<()> {
        let function = compiler::compile(source, &mut self.heap)?;
        let script = Gc::new(Closure {
            function,
            upvalues: Vec::new(),
        });

        self.push(Value::Closure(Gc::clone(&script)))?;
        self.call(script, 0)?;

        let result = self.run();
        self.reset();
        result
    }

    /// The main opcode interpreter loop.
    fn run(&mut self) -> crate::Result<()> {
        use OpCode::*;

        loop {
            if cfg!(feature = "trace_execution") {
                use crate::debug::disassemble_instruction;

                // Prints the current stack:
                print!("        ");
                for value in self.stack.iter() {
                    print!("[ {value} ]")
                }
                println!();

                // Print the next instruction:
                let frame = self.frames.last().expect("the VM always runs in a frame");
                disassemble_instruction(&frame.closure.function.chunk, frame.ip);
            }

            let opcode = self.read_opcode();
            match opcode {
                Constant => {
                    let constant = self.read_constant();
                    self.push(constant)?;
                }
                Nil => self.push(Value::Nil)?,
                True => self.push(true.into())?,
                False => self.push(false.into())?,
                Pop => {
                    self.pop();
                }
                Add => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    match (lhs, rhs) {
                        (Value::Number(a), Value::Number(b)) => self.push((a + b).into())?,
                        (Value::String(a), Value::String(b)) => {
                            let concatenated =
                                self.heap.intern(&format!("{}{}", a.as_str(), b.as_str()));
                            self.push(Value::String(concatenated))?;
                        }
                        _ => return self.runtime_error("Expected numeric or string operands"),
                    }
                }
                Subtract => self.binary_op(|a, b| a - b)?,
                Multiply => self.binary_op(|a, b| a * b)?,
                Divide => self.binary_op(|a, b| a / b)?,
                Not => {
                    let value = self.pop();
                    match value.as_bool() {
                        Some(b) => self.push((!b).into())?,
                        None => return self.runtime_error("Expected a boolean operand"),
                    }
                }
                Equal => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push(lhs.oba_equal(&rhs).into())?;
                }
                NotEqual => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push((!lhs.oba_equal(&rhs)).into())?;
                }
                Less => self.binary_op(|a, b| a < b)?,
                Greater => self.binary_op(|a, b| a > b)?,
                LessEqual => self.binary_op(|a, b| a <= b)?,
                GreaterEqual => self.binary_op(|a, b| a >= b)?,
                Debug => {
                    let value = self.pop();
                    // The sink is fire-and-forget; a broken pipe must not take the VM down.
                    let _ = writeln!(self.debug_sink, "DEBUG: {value}");
                }
                DefineGlobal => {
                    let name = self.read_string_constant();
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                GetGlobal => {
                    let name = self.read_string_constant();
                    match self.globals.get(&name) {
                        Some(value) => self.push(value)?,
                        None => {
                            let message = format!("Undefined variable '{}'", name.as_str());
                            return self.runtime_error(&message);
                        }
                    }
                }
                SetGlobal => {
                    let name = self.read_string_constant();
                    let value = self.peek(0).clone();
                    if self.globals.set(Gc::clone(&name), value) {
                        // Assignment must not create globals; undo the insertion.
                        self.globals.delete(&name);
                        let message = format!("Undefined variable '{}'", name.as_str());
                        return self.runtime_error(&message);
                    }
                }
                GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slot_base + slot].clone();
                    self.push(value)?;
                }
                SetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0).clone();
                    let base = self.frame().slot_base;
                    self.stack[base + slot] = value;
                }
                GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let cell = Gc::clone(&self.frame().closure.upvalues[index]);
                    let value = match &*cell.borrow() {
                        Upvalue::Open(slot) => self.stack[*slot].clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value)?;
                }
                SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0).clone();
                    let cell = Gc::clone(&self.frame().closure.upvalues[index]);
                    let mut upvalue = cell.borrow_mut();
                    match &mut *upvalue {
                        Upvalue::Open(slot) => self.stack[*slot] = value,
                        Upvalue::Closed(stored) => *stored = value,
                    }
                }
                Jump => {
                    let distance = self.read_u16() as usize;
                    self.frame_mut().ip += distance;
                }
                JumpIfFalse => {
                    let distance = self.read_u16() as usize;
                    match self.peek(0).as_bool() {
                        Some(false) => self.frame_mut().ip += distance,
                        Some(true) => {}
                        None => return self.runtime_error("Expected a boolean operand"),
                    }
                }
                JumpIfTrue => {
                    let distance = self.read_u16() as usize;
                    match self.peek(0).as_bool() {
                        Some(true) => self.frame_mut().ip += distance,
                        Some(false) => {}
                        None => return self.runtime_error("Expected a boolean operand"),
                    }
                }
                JumpIfNotMatch => {
                    let distance = self.read_u16() as usize;
                    let pattern = self.pop();
                    if !pattern.oba_equal(self.peek(0)) {
                        self.frame_mut().ip += distance;
                    }
                }
                Loop => {
                    let target = self.read_u16() as usize;
                    self.frame_mut().ip = target;
                }
                Call => {
                    let argc = self.read_byte();
                    self.call_value(argc)?;
                }
                Closure => {
                    let function = match self.read_constant() {
                        Value::Function(function) => function,
                        _ => panic!("CLOSURE operand must be a function constant"),
                    };

                    let mut upvalues = Vec::with_capacity(function.upvalue_count);
                    for _ in 0..function.upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let cell = if is_local {
                            let slot = self.frame().slot_base + index;
                            self.capture_upvalue(slot)
                        } else {
                            Gc::clone(&self.frame().closure.upvalues[index])
                        };
                        upvalues.push(cell);
                    }

                    self.push(Value::Closure(Gc::new(crate::object::Closure {
                        function,
                        upvalues,
                    })))?;
                }
                CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                NoMatch => return self.runtime_error("No pattern matched the value"),
                Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("RETURN outside of a frame");
                    self.close_upvalues(frame.slot_base);
                    self.stack.truncate(frame.slot_base);

                    if self.frames.is_empty() {
                        // Returning from the top frame halts.
                        return Ok(());
                    }
                    self.push(result)?;
                }
                Exit => return Ok(()),
            }
        }
    }

    //////////////////////////////////////////// Calls ////////////////////////////////////////////

    /// Dispatch a `CALL`: the callee sits beneath `argc` arguments.
    fn call_value(&mut self, argc: u8) -> crate::Result<()> {
        let callee = self.peek(argc as usize).clone();
        match callee {
            Value::Closure(closure) => self.call(closure, argc),
            _ => self.runtime_error("Can only call functions"),
        }
    }

    /// Push a frame for `closure`. Slot 0 of the new window is the callee itself; the arguments
    /// are already in slots 1..=argc.
    fn call(&mut self, closure: Gc<Closure>, argc: u8) -> crate::Result<()> {
        if argc != closure.function.arity {
            let message = format!(
                "Expected {} arguments but got {}",
                closure.function.arity, argc
            );
            return self.runtime_error(&message);
        }

        if self.frames.len() >= FRAMES_MAX {
            return self.runtime_error("Stack overflow");
        }

        let slot_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base,
        });
        Ok(())
    }

    /////////////////////////////////////////// Upvalues //////////////////////////////////////////

    /// Returns the open upvalue for a stack slot, creating it if no closure has captured the
    /// slot yet. The open list stays sorted by descending slot so the scan can stop early.
    fn capture_upvalue(&mut self, slot: usize) -> UpvalueCell {
        let mut insert_at = self.open_upvalues.len();
        for (i, cell) in self.open_upvalues.iter().enumerate() {
            let open_slot = match *cell.borrow() {
                Upvalue::Open(open_slot) => open_slot,
                Upvalue::Closed(_) => unreachable!("closed upvalue on the open list"),
            };
            if open_slot == slot {
                return Gc::clone(cell);
            }
            if open_slot < slot {
                insert_at = i;
                break;
            }
        }

        let cell = Gc::new(RefCell::new(Upvalue::Open(slot)));
        self.all_upvalues.push(Gc::downgrade(&cell));
        self.open_upvalues.insert(insert_at, Gc::clone(&cell));
        cell
    }

    /// Close every open upvalue pointing at `from_slot` or above: the captured values move off
    /// the stack into their cells. Candidates are always at the front of the (descending) list.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(cell) = self.open_upvalues.first() {
            let slot = match *cell.borrow() {
                Upvalue::Open(slot) => slot,
                Upvalue::Closed(_) => unreachable!("closed upvalue on the open list"),
            };
            if slot < from_slot {
                break;
            }

            let cell = self.open_upvalues.remove(0);
            let value = self.stack[slot].clone();
            *cell.borrow_mut() = Upvalue::Closed(value);
        }
    }

    ////////////////////////////////////// Errors and resets //////////////////////////////////////

    /// Report a runtime error to stderr and bail out of this `interpret` call. The VM stays
    /// usable afterwards.
    fn runtime_error<T>(&mut self, message: &str) -> crate::Result<T> {
        match self.current_line() {
            Some(line) => eprintln!("Error: [line {line}] {message}"),
            None => eprintln!("Error: {message}"),
        }

        self.reset();
        Err(InterpretationError::RuntimeError)
    }

    /// The source line of the instruction being executed, if a frame is live.
    fn current_line(&self) -> Option<usize> {
        let frame = self.frames.last()?;
        let chunk = &frame.closure.function.chunk;
        chunk.line_number_for(frame.ip.saturating_sub(1))
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        // Drop registry entries whose cells have already been released.
        self.all_upvalues.retain(|cell| cell.strong_count() > 0);
    }

    //////////////////////////////////// Bytecode stream access ///////////////////////////////////

    #[inline(always)]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("the VM always runs in a frame")
    }

    #[inline(always)]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames
            .last_mut()
            .expect("the VM always runs in a frame")
    }

    /// Fetches the next byte from the current chunk, **AND** increments the instruction pointer.
    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame
            .closure
            .function
            .chunk
            .get(frame.ip)
            .expect("I have an instruction pointer within range")
            .as_byte();
        frame.ip += 1;
        byte
    }

    fn read_opcode(&mut self) -> OpCode {
        let byte = self.read_byte();
        OpCode::try_from(byte)
            .unwrap_or_else(|_| panic!("fetched invalid opcode {byte} at {}", self.frame().ip - 1))
    }

    /// Fetches a big-endian, two-byte operand.
    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        u16::from_be_bytes([high, low])
    }

    /// Fetches a one-byte constant index and resolves it in the current chunk.
    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.frame()
            .closure
            .function
            .chunk
            .constants
            .get(index)
            .expect("there should be a constant at this index")
    }

    /// Like [VM::read_constant], for operands that are always interned names.
    fn read_string_constant(&mut self) -> Gc<ObaString> {
        match self.read_constant() {
            Value::String(name) => name,
            _ => panic!("expected a string constant"),
        }
    }

    //////////////////////////////////////// Stack access /////////////////////////////////////////

    /// Pops two numeric operands on the stack to perform a binary operation.
    fn binary_op<F, T>(&mut self, op: F) -> crate::Result<()>
    where
        F: Fn(f64, f64) -> T,
        T: Into<Value>,
    {
        let rhs = self.pop();
        let lhs = self.pop();

        use Value::Number;
        match (lhs, rhs) {
            (Number(a), Number(b)) => self.push(op(a, b).into()),
            (_, _) => self.runtime_error("Expected numeric operands"),
        }
    }

    /// Pushes a [Value] on to the value stack. The stack is bounded, so this can fail.
    fn push(&mut self, value: Value) -> crate::Result<()> {
        if self.stack.len() >= STACK_MAX {
            return self.runtime_error("Stack overflow");
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pops and returns the top [Value] on the value stack.
    ///
    /// # Panics
    ///
    /// Panics when the value stack is empty. Given well-formed Oba bytecode, a pop cannot occur
    /// when the value stack is empty; therefore the interpreter panics if it is in this state.
    #[inline(always)]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack is empty")
    }

    /// Peeks at the value relative to the top of the stack.
    ///
    /// # Panics
    ///
    ///  * When the stack is empty
    ///  * When the distance goes off the end of the stack
    #[inline(always)]
    fn peek(&self, distance: usize) -> &Value {
        self.stack
            .get(self.stack.len() - 1 - distance)
            .expect("peeked escaped bounds of the stack")
    }
}

impl Default for VM {
    fn default() -> VM {
        VM::new()
    }
}

impl Drop for VM {
    /// Teardown, a.k.a. `free_vm`. Closures can form reference cycles through their captured
    /// variables (two closures capturing slots later reassigned to hold each other). Every
    /// such cycle passes through an upvalue cell, so emptying the registered cells breaks all
    /// of them and reference counting releases every object this VM allocated.
    fn drop(&mut self) {
        for cell in self.all_upvalues.drain(..) {
            if let Some(cell) = cell.upgrade() {
                *cell.borrow_mut() = Upvalue::Closed(Value::Nil);
            }
        }
    }
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use pretty_assertions::assert_eq;

    use super::*;

    /// A debug sink the test can read back after the VM is done with it.
    #[derive(Clone, Default)]
    struct CapturedOutput(Rc<RefCell<Vec<u8>>>);

    impl Write for CapturedOutput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run(source: &str) -> (crate::Result<()>, String) {
        let output = CapturedOutput::default();
        let mut vm = VM::with_debug_sink(Box::new(output.clone()));
        let result = vm.interpret(source);
        let text = String::from_utf8(output.0.borrow().clone()).expect("debug output is UTF-8");
        (result, text)
    }

    /// Runs a program expected to succeed; returns its debug output.
    fn debug_output(source: &str) -> String {
        let (result, output) = run(source);
        result.expect("program should run cleanly");
        output
    }

    /// Runs a program expected to die at runtime; returns the output produced before the error.
    fn runtime_failure(source: &str) -> String {
        let (result, output) = run(source);
        assert!(matches!(result, Err(InterpretationError::RuntimeError)));
        output
    }

    #[test]
    fn arithmetic_and_variables() {
        let source = "let a = 1
let b = 2
debug a + b";
        assert_eq!("DEBUG: 3\n", debug_output(source));
    }

    #[test]
    fn arithmetic_is_right_associative() {
        assert_eq!("DEBUG: 2\n", debug_output("debug 1 - 2 - 3"));
        // 6 / (2 / 2), not (6 / 2) / 2.
        assert_eq!("DEBUG: 6\n", debug_output("debug 6 / 2 / 2"));
    }

    #[test]
    fn number_formatting_is_compact() {
        assert_eq!("DEBUG: 3.5\n", debug_output("debug 7 / 2"));
        assert_eq!("DEBUG: -1\n", debug_output("debug 2 - 3"));
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!("DEBUG: true\n", debug_output("debug 1 < 2"));
        assert_eq!("DEBUG: false\n", debug_output("debug 2 <= 1"));
        assert_eq!("DEBUG: true\n", debug_output("debug !(1 > 2)"));
        assert_eq!("DEBUG: true\n", debug_output("debug 1 != 2"));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!("DEBUG: foobar\n", debug_output("debug \"foo\" + \"bar\""));
    }

    #[test]
    fn string_interning_gives_content_equality() {
        assert_eq!("DEBUG: true\n", debug_output("debug \"ab\" == \"ab\""));
        // Even strings built at runtime land in the same intern table.
        assert_eq!(
            "DEBUG: true\n",
            debug_output("debug (\"a\" + \"b\") == \"ab\"")
        );
    }

    #[test]
    fn if_else_statements() {
        let source = "if 1 < 2 {
    debug \"then\"
} else {
    debug \"else\"
}
if 2 < 1 {
    debug \"then\"
} else if true {
    debug \"chained\"
}";
        assert_eq!("DEBUG: then\nDEBUG: chained\n", debug_output(source));
    }

    #[test]
    fn scope_discipline() {
        let source = "let a = 1
{
    let a = 2
    debug a
}
debug a";
        assert_eq!("DEBUG: 2\nDEBUG: 1\n", debug_output(source));
    }

    #[test]
    fn function_call_and_closure_over_argument() {
        let source = "fn make x { fn get { x } get }
let g = make(42)
debug g()";
        assert_eq!("DEBUG: 42\n", debug_output(source));
    }

    #[test]
    fn functions_print_their_names() {
        let source = "fn make x { x }
debug make";
        assert_eq!("DEBUG: <fn make>\n", debug_output(source));
    }

    #[test]
    fn empty_function_returns_nil() {
        assert_eq!("DEBUG: nil\n", debug_output("fn noop { }\ndebug noop()"));
    }

    #[test]
    fn nested_upvalues_chain_outward() {
        let source = "fn outer a {
    fn middle {
        fn inner { a }
        debug inner()
        \"middle\"
    }
    debug middle()
    \"outer\"
}
debug outer(\"arg\")";
        assert_eq!(
            "DEBUG: arg\nDEBUG: middle\nDEBUG: outer\n",
            debug_output(source)
        );
    }

    #[test]
    fn closed_upvalues_persist_and_mutate() {
        let source = "fn counter start {
    fn bump {
        start = start + 1
        start
    }
    bump
}
let tick = counter(10)
debug tick()
debug tick()";
        assert_eq!("DEBUG: 11\nDEBUG: 12\n", debug_output(source));
    }

    #[test]
    fn two_closures_share_one_upvalue() {
        let source = "let set = 0
let get = 0
fn make {
    let x = 1
    fn s { x = 42 }
    fn g { x }
    set = s
    get = g
}
make()
set()
debug get()";
        assert_eq!("DEBUG: 42\n", debug_output(source));
    }

    #[test]
    fn open_upvalues_are_shared_while_on_the_stack() {
        let source = "fn observe {
    let x = 1
    fn poke { x = 99 }
    fn peek { x }
    poke()
    debug peek()
}
observe()";
        assert_eq!("DEBUG: 99\n", debug_output(source));
    }

    #[test]
    fn recursion_through_match_bodies() {
        let source = "fn fib n | 0 = 0 | 1 = 1 | n = fib(n - 1) + fib(n - 2) ;
debug fib(10)";
        assert_eq!("DEBUG: 55\n", debug_output(source));
    }

    #[test]
    fn match_expressions_produce_values() {
        let source = "let word = match 2 | 1 = \"one\" | 2 = \"two\" ;
debug word";
        assert_eq!("DEBUG: two\n", debug_output(source));
    }

    #[test]
    fn exhausted_match_is_a_runtime_error() {
        assert_eq!("", runtime_failure("debug match 3 | 1 = 1 ;"));
    }

    #[test]
    fn add_type_mismatch_is_recoverable() {
        // No DEBUG line is produced...
        assert_eq!("", runtime_failure("debug 1 + true"));

        // ...and the same VM keeps working afterwards.
        let output = CapturedOutput::default();
        let mut vm = VM::with_debug_sink(Box::new(output.clone()));
        assert!(vm.interpret("debug 1 + true").is_err());
        vm.interpret("debug 2 + 2").expect("the VM must recover");
        let text = String::from_utf8(output.0.borrow().clone()).unwrap();
        assert_eq!("DEBUG: 4\n", text);
    }

    #[test]
    fn comparison_type_mismatch() {
        assert_eq!("", runtime_failure("debug 1 < \"two\""));
    }

    #[test]
    fn conditions_must_be_boolean() {
        assert_eq!("", runtime_failure("if 1 { debug 2 }"));
        assert_eq!("", runtime_failure("debug !1"));
    }

    #[test]
    fn undefined_globals() {
        assert_eq!("", runtime_failure("debug missing"));
        assert_eq!("", runtime_failure("missing = 1"));
        // A failed assignment must not define the global as a side effect.
        assert_eq!("", runtime_failure("fn f { oops = 1 }\nf()\ndebug oops"));
    }

    #[test]
    fn calling_a_non_callable() {
        assert_eq!("", runtime_failure("let a = 1\na()"));
    }

    #[test]
    fn arity_is_checked() {
        assert_eq!("", runtime_failure("fn one x { x }\ndebug one()"));
        assert_eq!("", runtime_failure("fn none { 1 }\ndebug none(2)"));
    }

    #[test]
    fn runaway_recursion_overflows() {
        assert_eq!("", runtime_failure("fn f { f() }\nf()"));
    }

    #[test]
    fn globals_persist_across_interpret_calls() {
        let output = CapturedOutput::default();
        let mut vm = VM::with_debug_sink(Box::new(output.clone()));
        vm.interpret("let a = 41").expect("first run");
        vm.interpret("debug a + 1").expect("second run");
        let text = String::from_utf8(output.0.borrow().clone()).unwrap();
        assert_eq!("DEBUG: 42\n", text);
    }

    #[test]
    fn teardown_releases_cyclic_closures() {
        // `first` and `second` capture each other's slots through reassignment, so the two
        // closures form a reference cycle once their upvalues close.
        let source = "fn pair {
    let a = 0
    let b = 0
    fn first { b }
    fn second { a }
    a = first
    b = second
    a
}
let cyclic = pair()";
        let mut vm = VM::with_debug_sink(Box::new(CapturedOutput::default()));
        vm.interpret(source).expect("program should run cleanly");

        // Take a weak probe on one of the mutually-capturing closures through the globals.
        let name = vm.heap.intern("cyclic");
        let probe = match vm.globals.get(&name) {
            Some(Value::Closure(closure)) => Gc::downgrade(&closure),
            other => panic!("expected a closure in `cyclic`, got {other:?}"),
        };
        assert!(probe.upgrade().is_some());

        // The cycle would keep itself alive under plain reference counting; teardown must
        // sever the upvalue links and release it.
        drop(vm);
        assert_eq!(0, probe.strong_count());
    }

    #[test]
    fn determinism() {
        let source = "fn fib n | 0 = 0 | 1 = 1 | n = fib(n - 1) + fib(n - 2) ;
debug fib(12)
debug \"done\"";
        let first = debug_output(source);
        let second = debug_output(source);
        assert_eq!(first, second);
        assert_eq!("DEBUG: 144\nDEBUG: done\n", first);
    }
}
