//! Helpers to print a debug representations.

use crate::chunk::{Chunk, OpCode};
use crate::value::Value;

/// Given a chunk, prints its disassembly to `stdout`
pub fn disassemble_chunk(c: &Chunk, name: &str) {
    println!("== {name} ==");

    let mut offset = 0;
    while offset < c.len() {
        offset = disassemble_instruction(c, offset);
    }
}

/// Print one instruction from the [Chunk] to `stdout`, taking into account its operands.
pub fn disassemble_instruction(c: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);

    if offset > 0 && at_same_line_as_previous_offset(c, offset) {
        print!("   | ");
    } else {
        let line_no = c.line_number_for(offset).unwrap();
        print!("{line_no:4} ")
    }

    let instruction = c
        .get(offset)
        .expect("offset too large")
        .as_opcode()
        .expect("Invalid byte for opcode");

    use OpCode::*;
    match instruction {
        Constant => constant_instruction("OP_CONSTANT", c, offset),
        Nil => simple_instruction("OP_NIL", offset),
        True => simple_instruction("OP_TRUE", offset),
        False => simple_instruction("OP_FALSE", offset),
        Pop => simple_instruction("OP_POP", offset),
        Add => simple_instruction("OP_ADD", offset),
        Subtract => simple_instruction("OP_SUBTRACT", offset),
        Multiply => simple_instruction("OP_MULTIPLY", offset),
        Divide => simple_instruction("OP_DIVIDE", offset),
        Not => simple_instruction("OP_NOT", offset),
        Equal => simple_instruction("OP_EQUAL", offset),
        NotEqual => simple_instruction("OP_NOT_EQUAL", offset),
        Less => simple_instruction("OP_LESS", offset),
        Greater => simple_instruction("OP_GREATER", offset),
        LessEqual => simple_instruction("OP_LESS_EQUAL", offset),
        GreaterEqual => simple_instruction("OP_GREATER_EQUAL", offset),
        Debug => simple_instruction("OP_DEBUG", offset),
        DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", c, offset),
        GetGlobal => constant_instruction("OP_GET_GLOBAL", c, offset),
        SetGlobal => constant_instruction("OP_SET_GLOBAL", c, offset),
        GetLocal => byte_instruction("OP_GET_LOCAL", c, offset),
        SetLocal => byte_instruction("OP_SET_LOCAL", c, offset),
        GetUpvalue => byte_instruction("OP_GET_UPVALUE", c, offset),
        SetUpvalue => byte_instruction("OP_SET_UPVALUE", c, offset),
        Jump => jump_instruction("OP_JUMP", c, offset),
        JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", c, offset),
        JumpIfTrue => jump_instruction("OP_JUMP_IF_TRUE", c, offset),
        JumpIfNotMatch => jump_instruction("OP_JUMP_IF_NOT_MATCH", c, offset),
        Loop => loop_instruction("OP_LOOP", c, offset),
        Call => byte_instruction("OP_CALL", c, offset),
        Closure => closure_instruction("OP_CLOSURE", c, offset),
        CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        NoMatch => simple_instruction("OP_NO_MATCH", offset),
        Return => simple_instruction("OP_RETURN", offset),
        Exit => simple_instruction("OP_EXIT", offset),
    }
}

/////////////////////////////////////// Instruction printers ///////////////////////////////////////

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{name:>20}");
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let operand = chunk.get(offset + 1).expect("ran out of bytes").as_byte();
    println!("{name:>20}{operand:4}");

    offset + 2
}

/// Forward jumps encode a distance, measured from just past the operand.
fn jump_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let distance = chunk.read_u16(offset + 1).expect("ran out of bytes");
    println!("{name:>20}  ->{:04}", offset + 3 + distance as usize);

    offset + 3
}

/// `OP_LOOP` encodes an absolute target offset instead of a distance.
fn loop_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let target = chunk.read_u16(offset + 1).expect("ran out of bytes");
    println!("{name:>20}  ->{target:04}");

    offset + 3
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let (index, value) = chunk
        .get(offset + 1)
        .expect("ran out of bytes")
        .resolve_constant_with_index()
        .expect("Invalid constant index");

    println!("{name:>20}{index:4} '{value}'");

    offset + 2
}

/// `OP_CLOSURE` is variable-length: two trailing bytes per captured variable.
fn closure_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let (index, value) = chunk
        .get(offset + 1)
        .expect("ran out of bytes")
        .resolve_constant_with_index()
        .expect("Invalid constant index");

    println!("{name:>20}{index:4} '{value}'");

    let upvalue_count = match &value {
        Value::Function(function) => function.upvalue_count,
        _ => panic!("OP_CLOSURE operand must be a function constant"),
    };

    let mut offset = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.get(offset).expect("ran out of bytes").as_byte() != 0;
        let index = chunk.get(offset + 1).expect("ran out of bytes").as_byte();
        let kind = if is_local { "local" } else { "upvalue" };
        println!("{offset:04}    |{:>20} {kind} {index}", "");
        offset += 2;
    }

    offset
}

//////////////////////////////////////////// Utilities ////////////////////////////////////////////

/// Returns true if the given offset is at the same line number as the previous line number.
fn at_same_line_as_previous_offset(chunk: &Chunk, offset: usize) -> bool {
    assert!(offset > 0);

    chunk
        .line_number_for(offset)
        .zip(chunk.line_number_for(offset - 1))
        .map(|(current_line, previous_line)| current_line == previous_line)
        .unwrap()
}
