// File: src/disassembler.rs
//
// Human-readable rendering of compiled chunks, used by --dump-bytecode and
// the --trace execution log.

use crate::bytecode::{Chunk, Constant, Op};

/// Render a whole chunk, recursing into nested function chunks.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("== {} ==\n", name));
    out.push_str(&format!(
        "arity {} (optional {}{}) locals {} upvalues {}\n",
        chunk.arity,
        chunk.optional_params,
        if chunk.has_rest { ", rest" } else { "" },
        chunk.local_count,
        chunk.upvalues.len()
    ));
    let mut offset = 0;
    while offset < chunk.code.len() {
        let line = chunk.get_line(offset);
        let same_line = offset > 0 && chunk.get_line(offset - 1) == line;
        let line_column = if same_line { "   |".to_string() } else { format!("{:4}", line) };
        out.push_str(&format!(
            "{:04} {} {}\n",
            offset,
            line_column,
            disassemble_instruction(chunk, offset)
        ));
        offset += instruction_len(chunk, offset);
    }
    for constant in &chunk.constants {
        if let Constant::Chunk(child) = constant {
            out.push('\n');
            let child_name = if child.name.is_empty() { "<fn>" } else { &child.name };
            out.push_str(&disassemble_chunk(child, child_name));
        }
    }
    out
}

/// Byte length of the instruction at `offset`, operands included.
pub fn instruction_len(chunk: &Chunk, offset: usize) -> usize {
    let Some(op) = Op::from_byte(chunk.code[offset]) else {
        return 1;
    };
    match op {
        Op::ConstByte
        | Op::GetLocal
        | Op::SetLocal
        | Op::GetUpvalue
        | Op::SetUpvalue
        | Op::PopN
        | Op::Call
        | Op::Print
        | Op::Cast => 2,
        Op::Const
        | Op::Array
        | Op::Object
        | Op::StringInterp
        | Op::GetGlobal
        | Op::SetGlobal
        | Op::DefineGlobal
        | Op::DefineGlobalConst
        | Op::GetProperty
        | Op::SetProperty
        | Op::SetObjType
        | Op::Jump
        | Op::JumpIfFalse
        | Op::JumpIfTrue
        | Op::Loop
        | Op::Coalesce
        | Op::OptionalChain => 3,
        Op::CallBuiltin | Op::CallMethod => 4,
        Op::Try => 5,
        Op::Closure => {
            let upvalue_count = chunk.code[offset + 3] as usize;
            4 + upvalue_count * 2
        }
        _ => 1,
    }
}

/// Render one instruction without its offset prefix.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> String {
    let byte = chunk.code[offset];
    let Some(op) = Op::from_byte(byte) else {
        return format!("??? {:#04x}", byte);
    };
    let name = op.name();
    match op {
        Op::ConstByte => format!("{:<18} {}", name, chunk.code[offset + 1]),
        Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue | Op::PopN | Op::Call
        | Op::Print => {
            format!("{:<18} {}", name, chunk.code[offset + 1])
        }
        Op::Cast => {
            let tag = crate::value::TypeTag::from_byte(chunk.code[offset + 1]);
            format!("{:<18} {}", name, tag.map(|t| t.name()).unwrap_or("?"))
        }
        Op::Const => {
            let index = chunk.read_short(offset + 1) as usize;
            format!("{:<18} {} ({})", name, index, chunk.constants[index])
        }
        Op::Array | Op::Object | Op::StringInterp => {
            format!("{:<18} {}", name, chunk.read_short(offset + 1))
        }
        Op::GetGlobal
        | Op::SetGlobal
        | Op::DefineGlobal
        | Op::DefineGlobalConst
        | Op::GetProperty
        | Op::SetProperty
        | Op::SetObjType => {
            let index = chunk.read_short(offset + 1) as usize;
            format!("{:<18} {} ({})", name, index, chunk.identifiers[index])
        }
        Op::Jump | Op::JumpIfFalse | Op::JumpIfTrue | Op::Coalesce | Op::OptionalChain => {
            let delta = chunk.read_short(offset + 1) as usize;
            format!("{:<18} -> {}", name, offset + 3 + delta)
        }
        Op::Loop => {
            let delta = chunk.read_short(offset + 1) as usize;
            format!("{:<18} -> {}", name, offset + 3 - delta)
        }
        Op::Try => {
            let catch = chunk.read_short(offset + 1) as usize;
            let finally = chunk.read_short(offset + 3) as usize;
            format!("{:<18} catch -> {} finally -> {}", name, offset + 5 + catch, offset + 5 + finally)
        }
        Op::CallBuiltin => {
            let id = chunk.read_short(offset + 1);
            let argc = chunk.code[offset + 3];
            format!("{:<18} {} ({} args)", name, crate::builtins::by_id(id).name, argc)
        }
        Op::CallMethod => {
            let index = chunk.read_short(offset + 1) as usize;
            let argc = chunk.code[offset + 3];
            format!("{:<18} {} ({} args)", name, chunk.identifiers[index], argc)
        }
        Op::Closure => {
            let index = chunk.read_short(offset + 1) as usize;
            let upvalue_count = chunk.code[offset + 3];
            format!("{:<18} {} ({} upvalues)", name, chunk.constants[index], upvalue_count)
        }
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_program;
    use crate::parser::parse_program;

    #[test]
    fn dump_walks_every_instruction_boundary() {
        let chunk = compile_program(
            &parse_program("let f = fn(a) { return a + 1; }; let x = f(2);").unwrap(),
        )
        .unwrap();
        let dump = disassemble_chunk(&chunk, "<script>");
        assert!(dump.contains("CLOSURE"));
        assert!(dump.contains("RETURN"));
        // Nested function chunks get their own section.
        assert!(dump.matches("== ").count() >= 2);
    }
}
