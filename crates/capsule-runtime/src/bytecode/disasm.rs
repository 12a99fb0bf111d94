//! Unit disassembler
//!
//! Renders a unit as human-readable assembly, including the rewriter's
//! instrumentation. Used for debugging and in rewriter tests.

use super::insn::{decode_at, Insn};
use super::{Constant, Method, Unit};
use std::fmt::Write;

/// Disassemble a unit to human-readable format
///
/// # Format
/// ```text
/// === Unit app.main ===
///
/// === Constants ===
/// 0: "host.io::println"
/// 1: 42
///
/// === Method run/1 (locals 2) [sync] ===
/// 0000  EnterCheck
/// 0001  Const 1                ; 42
/// 0004  Invoke 0 1             ; host.io::println
/// handler [0001, 0008) -> 0010 catch fault.exception
/// ```
pub fn disassemble(unit: &Unit) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "=== Unit {} ===", unit.name);

    if !unit.constants.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "=== Constants ===");
        for (idx, constant) in unit.constants.iter().enumerate() {
            let _ = writeln!(output, "{}: {}", idx, format_constant(constant));
        }
    }

    for method in &unit.methods {
        let _ = writeln!(output);
        disassemble_method(unit, method, &mut output);
    }

    output
}

fn disassemble_method(unit: &Unit, method: &Method, output: &mut String) {
    let mut tags = Vec::new();
    if method.is_synchronized() {
        tags.push("sync");
    }
    if method.is_finalizer() {
        tags.push("finalizer");
    }
    let tags = if tags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", tags.join(", "))
    };
    let _ = writeln!(
        output,
        "=== Method {}/{} (locals {}){} ===",
        method.name, method.arity, method.locals, tags
    );

    let mut offset = 0;
    while offset < method.code.len() {
        match decode_at(&method.code, offset) {
            Ok((insn, len)) => {
                let _ = writeln!(output, "{}", format_instruction(unit, offset, &insn));
                offset += len;
            }
            Err(e) => {
                let _ = writeln!(output, "{:04}  <{}>", offset, e);
                break;
            }
        }
    }

    for handler in &method.handlers {
        let catch = handler
            .catch
            .and_then(|c| unit.str_constant(c))
            .unwrap_or("*");
        let _ = writeln!(
            output,
            "handler [{:04}, {:04}) -> {:04} catch {}",
            handler.start, handler.end, handler.target, catch
        );
    }
}

fn format_instruction(unit: &Unit, offset: usize, insn: &Insn) -> String {
    let text = match insn {
        Insn::Const(i) => format!("Const {}", i),
        Insn::Load(i) => format!("Load {}", i),
        Insn::Store(i) => format!("Store {}", i),
        Insn::Jump(t) => format!("Jump {:04}", t),
        Insn::JumpIfFalse(t) => format!("JumpIfFalse {:04}", t),
        Insn::Invoke { target, argc } => format!("Invoke {} {}", target, argc),
        Insn::NewList(n) => format!("NewList {}", n),
        Insn::Throw(i) => format!("Throw {}", i),
        Insn::UnitRef(i) => format!("UnitRef {}", i),
        Insn::Trap(i) => format!("Trap {}", i),
        other => format!("{:?}", other.opcode()),
    };

    match insn.constant_ref().and_then(|i| unit.constants.get(i as usize)) {
        Some(constant) => format!("{:04}  {:<22} ; {}", offset, text, constant_comment(constant)),
        None => format!("{:04}  {}", offset, text),
    }
}

fn format_constant(constant: &Constant) -> String {
    match constant {
        Constant::Int(n) => n.to_string(),
        Constant::Str(s) => format!("{:?}", s),
    }
}

fn constant_comment(constant: &Constant) -> String {
    match constant {
        Constant::Int(n) => n.to_string(),
        Constant::Str(s) => s.clone(),
    }
}
