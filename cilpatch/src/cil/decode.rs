//! CIL bytecode decoding.
//!
//! Accepts both short and long encodings for branches, argument/local access,
//! and integer constants, normalizing everything to the canonical in-memory
//! [`Op`] form. Byte-offset branch targets are resolved to stable ids in a
//! second pass once all instruction boundaries are known.

use std::collections::HashMap;

use crate::cil::{InstrId, InstructionStream, Op};
use crate::file::Parser;
use crate::image::Token;
use crate::Result;

/// Decode `code` into an instruction stream.
///
/// `lookup_string` maps a user-string token to its literal value. The
/// returned map carries the byte offset of every decoded instruction, which
/// the body reader needs to resolve exception-handler boundaries.
pub(crate) fn decode_code(
    code: &[u8],
    lookup_string: &dyn Fn(Token) -> Result<String>,
) -> Result<(InstructionStream, HashMap<u32, InstrId>)> {
    let mut parser = Parser::new(code);
    let mut stream = InstructionStream::new();
    let mut offsets: HashMap<u32, InstrId> = HashMap::new();
    // (branching instruction, absolute target offset), patched after the pass
    let mut fixups: Vec<(InstrId, u32)> = Vec::new();

    while parser.has_more_data() {
        let offset = parser.pos() as u32;
        let opcode = parser.read_u8()?;

        let op = match opcode {
            0x00 => Op::Nop,
            0x02..=0x05 => Op::Ldarg(u16::from(opcode - 0x02)),
            0x06..=0x09 => Op::Ldloc(u16::from(opcode - 0x06)),
            0x0A..=0x0D => Op::Stloc(u16::from(opcode - 0x0A)),
            0x0E => Op::Ldarg(u16::from(parser.read_u8()?)),
            0x10 => Op::Starg(u16::from(parser.read_u8()?)),
            0x11 => Op::Ldloc(u16::from(parser.read_u8()?)),
            0x13 => Op::Stloc(u16::from(parser.read_u8()?)),
            0x14 => Op::Ldnull,
            0x15 => Op::LdcI4(-1),
            0x16..=0x1E => Op::LdcI4(i32::from(opcode) - 0x16),
            0x1F => Op::LdcI4(i32::from(parser.read_i8()?)),
            0x20 => Op::LdcI4(parser.read_i32()?),
            0x22 => Op::LdcR4(parser.read_f32()?),
            0x25 => Op::Dup,
            0x26 => Op::Pop,
            0x28 => Op::Call(Token::new(parser.read_u32()?)),
            0x2A => Op::Ret,
            0x2B => {
                let rel = i64::from(parser.read_i8()?);
                return_target(&mut parser, rel, code.len()).map(Op::Br)?
            }
            0x2C => {
                let rel = i64::from(parser.read_i8()?);
                return_target(&mut parser, rel, code.len()).map(Op::Brfalse)?
            }
            0x2D => {
                let rel = i64::from(parser.read_i8()?);
                return_target(&mut parser, rel, code.len()).map(Op::Brtrue)?
            }
            0x38 => {
                let rel = i64::from(parser.read_i32()?);
                return_target(&mut parser, rel, code.len()).map(Op::Br)?
            }
            0x39 => {
                let rel = i64::from(parser.read_i32()?);
                return_target(&mut parser, rel, code.len()).map(Op::Brfalse)?
            }
            0x3A => {
                let rel = i64::from(parser.read_i32()?);
                return_target(&mut parser, rel, code.len()).map(Op::Brtrue)?
            }
            0x6F => Op::Callvirt(Token::new(parser.read_u32()?)),
            0x72 => {
                let token = Token::new(parser.read_u32()?);
                Op::Ldstr(lookup_string(token)?)
            }
            0x7A => Op::Throw,
            0x7B => Op::Ldfld(Token::new(parser.read_u32()?)),
            0x7D => Op::Stfld(Token::new(parser.read_u32()?)),
            0x7E => Op::Ldsfld(Token::new(parser.read_u32()?)),
            0x80 => Op::Stsfld(Token::new(parser.read_u32()?)),
            0xDD => {
                let rel = i64::from(parser.read_i32()?);
                return_target(&mut parser, rel, code.len()).map(Op::Leave)?
            }
            0xDE => {
                let rel = i64::from(parser.read_i8()?);
                return_target(&mut parser, rel, code.len()).map(Op::Leave)?
            }
            _ => {
                return Err(malformed_error!(
                    "unknown opcode 0x{:02X} at offset 0x{:X}",
                    opcode,
                    offset
                ))
            }
        };

        // Branch ops hold a placeholder id wrapping the absolute byte offset
        // until the second pass below rewrites them.
        let id = stream.push(op);
        offsets.insert(offset, id);
        if let Some(placeholder) = stream.get(id).and_then(|i| i.op.branch_target()) {
            fixups.push((id, placeholder.0));
        }
    }

    resolve_branch_targets(&mut stream, &offsets, &fixups)?;
    Ok((stream, offsets))
}

/// Convert a relative displacement (from the end of the branch instruction)
/// into an absolute target offset, temporarily smuggled through an
/// [`InstrId`] until the fixup pass runs.
fn return_target(parser: &mut Parser, rel: i64, code_len: usize) -> Result<InstrId> {
    let next = parser.pos() as i64;
    let target = next + rel;
    if target < 0 || target > code_len as i64 {
        return Err(malformed_error!(
            "branch target 0x{:X} outside method body",
            target
        ));
    }
    Ok(InstrId(target as u32))
}

fn resolve_branch_targets(
    stream: &mut InstructionStream,
    offsets: &HashMap<u32, InstrId>,
    fixups: &[(InstrId, u32)],
) -> Result<()> {
    // Collect replacements first; the stream cannot be mutated while iterated.
    let mut patched: Vec<(InstrId, InstrId)> = Vec::with_capacity(fixups.len());
    for (id, target_offset) in fixups {
        let target = offsets.get(target_offset).copied().ok_or_else(|| {
            malformed_error!(
                "branch targets offset 0x{:X}, which is not an instruction boundary",
                target_offset
            )
        })?;
        patched.push((*id, target));
    }

    for (id, target) in patched {
        stream.retarget(id, target);
    }
    Ok(())
}

impl InstructionStream {
    /// Rewrite the branch target of one instruction in place.
    pub(crate) fn retarget(&mut self, id: InstrId, target: InstrId) {
        if let Some(instr) = self.iter_mut().find(|i| i.id == id) {
            instr.op = match &instr.op {
                Op::Br(_) => Op::Br(target),
                Op::Brfalse(_) => Op::Brfalse(target),
                Op::Brtrue(_) => Op::Brtrue(target),
                Op::Leave(_) => Op::Leave(target),
                other => other.clone(),
            };
        }
    }

    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut crate::cil::Instruction> + '_ {
        self.items_mut().iter_mut()
    }
}
