//! Deterministic CIL bytecode encoding.
//!
//! Every operation is emitted in the shortest encoding that fits its
//! operand, with branch displacements settled by iterating short-to-long
//! promotions to a fixed point. Promotion only ever lengthens the code, so
//! the loop terminates; the result depends only on the instruction stream,
//! which is what makes an untouched image re-serialize byte-identically.

use std::collections::{HashMap, HashSet};

use crate::cil::{InstrId, InstructionStream, Op};
use crate::file::Writer;
use crate::image::Token;
use crate::{Error, Result};

/// Encode a stream to raw code bytes.
///
/// `intern_string` maps an `ldstr` literal to its user-string heap token.
/// Returns the code bytes and the byte offset of every instruction.
pub(crate) fn encode_code(
    stream: &InstructionStream,
    intern_string: &mut dyn FnMut(&str) -> Result<Token>,
) -> Result<(Vec<u8>, HashMap<InstrId, u32>)> {
    let mut long_branches: HashSet<InstrId> = HashSet::new();

    // Settle branch widths.
    let offsets = loop {
        let offsets = layout(stream, &long_branches)?;
        let mut changed = false;

        for instr in stream {
            let Some(target) = instr.op.branch_target() else {
                continue;
            };
            if long_branches.contains(&instr.id) {
                continue;
            }
            let start = offsets[&instr.id];
            let target_offset = *offsets.get(&target).ok_or_else(|| {
                Error::Serialization(format!(
                    "branch in '{}' targets an instruction not present in the stream",
                    instr.op.mnemonic()
                ))
            })?;
            let rel = i64::from(target_offset) - (i64::from(start) + 2);
            if i8::try_from(rel).is_err() {
                long_branches.insert(instr.id);
                changed = true;
            }
        }

        if !changed {
            break offsets;
        }
    };

    // Emit.
    let mut writer = Writer::new();
    for instr in stream {
        debug_assert_eq!(writer.len() as u32, offsets[&instr.id]);
        emit_one(&mut writer, &instr.op, instr.id, &offsets, &long_branches, intern_string)?;
    }

    Ok((writer.into_bytes(), offsets))
}

/// Compute instruction offsets for the current branch-width assignment.
fn layout(
    stream: &InstructionStream,
    long_branches: &HashSet<InstrId>,
) -> Result<HashMap<InstrId, u32>> {
    let mut offsets = HashMap::with_capacity(stream.len());
    let mut pos: u32 = 0;
    for instr in stream {
        offsets.insert(instr.id, pos);
        pos += instr_size(&instr.op, long_branches.contains(&instr.id))?;
    }
    Ok(offsets)
}

fn instr_size(op: &Op, long_branch: bool) -> Result<u32> {
    Ok(match op {
        Op::Nop | Op::Ldnull | Op::Dup | Op::Pop | Op::Ret | Op::Throw => 1,
        Op::Ldarg(n) | Op::Ldloc(n) => {
            check_slot(*n)?;
            if *n < 4 {
                1
            } else {
                2
            }
        }
        Op::Stloc(n) => {
            check_slot(*n)?;
            if *n < 4 {
                1
            } else {
                2
            }
        }
        Op::Starg(n) => {
            check_slot(*n)?;
            2
        }
        Op::LdcI4(v) => match v {
            -1..=8 => 1,
            _ if i8::try_from(*v).is_ok() => 2,
            _ => 5,
        },
        Op::LdcR4(_) | Op::Ldstr(_) => 5,
        Op::Call(_) | Op::Callvirt(_) => 5,
        Op::Ldfld(_) | Op::Stfld(_) | Op::Ldsfld(_) | Op::Stsfld(_) => 5,
        Op::Br(_) | Op::Brfalse(_) | Op::Brtrue(_) | Op::Leave(_) => {
            if long_branch {
                5
            } else {
                2
            }
        }
    })
}

fn check_slot(n: u16) -> Result<()> {
    if n > 0xFF {
        return Err(Error::Serialization(format!(
            "argument/local index {n} exceeds the short-form operand range"
        )));
    }
    Ok(())
}

fn emit_one(
    writer: &mut Writer,
    op: &Op,
    id: InstrId,
    offsets: &HashMap<InstrId, u32>,
    long_branches: &HashSet<InstrId>,
    intern_string: &mut dyn FnMut(&str) -> Result<Token>,
) -> Result<()> {
    match op {
        Op::Nop => writer.write_u8(0x00),
        Op::Ldarg(n) => match n {
            0..=3 => writer.write_u8(0x02 + *n as u8),
            _ => {
                writer.write_u8(0x0E);
                writer.write_u8(*n as u8);
            }
        },
        Op::Starg(n) => {
            writer.write_u8(0x10);
            writer.write_u8(*n as u8);
        }
        Op::Ldloc(n) => match n {
            0..=3 => writer.write_u8(0x06 + *n as u8),
            _ => {
                writer.write_u8(0x11);
                writer.write_u8(*n as u8);
            }
        },
        Op::Stloc(n) => match n {
            0..=3 => writer.write_u8(0x0A + *n as u8),
            _ => {
                writer.write_u8(0x13);
                writer.write_u8(*n as u8);
            }
        },
        Op::LdcI4(v) => match v {
            -1 => writer.write_u8(0x15),
            0..=8 => writer.write_u8(0x16 + *v as u8),
            _ => {
                if let Ok(small) = i8::try_from(*v) {
                    writer.write_u8(0x1F);
                    writer.write_i8(small);
                } else {
                    writer.write_u8(0x20);
                    writer.write_i32(*v);
                }
            }
        },
        Op::LdcR4(v) => {
            writer.write_u8(0x22);
            writer.write_f32(*v);
        }
        Op::Ldnull => writer.write_u8(0x14),
        Op::Ldstr(value) => {
            let token = intern_string(value)?;
            writer.write_u8(0x72);
            writer.write_u32(token.value());
        }
        Op::Dup => writer.write_u8(0x25),
        Op::Pop => writer.write_u8(0x26),
        Op::Call(token) => {
            writer.write_u8(0x28);
            writer.write_u32(token.value());
        }
        Op::Callvirt(token) => {
            writer.write_u8(0x6F);
            writer.write_u32(token.value());
        }
        Op::Ret => writer.write_u8(0x2A),
        Op::Throw => writer.write_u8(0x7A),
        Op::Br(target) | Op::Brfalse(target) | Op::Brtrue(target) | Op::Leave(target) => {
            let long = long_branches.contains(&id);
            let (short_op, long_op) = match op {
                Op::Br(_) => (0x2Bu8, 0x38u8),
                Op::Brfalse(_) => (0x2C, 0x39),
                Op::Brtrue(_) => (0x2D, 0x3A),
                Op::Leave(_) => (0xDE, 0xDD),
                _ => unreachable!(),
            };
            let start = offsets[&id];
            let target_offset = i64::from(offsets[target]);
            if long {
                let rel = target_offset - (i64::from(start) + 5);
                writer.write_u8(long_op);
                writer.write_i32(rel as i32);
            } else {
                let rel = target_offset - (i64::from(start) + 2);
                writer.write_u8(short_op);
                writer.write_i8(rel as i8);
            }
        }
        Op::Ldfld(token) => {
            writer.write_u8(0x7B);
            writer.write_u32(token.value());
        }
        Op::Stfld(token) => {
            writer.write_u8(0x7D);
            writer.write_u32(token.value());
        }
        Op::Ldsfld(token) => {
            writer.write_u8(0x7E);
            writer.write_u32(token.value());
        }
        Op::Stsfld(token) => {
            writer.write_u8(0x80);
            writer.write_u32(token.value());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::decode_code;
    use crate::image::token::table;

    fn fixed_token(_: &str) -> Result<Token> {
        Ok(Token::from_parts(table::USER_STRING, 1))
    }

    fn roundtrip(stream: &InstructionStream) -> Result<InstructionStream> {
        let mut intern = fixed_token;
        let (bytes, _) = encode_code(stream, &mut intern)?;
        let (decoded, _) = decode_code(&bytes, &|_| Ok("s".to_string()))?;
        Ok(decoded)
    }

    #[test]
    fn test_forward_branch_stays_short() -> Result<()> {
        let mut stream = InstructionStream::new();
        let nop = stream.push(Op::Nop);
        let end = stream.push(Op::Ret);
        stream.insert_before(nop, Op::LdcI4(1))?;
        stream.insert_before(nop, Op::Brtrue(end))?;

        let mut intern = fixed_token;
        let (bytes, _) = encode_code(&stream, &mut intern)?;
        // ldc.i4.1, brtrue.s +1, nop, ret
        assert_eq!(bytes, vec![0x17, 0x2D, 0x01, 0x00, 0x2A]);
        Ok(())
    }

    #[test]
    fn test_long_branch_promotion() -> Result<()> {
        // A branch over > 127 bytes of filler must be promoted to long form.
        let mut stream = InstructionStream::new();
        let end = stream.push(Op::Ret);
        let first_filler = stream.insert_before(end, Op::LdcI4(1000))?; // 5 bytes
        for _ in 0..30 {
            stream.insert_before(end, Op::LdcI4(1000))?;
            stream.insert_before(end, Op::Pop)?;
        }
        stream.insert_before(end, Op::Pop)?;
        stream.insert_before(first_filler, Op::Br(end))?;

        let mut intern = fixed_token;
        let (bytes, offsets) = encode_code(&stream, &mut intern)?;
        assert_eq!(bytes[0], 0x38); // long br
        let rel = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(5 + rel as i64, i64::from(offsets[&end]));
        Ok(())
    }

    #[test]
    fn test_encode_decode_roundtrip_preserves_shape() -> Result<()> {
        let mut stream = InstructionStream::new();
        let ret = stream.push(Op::Ret);
        stream.insert_before(ret, Op::Ldarg(0))?;
        stream.insert_before(ret, Op::LdcR4(1.0))?;
        stream.insert_before(ret, Op::Callvirt(Token::from_parts(table::METHOD_DEF, 2)))?;
        stream.insert_before(ret, Op::Ldstr("marker".into()))?;
        stream.insert_before(ret, Op::Pop)?;

        let decoded = roundtrip(&stream)?;
        assert_eq!(decoded.len(), stream.len());
        for (a, b) in stream.iter().zip(decoded.iter()) {
            assert_eq!(a.op.mnemonic(), b.op.mnemonic());
        }
        Ok(())
    }

    #[test]
    fn test_encoding_is_deterministic() -> Result<()> {
        let mut stream = InstructionStream::new();
        let end = stream.push(Op::Ret);
        stream.insert_before(end, Op::LdcI4(7))?;
        stream.insert_before(end, Op::Pop)?;

        let mut intern = fixed_token;
        let (first, _) = encode_code(&stream, &mut intern)?;
        let (second, _) = encode_code(&stream, &mut intern)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_missing_branch_target_fails() {
        let mut other = InstructionStream::new();
        for _ in 0..5 {
            other.push(Op::Nop);
        }
        let foreign = other.push(Op::Ret);

        let mut stream = InstructionStream::new();
        stream.push(Op::Br(foreign));
        stream.push(Op::Ret);
        let mut intern = fixed_token;
        assert!(encode_code(&stream, &mut intern).is_err());
    }
}
