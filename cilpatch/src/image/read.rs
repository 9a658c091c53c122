//! Image loading.
//!
//! Opening is strictly read-only: the file is memory-mapped, parsed into an
//! owned [`AssemblyImage`], and unmapped. Nothing touches the disk until an
//! explicit serialization.

use std::path::Path;

use crate::cil::decode_code;
use crate::file::{File, Parser};
use crate::image::method::{ExceptionHandler, ExceptionHandlerFlags, MethodBody, MethodDef};
use crate::image::signature::{MethodSig, TypeSig};
use crate::image::token::{table, Token};
use crate::image::types::{
    AssemblyRef, FieldDef, FieldFlags, MemberRef, MemberRefSig, MethodFlags, TypeDef, TypeFlags,
    TypeRef,
};
use crate::image::write::{
    BODY_FLAG_FAT, BODY_FLAG_INIT_LOCALS, BODY_FLAG_MORE_SECTS, BODY_FLAG_TINY, FORMAT_VERSION,
    MAGIC, SECT_EHTABLE,
};
use crate::image::AssemblyImage;
use crate::{Error, Result};

impl AssemblyImage {
    /// Load a module image from disk.
    ///
    /// # Errors
    /// [`Error::AssemblyNotFound`] when the path does not exist,
    /// [`Error::Malformed`]/[`Error::NotSupported`] when the bytes do not
    /// parse as a supported module.
    pub fn from_file(path: &Path) -> Result<AssemblyImage> {
        let file = File::open(path)?;
        let image = Self::from_mem(file.data())?;
        log::info!("loaded module '{}' from {}", image.name, path.display());
        Ok(image)
    }

    /// Parse a module image from a byte buffer.
    pub fn from_mem(data: &[u8]) -> Result<AssemblyImage> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let mut parser = Parser::new(data);
        let magic = parser.read_bytes(4)?;
        if magic != MAGIC {
            return Err(malformed_error!("bad magic, not a compact managed module"));
        }
        let version = parser.read_u16()?;
        if version != FORMAT_VERSION {
            return Err(Error::NotSupported(version));
        }
        parser.read_u16()?; // reserved
        let name_offset = parser.read_u32()? as usize;

        let strings_len = parser.read_u32()? as usize;
        let strings = parser.read_bytes(strings_len)?;
        let users_len = parser.read_u32()? as usize;
        let users = parser.read_bytes(users_len)?;

        let string_at = |offset: u32| -> Result<String> {
            Parser::new(strings).read_string_at(offset as usize)
        };
        let user_string = |token: Token| -> Result<String> {
            if token.table() != table::USER_STRING {
                return Err(malformed_error!(
                    "ldstr operand {} is not a user-string token",
                    token
                ));
            }
            let mut p = Parser::new(users);
            p.seek(token.row() as usize)?;
            p.read_prefixed_string_utf16()
        };

        let mut image = AssemblyImage::new(&string_at(name_offset as u32)?);

        let assembly_ref_count = parser.read_u32()?;
        for _ in 0..assembly_ref_count {
            let name = string_at(parser.read_u32()?)?;
            image.assembly_refs.push(AssemblyRef { name });
        }

        let type_ref_count = parser.read_u32()?;
        for _ in 0..type_ref_count {
            let scope = Token::new(parser.read_u32()?);
            let full_name = string_at(parser.read_u32()?)?;
            if scope.table() != table::ASSEMBLY_REF
                || scope.row() as usize > image.assembly_refs.len()
            {
                return Err(malformed_error!(
                    "type ref '{}' has invalid scope {scope}",
                    full_name
                ));
            }
            image.type_refs.push(TypeRef { scope, full_name });
        }

        let member_ref_count = parser.read_u32()?;
        for _ in 0..member_ref_count {
            let parent = Token::new(parser.read_u32()?);
            let name = string_at(parser.read_u32()?)?;
            if parent.table() != table::TYPE_REF || parent.row() as usize > image.type_refs.len() {
                return Err(malformed_error!(
                    "member ref '{}' has invalid parent {parent}",
                    name
                ));
            }
            let signature = match parser.read_u8()? {
                0 => MemberRefSig::Method(MethodSig::parse(&mut parser)?),
                1 => MemberRefSig::Field(TypeSig::parse(&mut parser)?),
                kind => return Err(malformed_error!("unknown member ref kind {}", kind)),
            };
            image.member_refs.push(MemberRef {
                parent,
                name,
                signature,
            });
        }

        let type_count = parser.read_u32()?;
        for _ in 0..type_count {
            let full_name = string_at(parser.read_u32()?)?;
            let flags = TypeFlags::from_bits_truncate(parser.read_u32()?);

            let field_count = parser.read_u32()?;
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                let name = string_at(parser.read_u32()?)?;
                let field_flags = FieldFlags::from_bits_truncate(parser.read_u16()?);
                let field_type = TypeSig::parse(&mut parser)?;
                fields.push(FieldDef {
                    name,
                    flags: field_flags,
                    field_type,
                });
            }

            let method_count = parser.read_u32()?;
            let mut methods = Vec::with_capacity(method_count as usize);
            for _ in 0..method_count {
                let name = string_at(parser.read_u32()?)?;
                let method_flags = MethodFlags::from_bits_truncate(parser.read_u16()?);
                let signature = MethodSig::parse(&mut parser)?;
                let body_len = parser.read_u32()? as usize;
                let body = if body_len == 0 {
                    None
                } else {
                    let body_bytes = parser.read_bytes(body_len)?;
                    Some(parse_body(body_bytes, &user_string).map_err(|e| {
                        log::warn!("failed to parse body of {full_name}.{name}");
                        e
                    })?)
                };
                methods.push(MethodDef {
                    name,
                    flags: method_flags,
                    signature,
                    body,
                });
            }

            image.types.push(TypeDef {
                full_name,
                flags,
                fields,
                methods,
            });
        }

        Ok(image)
    }
}

fn parse_body(data: &[u8], user_string: &dyn Fn(Token) -> Result<String>) -> Result<MethodBody> {
    if data.is_empty() {
        return Err(malformed_error!("empty method body"));
    }

    let first = data[0];
    match first & 0x3 {
        BODY_FLAG_TINY => {
            let code_size = (first >> 2) as usize;
            if 1 + code_size > data.len() {
                return Err(Error::OutOfBounds);
            }
            let (instructions, _) = decode_code(&data[1..1 + code_size], user_string)?;
            Ok(MethodBody {
                init_locals: false,
                max_stack: 8,
                locals: Vec::new(),
                instructions,
                exception_handlers: Vec::new(),
            })
        }
        f if f == BODY_FLAG_FAT => {
            let mut parser = Parser::new(data);
            let flags = parser.read_u16()?;
            let max_stack = parser.read_u16()?;
            let code_size = parser.read_u32()?;

            let local_count = parser.read_compressed_u32()?;
            let mut locals = Vec::with_capacity(local_count as usize);
            for _ in 0..local_count {
                locals.push(TypeSig::parse(&mut parser)?);
            }

            let code = parser.read_bytes(code_size as usize)?;
            let (instructions, offsets) = decode_code(code, user_string)?;

            let mut exception_handlers = Vec::new();
            if flags & BODY_FLAG_MORE_SECTS != 0 {
                let aligned = (parser.pos() + 3) & !3;
                parser.seek(aligned)?;

                let sect_flags = parser.read_u8()?;
                if sect_flags & SECT_EHTABLE == 0 {
                    return Err(malformed_error!(
                        "unknown method data section 0x{:02X}",
                        sect_flags
                    ));
                }
                let size = u32::from(parser.read_u8()?)
                    | (u32::from(parser.read_u8()?) << 8)
                    | (u32::from(parser.read_u8()?) << 16);
                if size < 4 || (size - 4) % 24 != 0 {
                    return Err(malformed_error!(
                        "malformed exception section size {}",
                        size
                    ));
                }

                let boundary = |offset: u32| {
                    offsets.get(&offset).copied().ok_or_else(|| {
                        malformed_error!(
                            "exception boundary 0x{:X} is not an instruction boundary",
                            offset
                        )
                    })
                };
                let end_boundary = |offset: u32| -> Result<_> {
                    if offset == code_size {
                        Ok(None)
                    } else {
                        boundary(offset).map(Some)
                    }
                };

                for _ in 0..(size - 4) / 24 {
                    let clause_flags =
                        ExceptionHandlerFlags::from_bits_truncate(parser.read_u32()? as u16);
                    let try_offset = parser.read_u32()?;
                    let try_length = parser.read_u32()?;
                    let handler_offset = parser.read_u32()?;
                    let handler_length = parser.read_u32()?;
                    let class_token = parser.read_u32()?;

                    exception_handlers.push(ExceptionHandler {
                        flags: clause_flags,
                        try_start: boundary(try_offset)?,
                        try_end: end_boundary(try_offset + try_length)?,
                        handler_start: boundary(handler_offset)?,
                        handler_end: end_boundary(handler_offset + handler_length)?,
                        catch_type: if class_token == 0 {
                            None
                        } else {
                            Some(Token::new(class_token))
                        },
                    });
                }
            }

            Ok(MethodBody {
                init_locals: flags & BODY_FLAG_INIT_LOCALS != 0,
                max_stack,
                locals,
                instructions,
                exception_handlers,
            })
        }
        _ => Err(malformed_error!(
            "method body header is neither fat nor tiny - 0x{:02X}",
            first
        )),
    }
}
