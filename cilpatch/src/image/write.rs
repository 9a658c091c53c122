//! Image serialization.
//!
//! Every method body is validated before encoding; a body that fails the
//! structural checks aborts the whole write. The on-disk write itself is
//! all-or-nothing: the image is assembled fully in memory, flushed to a
//! sibling temp file, and renamed over the target, so a partially-written
//! module can never be observed at the destination path.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::cil::{encode_code, validate_body, InstrId};
use crate::file::Writer;
use crate::image::method::MethodBody;
use crate::image::token::{table, Token};
use crate::image::types::MemberRefSig;
use crate::image::{AssemblyImage, MethodSig};
use crate::{Error, Result};

pub(crate) const MAGIC: &[u8; 4] = b"CMM\0";
pub(crate) const FORMAT_VERSION: u16 = 1;

pub(crate) const BODY_FLAG_TINY: u8 = 0x2;
pub(crate) const BODY_FLAG_FAT: u8 = 0x3;
pub(crate) const BODY_FLAG_MORE_SECTS: u16 = 0x8;
pub(crate) const BODY_FLAG_INIT_LOCALS: u16 = 0x10;
pub(crate) const SECT_EHTABLE: u8 = 0x01;
pub(crate) const SECT_FAT_FORMAT: u8 = 0x40;

/// Deduplicating NUL-terminated UTF-8 name heap; offset 0 is the empty string.
struct StringHeap {
    data: Vec<u8>,
    map: HashMap<String, u32>,
}

impl StringHeap {
    fn new() -> Self {
        StringHeap {
            data: vec![0],
            map: HashMap::new(),
        }
    }

    fn intern(&mut self, value: &str) -> u32 {
        if value.is_empty() {
            return 0;
        }
        if let Some(&offset) = self.map.get(value) {
            return offset;
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.map.insert(value.to_string(), offset);
        offset
    }
}

/// Deduplicating UTF-16 literal heap; tokens carry the byte offset.
struct UserStringHeap {
    data: Vec<u8>,
    map: HashMap<String, u32>,
}

impl UserStringHeap {
    fn new() -> Self {
        UserStringHeap {
            data: vec![0],
            map: HashMap::new(),
        }
    }

    fn intern(&mut self, value: &str) -> Result<Token> {
        if let Some(&offset) = self.map.get(value) {
            return Ok(Token::from_parts(table::USER_STRING, offset));
        }
        let offset = self.data.len() as u32;
        let mut writer = Writer::new();
        writer.write_prefixed_string_utf16(value)?;
        self.data.extend_from_slice(writer.bytes());
        self.map.insert(value.to_string(), offset);
        Ok(Token::from_parts(table::USER_STRING, offset))
    }
}

impl AssemblyImage {
    /// Serialize the image, validating every method body first.
    ///
    /// # Errors
    /// Returns [`Error::StructuralInvariant`] when a body fails validation
    /// and [`Error::Serialization`] for encoding-level failures. Neither
    /// leaves any trace on disk.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut strings = StringHeap::new();
        let mut users = UserStringHeap::new();

        let name_offset = strings.intern(&self.name);
        let tables = self.encode_tables(&mut strings, &mut users)?;

        let mut out = Writer::new();
        out.write_bytes(MAGIC);
        out.write_u16(FORMAT_VERSION);
        out.write_u16(0); // reserved
        out.write_u32(name_offset);
        out.write_u32(strings.data.len() as u32);
        out.write_bytes(&strings.data);
        out.write_u32(users.data.len() as u32);
        out.write_bytes(&users.data);
        out.write_bytes(tables.bytes());
        Ok(out.into_bytes())
    }

    /// Serialize and atomically replace the file at `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;

        let file_name = path
            .file_name()
            .ok_or_else(|| Error::Serialization(format!("invalid output path {}", path.display())))?;
        let mut temp_name = file_name.to_os_string();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);

        fs::write(&temp_path, &bytes)?;
        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        log::info!("wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    fn encode_tables(
        &self,
        strings: &mut StringHeap,
        users: &mut UserStringHeap,
    ) -> Result<Writer> {
        let mut w = Writer::new();

        w.write_u32(self.assembly_refs.len() as u32);
        for r in &self.assembly_refs {
            w.write_u32(strings.intern(&r.name));
        }

        w.write_u32(self.type_refs.len() as u32);
        for r in &self.type_refs {
            w.write_u32(r.scope.value());
            w.write_u32(strings.intern(&r.full_name));
        }

        w.write_u32(self.member_refs.len() as u32);
        for r in &self.member_refs {
            w.write_u32(r.parent.value());
            w.write_u32(strings.intern(&r.name));
            match &r.signature {
                MemberRefSig::Method(sig) => {
                    w.write_u8(0);
                    sig.emit(&mut w)?;
                }
                MemberRefSig::Field(sig) => {
                    w.write_u8(1);
                    sig.emit(&mut w)?;
                }
            }
        }

        w.write_u32(self.types.len() as u32);
        for t in &self.types {
            w.write_u32(strings.intern(&t.full_name));
            w.write_u32(t.flags.bits());

            w.write_u32(t.fields.len() as u32);
            for f in &t.fields {
                w.write_u32(strings.intern(&f.name));
                w.write_u16(f.flags.bits());
                f.field_type.emit(&mut w)?;
            }

            w.write_u32(t.methods.len() as u32);
            for m in &t.methods {
                w.write_u32(strings.intern(&m.name));
                w.write_u16(m.flags.bits());
                m.signature.emit(&mut w)?;
                match &m.body {
                    None => w.write_u32(0),
                    Some(body) => {
                        let display = format!("{}.{}", t.full_name, m.name);
                        let encoded =
                            encode_body(self, &display, body, &m.signature, users)?;
                        w.write_u32(encoded.len() as u32);
                        w.write_bytes(&encoded);
                    }
                }
            }
        }

        Ok(w)
    }
}

fn encode_body(
    image: &AssemblyImage,
    display: &str,
    body: &MethodBody,
    signature: &MethodSig,
    users: &mut UserStringHeap,
) -> Result<Vec<u8>> {
    let metrics = validate_body(display, body, signature, image)?;

    let mut intern = |s: &str| users.intern(s);
    let (code, offsets) = encode_code(&body.instructions, &mut intern)?;
    let code_size = code.len() as u32;

    let tiny_eligible = code.len() < 64
        && body.locals.is_empty()
        && body.exception_handlers.is_empty()
        && metrics.max_stack <= 8;

    let mut w = Writer::new();
    if tiny_eligible {
        w.write_u8(((code.len() as u8) << 2) | BODY_FLAG_TINY);
        w.write_bytes(&code);
        return Ok(w.into_bytes());
    }

    let mut flags = u16::from(BODY_FLAG_FAT);
    if !body.exception_handlers.is_empty() {
        flags |= BODY_FLAG_MORE_SECTS;
    }
    if body.init_locals {
        flags |= BODY_FLAG_INIT_LOCALS;
    }
    w.write_u16(flags);
    w.write_u16(metrics.max_stack);
    w.write_u32(code_size);
    w.write_compressed_u32(body.locals.len() as u32)?;
    for local in &body.locals {
        local.emit(&mut w)?;
    }
    w.write_bytes(&code);

    if !body.exception_handlers.is_empty() {
        w.align(4);
        w.write_u8(SECT_EHTABLE | SECT_FAT_FORMAT);
        let section_size = 4 + 24 * body.exception_handlers.len() as u32;
        w.write_u8((section_size & 0xFF) as u8);
        w.write_u8(((section_size >> 8) & 0xFF) as u8);
        w.write_u8(((section_size >> 16) & 0xFF) as u8);

        let offset_of = |id: InstrId| -> Result<u32> {
            offsets.get(&id).copied().ok_or_else(|| {
                Error::StructuralInvariant {
                    method: display.to_string(),
                    details: "exception region boundary is not in the instruction stream".into(),
                }
            })
        };
        let end_of = |id: Option<InstrId>| -> Result<u32> {
            match id {
                Some(id) => offset_of(id),
                None => Ok(code_size),
            }
        };

        for handler in &body.exception_handlers {
            let try_start = offset_of(handler.try_start)?;
            let try_end = end_of(handler.try_end)?;
            let handler_start = offset_of(handler.handler_start)?;
            let handler_end = end_of(handler.handler_end)?;
            w.write_u32(u32::from(handler.flags.bits()));
            w.write_u32(try_start);
            w.write_u32(try_end - try_start);
            w.write_u32(handler_start);
            w.write_u32(handler_end - handler_start);
            w.write_u32(handler.catch_type.map_or(0, Token::value));
        }
    }

    Ok(w.into_bytes())
}
