//! Type and method signatures.
//!
//! Signatures are stored inline in the table stream using ECMA-style element
//! codes and a calling-convention byte (`HASTHIS` = 0x20 for instance
//! members). Only the handful of element types the patch surface touches are
//! carried; anything else fails the load rather than being silently mangled.

use crate::{
    file::{Parser, Writer},
    image::token::{table, Token},
    Result,
};

/// Calling convention flag: the member has an implicit `this` parameter.
pub const SIG_HAS_THIS: u8 = 0x20;

const ELEM_VOID: u8 = 0x01;
const ELEM_BOOLEAN: u8 = 0x02;
const ELEM_I4: u8 = 0x08;
const ELEM_R4: u8 = 0x0C;
const ELEM_STRING: u8 = 0x0E;
const ELEM_CLASS: u8 = 0x12;
const ELEM_OBJECT: u8 = 0x1C;

/// A single type position in a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSig {
    /// No value (return position only)
    Void,
    /// System.Boolean
    Boolean,
    /// System.Int32
    I4,
    /// System.Single
    R4,
    /// System.String
    String,
    /// System.Object
    Object,
    /// A class reference by TypeRef or TypeDef token
    Class(Token),
}

impl TypeSig {
    /// The framework full name for primitive positions; `Class` positions
    /// resolve through the image's type tables instead.
    #[must_use]
    pub fn primitive_full_name(&self) -> Option<&'static str> {
        match self {
            TypeSig::Void => Some("System.Void"),
            TypeSig::Boolean => Some("System.Boolean"),
            TypeSig::I4 => Some("System.Int32"),
            TypeSig::R4 => Some("System.Single"),
            TypeSig::String => Some("System.String"),
            TypeSig::Object => Some("System.Object"),
            TypeSig::Class(_) => None,
        }
    }

    pub(crate) fn parse(parser: &mut Parser) -> Result<TypeSig> {
        let code = parser.read_u8()?;
        Ok(match code {
            ELEM_VOID => TypeSig::Void,
            ELEM_BOOLEAN => TypeSig::Boolean,
            ELEM_I4 => TypeSig::I4,
            ELEM_R4 => TypeSig::R4,
            ELEM_STRING => TypeSig::String,
            ELEM_OBJECT => TypeSig::Object,
            ELEM_CLASS => {
                let raw = parser.read_compressed_u32()?;
                TypeSig::Class(Token::new(raw))
            }
            _ => return Err(malformed_error!("unknown signature element 0x{:02X}", code)),
        })
    }

    pub(crate) fn emit(&self, writer: &mut Writer) -> Result<()> {
        match self {
            TypeSig::Void => writer.write_u8(ELEM_VOID),
            TypeSig::Boolean => writer.write_u8(ELEM_BOOLEAN),
            TypeSig::I4 => writer.write_u8(ELEM_I4),
            TypeSig::R4 => writer.write_u8(ELEM_R4),
            TypeSig::String => writer.write_u8(ELEM_STRING),
            TypeSig::Object => writer.write_u8(ELEM_OBJECT),
            TypeSig::Class(token) => {
                writer.write_u8(ELEM_CLASS);
                debug_assert!(matches!(
                    token.table(),
                    table::TYPE_REF | table::TYPE_DEF
                ));
                writer.write_compressed_u32(token.value())?;
            }
        }
        Ok(())
    }
}

/// A method signature: calling convention, return type, ordered parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    /// True for instance members (implicit `this` not listed in `params`)
    pub has_this: bool,
    /// Return type (may be [`TypeSig::Void`])
    pub return_type: TypeSig,
    /// Declared parameter types, in order
    pub params: Vec<TypeSig>,
}

impl MethodSig {
    /// A static method signature.
    #[must_use]
    pub fn static_fn(return_type: TypeSig, params: Vec<TypeSig>) -> MethodSig {
        MethodSig {
            has_this: false,
            return_type,
            params,
        }
    }

    /// An instance method signature.
    #[must_use]
    pub fn instance(return_type: TypeSig, params: Vec<TypeSig>) -> MethodSig {
        MethodSig {
            has_this: true,
            return_type,
            params,
        }
    }

    /// Total values a call pops from the stack: declared parameters plus the
    /// implicit `this` for instance members.
    #[must_use]
    pub fn arg_slots(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }

    /// True if the method produces a value.
    #[must_use]
    pub fn returns_value(&self) -> bool {
        self.return_type != TypeSig::Void
    }

    pub(crate) fn parse(parser: &mut Parser) -> Result<MethodSig> {
        let conv = parser.read_u8()?;
        let param_count = parser.read_compressed_u32()? as usize;
        let return_type = TypeSig::parse(parser)?;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            params.push(TypeSig::parse(parser)?);
        }
        Ok(MethodSig {
            has_this: conv & SIG_HAS_THIS != 0,
            return_type,
            params,
        })
    }

    pub(crate) fn emit(&self, writer: &mut Writer) -> Result<()> {
        writer.write_u8(if self.has_this { SIG_HAS_THIS } else { 0 });
        writer.write_compressed_u32(self.params.len() as u32)?;
        self.return_type.emit(writer)?;
        for param in &self.params {
            param.emit(writer)?;
        }
        Ok(())
    }
}
