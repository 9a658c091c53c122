//! The in-memory module model.
//!
//! An [`AssemblyImage`] is an owned, mutable representation of one compact
//! managed module: reference tables, type definitions, and method bodies.
//! It is created by reading a file, mutated in place by patch operations,
//! and serialized back out; nothing about it persists across a patcher run
//! except the bytes it came from and the bytes it writes.

mod builder;
mod imports;
mod loader;
mod method;
mod read;
mod signature;
pub mod token;
mod types;
mod write;

pub use builder::{BodyBuilder, ImageBuilder, MethodBuilder, TypeBuilder};
pub use loader::{ImageResolver, MODULE_EXTENSION};
pub use method::{ExceptionHandler, ExceptionHandlerFlags, MethodBody, MethodDef};
pub use signature::{MethodSig, TypeSig, SIG_HAS_THIS};
pub use token::Token;
pub use types::{
    simple_name, AssemblyRef, FieldDef, FieldFlags, MemberRef, MemberRefSig, MethodFlags,
    TypeDef, TypeFlags, TypeRef,
};

use crate::cil::SigLookup;

use self::token::table;

/// A mutable, fully owned module image.
#[derive(Debug, Clone, Default)]
pub struct AssemblyImage {
    /// Module name
    pub name: String,
    /// Referenced sibling modules
    pub assembly_refs: Vec<AssemblyRef>,
    /// Types referenced in other modules
    pub type_refs: Vec<TypeRef>,
    /// Members referenced in other modules
    pub member_refs: Vec<MemberRef>,
    /// Types defined by this module
    pub types: Vec<TypeDef>,
}

/// Position of a method definition inside an image, stable across body
/// mutation (but not across type/method insertion or removal, which the
/// patcher never performs on resolved handles).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHandle {
    /// Index into [`AssemblyImage::types`]
    pub type_index: usize,
    /// Index into the type's method list
    pub method_index: usize,
}

impl AssemblyImage {
    /// Create an empty image with the given module name.
    #[must_use]
    pub fn new(name: &str) -> AssemblyImage {
        AssemblyImage {
            name: name.to_string(),
            ..AssemblyImage::default()
        }
    }

    /// Find a type definition by exact, case-sensitive full name.
    #[must_use]
    pub fn type_by_name(&self, full_name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.full_name == full_name)
    }

    /// Index of a type definition by full name.
    #[must_use]
    pub fn type_index(&self, full_name: &str) -> Option<usize> {
        self.types.iter().position(|t| t.full_name == full_name)
    }

    /// The method behind a handle.
    ///
    /// # Panics
    /// Panics if the handle does not belong to this image; handles are only
    /// produced by resolution against the same image.
    #[must_use]
    pub fn method(&self, handle: MethodHandle) -> &MethodDef {
        &self.types[handle.type_index].methods[handle.method_index]
    }

    /// Mutable access to the method behind a handle.
    #[must_use]
    pub fn method_mut(&mut self, handle: MethodHandle) -> &mut MethodDef {
        &mut self.types[handle.type_index].methods[handle.method_index]
    }

    /// Display name `Type.Method` for a handle.
    #[must_use]
    pub fn method_display(&self, handle: MethodHandle) -> String {
        format!(
            "{}.{}",
            self.types[handle.type_index].full_name,
            self.method(handle).name
        )
    }

    /// MethodDef token for a handle (1-based global method index).
    #[must_use]
    pub fn method_token(&self, handle: MethodHandle) -> Token {
        let mut row = 1u32;
        for t in &self.types[..handle.type_index] {
            row += t.methods.len() as u32;
        }
        row += handle.method_index as u32;
        Token::from_parts(table::METHOD_DEF, row)
    }

    /// Resolve a MethodDef token back to its handle.
    #[must_use]
    pub fn method_handle(&self, token: Token) -> Option<MethodHandle> {
        if token.table() != table::METHOD_DEF || token.row() == 0 {
            return None;
        }
        let mut remaining = token.row() - 1;
        for (type_index, t) in self.types.iter().enumerate() {
            if (remaining as usize) < t.methods.len() {
                return Some(MethodHandle {
                    type_index,
                    method_index: remaining as usize,
                });
            }
            remaining -= t.methods.len() as u32;
        }
        None
    }

    /// Field token for a (type, field) position (1-based global field index).
    #[must_use]
    pub fn field_token(&self, type_index: usize, field_index: usize) -> Token {
        let mut row = 1u32;
        for t in &self.types[..type_index] {
            row += t.fields.len() as u32;
        }
        row += field_index as u32;
        Token::from_parts(table::FIELD, row)
    }

    /// Resolve a Field token to its (type index, field index) position.
    #[must_use]
    pub fn field_position(&self, token: Token) -> Option<(usize, usize)> {
        if token.table() != table::FIELD || token.row() == 0 {
            return None;
        }
        let mut remaining = token.row() - 1;
        for (type_index, t) in self.types.iter().enumerate() {
            if (remaining as usize) < t.fields.len() {
                return Some((type_index, remaining as usize));
            }
            remaining -= t.fields.len() as u32;
        }
        None
    }

    /// The member-ref row behind a token.
    #[must_use]
    pub fn member_ref(&self, token: Token) -> Option<&MemberRef> {
        if token.table() != table::MEMBER_REF {
            return None;
        }
        self.member_refs.get(token.row().checked_sub(1)? as usize)
    }

    /// Full name of a TypeDef or TypeRef token.
    #[must_use]
    pub fn type_full_name(&self, token: Token) -> Option<&str> {
        match token.table() {
            table::TYPE_DEF => self
                .types
                .get(token.row().checked_sub(1)? as usize)
                .map(|t| t.full_name.as_str()),
            table::TYPE_REF => self
                .type_refs
                .get(token.row().checked_sub(1)? as usize)
                .map(|t| t.full_name.as_str()),
            _ => None,
        }
    }

    /// Declaring-type full name and member name of a callable token
    /// (MethodDef or method MemberRef). Used by call-pattern matching.
    #[must_use]
    pub fn callable_names(&self, token: Token) -> Option<(&str, &str)> {
        match token.table() {
            table::METHOD_DEF => {
                let handle = self.method_handle(token)?;
                Some((
                    self.types[handle.type_index].full_name.as_str(),
                    self.method(handle).name.as_str(),
                ))
            }
            table::MEMBER_REF => {
                let member = self.member_ref(token)?;
                let parent = self.type_full_name(member.parent)?;
                Some((parent, member.name.as_str()))
            }
            _ => None,
        }
    }

    /// Render a signature position as a framework full name, resolving class
    /// references through the type tables.
    #[must_use]
    pub fn type_sig_full_name(&self, sig: &TypeSig) -> String {
        match sig.primitive_full_name() {
            Some(name) => name.to_string(),
            None => match sig {
                TypeSig::Class(token) => self
                    .type_full_name(*token)
                    .unwrap_or("<unresolved>")
                    .to_string(),
                _ => unreachable!(),
            },
        }
    }
}

impl SigLookup for AssemblyImage {
    fn method_sig(&self, token: Token) -> Option<MethodSig> {
        match token.table() {
            table::METHOD_DEF => {
                let handle = self.method_handle(token)?;
                Some(self.method(handle).signature.clone())
            }
            table::MEMBER_REF => match &self.member_ref(token)?.signature {
                MemberRefSig::Method(sig) => Some(sig.clone()),
                MemberRefSig::Field(_) => None,
            },
            _ => None,
        }
    }

    fn field_type(&self, token: Token) -> Option<TypeSig> {
        match token.table() {
            table::FIELD => {
                let (ti, fi) = self.field_position(token)?;
                Some(self.types[ti].fields[fi].field_type.clone())
            }
            table::MEMBER_REF => match &self.member_ref(token)?.signature {
                MemberRefSig::Field(sig) => Some(sig.clone()),
                MemberRefSig::Method(_) => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::Op;

    fn two_type_image() -> AssemblyImage {
        ImageBuilder::new("Scripts")
            .type_def("First", |t| {
                t.method("A", MethodSig::instance(TypeSig::Void, vec![]), |m| {
                    m.body(|b| {
                        b.ret();
                    })
                })
                .method("B", MethodSig::instance(TypeSig::Void, vec![]), |m| {
                    m.body(|b| {
                        b.ret();
                    })
                })
            })
            .type_def("Second", |t| {
                t.field("x", TypeSig::I4, FieldFlags::PRIVATE)
                    .method("C", MethodSig::instance(TypeSig::Void, vec![]), |m| {
                        m.body(|b| {
                            b.ret();
                        })
                    })
            })
            .build()
    }

    #[test]
    fn test_method_token_roundtrip() {
        let image = two_type_image();
        let handle = MethodHandle {
            type_index: 1,
            method_index: 0,
        };
        let token = image.method_token(handle);
        assert_eq!(token.value(), 0x0600_0003);
        assert_eq!(image.method_handle(token), Some(handle));
        assert_eq!(image.method(handle).name, "C");
    }

    #[test]
    fn test_callable_names_for_method_def() {
        let image = two_type_image();
        let token = Token::from_parts(table::METHOD_DEF, 2);
        assert_eq!(image.callable_names(token), Some(("First", "B")));
    }

    #[test]
    fn test_field_token_roundtrip() {
        let image = two_type_image();
        let token = image.field_token(1, 0);
        assert_eq!(image.field_position(token), Some((1, 0)));
    }

    #[test]
    fn test_body_mutation_through_handle() {
        let mut image = two_type_image();
        let handle = MethodHandle {
            type_index: 0,
            method_index: 0,
        };
        let body = image.method_mut(handle).body.as_mut().unwrap();
        let first = body.instructions.first().unwrap();
        body.instructions.insert_before(first, Op::Nop).unwrap();
        assert_eq!(image.method(handle).body.as_ref().unwrap().instructions.len(), 2);
    }
}
