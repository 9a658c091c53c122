//! External symbol imports.
//!
//! Before injected instructions can reference a method defined in another
//! module, that symbol must exist in this image's reference tables. The
//! image owns those tables exclusively, and every import path deduplicates
//! by identity so re-running a patch can never grow the metadata.

use crate::image::token::{table, Token};
use crate::image::types::{AssemblyRef, FieldDef, MemberRef, MemberRefSig, TypeRef};
use crate::image::{AssemblyImage, MethodSig};

impl AssemblyImage {
    /// Token of the assembly-ref row for `name`, adding the row if absent.
    pub fn ensure_assembly_ref(&mut self, name: &str) -> Token {
        if let Some(index) = self.assembly_refs.iter().position(|r| r.name == name) {
            return Token::from_parts(table::ASSEMBLY_REF, index as u32 + 1);
        }
        self.assembly_refs.push(AssemblyRef {
            name: name.to_string(),
        });
        log::debug!("added assembly reference: {name}");
        Token::from_parts(table::ASSEMBLY_REF, self.assembly_refs.len() as u32)
    }

    /// Token of the type-ref row for `full_name` scoped to `assembly`,
    /// adding both rows as needed.
    pub fn ensure_type_ref(&mut self, assembly: &str, full_name: &str) -> Token {
        let scope = self.ensure_assembly_ref(assembly);
        if let Some(index) = self
            .type_refs
            .iter()
            .position(|r| r.scope == scope && r.full_name == full_name)
        {
            return Token::from_parts(table::TYPE_REF, index as u32 + 1);
        }
        self.type_refs.push(TypeRef {
            scope,
            full_name: full_name.to_string(),
        });
        Token::from_parts(table::TYPE_REF, self.type_refs.len() as u32)
    }

    /// Import a method defined in another module, returning its member-ref
    /// token. Importing the same (type, name, signature) twice returns the
    /// first token.
    pub fn import_method(
        &mut self,
        assembly: &str,
        type_full_name: &str,
        name: &str,
        signature: MethodSig,
    ) -> Token {
        let parent = self.ensure_type_ref(assembly, type_full_name);
        let signature = MemberRefSig::Method(signature);
        if let Some(index) = self
            .member_refs
            .iter()
            .position(|r| r.parent == parent && r.name == name && r.signature == signature)
        {
            return Token::from_parts(table::MEMBER_REF, index as u32 + 1);
        }
        self.member_refs.push(MemberRef {
            parent,
            name: name.to_string(),
            signature,
        });
        log::debug!("imported {type_full_name}::{name}");
        Token::from_parts(table::MEMBER_REF, self.member_refs.len() as u32)
    }

    /// Append a field to a type definition, returning its token.
    pub fn add_field(&mut self, type_index: usize, field: FieldDef) -> Token {
        self.types[type_index].fields.push(field);
        self.field_token(type_index, self.types[type_index].fields.len() - 1)
    }
}
