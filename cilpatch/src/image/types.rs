//! Type definitions, fields, and cross-module reference rows.

use bitflags::bitflags;

use crate::image::method::MethodDef;
use crate::image::signature::{MethodSig, TypeSig};
use crate::image::token::Token;

bitflags! {
    /// Attributes of a type definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        /// Visible outside the module
        const PUBLIC = 0x0001;
        /// Cannot be instantiated
        const ABSTRACT = 0x0080;
        /// Cannot be derived from
        const SEALED = 0x0100;
    }
}

bitflags! {
    /// Attributes of a field definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u16 {
        /// Accessible only within the declaring type
        const PRIVATE = 0x0001;
        /// Accessible everywhere
        const PUBLIC = 0x0006;
        /// Per-type rather than per-instance storage
        const STATIC = 0x0010;
    }
}

bitflags! {
    /// Attributes of a method definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodFlags: u16 {
        /// Accessible only within the declaring type
        const PRIVATE = 0x0001;
        /// Accessible everywhere
        const PUBLIC = 0x0006;
        /// No `this` parameter
        const STATIC = 0x0010;
        /// Participates in virtual dispatch
        const VIRTUAL = 0x0040;
    }
}

/// A reference to another module by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRef {
    /// Module name without extension
    pub name: String,
}

/// A reference to a type defined in another module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    /// AssemblyRef token of the module that defines the type
    pub scope: Token,
    /// Namespace-qualified type name
    pub full_name: String,
}

/// The member kinds a [`MemberRef`] can point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRefSig {
    /// A method, with its full signature
    Method(MethodSig),
    /// A field, with its declared type
    Field(TypeSig),
}

/// A reference to a member of a type in another module.
///
/// The image owns its member-ref table exclusively; imports are deduplicated
/// by (parent, name, signature) so repeated imports of the same symbol never
/// bloat the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    /// TypeRef token of the declaring type
    pub parent: Token,
    /// Member name
    pub name: String,
    /// Method or field signature
    pub signature: MemberRefSig,
}

/// A field declared by a type in this module.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Storage and visibility attributes
    pub flags: FieldFlags,
    /// Declared type
    pub field_type: TypeSig,
}

impl FieldDef {
    /// True for per-type storage.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }
}

/// A type declared in this module.
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// Namespace-qualified name
    pub full_name: String,
    /// Type attributes
    pub flags: TypeFlags,
    /// Declared fields, in declaration order
    pub fields: Vec<FieldDef>,
    /// Declared methods, in declaration order
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    /// The name after the last namespace separator.
    #[must_use]
    pub fn simple_name(&self) -> &str {
        self.full_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.full_name)
    }
}

/// Split a namespace-qualified name into its final segment.
#[must_use]
pub fn simple_name(full_name: &str) -> &str {
    full_name.rsplit('.').next().unwrap_or(full_name)
}
