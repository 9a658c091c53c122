//! Fluent construction of module images.
//!
//! Primarily test infrastructure: synthetic target and hook modules are
//! assembled with these builders, written to disk, and fed back through the
//! loader. The closure-per-level shape keeps declaration order explicit,
//! which matters because tokens are positional.
//!
//! # Example
//!
//! ```
//! use cilpatch::image::{ImageBuilder, MethodSig, TypeSig};
//!
//! let image = ImageBuilder::new("Scripts")
//!     .type_def("LabelObject", |t| {
//!         t.method("SetText", MethodSig::instance(TypeSig::Void, vec![TypeSig::String]), |m| {
//!             m.body(|b| {
//!                 b.ret();
//!             })
//!         })
//!     })
//!     .build();
//! assert_eq!(image.types.len(), 1);
//! ```

use crate::cil::{InstrId, Op};
use crate::image::method::{ExceptionHandler, MethodBody, MethodDef};
use crate::image::signature::{MethodSig, TypeSig};
use crate::image::types::{FieldDef, FieldFlags, MethodFlags, TypeDef, TypeFlags};
use crate::image::{AssemblyImage, Token};

/// Builds a whole [`AssemblyImage`].
pub struct ImageBuilder {
    image: AssemblyImage,
}

impl ImageBuilder {
    /// Start an image with the given module name.
    #[must_use]
    pub fn new(name: &str) -> ImageBuilder {
        ImageBuilder {
            image: AssemblyImage::new(name),
        }
    }

    /// Add a type definition.
    #[must_use]
    pub fn type_def(mut self, full_name: &str, f: impl FnOnce(TypeBuilder) -> TypeBuilder) -> Self {
        let builder = TypeBuilder {
            def: TypeDef {
                full_name: full_name.to_string(),
                flags: TypeFlags::PUBLIC,
                fields: Vec::new(),
                methods: Vec::new(),
            },
        };
        self.image.types.push(f(builder).def);
        self
    }

    /// Finish and return the image.
    #[must_use]
    pub fn build(self) -> AssemblyImage {
        self.image
    }
}

/// Builds one type definition.
pub struct TypeBuilder {
    def: TypeDef,
}

impl TypeBuilder {
    /// Override the type flags.
    #[must_use]
    pub fn flags(mut self, flags: TypeFlags) -> Self {
        self.def.flags = flags;
        self
    }

    /// Add a field.
    #[must_use]
    pub fn field(mut self, name: &str, field_type: TypeSig, flags: FieldFlags) -> Self {
        self.def.fields.push(FieldDef {
            name: name.to_string(),
            flags,
            field_type,
        });
        self
    }

    /// Add a method. Static/instance is taken from the signature.
    #[must_use]
    pub fn method(
        mut self,
        name: &str,
        signature: MethodSig,
        f: impl FnOnce(MethodBuilder) -> MethodBuilder,
    ) -> Self {
        let mut flags = MethodFlags::PUBLIC;
        if !signature.has_this {
            flags |= MethodFlags::STATIC;
        }
        let builder = MethodBuilder {
            def: MethodDef {
                name: name.to_string(),
                flags,
                signature,
                body: None,
            },
        };
        self.def.methods.push(f(builder).def);
        self
    }
}

/// Builds one method definition.
pub struct MethodBuilder {
    def: MethodDef,
}

impl MethodBuilder {
    /// Override the method flags.
    #[must_use]
    pub fn flags(mut self, flags: MethodFlags) -> Self {
        self.def.flags = flags;
        self
    }

    /// Give the method a body.
    #[must_use]
    pub fn body(mut self, f: impl FnOnce(&mut BodyBuilder)) -> Self {
        let mut builder = BodyBuilder {
            body: MethodBody {
                init_locals: true,
                max_stack: 0,
                locals: Vec::new(),
                instructions: crate::cil::InstructionStream::new(),
                exception_handlers: Vec::new(),
            },
        };
        f(&mut builder);
        self.def.body = Some(builder.body);
        self
    }
}

/// Emits instructions into a method body under construction.
///
/// Linear emission only; the injectors build their own control flow
/// directly against the instruction stream.
pub struct BodyBuilder {
    body: MethodBody,
}

impl BodyBuilder {
    /// Declare a local variable, returning its slot index.
    pub fn local(&mut self, local_type: TypeSig) -> u16 {
        self.body.locals.push(local_type);
        (self.body.locals.len() - 1) as u16
    }

    /// Append an arbitrary operation.
    pub fn op(&mut self, op: Op) -> InstrId {
        self.body.instructions.push(op)
    }

    /// Emit `nop`.
    pub fn nop(&mut self) -> &mut Self {
        self.op(Op::Nop);
        self
    }

    /// Emit an argument load.
    pub fn ldarg(&mut self, index: u16) -> &mut Self {
        self.op(Op::Ldarg(index));
        self
    }

    /// Emit an argument store.
    pub fn starg(&mut self, index: u16) -> &mut Self {
        self.op(Op::Starg(index));
        self
    }

    /// Emit a local load.
    pub fn ldloc(&mut self, slot: u16) -> &mut Self {
        self.op(Op::Ldloc(slot));
        self
    }

    /// Emit a local store.
    pub fn stloc(&mut self, slot: u16) -> &mut Self {
        self.op(Op::Stloc(slot));
        self
    }

    /// Emit an i4 constant load.
    pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
        self.op(Op::LdcI4(value));
        self
    }

    /// Emit an r4 constant load.
    pub fn ldc_r4(&mut self, value: f32) -> &mut Self {
        self.op(Op::LdcR4(value));
        self
    }

    /// Emit `ldnull`.
    pub fn ldnull(&mut self) -> &mut Self {
        self.op(Op::Ldnull);
        self
    }

    /// Emit a string literal load.
    pub fn ldstr(&mut self, value: &str) -> &mut Self {
        self.op(Op::Ldstr(value.to_string()));
        self
    }

    /// Emit `dup`.
    pub fn dup(&mut self) -> &mut Self {
        self.op(Op::Dup);
        self
    }

    /// Emit `pop`.
    pub fn pop(&mut self) -> &mut Self {
        self.op(Op::Pop);
        self
    }

    /// Emit a direct call.
    pub fn call(&mut self, target: Token) -> &mut Self {
        self.op(Op::Call(target));
        self
    }

    /// Emit a virtual call.
    pub fn callvirt(&mut self, target: Token) -> &mut Self {
        self.op(Op::Callvirt(target));
        self
    }

    /// Emit an instance field load.
    pub fn ldfld(&mut self, field: Token) -> &mut Self {
        self.op(Op::Ldfld(field));
        self
    }

    /// Emit an instance field store.
    pub fn stfld(&mut self, field: Token) -> &mut Self {
        self.op(Op::Stfld(field));
        self
    }

    /// Emit a static field load.
    pub fn ldsfld(&mut self, field: Token) -> &mut Self {
        self.op(Op::Ldsfld(field));
        self
    }

    /// Emit a static field store.
    pub fn stsfld(&mut self, field: Token) -> &mut Self {
        self.op(Op::Stsfld(field));
        self
    }

    /// Emit `throw`.
    pub fn throw(&mut self) -> &mut Self {
        self.op(Op::Throw);
        self
    }

    /// Emit `ret`.
    pub fn ret(&mut self) -> &mut Self {
        self.op(Op::Ret);
        self
    }

    /// Attach an exception handler over already-emitted instructions.
    pub fn exception_handler(&mut self, handler: ExceptionHandler) -> &mut Self {
        self.body.exception_handlers.push(handler);
        self
    }
}
