//! Method definitions, bodies, and exception-handler regions.
//!
//! A body's exception handlers reference instruction identities, not byte
//! offsets; the serialized fat-clause offsets are recomputed from the
//! encoded layout every time the image is written.

use bitflags::bitflags;

use crate::cil::{InstrId, InstructionStream};
use crate::image::signature::{MethodSig, TypeSig};
use crate::image::token::Token;
use crate::image::types::MethodFlags;

bitflags! {
    /// Kind of an exception handling clause.
    ///
    /// `EXCEPTION` is the zero value, matching the on-disk encoding; use
    /// [`ExceptionHandler::is_catch`] rather than `contains` to test for it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed (or catch-all) exception clause
        const EXCEPTION = 0x0000;
        /// An exception filter clause
        const FILTER = 0x0001;
        /// A finally clause
        const FINALLY = 0x0002;
        /// A fault clause (finally that runs only on exception)
        const FAULT = 0x0004;
    }
}

/// One try/handler region of a method body.
///
/// Ranges are half-open over the instruction sequence: `*_start` is the
/// first instruction inside the region, `*_end` the first instruction after
/// it, with `None` meaning the region runs to the end of the body.
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// First instruction of the protected region
    pub try_start: InstrId,
    /// First instruction after the protected region
    pub try_end: Option<InstrId>,
    /// First instruction of the handler
    pub handler_start: InstrId,
    /// First instruction after the handler
    pub handler_end: Option<InstrId>,
    /// Exception type this clause catches; `None` catches anything
    pub catch_type: Option<Token>,
}

impl ExceptionHandler {
    /// True for catch clauses (typed or catch-all).
    #[must_use]
    pub fn is_catch(&self) -> bool {
        self.flags.bits() & (ExceptionHandlerFlags::FILTER.bits()
            | ExceptionHandlerFlags::FINALLY.bits()
            | ExceptionHandlerFlags::FAULT.bits())
            == 0
    }
}

/// The executable body of a method.
#[derive(Debug, Clone)]
pub struct MethodBody {
    /// Zero-initialize locals on entry
    pub init_locals: bool,
    /// Operand stack ceiling; recomputed from the instruction stream at
    /// serialization time, retained here from the last load
    pub max_stack: u16,
    /// Local variable types, slot-indexed
    pub locals: Vec<TypeSig>,
    /// The instruction sequence
    pub instructions: InstructionStream,
    /// Try/handler regions
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// An empty body holding just `ret`.
    #[must_use]
    pub fn empty() -> MethodBody {
        let mut instructions = InstructionStream::new();
        instructions.push(crate::cil::Op::Ret);
        MethodBody {
            init_locals: true,
            max_stack: 0,
            locals: Vec::new(),
            instructions,
            exception_handlers: Vec::new(),
        }
    }
}

/// A method declared by a type in this module.
#[derive(Debug, Clone)]
pub struct MethodDef {
    /// Method name
    pub name: String,
    /// Visibility, storage, and dispatch attributes
    pub flags: MethodFlags,
    /// Calling convention, return type, parameters
    pub signature: MethodSig,
    /// The body; `None` for abstract/external declarations
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// True when the method has no `this` parameter.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// True when the method is visible outside its module.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.flags.contains(MethodFlags::PUBLIC)
    }
}
