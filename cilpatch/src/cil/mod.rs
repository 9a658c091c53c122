//! CIL instruction stream handling: opcode model, decoding, deterministic
//! encoding, and structural validation.
//!
//! Instructions carry a stable per-body identity ([`InstrId`]) assigned from
//! an arena counter. Branch operands and exception-handler boundaries
//! reference these ids, never indices or byte offsets, so inserting
//! instructions can never invalidate an existing reference. All offset-based
//! metadata (branch displacements, handler ranges) is recomputed from scratch
//! at serialization time.

mod decode;
mod encode;
mod ops;
mod stream;
mod validate;

pub use ops::{FlowType, Op};
pub use stream::{InstrId, Instruction, InstructionStream};
pub use validate::{validate_body, BodyMetrics};

pub(crate) use decode::decode_code;
pub(crate) use encode::encode_code;

use crate::image::{MethodSig, Token, TypeSig};

/// Signature lookup used for stack-effect calculation and call-target
/// inspection without tying the instruction layer to the image model.
pub trait SigLookup {
    /// Signature of a callable token (MethodDef or method MemberRef).
    fn method_sig(&self, token: Token) -> Option<MethodSig>;

    /// Declared type of a field token (Field or field MemberRef).
    fn field_type(&self, token: Token) -> Option<TypeSig>;
}
