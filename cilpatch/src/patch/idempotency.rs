//! Patch markers: detecting a prior run's work.
//!
//! A marker is a detectable trace the injector itself leaves behind - a call
//! to the hook, or a distinctive string literal. Finding one means the
//! method is already patched and must be reported as a no-op, never patched
//! again and never treated as an error.

use crate::image::{simple_name, AssemblyImage, MethodBody};

/// Predicate over an instruction stream identifying a prior patch.
#[derive(Debug, Clone)]
pub enum PatchMarker {
    /// A call/callvirt whose target member matches by declaring type
    /// (full or simple name) and member name
    CallTo {
        /// Declaring type of the called member
        declaring: String,
        /// Name of the called member
        method: String,
    },
    /// An `ldstr` carrying exactly this literal
    StringLiteral(String),
}

/// Scan `body` for `marker`, looking at the first `limit` instructions or
/// the whole stream when `limit` is `None`.
#[must_use]
pub fn is_marked(
    image: &AssemblyImage,
    body: &MethodBody,
    marker: &PatchMarker,
    limit: Option<usize>,
) -> bool {
    let scan = limit.unwrap_or(usize::MAX);
    body.instructions.iter().take(scan).any(|instr| match marker {
        PatchMarker::CallTo { declaring, method } => {
            instr.op.call_target().is_some_and(|token| {
                image.callable_names(token).is_some_and(|(decl, name)| {
                    name == method && (decl == declaring || simple_name(decl) == declaring)
                })
            })
        }
        PatchMarker::StringLiteral(value) => {
            matches!(&instr.op, crate::cil::Op::Ldstr(s) if s == value)
        }
    })
}
