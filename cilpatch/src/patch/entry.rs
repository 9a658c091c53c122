//! Entry injection: route a method's string parameter through the hook.
//!
//! The injected prologue runs before the first real instruction and rewrites
//! the parameter in place, so every pre-existing instruction operates on the
//! hook-transformed value:
//!
//! ```text
//! ldarg.0
//! ldarg.1
//! call string TextHook::OnSetText(object, string)
//! starg.s 1
//! ```
//!
//! The sequence is stack-neutral and only ever inserts in front of the
//! anchor, so no branch target or exception region elsewhere in the body is
//! disturbed.

use crate::cil::Op;
use crate::image::{AssemblyImage, MethodHandle, Token, TypeSig};
use crate::patch::idempotency::{is_marked, PatchMarker};
use crate::patch::PatchOutcome;
use crate::{Error, Result};

/// Prefix length scanned for the already-patched marker. Injected code sits
/// at method entry, so a bounded scan is sufficient.
pub const ENTRY_MARKER_SCAN: usize = 16;

/// Insert the hook call at the entry of the method behind `handle`.
///
/// `hook` must be an imported member-ref to a public static
/// `(object, string) -> string` function; the target method must be an
/// instance method taking a single string.
///
/// # Errors
/// [`Error::ParameterTypeMismatch`] when the target's parameter list is not
/// `(string)`; [`Error::SignatureMismatch`] when it has no body.
pub fn inject_entry_hook(
    image: &mut AssemblyImage,
    handle: MethodHandle,
    hook: Token,
) -> Result<PatchOutcome> {
    let display = image.method_display(handle);

    let (hook_declaring, hook_name) = image
        .callable_names(hook)
        .map(|(d, n)| (d.to_string(), n.to_string()))
        .ok_or_else(|| Error::Serialization(format!("hook token {hook} is not callable")))?;

    {
        let method = image.method(handle);
        if !method.signature.has_this || method.signature.params.len() != 1 {
            return Err(Error::ParameterTypeMismatch {
                method: display,
                expected: "System.String".into(),
                found: format!("{} parameter(s)", method.signature.params.len()),
            });
        }
        if method.signature.params[0] != TypeSig::String {
            let found = image.type_sig_full_name(&method.signature.params[0]);
            return Err(Error::ParameterTypeMismatch {
                method: display,
                expected: "System.String".into(),
                found,
            });
        }
        let body = method.body.as_ref().ok_or_else(|| Error::SignatureMismatch {
            type_name: image.types[handle.type_index].full_name.clone(),
            method_name: method.name.clone(),
            details: "method has no body".into(),
        })?;

        let marker = PatchMarker::CallTo {
            declaring: hook_declaring,
            method: hook_name,
        };
        if is_marked(image, body, &marker, Some(ENTRY_MARKER_SCAN)) {
            return Ok(PatchOutcome::AlreadyPatched);
        }
    }

    let body = image
        .method_mut(handle)
        .body
        .as_mut()
        .expect("checked above");
    let anchor = body
        .instructions
        .first_real()
        .expect("bodies always hold at least ret");

    body.instructions.insert_before(anchor, Op::Ldarg(0))?;
    body.instructions.insert_before(anchor, Op::Ldarg(1))?;
    body.instructions.insert_before(anchor, Op::Call(hook))?;
    body.instructions.insert_before(anchor, Op::Starg(1))?;

    log::info!("entry hook installed in {display}");
    Ok(PatchOutcome::Applied)
}
