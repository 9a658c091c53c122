//! Bootstrap wrapping: a guarded, exception-safe, one-time call into a
//! dynamically-resolved entry point.
//!
//! Injected at the entry of a frequently-invoked method (the per-frame
//! update), the sequence runs once per process and swallows every failure,
//! so a missing or broken hook module can never destabilize the host:
//!
//! ```text
//!       ldsfld   bool <flag>
//!       brtrue   END
//!       ldc.i4.1
//!       stsfld   bool <flag>
//!   .try {
//!       ldstr    "<bootstrap type name>"        // idempotency marker
//!       call     object LateBinding::ResolveType(string)
//!       ldstr    "<bootstrap method name>"
//!       call     object LateBinding::InvokeStatic(object, string)
//!       pop
//!       leave    END
//!   } catch object {
//!       pop
//!       leave    END
//!   }
//!   END: <original first instruction>
//! ```
//!
//! The type is resolved by name inside the *patched* process at runtime, not
//! at patch time; this injector never needs the named type to exist in
//! anything it can see.

use crate::cil::Op;
use crate::image::{ExceptionHandler, ExceptionHandlerFlags};
use crate::image::{
    AssemblyImage, FieldDef, FieldFlags, MethodHandle, MethodSig, TypeSig,
};
use crate::patch::idempotency::{is_marked, PatchMarker};
use crate::patch::PatchOutcome;
use crate::{Error, Result};

/// Module that provides the late-binding intrinsics.
pub const LATE_BINDING_ASSEMBLY: &str = "mscorlib";
/// Declaring type of the late-binding intrinsics.
pub const LATE_BINDING_TYPE: &str = "System.Reflection.LateBinding";
/// `static object ResolveType(string typeName)`
pub const RESOLVE_TYPE_METHOD: &str = "ResolveType";
/// `static object InvokeStatic(object type, string methodName)`
pub const INVOKE_STATIC_METHOD: &str = "InvokeStatic";

/// What the bootstrap should resolve and call at host runtime.
#[derive(Debug, Clone)]
pub struct BootstrapSpec {
    /// Type name resolved by the host at runtime; also the idempotency marker
    pub type_name: String,
    /// Public static no-arg method invoked on the resolved type
    pub method_name: String,
    /// Name of the private static bool guard field added to the declaring type
    pub flag_field: String,
}

impl BootstrapSpec {
    /// Spec with the conventional flag-field name.
    #[must_use]
    pub fn new(type_name: &str, method_name: &str) -> BootstrapSpec {
        BootstrapSpec {
            type_name: type_name.to_string(),
            method_name: method_name.to_string(),
            flag_field: "__bootstrapInvoked".to_string(),
        }
    }
}

/// Inject the guarded bootstrap at the entry of the method behind `handle`.
///
/// # Errors
/// [`Error::FlagFieldConflict`] when a field with the flag's name exists but
/// is not a private static bool. Runtime resolution failures are not
/// patch-time errors at all; they are swallowed by the injected handler.
pub fn inject_bootstrap(
    image: &mut AssemblyImage,
    handle: MethodHandle,
    spec: &BootstrapSpec,
) -> Result<PatchOutcome> {
    let display = image.method_display(handle);

    {
        let method = image.method(handle);
        let body = method.body.as_ref().ok_or_else(|| Error::SignatureMismatch {
            type_name: image.types[handle.type_index].full_name.clone(),
            method_name: method.name.clone(),
            details: "method has no body".into(),
        })?;
        let marker = PatchMarker::StringLiteral(spec.type_name.clone());
        if is_marked(image, body, &marker, None) {
            return Ok(PatchOutcome::AlreadyPatched);
        }
    }

    // Guard flag: reuse a compatible field, add one if absent, reject
    // anything with the right name and the wrong shape.
    let type_index = handle.type_index;
    let flag = match image.types[type_index]
        .fields
        .iter()
        .position(|f| f.name == spec.flag_field)
    {
        Some(index) => {
            let field = &image.types[type_index].fields[index];
            if !field.is_static() || field.field_type != TypeSig::Boolean {
                return Err(Error::FlagFieldConflict {
                    type_name: image.types[type_index].full_name.clone(),
                    field_name: spec.flag_field.clone(),
                });
            }
            image.field_token(type_index, index)
        }
        None => image.add_field(
            type_index,
            FieldDef {
                name: spec.flag_field.clone(),
                flags: FieldFlags::PRIVATE | FieldFlags::STATIC,
                field_type: TypeSig::Boolean,
            },
        ),
    };

    let resolve_type = image.import_method(
        LATE_BINDING_ASSEMBLY,
        LATE_BINDING_TYPE,
        RESOLVE_TYPE_METHOD,
        MethodSig::static_fn(TypeSig::Object, vec![TypeSig::String]),
    );
    let invoke_static = image.import_method(
        LATE_BINDING_ASSEMBLY,
        LATE_BINDING_TYPE,
        INVOKE_STATIC_METHOD,
        MethodSig::static_fn(TypeSig::Object, vec![TypeSig::Object, TypeSig::String]),
    );

    let body = image
        .method_mut(handle)
        .body
        .as_mut()
        .expect("checked above");
    let end = body
        .instructions
        .first()
        .expect("bodies always hold at least ret");

    let stream = &mut body.instructions;
    stream.insert_before(end, Op::Ldsfld(flag))?;
    stream.insert_before(end, Op::Brtrue(end))?;
    stream.insert_before(end, Op::LdcI4(1))?;
    stream.insert_before(end, Op::Stsfld(flag))?;
    let try_start = stream.insert_before(end, Op::Ldstr(spec.type_name.clone()))?;
    stream.insert_before(end, Op::Call(resolve_type))?;
    stream.insert_before(end, Op::Ldstr(spec.method_name.clone()))?;
    stream.insert_before(end, Op::Call(invoke_static))?;
    stream.insert_before(end, Op::Pop)?;
    stream.insert_before(end, Op::Leave(end))?;
    let handler_start = stream.insert_before(end, Op::Pop)?;
    stream.insert_before(end, Op::Leave(end))?;

    body.exception_handlers.push(ExceptionHandler {
        flags: ExceptionHandlerFlags::EXCEPTION,
        try_start,
        try_end: Some(handler_start),
        handler_start,
        handler_end: Some(end),
        catch_type: None, // catch anything
    });

    log::info!("bootstrap for '{}' installed in {display}", spec.type_name);
    Ok(PatchOutcome::Applied)
}
