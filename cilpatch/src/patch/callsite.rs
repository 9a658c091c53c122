//! Call-site injection: force a property setter immediately before a
//! pattern-matched call.
//!
//! Used to defeat the timed text-reveal effect: right before the animation
//! sequence's `Play` call, the reveal-progress setter is forced to its
//! maximal value, so the line is fully visible the moment it starts.

use crate::cil::{InstrId, Op};
use crate::image::{AssemblyImage, MethodHandle, Token};
use crate::patch::PatchOutcome;
use crate::{Error, Result};

/// How far back from the matched call the injector scans for an existing
/// call to the setter before inserting a duplicate.
pub const CALLSITE_BACKSCAN_WINDOW: usize = 20;

/// Predicate describing the call instruction to anchor on.
#[derive(Debug, Clone)]
pub struct CallSite {
    /// Substring the callee's declaring-type full name must contain
    pub declaring_fragment: String,
    /// Exact callee method name
    pub method_name: String,
}

/// Insert `ldarg.0; ldc.r4 <value>; callvirt <setter>` immediately before
/// the first call matching `site` in the method behind `handle`.
///
/// # Errors
/// [`Error::CallSiteNotFound`] when no instruction matches the predicate -
/// the target module's internal structure changed and this patch no longer
/// applies. Reported, not silently ignored; non-fatal for the run.
pub fn inject_before_call(
    image: &mut AssemblyImage,
    handle: MethodHandle,
    site: &CallSite,
    setter: Token,
    value: f32,
) -> Result<PatchOutcome> {
    let display = image.method_display(handle);

    let setter_name = image
        .callable_names(setter)
        .map(|(_, n)| n.to_string())
        .ok_or_else(|| Error::Serialization(format!("setter token {setter} is not callable")))?;

    let anchor = {
        let method = image.method(handle);
        let body = method.body.as_ref().ok_or_else(|| Error::SignatureMismatch {
            type_name: image.types[handle.type_index].full_name.clone(),
            method_name: method.name.clone(),
            details: "method has no body".into(),
        })?;

        let found: Option<(InstrId, usize)> =
            body.instructions.iter().enumerate().find_map(|(idx, instr)| {
                let token = instr.op.call_target()?;
                let (declaring, name) = image.callable_names(token)?;
                (name == site.method_name && declaring.contains(&site.declaring_fragment))
                    .then_some((instr.id, idx))
            });

        let Some((anchor, anchor_index)) = found else {
            return Err(Error::CallSiteNotFound {
                method: display,
                callee: site.method_name.clone(),
            });
        };

        // Re-patch guard: an earlier run already placed the setter call in
        // the window right before the anchor.
        let window_start = anchor_index.saturating_sub(CALLSITE_BACKSCAN_WINDOW);
        let already = body
            .instructions
            .iter()
            .skip(window_start)
            .take(anchor_index - window_start)
            .any(|instr| {
                instr.op.call_target().is_some_and(|token| {
                    image
                        .callable_names(token)
                        .is_some_and(|(_, name)| name == setter_name)
                })
            });
        if already {
            return Ok(PatchOutcome::AlreadyPatched);
        }

        anchor
    };

    let body = image
        .method_mut(handle)
        .body
        .as_mut()
        .expect("checked above");
    body.instructions.insert_before(anchor, Op::Ldarg(0))?;
    body.instructions.insert_before(anchor, Op::LdcR4(value))?;
    body.instructions.insert_before(anchor, Op::Callvirt(setter))?;

    log::info!("forced {setter_name}({value}) before {} in {display}", site.method_name);
    Ok(PatchOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cil::validate_body;
    use crate::image::{ImageBuilder, MethodSig, TypeSig};
    use crate::patch::{resolve_method, MethodTarget};

    /// Image shaped like the dialog-reveal path: a setter on the type and a
    /// method whose body calls Sequence::Play twice.
    fn dialog_image() -> (AssemblyImage, Token, MethodHandle) {
        let mut image = ImageBuilder::new("Scripts")
            .type_def("Girl", |t| {
                t.method(
                    "set_dialogReadPercent",
                    MethodSig::instance(TypeSig::Void, vec![TypeSig::R4]),
                    |m| {
                        m.body(|b| {
                            b.ret();
                        })
                    },
                )
                .method("ReadDialogLine", MethodSig::instance(TypeSig::Void, vec![]), |m| m)
            })
            .build();

        let play = image.import_method(
            "HOTween",
            "Holoville.HOTween.Core.Sequence",
            "Play",
            MethodSig::instance(TypeSig::Void, vec![]),
        );

        let setter = image.method_token(MethodHandle {
            type_index: 0,
            method_index: 0,
        });

        // Body: two Play call sites on a null receiver stand-in.
        let handle = MethodHandle {
            type_index: 0,
            method_index: 1,
        };
        let method = image.method_mut(handle);
        let mut body = crate::image::MethodBody::empty();
        let ret = body.instructions.first().unwrap();
        body.instructions.insert_before(ret, Op::Ldnull).unwrap();
        body.instructions.insert_before(ret, Op::Callvirt(play)).unwrap();
        body.instructions.insert_before(ret, Op::Ldnull).unwrap();
        body.instructions.insert_before(ret, Op::Callvirt(play)).unwrap();
        method.body = Some(body);

        (image, setter, handle)
    }

    #[test]
    fn test_injects_before_first_matching_call_only() -> Result<()> {
        let (mut image, setter, handle) = dialog_image();
        let site = CallSite {
            declaring_fragment: "Holoville.HOTween.Core.Sequence".into(),
            method_name: "Play".into(),
        };

        assert_eq!(
            inject_before_call(&mut image, handle, &site, setter, 1.0)?,
            PatchOutcome::Applied
        );

        let method = image.method(handle);
        let body = method.body.as_ref().unwrap();
        let ops: Vec<&str> = body.instructions.iter().map(|i| i.op.mnemonic()).collect();
        assert_eq!(
            ops,
            vec![
                "ldnull", "ldarg", "ldc.r4", "callvirt", // injected before first Play
                "callvirt", // first Play
                "ldnull", "callvirt", // second Play untouched
                "ret",
            ]
        );
        validate_body("Girl.ReadDialogLine", body, &method.signature, &image)?;
        Ok(())
    }

    #[test]
    fn test_rerun_detects_setter_in_backscan_window() -> Result<()> {
        let (mut image, setter, handle) = dialog_image();
        let site = CallSite {
            declaring_fragment: "Sequence".into(),
            method_name: "Play".into(),
        };

        inject_before_call(&mut image, handle, &site, setter, 1.0)?;
        let before = image.method(handle).body.as_ref().unwrap().instructions.len();
        assert_eq!(
            inject_before_call(&mut image, handle, &site, setter, 1.0)?,
            PatchOutcome::AlreadyPatched
        );
        let after = image.method(handle).body.as_ref().unwrap().instructions.len();
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn test_missing_call_site_is_reported() {
        let (mut image, setter, _) = dialog_image();
        let handle = resolve_method(
            &image,
            &MethodTarget::new("Girl", "set_dialogReadPercent").params(&["System.Single"]),
        )
        .unwrap();
        let site = CallSite {
            declaring_fragment: "Sequence".into(),
            method_name: "Play".into(),
        };
        assert!(matches!(
            inject_before_call(&mut image, handle, &site, setter, 1.0),
            Err(Error::CallSiteNotFound { .. })
        ));
    }
}
