//! End-to-end patch runs against synthetic modules on disk: idempotence
//! down to the byte level, the backup invariant, and structural validity of
//! everything the serializer emits.

use cilpatch::cil::{validate_body, Op};
use cilpatch::image::{
    AssemblyImage, FieldFlags, ImageBuilder, MethodSig, Token, TypeSig,
};
use cilpatch::patch::{
    ensure_backup, inject_before_call, inject_bootstrap, inject_entry_hook, resolve_method,
    BackupOutcome, BootstrapSpec, CallSite, MethodTarget, PatchOutcome,
};
use cilpatch::Result;

/// A module shaped like the game's scripts: the text setter, the dialog
/// reader with two Play call sites, and the per-frame update.
fn game_image() -> AssemblyImage {
    let mut image = ImageBuilder::new("GameScripts")
        .type_def("LabelObject", |t| {
            t.field("lastText", TypeSig::String, FieldFlags::PUBLIC)
                .method(
                    "SetText",
                    MethodSig::instance(TypeSig::Void, vec![TypeSig::String]),
                    |m| m,
                )
        })
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
        .type_def("GameManager", |t| {
            t.method("Update", MethodSig::instance(TypeSig::Void, vec![]), |m| {
                m.body(|b| {
                    b.nop().ret();
                })
            })
        })
        .build();

    // LabelObject.SetText: this.lastText = s; return
    let set_text = cilpatch::image::MethodHandle {
        type_index: 0,
        method_index: 0,
    };
    let last_text = image.field_token(0, 0);
    let mut body = cilpatch::image::MethodBody::empty();
    let ret = body.instructions.first().unwrap();
    body.instructions.insert_before(ret, Op::Ldarg(0)).unwrap();
    body.instructions.insert_before(ret, Op::Ldarg(1)).unwrap();
    body.instructions.insert_before(ret, Op::Stfld(last_text)).unwrap();
    image.method_mut(set_text).body = Some(body);

    // Girl.ReadDialogLine: two Sequence::Play call sites.
    let play = image.import_method(
        "HOTween",
        "Holoville.HOTween.Core.Sequence",
        "Play",
        MethodSig::instance(TypeSig::Void, vec![]),
    );
    let read_line = cilpatch::image::MethodHandle {
        type_index: 1,
        method_index: 1,
    };
    let mut body = cilpatch::image::MethodBody::empty();
    let ret = body.instructions.first().unwrap();
    for _ in 0..2 {
        body.instructions.insert_before(ret, Op::Ldnull).unwrap();
        body.instructions.insert_before(ret, Op::Callvirt(play)).unwrap();
    }
    image.method_mut(read_line).body = Some(body);

    image
}

fn hook_sig() -> MethodSig {
    MethodSig::static_fn(TypeSig::String, vec![TypeSig::Object, TypeSig::String])
}

/// Apply the full patch set, returning the three outcomes.
fn apply_all(image: &mut AssemblyImage) -> Result<[PatchOutcome; 3]> {
    let hook = image.import_method("TextHook", "TextHook", "OnSetText", hook_sig());

    let set_text = resolve_method(
        image,
        &MethodTarget::new("LabelObject", "SetText").params(&["System.String"]),
    )?;
    let entry = inject_entry_hook(image, set_text, hook)?;

    let read_line = resolve_method(image, &MethodTarget::new("Girl", "ReadDialogLine"))?;
    let setter = resolve_method(
        image,
        &MethodTarget::new("Girl", "set_dialogReadPercent").params(&["System.Single"]),
    )?;
    let setter_token = image.method_token(setter);
    let site = CallSite {
        declaring_fragment: "Holoville.HOTween.Core.Sequence".into(),
        method_name: "Play".into(),
    };
    let callsite = inject_before_call(image, read_line, &site, setter_token, 1.0)?;

    let update = resolve_method(image, &MethodTarget::new("GameManager", "Update"))?;
    let bootstrap = inject_bootstrap(
        image,
        update,
        &BootstrapSpec::new("TextHookBootstrap", "Start"),
    )?;

    Ok([entry, callsite, bootstrap])
}

#[test]
fn patched_output_is_loadable_and_every_body_validates() -> Result<()> {
    let mut image = game_image();
    let outcomes = apply_all(&mut image)?;
    assert!(outcomes.iter().all(|o| *o == PatchOutcome::Applied));

    let bytes = image.to_bytes()?;
    let reloaded = AssemblyImage::from_mem(&bytes)?;

    for type_def in &reloaded.types {
        for method in &type_def.methods {
            if let Some(body) = &method.body {
                let display = format!("{}.{}", type_def.full_name, method.name);
                validate_body(&display, body, &method.signature, &reloaded)?;
            }
        }
    }

    // The bootstrap's handler table must survive the round trip.
    let update = resolve_method(&reloaded, &MethodTarget::new("GameManager", "Update"))?;
    let body = reloaded.method(update).body.as_ref().unwrap();
    assert_eq!(body.exception_handlers.len(), 1);
    assert!(body.exception_handlers[0].catch_type.is_none());
    Ok(())
}

#[test]
fn repatching_an_already_patched_image_is_byte_identical() -> Result<()> {
    let mut image = game_image();
    apply_all(&mut image)?;
    let first = image.to_bytes()?;

    let mut second_run = AssemblyImage::from_mem(&first)?;
    let outcomes = apply_all(&mut second_run)?;
    assert!(
        outcomes.iter().all(|o| *o == PatchOutcome::AlreadyPatched),
        "every sub-patch must report already patched, got {outcomes:?}"
    );

    let second = second_run.to_bytes()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn backup_survives_two_runs_with_original_bytes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("GameScripts.cmm");

    let pristine = game_image();
    pristine.write_to_file(&target)?;
    let original_bytes = std::fs::read(&target)?;

    // First run: backup, patch, overwrite.
    assert!(matches!(ensure_backup(&target)?, BackupOutcome::Created(_)));
    let mut image = AssemblyImage::from_file(&target)?;
    apply_all(&mut image)?;
    image.write_to_file(&target)?;
    assert_ne!(std::fs::read(&target)?, original_bytes);

    // Second run: backup untouched, output unchanged.
    let backup = dir.path().join("GameScripts.cmm.bak");
    assert!(matches!(
        ensure_backup(&target)?,
        BackupOutcome::AlreadyExists(_)
    ));
    let mut image = AssemblyImage::from_file(&target)?;
    apply_all(&mut image)?;
    image.write_to_file(&target)?;

    assert_eq!(std::fs::read(&backup)?, original_bytes);
    Ok(())
}

#[test]
fn import_tables_do_not_grow_across_runs() -> Result<()> {
    let mut image = game_image();
    apply_all(&mut image)?;
    let member_refs = image.member_refs.len();
    let type_refs = image.type_refs.len();
    let fields: usize = image.types.iter().map(|t| t.fields.len()).sum();

    apply_all(&mut image)?;
    assert_eq!(image.member_refs.len(), member_refs);
    assert_eq!(image.type_refs.len(), type_refs);
    assert_eq!(image.types.iter().map(|t| t.fields.len()).sum::<usize>(), fields);
    Ok(())
}

#[test]
fn ambiguous_target_aborts_instead_of_guessing() {
    let image = ImageBuilder::new("GameScripts")
        .type_def("LabelObject", |t| {
            t.method(
                "SetText",
                MethodSig::instance(TypeSig::Void, vec![TypeSig::String]),
                |m| {
                    m.body(|b| {
                        b.ret();
                    })
                },
            )
            .method(
                "SetText",
                MethodSig::instance(TypeSig::String, vec![TypeSig::String]),
                |m| {
                    m.body(|b| {
                        b.ldarg(1).ret();
                    })
                },
            )
        })
        .build();

    // Parameter lists collide; only the return type separates the two.
    let result = resolve_method(
        &image,
        &MethodTarget::new("LabelObject", "SetText").params(&["System.String"]),
    );
    assert!(matches!(
        result,
        Err(cilpatch::Error::AmbiguousMethod { count: 2, .. })
    ));
}

#[test]
fn serializer_rejects_a_corrupted_body_before_writing() -> Result<()> {
    let mut image = game_image();
    let set_text = resolve_method(
        &image,
        &MethodTarget::new("LabelObject", "SetText").params(&["System.String"]),
    )?;

    // Sabotage: a branch to another body's instruction.
    let mut foreign = cilpatch::cil::InstructionStream::new();
    for _ in 0..40 {
        foreign.push(Op::Nop);
    }
    let foreign_id = foreign.push(Op::Ret);
    let body = image.method_mut(set_text).body.as_mut().unwrap();
    let anchor = body.instructions.first().unwrap();
    body.instructions
        .insert_before(anchor, Op::Br(foreign_id))
        .unwrap();

    assert!(matches!(
        image.to_bytes(),
        Err(cilpatch::Error::StructuralInvariant { .. })
    ));
    Ok(())
}

#[test]
fn optional_patch_failure_does_not_block_the_rest() -> Result<()> {
    // A build without the Girl type: the reveal patch has nothing to bind to.
    let mut image = ImageBuilder::new("GameScripts")
        .type_def("LabelObject", |t| {
            t.method(
                "SetText",
                MethodSig::instance(TypeSig::Void, vec![TypeSig::String]),
                |m| {
                    m.body(|b| {
                        b.ret();
                    })
                },
            )
        })
        .build();

    let hook = image.import_method("TextHook", "TextHook", "OnSetText", hook_sig());
    let set_text = resolve_method(
        &image,
        &MethodTarget::new("LabelObject", "SetText").params(&["System.String"]),
    )?;
    assert_eq!(
        inject_entry_hook(&mut image, set_text, hook)?,
        PatchOutcome::Applied
    );

    let missing = resolve_method(&image, &MethodTarget::new("Girl", "ReadDialogLine"));
    assert!(matches!(missing, Err(cilpatch::Error::TypeNotFound(_))));

    // The core patch still serializes.
    let bytes = image.to_bytes()?;
    assert!(AssemblyImage::from_mem(&bytes).is_ok());
    Ok(())
}

#[test]
fn reveal_defeat_targets_first_play_only_after_roundtrip() -> Result<()> {
    let mut image = game_image();
    apply_all(&mut image)?;
    let reloaded = AssemblyImage::from_mem(&image.to_bytes()?)?;

    let read_line = resolve_method(&reloaded, &MethodTarget::new("Girl", "ReadDialogLine"))?;
    let body = reloaded.method(read_line).body.as_ref().unwrap();
    let calls: Vec<(usize, Token)> = body
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(i, instr)| instr.op.call_target().map(|t| (i, t)))
        .collect();

    // setter, Play, Play - the second Play keeps no setter in front of it.
    assert_eq!(calls.len(), 3);
    let (first_idx, setter_token) = calls[0];
    let (_, name) = reloaded.callable_names(setter_token).unwrap();
    assert_eq!(name, "set_dialogReadPercent");
    assert_eq!(calls[1].0, first_idx + 1);
    Ok(())
}
