//! The patch run: preconditions, backup, load, patch, serialize.
//!
//! Status goes to stdout as one line per step; the process exit code is the
//! only machine-readable signal. The ordering is the safety property:
//! backup first, then mutate in memory, then a single all-or-nothing write.

use anyhow::{bail, Context};
use cilpatch::image::{AssemblyImage, ImageResolver, MethodSig};
use cilpatch::patch::{
    ensure_backup, inject_before_call, inject_bootstrap, inject_entry_hook, resolve_method,
    BackupOutcome, MethodTarget, PatchEngine, PatchOutcome,
};
use cilpatch::Error;

use crate::app::Cli;
use crate::plan;

pub fn run(cli: &Cli) -> anyhow::Result<()> {
    let managed = cli.game_folder.join(&cli.managed_dir);
    if !managed.is_dir() {
        bail!("managed folder not found: {}", managed.display());
    }

    let target_path = managed.join(&cli.assembly);
    if !target_path.is_file() {
        bail!("scripts module not found: {}", target_path.display());
    }

    let mut resolver = ImageResolver::new();
    resolver.add_search_directory(&managed);
    let Some(hook_path) = resolver.locate(&cli.hook) else {
        bail!(
            "hook module '{}' not found in {} (copy it there first)",
            cli.hook,
            managed.display()
        );
    };
    println!("[OK] Found hook module: {}", hook_path.display());

    // Backup before anything can mutate; never overwritten once present.
    if !cli.dry_run {
        match ensure_backup(&target_path)? {
            BackupOutcome::Created(path) => println!("[OK] Backup created: {}", path.display()),
            BackupOutcome::AlreadyExists(path) => {
                println!("[OK] Backup exists: {}", path.display());
            }
        }
    }

    let image = AssemblyImage::from_file(&target_path)
        .with_context(|| format!("failed to load {}", target_path.display()))?;
    println!(
        "[OK] Loaded {} ({} types)",
        cli.assembly,
        image.types.len()
    );

    let hook_sig = verify_hook_export(&resolver, &cli.hook)?;
    println!(
        "[OK] Verified {}::{}(object, string) -> string",
        plan::HOOK_TYPE,
        plan::HOOK_METHOD
    );

    let mut engine = PatchEngine::new(image);

    // 1) Core text hook - the run is pointless without it, so any failure
    //    here is fatal.
    let hook_name = cli.hook.clone();
    let outcome = engine.apply("text hook", true, move |image| {
        let hook_token =
            image.import_method(&hook_name, plan::HOOK_TYPE, plan::HOOK_METHOD, hook_sig);
        let handle = resolve_method(image, &plan::text_hook_target())?;
        inject_entry_hook(image, handle, hook_token)
    })?;
    report("LabelObject.SetText <- text hook", &outcome);

    // 2) Typed-reveal defeat - optional; the game works without it.
    let outcome = engine.apply("typed-reveal defeat", false, |image| {
        let handle = resolve_method(image, &plan::dialog_line_target())?;
        let setter = resolve_reveal_setter(image)?;
        let setter_token = image.method_token(setter);
        inject_before_call(image, handle, &plan::reveal_play_site(), setter_token, 1.0)
    })?;
    report("Girl.ReadDialogLine <- reveal defeat", &outcome);

    // 3) Bootstrap wrapper - optional.
    let outcome = engine.apply("bootstrap", false, |image| {
        let handle = resolve_method(image, &plan::bootstrap_host_target())?;
        inject_bootstrap(image, handle, &plan::bootstrap_spec())
    })?;
    report("GameManager.Update <- bootstrap", &outcome);

    let (image, summary) = engine.finish();

    if !summary.changed() {
        println!(
            "[OK] Nothing to do: {} already patched, {} skipped",
            summary.already_patched(),
            summary.skipped()
        );
        return Ok(());
    }

    if cli.dry_run {
        println!(
            "[OK] Dry run: {} patch(es) would be applied, nothing written",
            summary.applied()
        );
        return Ok(());
    }

    image
        .write_to_file(&target_path)
        .with_context(|| format!("failed to write {}", target_path.display()))?;
    println!(
        "[SUCCESS] Patched {}: {} applied, {} already patched, {} skipped",
        cli.assembly,
        summary.applied(),
        summary.already_patched(),
        summary.skipped()
    );
    Ok(())
}

fn report(label: &str, outcome: &PatchOutcome) {
    match outcome {
        PatchOutcome::Applied => println!("[OK] Patched: {label}"),
        PatchOutcome::AlreadyPatched => println!("[OK] Already patched: {label}"),
        PatchOutcome::Skipped { reason } => println!("[SKIP] {label}: {reason}"),
    }
}

/// Check the hook module actually exports the entry point the injected call
/// will bind to at game startup, and hand back its signature for import.
fn verify_hook_export(resolver: &ImageResolver, hook_name: &str) -> anyhow::Result<MethodSig> {
    let hook_image = resolver
        .resolve(hook_name)
        .with_context(|| format!("failed to load hook module '{hook_name}'"))?;

    let target = MethodTarget::new(plan::HOOK_TYPE, plan::HOOK_METHOD)
        .params(&["System.Object", "System.String"])
        .returns("System.String");
    let handle = resolve_method(&hook_image, &target).map_err(|e| match e {
        Error::TypeNotFound(_) | Error::MethodNotFound { .. } | Error::SignatureMismatch { .. } => {
            anyhow::anyhow!(
                "hook module '{hook_name}' does not export {}::{}(object, string) -> string",
                plan::HOOK_TYPE,
                plan::HOOK_METHOD
            )
        }
        other => other.into(),
    })?;

    let method = hook_image.method(handle);
    if !method.is_static() || !method.is_public() {
        bail!(
            "{}::{} must be public static",
            plan::HOOK_TYPE,
            plan::HOOK_METHOD
        );
    }
    Ok(method.signature.clone())
}

/// The reveal-progress setter under either casing the game has shipped.
fn resolve_reveal_setter(
    image: &AssemblyImage,
) -> cilpatch::Result<cilpatch::image::MethodHandle> {
    let [primary, fallback] = plan::reveal_setter_targets();
    match resolve_method(image, &primary) {
        Ok(handle) => Ok(handle),
        Err(Error::MethodNotFound { .. }) => resolve_method(image, &fallback),
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cilpatch::image::{ImageBuilder, MethodBody, MethodHandle, TypeSig};
    use std::path::Path;

    fn hook_sig() -> MethodSig {
        MethodSig::static_fn(TypeSig::String, vec![TypeSig::Object, TypeSig::String])
    }

    fn write_hook_module(managed: &Path) {
        ImageBuilder::new("TextHook")
            .type_def("TextHook", |t| {
                t.method(plan::HOOK_METHOD, hook_sig(), |m| {
                    m.body(|b| {
                        b.ldarg(1).ret();
                    })
                })
            })
            .build()
            .write_to_file(&managed.join("TextHook.cmm"))
            .unwrap();
    }

    fn write_game_module(managed: &Path) {
        ImageBuilder::new("GameScripts")
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
            .type_def("GameManager", |t| {
                t.method("Update", MethodSig::instance(TypeSig::Void, vec![]), |m| {
                    m.body(|b| {
                        b.ret();
                    })
                })
            })
            .build()
            .write_to_file(&managed.join("GameScripts.cmm"))
            .unwrap();
    }

    fn cli_for(game: &Path) -> Cli {
        Cli {
            game_folder: game.to_path_buf(),
            managed_dir: "Data/Managed".into(),
            assembly: "GameScripts.cmm".into(),
            hook: "TextHook".into(),
            dry_run: false,
            verbose: false,
        }
    }

    #[test]
    fn test_full_run_then_rerun_reports_nothing_to_do() -> anyhow::Result<()> {
        let game = tempfile::tempdir()?;
        let managed = game.path().join("Data/Managed");
        std::fs::create_dir_all(&managed)?;
        write_hook_module(&managed);
        write_game_module(&managed);

        run(&cli_for(game.path()))?;

        // The reveal patch is skipped (no Girl type), the rest applied.
        let patched = AssemblyImage::from_file(&managed.join("GameScripts.cmm"))?;
        let handle = MethodHandle {
            type_index: 0,
            method_index: 0,
        };
        let body: &MethodBody = patched.method(handle).body.as_ref().unwrap();
        assert!(body.instructions.len() > 1);

        // Second run: everything already patched, file untouched.
        let before = std::fs::read(managed.join("GameScripts.cmm"))?;
        run(&cli_for(game.path()))?;
        let after = std::fs::read(managed.join("GameScripts.cmm"))?;
        assert_eq!(before, after);
        Ok(())
    }

    #[test]
    fn test_missing_hook_module_is_fatal() -> anyhow::Result<()> {
        let game = tempfile::tempdir()?;
        let managed = game.path().join("Data/Managed");
        std::fs::create_dir_all(&managed)?;
        write_game_module(&managed);

        assert!(run(&cli_for(game.path())).is_err());
        // Nothing was written, no backup either.
        assert!(!managed.join("GameScripts.cmm.bak").exists());
        Ok(())
    }

    #[test]
    fn test_missing_game_folder_is_fatal() {
        let cli = cli_for(Path::new("/definitely/not/a/game"));
        assert!(run(&cli).is_err());
    }
}
