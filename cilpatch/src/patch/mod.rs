//! Patch operations and orchestration.
//!
//! Each injector mutates one method body of an [`AssemblyImage`] and reports
//! its own outcome; the [`PatchEngine`] applies a sequence of such
//! operations strictly in order, converts the non-fatal failure kinds of
//! optional patches into skips, and accumulates the per-patch summary the
//! CLI prints. Nothing here touches the disk; serialization stays with the
//! image, and the backup guard runs before any of this.

mod backup;
mod bootstrap;
mod callsite;
mod entry;
mod idempotency;
mod resolver;

pub use backup::{ensure_backup, BackupOutcome};
pub use bootstrap::{
    inject_bootstrap, BootstrapSpec, INVOKE_STATIC_METHOD, LATE_BINDING_ASSEMBLY,
    LATE_BINDING_TYPE, RESOLVE_TYPE_METHOD,
};
pub use callsite::{inject_before_call, CallSite, CALLSITE_BACKSCAN_WINDOW};
pub use entry::{inject_entry_hook, ENTRY_MARKER_SCAN};
pub use idempotency::{is_marked, PatchMarker};
pub use resolver::{resolve_method, MethodTarget, ParamConstraint};

use strum::AsRefStr;

use crate::image::AssemblyImage;
use crate::{Error, Result};

/// Result of one patch attempt.
#[derive(Debug, Clone, PartialEq, Eq, AsRefStr)]
pub enum PatchOutcome {
    /// Instructions were inserted
    Applied,
    /// A prior run's marker was found; nothing changed
    AlreadyPatched,
    /// A non-fatal lookup failure; the patch does not apply to this image
    Skipped {
        /// Human-readable reason, straight from the underlying error
        reason: String,
    },
}

/// One line of the run summary.
#[derive(Debug, Clone)]
pub struct PatchReport {
    /// Patch name as shown to the user
    pub name: String,
    /// What happened
    pub outcome: PatchOutcome,
}

/// Accumulated outcomes of a patch run.
#[derive(Debug, Clone, Default)]
pub struct PatchSummary {
    reports: Vec<PatchReport>,
}

impl PatchSummary {
    /// All per-patch reports, in application order.
    #[must_use]
    pub fn reports(&self) -> &[PatchReport] {
        &self.reports
    }

    /// Number of patches that inserted instructions.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, PatchOutcome::Applied))
    }

    /// Number of patches already present from a prior run.
    #[must_use]
    pub fn already_patched(&self) -> usize {
        self.count(|o| matches!(o, PatchOutcome::AlreadyPatched))
    }

    /// Number of patches skipped as not applicable.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, PatchOutcome::Skipped { .. }))
    }

    /// True when the image was mutated and must be serialized.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.applied() > 0
    }

    fn count(&self, pred: impl Fn(&PatchOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Applies patches sequentially to one image.
pub struct PatchEngine {
    image: AssemblyImage,
    summary: PatchSummary,
}

/// Failure kinds an *optional* patch converts into a skip: the target
/// assembly's internal structure changed and this patch no longer applies.
/// Ambiguity is never downgraded; a constraint list matching two methods is
/// wrong whichever patch it belongs to.
fn is_non_fatal(error: &Error) -> bool {
    matches!(
        error,
        Error::TypeNotFound(_)
            | Error::MethodNotFound { .. }
            | Error::SignatureMismatch { .. }
            | Error::CallSiteNotFound { .. }
            | Error::FlagFieldConflict { .. }
    )
}

impl PatchEngine {
    /// Wrap an image for patching.
    #[must_use]
    pub fn new(image: AssemblyImage) -> PatchEngine {
        PatchEngine {
            image,
            summary: PatchSummary::default(),
        }
    }

    /// The image being patched.
    #[must_use]
    pub fn image(&self) -> &AssemblyImage {
        &self.image
    }

    /// Apply one patch operation.
    ///
    /// When `required` is false, resolution-class failures are recorded as
    /// [`PatchOutcome::Skipped`] and the run continues; when true, every
    /// failure propagates and aborts the run before serialization.
    pub fn apply(
        &mut self,
        name: &str,
        required: bool,
        op: impl FnOnce(&mut AssemblyImage) -> Result<PatchOutcome>,
    ) -> Result<PatchOutcome> {
        let outcome = match op(&mut self.image) {
            Ok(outcome) => outcome,
            Err(error) if !required && is_non_fatal(&error) => {
                log::warn!("patch '{name}' skipped: {error}");
                PatchOutcome::Skipped {
                    reason: error.to_string(),
                }
            }
            Err(error) => return Err(error),
        };
        self.summary.reports.push(PatchReport {
            name: name.to_string(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// Finish, handing back the (possibly mutated) image and the summary.
    #[must_use]
    pub fn finish(self) -> (AssemblyImage, PatchSummary) {
        (self.image, self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_patch_downgrades_resolution_failure() -> Result<()> {
        let mut engine = PatchEngine::new(AssemblyImage::new("Scripts"));
        let outcome = engine.apply("typewriter", false, |_| {
            Err(Error::TypeNotFound("Girl".into()))
        })?;
        assert!(matches!(outcome, PatchOutcome::Skipped { .. }));
        assert_eq!(engine.summary.skipped(), 1);
        assert!(!engine.summary.changed());
        Ok(())
    }

    #[test]
    fn test_required_patch_propagates_failure() {
        let mut engine = PatchEngine::new(AssemblyImage::new("Scripts"));
        let result = engine.apply("text-hook", true, |_| {
            Err(Error::TypeNotFound("LabelObject".into()))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_ambiguity_is_fatal_even_for_optional_patches() {
        let mut engine = PatchEngine::new(AssemblyImage::new("Scripts"));
        let result = engine.apply("typewriter", false, |_| {
            Err(Error::AmbiguousMethod {
                type_name: "Girl".into(),
                method_name: "ReadDialogLine".into(),
                count: 2,
            })
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_summary_counts() -> Result<()> {
        let mut engine = PatchEngine::new(AssemblyImage::new("Scripts"));
        engine.apply("a", true, |_| Ok(PatchOutcome::Applied))?;
        engine.apply("b", true, |_| Ok(PatchOutcome::AlreadyPatched))?;
        engine.apply("c", false, |_| {
            Err(Error::CallSiteNotFound {
                method: "Girl.ReadDialogLine".into(),
                callee: "Play".into(),
            })
        })?;
        let (_, summary) = engine.finish();
        assert_eq!(summary.applied(), 1);
        assert_eq!(summary.already_patched(), 1);
        assert_eq!(summary.skipped(), 1);
        assert!(summary.changed());
        Ok(())
    }
}
