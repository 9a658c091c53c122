//! The game-specific patch plan.
//!
//! Target names are the game's internal classes; the hook contract names
//! are shared with the hook module's source. Changing either side means
//! changing both.

use cilpatch::patch::{BootstrapSpec, CallSite, MethodTarget};

/// Declaring type of the hook entry point inside the hook module.
pub const HOOK_TYPE: &str = "TextHook";
/// `static string OnSetText(object label, string text)`
pub const HOOK_METHOD: &str = "OnSetText";

/// Type name the bootstrap resolves dynamically inside the game process.
pub const BOOTSTRAP_TYPE: &str = "TextHookBootstrap";
/// Public static no-arg entry point invoked on the resolved type.
pub const BOOTSTRAP_METHOD: &str = "Start";

/// The text-setting method every displayed string funnels through.
pub fn text_hook_target() -> MethodTarget {
    MethodTarget::new("LabelObject", "SetText").params(&["System.String"])
}

/// The dialog-line reader that starts the timed reveal sequence.
pub fn dialog_line_target() -> MethodTarget {
    MethodTarget::new("Girl", "ReadDialogLine").first_param_simple("DialogLine", 1)
}

/// Candidate names of the reveal-progress setter; the game's property
/// casing has differed between builds.
pub fn reveal_setter_targets() -> [MethodTarget; 2] {
    [
        MethodTarget::new("Girl", "set_dialogReadPercent").params(&["System.Single"]),
        MethodTarget::new("Girl", "set_DialogReadPercent").params(&["System.Single"]),
    ]
}

/// The `Play` call that kicks off the typed-reveal tween.
pub fn reveal_play_site() -> CallSite {
    CallSite {
        declaring_fragment: "Holoville.HOTween.Core.Sequence".to_string(),
        method_name: "Play".to_string(),
    }
}

/// The per-frame method carrying the one-time bootstrap.
pub fn bootstrap_host_target() -> MethodTarget {
    MethodTarget::new("GameManager", "Update").params(&[])
}

/// The bootstrap resolution spec.
pub fn bootstrap_spec() -> BootstrapSpec {
    BootstrapSpec::new(BOOTSTRAP_TYPE, BOOTSTRAP_METHOD)
}
