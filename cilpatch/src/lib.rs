#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # cilpatch
//!
//! Bytecode patching toolkit behind the localization project's `patcher`
//! tool. It loads a game's compact managed module, splices hook calls into
//! specific method bodies, and writes the module back - leaving an
//! untouched backup and never producing a structurally invalid image.
//!
//! ## What it does
//!
//! - **Load** a module image read-only ([`image::AssemblyImage::from_file`]),
//!   resolving sibling modules (the text hook) through configured search
//!   directories ([`image::ImageResolver`]).
//! - **Resolve** patch targets by exact type/method/signature constraints,
//!   with "absent" and "ambiguous" as distinct failures
//!   ([`patch::resolve_method`]).
//! - **Inject** three shapes of patch, each idempotent under re-runs:
//!   a stack-neutral entry hook that reroutes a string parameter
//!   ([`patch::inject_entry_hook`]), a forced setter call in front of a
//!   pattern-matched call site ([`patch::inject_before_call`]), and a
//!   guarded, exception-safe one-time bootstrap with a proper try/catch
//!   region ([`patch::inject_bootstrap`]).
//! - **Serialize** all-or-nothing, after validating every mutated body's
//!   control flow, exception regions, and stack balance
//!   ([`image::AssemblyImage::write_to_file`]).
//!
//! The [`eval`] module interprets patched bodies so behavior is assertable
//! in tests; [`dictionary`] and [`textkey`] implement the flat-file formats
//! and key normalization the runtime hook side depends on.
//!
//! ## Example
//!
//! ```no_run
//! use cilpatch::image::AssemblyImage;
//! use cilpatch::patch::{resolve_method, inject_entry_hook, MethodTarget};
//! use cilpatch::image::{MethodSig, TypeSig};
//!
//! # fn main() -> cilpatch::Result<()> {
//! let mut image = AssemblyImage::from_file("GameScripts.cmm".as_ref())?;
//! let hook = image.import_method(
//!     "TextHook",
//!     "TextHook",
//!     "OnSetText",
//!     MethodSig::static_fn(TypeSig::String, vec![TypeSig::Object, TypeSig::String]),
//! );
//! let target = MethodTarget::new("LabelObject", "SetText").params(&["System.String"]);
//! let handle = resolve_method(&image, &target)?;
//! inject_entry_hook(&mut image, handle, hook)?;
//! image.write_to_file("GameScripts.cmm".as_ref())?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod error;

/// File access and low-level binary IO.
pub mod file;

/// CIL instruction streams: opcode model, decode/encode, validation.
pub mod cil;

/// The module image model, loading, serialization, and builders.
pub mod image;

/// Patch operations: backup guard, resolution, injectors, orchestration.
pub mod patch;

/// Evaluation engine for executing method bodies in tests.
pub mod eval;

/// Translation dictionary and pending-log file formats.
pub mod dictionary;

/// Dictionary-key normalization and fallback policy.
pub mod textkey;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

pub use error::Error;
