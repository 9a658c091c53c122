//! Sibling module resolution.
//!
//! The patcher needs more than the target module: the hook module (and, in
//! principle, other referenced siblings) must be located in one of the
//! configured search directories. Resolution failure is distinct from a
//! missing target file, since it happens during import rather than open.

use std::path::{Path, PathBuf};

use crate::image::AssemblyImage;
use crate::{Error, Result};

/// File extension of compact managed modules.
pub const MODULE_EXTENSION: &str = "cmm";

/// Locates and loads sibling modules by simple name.
#[derive(Debug, Default)]
pub struct ImageResolver {
    search_dirs: Vec<PathBuf>,
}

impl ImageResolver {
    /// A resolver with no search directories.
    #[must_use]
    pub fn new() -> ImageResolver {
        ImageResolver::default()
    }

    /// Append a search directory. Directories are probed in insertion order.
    pub fn add_search_directory(&mut self, dir: &Path) -> &mut Self {
        self.search_dirs.push(dir.to_path_buf());
        self
    }

    /// Locate a module by simple name (no extension) without loading it.
    #[must_use]
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        for dir in &self.search_dirs {
            let candidate = dir.join(format!("{name}.{MODULE_EXTENSION}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    /// Load a module by simple name.
    ///
    /// # Errors
    /// Returns [`Error::ReferenceResolution`] when no search directory
    /// contains the module.
    pub fn resolve(&self, name: &str) -> Result<AssemblyImage> {
        let path = self
            .locate(name)
            .ok_or_else(|| Error::ReferenceResolution(name.to_string()))?;
        log::debug!("resolved module '{name}' at {}", path.display());
        AssemblyImage::from_file(&path)
    }
}
