//! File access for compact managed module images.
//!
//! Input images are opened read-only through a memory mapping; nothing is
//! written back through this module. Serialization goes through
//! [`crate::image::AssemblyImage::write_to_file`], which assembles the full
//! output in memory first.

pub(crate) mod parser;
pub(crate) mod writer;

use std::{fs, path::Path};

use memmap2::Mmap;

use crate::{Error, Result};

pub use parser::Parser;
pub use writer::Writer;

/// A read-only, memory-mapped view of a module file.
pub struct File {
    map: Mmap,
}

impl File {
    /// Map the file at `path` into memory.
    ///
    /// # Errors
    /// Returns [`Error::AssemblyNotFound`] if the path does not exist and
    /// [`Error::Empty`] for zero-length files.
    pub fn open(path: &Path) -> Result<File> {
        if !path.is_file() {
            return Err(Error::AssemblyNotFound(path.to_path_buf()));
        }

        let file = fs::File::open(path)?;
        // Safety: the mapping is read-only and the file is not mutated while mapped.
        let map = unsafe { Mmap::map(&file)? };
        if map.is_empty() {
            return Err(Error::Empty);
        }

        Ok(File { map })
    }

    /// The mapped bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.map
    }
}
