//! Storage owned by one analysis run
//!
//! Loaded file contents and interned strings live here for the whole run and are released
//! together when the run's result is dropped. Decoded tables refer into it by handle or by
//! file offset, never by pointer.

use crate::interner::{StringInterner, Sym};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct FileId(u32);

#[derive(Debug, Default)]
pub struct Arena {
    pub strings: StringInterner,
    files: Vec<Vec<u8>>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a whole file into the arena
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> std::io::Result<FileId> {
        let content = fs_err::read(path.as_ref())?;
        Ok(self.insert(content))
    }

    pub fn insert(&mut self, content: Vec<u8>) -> FileId {
        self.files.push(content);
        FileId(self.files.len() as u32 - 1)
    }

    pub fn file(&self, id: FileId) -> &[u8] {
        &self.files[id.0 as usize]
    }

    /// Borrow a file's bytes while new strings are interned
    pub fn file_and_strings(&mut self, id: FileId) -> (&[u8], &mut StringInterner) {
        (&self.files[id.0 as usize], &mut self.strings)
    }

    pub fn intern(&mut self, s: &str) -> Sym {
        self.strings.intern(s)
    }

    pub fn str(&self, sym: Sym) -> &str {
        self.strings.resolve(sym)
    }
}
