use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Structural violation found while decoding a binary
///
/// Any of these aborts the decoding of the current file; the engine then marks the module as
/// not analyzable and carries on with the rest of the graph.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FormatError {
    #[error("{what}: {needed} bytes needed at offset {offset:#x}, but the file has {file_size}")]
    Truncated {
        what: &'static str,
        offset: u64,
        needed: u64,
        file_size: u64,
    },

    #[error("bad legacy stub signature {0:#06x}")]
    BadStubSignature(u16),

    #[error("bad PE signature {0:#010x}")]
    BadPeSignature(u32),

    #[error("unknown optional header magic {0:#06x}")]
    BadOptionalHeaderMagic(u16),

    #[error("optional header declares {declared} bytes, {required} are required")]
    OptionalHeaderTooSmall { declared: u16, required: u64 },

    #[error("RVA {rva:#x} lies in the zero-filled tail of section {section}, it has no disk backing")]
    RvaNotOnDisk { rva: u32, section: String },

    #[error("RVA {rva:#x} is not covered by any section")]
    RvaUnmapped { rva: u32 },

    #[error("{what} at RVA {rva:#x} ({len} bytes) runs past the end of its section")]
    OutOfSection {
        what: &'static str,
        rva: u32,
        len: u64,
    },

    #[error("{what} at RVA {rva:#x} is not NUL-terminated")]
    UnterminatedString { what: &'static str, rva: u32 },

    #[error("{what}: count {count} exceeds the limit of {limit}")]
    CountOutOfRange {
        what: &'static str,
        count: u64,
        limit: u64,
    },

    #[error("{what} at offset {offset:#x} ({len} bytes) lies outside its directory of {size:#x} bytes")]
    OutOfDirectory {
        what: &'static str,
        offset: u64,
        len: u64,
        size: u32,
    },

    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Run-level failure of a dependency lookup
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Lookup context building error: {0}")]
    ContextDeductionError(String),

    #[error("Could not canonicalize path {path}: {reason}")]
    CanonicalizationError { path: String, reason: String },

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    FormatError(#[from] FormatError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Fatal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

/// Collects what the decoders report while working on one file
///
/// Warnings never stop decoding; a fatal entry is appended by the caller when a decoder returns
/// a `FormatError`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.entries.push(Diagnostic {
            severity: Severity::Warning,
            message,
        });
    }

    pub fn fatal(&mut self, error: &FormatError) {
        self.entries.push(Diagnostic {
            severity: Severity::Fatal,
            message: error.to_string(),
        });
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }

    pub fn has_fatal(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Fatal)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }
}

pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_string_lossy().into_owned()
}

/// Strip the verbatim prefix Windows adds to canonical paths, for display
pub fn decanonicalize(s: &str) -> String {
    s.strip_prefix(r"\\?\").unwrap_or(s).to_owned()
}
