//! Deduplicated storage for decoded text: paths, module and symbol names, resource names

use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;

/// Handle to a string owned by a `StringInterner`
///
/// Handles are only meaningful for the interner that produced them. Equal strings always get
/// the same handle, so comparing handles compares the text exactly (case-sensitively).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Sym(u32);

impl Sym {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Default, Clone)]
pub struct StringInterner {
    strings: Vec<Arc<str>>,
    index: HashMap<Arc<str>, Sym>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> Sym {
        if let Some(&sym) = self.index.get(s) {
            return sym;
        }
        let sym = Sym(self.strings.len() as u32);
        let shared: Arc<str> = Arc::from(s);
        self.strings.push(shared.clone());
        self.index.insert(shared, sym);
        sym
    }

    /// Look a string up without inserting it
    pub fn get(&self, s: &str) -> Option<Sym> {
        self.index.get(s).copied()
    }

    pub fn resolve(&self, sym: Sym) -> &str {
        &self.strings[sym.index()]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Serialize for StringInterner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.strings.iter().map(|s| &**s))
    }
}
