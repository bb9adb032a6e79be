//! Views over a resolved graph for presentation layers
//!
//! The graph may contain cycles and modules reached along several paths; a tree widget needs
//! every row to have a single parent. `ModuleTree` reifies such a tree, expanding each module
//! only at its first occurrence.

use crate::executable::{Analysis, DependencyKind};
use crate::exports::Export;
use crate::imports::{ImportResolution, ImportTarget, ImportedSymbol};
use multimap::MultiMap;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleTreeNode {
    /// index of the module in the analysis
    pub module: usize,
    /// index of the parent row
    pub parent: Option<usize>,
    pub depth: usize,
    /// how the parent depends on this module
    pub kind: Option<DependencyKind>,
    /// rows of the dependencies, empty for repeated modules
    pub children: Vec<usize>,
    /// row of the expanded first occurrence, if this row repeats a module
    pub original: Option<usize>,
}

// ordered depth-first: the first root is the first row
#[derive(Debug, Clone, Default)]
pub struct ModuleTree {
    pub rows: Vec<ModuleTreeNode>,
    first_occurrence: HashMap<usize, usize>,
}

impl ModuleTree {
    fn add_to_arena(
        &mut self,
        analysis: &Analysis,
        module: usize,
        parent: Option<usize>,
        depth: usize,
        kind: Option<DependencyKind>,
    ) -> usize {
        let row = self.rows.len();
        let original = self.first_occurrence.get(&module).copied();
        self.rows.push(ModuleTreeNode {
            module,
            parent,
            depth,
            kind,
            children: Vec::new(),
            original,
        });
        if original.is_some() {
            return row;
        }
        self.first_occurrence.insert(module, row);

        let children: Vec<usize> = analysis
            .dependencies(module)
            .into_iter()
            .map(|(dep, kind)| self.add_to_arena(analysis, dep, Some(row), depth + 1, Some(kind)))
            .collect();
        self.rows[row].children = children;
        row
    }

    pub fn new(analysis: &Analysis) -> Self {
        let mut ret = Self::default();
        for &root in &analysis.roots {
            ret.add_to_arena(analysis, root, None, 0, None);
        }
        ret
    }

    pub fn visit_depth_first(&self, mut f: impl FnMut(&ModuleTreeNode)) {
        // the arena currently holds a depth-first linearization of the tree
        for n in &self.rows {
            f(n)
        }
    }

    /// Row where a module is expanded
    pub fn expanded_row(&self, module: usize) -> Option<usize> {
        self.first_occurrence.get(&module).copied()
    }
}

/// Reverse index: which modules depend on a given module
pub fn dependents(analysis: &Analysis) -> MultiMap<usize, usize> {
    let mut ret = MultiMap::new();
    for m in 0..analysis.modules.len() {
        for (dep, _) in analysis.dependencies(m) {
            ret.insert(dep, m);
        }
    }
    ret
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportColumn {
    Name,
    OrdinalOrHint,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportColumn {
    Ordinal,
    Name,
    Used,
    Forwarder,
}

fn status_rank(resolution: &ImportResolution) -> u8 {
    match resolution {
        ImportResolution::ModuleUnavailable => 0,
        ImportResolution::Unmatched => 1,
        ImportResolution::Pending => 2,
        ImportResolution::Forwarded { .. } => 3,
        ImportResolution::Matched { .. } => 4,
    }
}

// unnamed entries sort after named ones
fn cmp_names(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Row order of the symbols imported from one module, sorted by a column
pub fn sorted_imports(
    analysis: &Analysis,
    symbols: &[ImportedSymbol],
    column: ImportColumn,
) -> Vec<usize> {
    let name = |s: &ImportedSymbol| match s.target {
        ImportTarget::Name { name, .. } => Some(analysis.str(name)),
        ImportTarget::Ordinal(_) => None,
    };
    let number = |s: &ImportedSymbol| match s.target {
        ImportTarget::Name { hint, .. } => hint,
        ImportTarget::Ordinal(o) => o,
    };
    let mut rows: Vec<usize> = (0..symbols.len()).collect();
    rows.sort_by(|&a, &b| {
        let (a, b) = (&symbols[a], &symbols[b]);
        match column {
            ImportColumn::Name => cmp_names(name(a), name(b)),
            ImportColumn::OrdinalOrHint => number(a).cmp(&number(b)),
            ImportColumn::Status => status_rank(&a.resolution).cmp(&status_rank(&b.resolution)),
        }
    });
    rows
}

/// Row order of the exports of a module, sorted by a column
pub fn sorted_exports(analysis: &Analysis, exports: &[Export], column: ExportColumn) -> Vec<usize> {
    let mut rows: Vec<usize> = (0..exports.len()).collect();
    rows.sort_by(|&a, &b| {
        let (a, b) = (&exports[a], &exports[b]);
        match column {
            ExportColumn::Ordinal => a.ordinal.cmp(&b.ordinal),
            ExportColumn::Name => cmp_names(
                a.name.map(|n| analysis.str(n)),
                b.name.map(|n| analysis.str(n)),
            ),
            // used exports first
            ExportColumn::Used => b.used.cmp(&a.used),
            ExportColumn::Forwarder => b.is_forwarder().cmp(&a.is_forwarder()),
        }
    });
    rows
}
