use crate::arena::{Arena, FileId};
use crate::canonicalize::identity_key;
use crate::common::{Diagnostics, FormatError};
use crate::exports::{ExportAddress, ExportTable};
use crate::image::ImageInfo;
use crate::imports::{ImportTable, ImportTarget, LoadKind};
use crate::interner::{StringInterner, Sym};
use crate::resources::{Resource, ResourceTable};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Why a module appears in the graph without decoded tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UnresolvedReason {
    /// no file with this name in any search directory
    NotFound,
    /// the path collaborator rejected the located file
    NotCanonicalizable(String),
    Unreadable(String),
    BadFormat(FormatError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ModuleStatus {
    /// enqueued, not decoded yet
    Pending,
    Analyzed,
    Unresolved(UnresolvedReason),
}

/// A module named by a forwarder export of another module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardedModule {
    /// file name derived from the forwarder string
    pub name: Sym,
    pub resolved_path: Sym,
}

/// One node of the dependency graph, unique per resolved file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Module {
    /// name the module was first referenced by
    pub name: Sym,
    /// canonical path of the file, if it was located
    pub path: Option<Sym>,
    /// identity in the path -> node map
    pub key: Sym,
    /// index of the root through which the module was first reached
    pub root: usize,
    /// depth at which the file was first mentioned in the dependency tree
    pub depth_first_appearance: usize,
    pub status: ModuleStatus,
    pub image: Option<ImageInfo>,
    pub imports: ImportTable,
    pub exports: ExportTable,
    pub resources: ResourceTable,
    pub forwarded_modules: Vec<ForwardedModule>,
    pub diagnostics: Diagnostics,
    #[serde(skip)]
    pub(crate) file: Option<FileId>,
}

impl Module {
    pub(crate) fn pending(name: Sym, path: Option<Sym>, key: Sym, root: usize, depth: usize) -> Self {
        Self {
            name,
            path,
            key,
            root,
            depth_first_appearance: depth,
            status: ModuleStatus::Pending,
            image: None,
            imports: ImportTable::default(),
            exports: ExportTable::default(),
            resources: ResourceTable::default(),
            forwarded_modules: Vec::new(),
            diagnostics: Diagnostics::new(),
            file: None,
        }
    }

    pub fn is_analyzed(&self) -> bool {
        self.status == ModuleStatus::Analyzed
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self.status, ModuleStatus::Unresolved(_))
    }
}

/// How a module came to depend on another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DependencyKind {
    Static,
    Delayed,
    Forwarded,
}

impl From<LoadKind> for DependencyKind {
    fn from(load: LoadKind) -> Self {
        match load {
            LoadKind::Static => Self::Static,
            LoadKind::Delayed => Self::Delayed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    /// Map from dependent to the modules it references that could not be analyzed
    pub unresolved_modules: BTreeMap<String, BTreeSet<String>>,
    /// Map from importer to imported symbols that no export satisfies, grouped by exporter
    pub not_found_symbols: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// Roots that could not be analyzed
    pub unresolved_roots: BTreeSet<String>,
}

impl CheckReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.unresolved_modules.is_empty()
            && self.not_found_symbols.is_empty()
            && self.unresolved_roots.is_empty()
    }

    pub fn extend(&mut self, other: CheckReport) {
        for (k, v) in other.unresolved_modules {
            self.unresolved_modules.entry(k).or_default().extend(v);
        }
        for (importer, by_exporter) in other.not_found_symbols {
            let ours = self.not_found_symbols.entry(importer).or_default();
            for (exporter, symbols) in by_exporter {
                ours.entry(exporter).or_default().extend(symbols);
            }
        }
        self.unresolved_roots.extend(other.unresolved_roots);
    }
}

fn serialize_strings<S: Serializer>(arena: &Arena, serializer: S) -> Result<S::Ok, S::Error> {
    arena.strings.serialize(serializer)
}

/// The resolved dependency graph of one run
///
/// Owns every module node, the bytes of every loaded file and the string table all handles
/// point into.
#[derive(Debug, Serialize)]
pub struct Analysis {
    /// Node of each root, in query order
    pub roots: Vec<usize>,
    pub modules: Vec<Module>,
    #[serde(skip)]
    index: HashMap<Sym, usize>,
    #[serde(rename = "strings", serialize_with = "serialize_strings")]
    arena: Arena,
}

impl Analysis {
    pub(crate) fn new(
        roots: Vec<usize>,
        modules: Vec<Module>,
        index: HashMap<Sym, usize>,
        arena: Arena,
    ) -> Self {
        Self {
            roots,
            modules,
            index,
            arena,
        }
    }

    pub fn strings(&self) -> &StringInterner {
        &self.arena.strings
    }

    pub fn str(&self, sym: Sym) -> &str {
        self.arena.str(sym)
    }

    pub fn module(&self, index: usize) -> Option<&Module> {
        self.modules.get(index)
    }

    pub fn get_by_key(&self, key: Sym) -> Option<usize> {
        self.index.get(&key).copied()
    }

    /// Node of the file at an already canonical path
    pub fn get_by_path<P: AsRef<Path>>(&self, canonical: P) -> Option<usize> {
        let key = self.arena.strings.get(&identity_key(canonical.as_ref()))?;
        self.get_by_key(key)
    }

    pub fn display_name(&self, index: usize) -> &str {
        self.modules
            .get(index)
            .map_or("", |m| self.str(m.name))
    }

    pub fn sorted_by_first_appearance(&self) -> Vec<usize> {
        let mut sorted: Vec<usize> = (0..self.modules.len()).collect();
        sorted.sort_by_key(|&i| self.modules[i].depth_first_appearance);
        sorted
    }

    /// Modules this one depends on, in import order, each listed once
    pub fn dependencies(&self, index: usize) -> Vec<(usize, DependencyKind)> {
        let Some(module) = self.modules.get(index) else {
            return Vec::new();
        };
        let imported = module
            .imports
            .modules
            .iter()
            .filter_map(|m| m.resolved_path.map(|k| (k, DependencyKind::from(m.load))));
        let forwarded = module
            .forwarded_modules
            .iter()
            .map(|f| (f.resolved_path, DependencyKind::Forwarded));

        let mut out: Vec<(usize, DependencyKind)> = Vec::new();
        for (key, kind) in imported.chain(forwarded) {
            if let Some(target) = self.get_by_key(key) {
                if !out.iter().any(|(t, _)| *t == target) {
                    out.push((target, kind));
                }
            }
        }
        out
    }

    /// Raw bytes of a decoded resource, borrowed from the loaded file
    pub fn resource_data(&self, index: usize, resource: &Resource) -> Option<&[u8]> {
        let file = self.modules.get(index)?.file?;
        let start = usize::try_from(resource.file_offset).ok()?;
        let end = start.checked_add(resource.size as usize)?;
        self.arena.file(file).get(start..end)
    }

    pub fn symbol_label(&self, target: &ImportTarget) -> String {
        match target {
            ImportTarget::Name { name, .. } => self.str(*name).to_owned(),
            ImportTarget::Ordinal(o) => format!("#{o}"),
        }
    }

    /// Display form of an export address
    pub fn export_address_label(&self, address: &ExportAddress) -> String {
        match address {
            ExportAddress::Rva(rva) => format!("{rva:#010x}"),
            ExportAddress::Forwarder(f) => self.str(*f).to_owned(),
        }
    }

    /// Collect the modules that could not be analyzed and the imports that are not satisfied
    pub fn check(&self) -> CheckReport {
        let mut report = CheckReport::new();
        for &r in &self.roots {
            if self.modules[r].is_unresolved() {
                report.unresolved_roots.insert(self.display_name(r).to_owned());
            }
        }
        for (i, module) in self.modules.iter().enumerate() {
            report.extend(self.check_imports(i, module));
        }
        report
    }

    fn check_imports(&self, index: usize, module: &Module) -> CheckReport {
        let importer = self.display_name(index).to_owned();
        let mut report = CheckReport::new();
        for imported in &module.imports.modules {
            let target = imported.resolved_path.and_then(|k| self.get_by_key(k));
            let exporter = self.str(imported.name).to_owned();
            if target.map_or(true, |t| !self.modules[t].is_analyzed()) {
                report
                    .unresolved_modules
                    .entry(importer.clone())
                    .or_default()
                    .insert(exporter);
                continue;
            }
            let missing: BTreeSet<String> = imported
                .symbols
                .iter()
                .filter(|s| !s.resolution.is_satisfied())
                .map(|s| self.symbol_label(&s.target))
                .collect();
            if !missing.is_empty() {
                report
                    .not_found_symbols
                    .entry(importer.clone())
                    .or_default()
                    .insert(exporter, missing);
            }
        }
        report
    }
}
