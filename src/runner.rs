use crate::arena::Arena;
use crate::canonicalize::{identity_key, PathCanonicalizer};
use crate::common::{path_to_string, Diagnostics, FormatError, LookupError};
use crate::executable::{Analysis, ForwardedModule, Module, ModuleStatus, UnresolvedReason};
use crate::exports::{
    decode_exports, forwarded_module_file_name, split_forwarder, ExportAddress, ExportTable,
    ForwardedSymbol,
};
use crate::image::{Image, ImageInfo};
use crate::imports::{decode_imports, ExportRef, ImportResolution, ImportTable, ImportTarget};
use crate::interner::{StringInterner, Sym};
use crate::lookup_path::LookupPath;
use crate::query::{app_dir_of, LookupParameters, LookupQuery};
use crate::resources::{decode_resources, ResourceTable};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

/// Forwarder chains longer than this are treated as broken
const MAX_FORWARDER_HOPS: usize = 32;

struct Decoded {
    info: ImageInfo,
    imports: ImportTable,
    exports: ExportTable,
    resources: ResourceTable,
}

fn decode(
    data: &[u8],
    strings: &mut StringInterner,
    parameters: &LookupParameters,
    diagnostics: &mut Diagnostics,
) -> Result<Decoded, FormatError> {
    let image = Image::parse(data, diagnostics)?;
    let imports = decode_imports(&image, strings, diagnostics)?;
    let exports = decode_exports(&image, strings, diagnostics, parameters.demangle_exports)?;
    let resources = if parameters.decode_resources {
        decode_resources(&image, strings, diagnostics)?
    } else {
        ResourceTable::default()
    };
    Ok(Decoded {
        info: *image.info(),
        imports,
        exports,
        resources,
    })
}

/// Resolves the dependency graph of the roots of a query
///
/// Modules are decoded in breadth-first order; every located file gets exactly one node, keyed
/// by its canonical path. Imports are matched against exports once the whole graph is known.
pub(crate) struct Runner<'a> {
    roots: Vec<PathBuf>,
    parameters: LookupParameters,
    lookup_path: LookupPath,
    canonicalizer: &'a dyn PathCanonicalizer,
    arena: Arena,
    modules: Vec<Module>,
    index: HashMap<Sym, usize>,
    queue: VecDeque<usize>,
    root_nodes: Vec<usize>,
}

impl<'a> Runner<'a> {
    pub(crate) fn new(
        query: &LookupQuery,
        lookup_path: LookupPath,
        canonicalizer: &'a dyn PathCanonicalizer,
    ) -> Self {
        Self {
            roots: query.roots.clone(),
            parameters: query.parameters.clone(),
            lookup_path,
            canonicalizer,
            arena: Arena::new(),
            modules: Vec::new(),
            index: HashMap::new(),
            queue: VecDeque::new(),
            root_nodes: Vec::new(),
        }
    }

    fn insert_module(&mut self, module: Module) -> usize {
        let index = self.modules.len();
        self.index.insert(module.key, index);
        self.modules.push(module);
        index
    }

    // enqueue a located file, unless a file with the same identity is already in the graph
    fn enqueue(&mut self, name: &str, canonical: &Path, root: Option<usize>, depth: usize) -> Sym {
        let key = self.arena.intern(&identity_key(canonical));
        if self.index.contains_key(&key) {
            tracing::debug!("{} is already in the graph", name);
            return key;
        }
        let name = self.arena.intern(name);
        let path = self.arena.intern(&path_to_string(canonical));
        let root = root.unwrap_or(self.modules.len());
        let index = self.insert_module(Module::pending(name, Some(path), key, root, depth));
        tracing::debug!("enqueued {}", path_to_string(canonical));
        self.queue.push_back(index);
        key
    }

    // register a module that will not be decoded; repeated references share one node
    fn register_unresolved(
        &mut self,
        name: &str,
        reason: UnresolvedReason,
        root: Option<usize>,
        depth: usize,
    ) -> Sym {
        let key = self.arena.intern(&format!("?{}", name.to_lowercase()));
        if self.index.contains_key(&key) {
            return key;
        }
        tracing::info!("{} cannot be analyzed: {:?}", name, reason);
        let name = self.arena.intern(name);
        let root = root.unwrap_or(self.modules.len());
        let mut module = Module::pending(name, None, key, root, depth);
        module.status = ModuleStatus::Unresolved(reason);
        self.insert_module(module);
        key
    }

    fn pop(&mut self) -> Option<usize> {
        self.queue.pop_front()
    }

    // find a module referenced by name from an analyzed module
    fn locate(
        &mut self,
        name: &str,
        app_dir: &Path,
        importer_dir: &Path,
        root: usize,
        depth: usize,
    ) -> Sym {
        let found = match self.lookup_path.search_dll(name, app_dir, importer_dir) {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!("lookup of {:?} failed: {}", name, e);
                None
            }
        };
        match found {
            Some(found) => match self.canonicalizer.canonicalize(&found.fullpath) {
                Ok(canonical) => self.enqueue(name, &canonical, Some(root), depth),
                Err(e) => self.register_unresolved(
                    name,
                    UnresolvedReason::NotCanonicalizable(e.to_string()),
                    Some(root),
                    depth,
                ),
            },
            None => self.register_unresolved(name, UnresolvedReason::NotFound, Some(root), depth),
        }
    }

    fn module_dir(&self, index: usize) -> PathBuf {
        self.modules[index]
            .path
            .and_then(|p| app_dir_of(Path::new(self.arena.str(p))).ok())
            .unwrap_or_default()
    }

    fn analyze(&mut self, index: usize) {
        let Some(path) = self.modules[index].path else {
            return;
        };
        let path = PathBuf::from(self.arena.str(path));
        tracing::debug!("decoding {}", path.display());

        let file = match self.arena.load(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("could not read {}: {}", path.display(), e);
                self.modules[index].status =
                    ModuleStatus::Unresolved(UnresolvedReason::Unreadable(e.to_string()));
                return;
            }
        };
        let mut diagnostics = Diagnostics::new();
        let (data, strings) = self.arena.file_and_strings(file);
        let decoded = decode(data, strings, &self.parameters, &mut diagnostics);

        let module = &mut self.modules[index];
        module.file = Some(file);
        match decoded {
            Ok(d) => {
                module.image = Some(d.info);
                module.imports = d.imports;
                module.exports = d.exports;
                module.resources = d.resources;
                module.status = ModuleStatus::Analyzed;
            }
            Err(e) => {
                tracing::warn!("{} is not a valid binary: {}", path.display(), e);
                diagnostics.fatal(&e);
                module.status = ModuleStatus::Unresolved(UnresolvedReason::BadFormat(e));
            }
        }
        module.diagnostics = diagnostics;
    }

    fn expand(&mut self, index: usize) {
        let root = self.modules[index].root;
        let depth = self.modules[index].depth_first_appearance + 1;
        let app_dir = self.module_dir(root);
        let importer_dir = self.module_dir(index);

        let imported: Vec<String> = self.modules[index]
            .imports
            .modules
            .iter()
            .map(|m| self.arena.str(m.name).to_owned())
            .collect();
        for (j, name) in imported.iter().enumerate() {
            let key = self.locate(name, &app_dir, &importer_dir, root, depth);
            self.modules[index].imports.modules[j].resolved_path = Some(key);
        }

        if !self.parameters.follow_forwarders {
            return;
        }
        let mut forwarded: Vec<String> = Vec::new();
        for (_, f) in self.modules[index].exports.forwarders() {
            if let Some((module, _)) = split_forwarder(self.arena.str(f)) {
                let file_name = forwarded_module_file_name(module);
                if !forwarded.iter().any(|n| n.eq_ignore_ascii_case(&file_name)) {
                    forwarded.push(file_name);
                }
            }
        }
        for file_name in forwarded {
            let resolved_path = self.locate(&file_name, &app_dir, &importer_dir, root, depth);
            let name = self.arena.intern(&file_name);
            self.modules[index]
                .forwarded_modules
                .push(ForwardedModule { name, resolved_path });
        }
    }

    fn analyzed_node(&self, key: Sym) -> Option<usize> {
        self.index
            .get(&key)
            .copied()
            .filter(|&i| self.modules[i].is_analyzed())
    }

    /// Follow a forwarder chain to the export that provides the code
    fn follow_forwarder(
        &self,
        mut module: usize,
        mut forwarder: Sym,
        used: &mut Vec<(usize, usize)>,
    ) -> Option<ExportRef> {
        if !self.parameters.follow_forwarders {
            return None;
        }
        let mut visited = HashSet::new();
        for _ in 0..MAX_FORWARDER_HOPS {
            let (target, symbol) = split_forwarder(self.arena.str(forwarder))?;
            let file_name = forwarded_module_file_name(target);
            let key = self.modules[module]
                .forwarded_modules
                .iter()
                .find(|f| self.arena.str(f.name).eq_ignore_ascii_case(&file_name))?
                .resolved_path;
            let next = self.analyzed_node(key)?;
            let exports = &self.modules[next].exports;
            let export = match symbol {
                ForwardedSymbol::Name(n) => exports.by_name(self.arena.strings.get(n)?),
                ForwardedSymbol::Ordinal(o) => exports.by_ordinal(o),
            }?;
            if !visited.insert((next, export)) {
                tracing::debug!("forwarder cycle through {}", self.arena.str(forwarder));
                return None;
            }
            used.push((next, export));
            match exports.entries[export].address {
                ExportAddress::Rva(_) => {
                    return Some(ExportRef {
                        module: self.modules[next].key,
                        export,
                    })
                }
                ExportAddress::Forwarder(f) => {
                    module = next;
                    forwarder = f;
                }
            }
        }
        None
    }

    fn resolve(
        &self,
        module: usize,
        target: ImportTarget,
        used: &mut Vec<(usize, usize)>,
    ) -> ImportResolution {
        let exports = &self.modules[module].exports;
        let found = match target {
            ImportTarget::Ordinal(ordinal) => exports.by_ordinal(ordinal),
            ImportTarget::Name { name, .. } => exports.by_name(name),
        };
        let Some(export) = found else {
            return ImportResolution::Unmatched;
        };
        used.push((module, export));
        match exports.entries[export].address {
            ExportAddress::Rva(_) => ImportResolution::Matched { export },
            ExportAddress::Forwarder(f) => ImportResolution::Forwarded {
                export,
                target: self.follow_forwarder(module, f, used),
            },
        }
    }

    // match every import once all nodes exist
    fn match_imports(&mut self) {
        let mut resolutions = Vec::new();
        let mut used = Vec::new();
        for (mi, module) in self.modules.iter().enumerate() {
            for (ji, imported) in module.imports.modules.iter().enumerate() {
                let target = imported.resolved_path.and_then(|k| self.analyzed_node(k));
                for (si, symbol) in imported.symbols.iter().enumerate() {
                    let resolution = match target {
                        Some(t) => self.resolve(t, symbol.target, &mut used),
                        None => ImportResolution::ModuleUnavailable,
                    };
                    resolutions.push((mi, ji, si, resolution));
                }
            }
        }
        for (mi, ji, si, resolution) in resolutions {
            self.modules[mi].imports.modules[ji].symbols[si].resolution = resolution;
        }
        for (module, export) in used {
            self.modules[module].exports.entries[export].used = true;
        }
    }

    pub(crate) fn run(mut self) -> Result<Analysis, LookupError> {
        if self.roots.is_empty() {
            return Err(LookupError::ContextDeductionError(
                "No binaries to analyze".to_owned(),
            ));
        }
        tracing::info!("resolving the dependencies of {} binaries", self.roots.len());

        for root in self.roots.clone() {
            let name = root
                .file_name()
                .map(path_to_string)
                .unwrap_or_else(|| path_to_string(&root));
            let key = match self.canonicalizer.canonicalize(&root) {
                Ok(canonical) => self.enqueue(&name, &canonical, None, 0),
                Err(e) => self.register_unresolved(
                    &name,
                    UnresolvedReason::NotCanonicalizable(e.to_string()),
                    None,
                    0,
                ),
            };
            if let Some(&node) = self.index.get(&key) {
                if !self.root_nodes.contains(&node) {
                    self.root_nodes.push(node);
                }
            }
        }

        while let Some(index) = self.pop() {
            // don't decode again a file that was already handled
            if self.modules[index].status != ModuleStatus::Pending {
                continue;
            }
            self.analyze(index);
            if self.modules[index].is_analyzed() {
                self.expand(index);
            }
        }

        self.match_imports();
        tracing::info!(
            "{} modules in the graph, {} not analyzable",
            self.modules.len(),
            self.modules.iter().filter(|m| m.is_unresolved()).count()
        );
        Ok(Analysis::new(
            self.root_nodes,
            self.modules,
            self.index,
            self.arena,
        ))
    }
}
