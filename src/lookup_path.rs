use crate::common::LookupError;
use crate::query::LookupQuery;
use fs_err as fs;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Directory to be searched for a module, and where it comes from
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum LookupPathEntry {
    /// Directory of the root binary whose graph the module was reached from
    ExecutableDir(PathBuf),
    /// Directory of the module naming the dependency
    ImporterDir(PathBuf),
    /// Working directory of the (virtual) process whose module lookup we are simulating
    WorkingDir(PathBuf),
    /// Additional path entries specified by the user
    UserPath(PathBuf),
}

impl LookupPathEntry {
    pub fn path(&self) -> &Path {
        match self {
            Self::ExecutableDir(p)
            | Self::ImporterDir(p)
            | Self::WorkingDir(p)
            | Self::UserPath(p) => p,
        }
    }
}

/// Full location of a module found during lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub location: LookupPathEntry,
    pub fullpath: PathBuf,
}

/// Case-insensitive listing of directories, scanned once each
#[derive(Debug, Default)]
pub(crate) struct FileSystemCache {
    files_in_dirs: HashMap<PathBuf, HashMap<String, PathBuf>>,
}

impl FileSystemCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn test_file_in_folder_case_insensitive(
        &mut self,
        filename: &str,
        folder: &Path,
    ) -> Option<PathBuf> {
        self.scan_folder(folder)
            .get(&filename.to_lowercase())
            .map(|p| folder.join(p))
    }

    fn scan_folder(&mut self, folder: &Path) -> &HashMap<String, PathBuf> {
        self.files_in_dirs
            .entry(folder.to_owned())
            .or_insert_with(|| match fs::read_dir(folder) {
                Ok(entries) => entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.metadata().map_or(false, |m| m.is_file()))
                    .filter_map(|entry| {
                        entry
                            .file_name()
                            .to_str()
                            .map(|s| (s.to_lowercase(), entry.file_name().into()))
                    })
                    .collect(),
                Err(e) => {
                    tracing::debug!("skipping search directory: {}", e);
                    HashMap::new()
                }
            })
    }
}

/// Ordered list of directories to be looked up when searching for a module
///
/// The fixed part comes from the query; the application and importer directories depend on
/// where in the graph the reference was found.
pub struct LookupPath {
    working_dir: PathBuf,
    user_path: Vec<PathBuf>,
    fs_cache: RefCell<FileSystemCache>,
}

impl LookupPath {
    pub fn new(query: &LookupQuery) -> Self {
        Self {
            working_dir: query.working_dir.clone(),
            user_path: query.user_path.clone(),
            fs_cache: RefCell::new(FileSystemCache::new()),
        }
    }

    /// Search order for a module referenced from `importer_dir`, in the graph of the root
    /// sitting in `app_dir`; a directory appearing twice is only searched the first time
    pub fn entries(&self, app_dir: &Path, importer_dir: &Path) -> Vec<LookupPathEntry> {
        let candidates = [
            LookupPathEntry::ExecutableDir(app_dir.to_owned()),
            LookupPathEntry::ImporterDir(importer_dir.to_owned()),
            LookupPathEntry::WorkingDir(self.working_dir.clone()),
        ]
        .into_iter()
        .chain(self.user_path.iter().cloned().map(LookupPathEntry::UserPath));

        let mut entries: Vec<LookupPathEntry> = Vec::new();
        for c in candidates {
            if !entries.iter().any(|e| e.path() == c.path()) {
                entries.push(c);
            }
        }
        entries
    }

    // looks for a module by the name it is referenced with
    pub fn search_dll(
        &self,
        library: &str,
        app_dir: &Path,
        importer_dir: &Path,
    ) -> Result<Option<LookupResult>, LookupError> {
        if library.is_empty() {
            return Err(LookupError::ScanError("empty module name".to_owned()));
        }
        let as_path = Path::new(library);
        if as_path.components().count() > 1 {
            // a reference carrying directories is taken relative to the importer
            let fullpath = importer_dir.join(as_path);
            return Ok(fullpath.is_file().then(|| LookupResult {
                location: LookupPathEntry::ImporterDir(importer_dir.to_owned()),
                fullpath,
            }));
        }

        let mut cache = self.fs_cache.borrow_mut();
        for e in self.entries(app_dir, importer_dir) {
            if let Some(fullpath) = cache.test_file_in_folder_case_insensitive(library, e.path()) {
                return Ok(Some(LookupResult {
                    location: e,
                    fullpath,
                }));
            }
        }
        Ok(None)
    }
}
