//! Data structures that must be filled with the input and the parameters for the dependency scan

use crate::common::{path_to_string, LookupError};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupParameters {
    /// Decode the resource tree of every analyzed module
    pub decode_resources: bool,
    /// Attach demangled names to MSVC-decorated exports
    pub demangle_exports: bool,
    /// Locate the modules named by forwarder exports and resolve imports through forwarders
    pub follow_forwarders: bool,
}

impl Default for LookupParameters {
    fn default() -> Self {
        Self {
            decode_resources: false,
            demangle_exports: true,
            follow_forwarders: true,
        }
    }
}

/// Complete specification of a scan
#[derive(Clone, Debug)]
pub struct LookupQuery {
    /// Binaries whose dependency graphs are resolved, in order
    pub roots: Vec<PathBuf>,
    /// Working directory as it should appear in the search path
    pub working_dir: PathBuf,
    /// Additional search path set by the user
    pub user_path: Vec<PathBuf>,
    pub parameters: LookupParameters,
}

impl LookupQuery {
    /// autodetects the settings with sensible defaults
    ///
    /// The working directory will be set to the one containing the first root
    pub fn deduce_from_executable_locations<P: AsRef<Path>>(
        roots: &[P],
    ) -> Result<Self, LookupError> {
        let first = roots.first().ok_or_else(|| {
            LookupError::ContextDeductionError("No binaries to analyze".to_owned())
        })?;
        let app_dir = app_dir_of(first.as_ref())?;
        Ok(Self {
            roots: roots.iter().map(|r| r.as_ref().to_owned()).collect(),
            working_dir: app_dir,
            user_path: Vec::new(),
            parameters: LookupParameters::default(),
        })
    }
}

/// Directory a binary sits in; a bare file name sits in the current directory
pub(crate) fn app_dir_of(binary: &Path) -> Result<PathBuf, LookupError> {
    let parent = binary.parent().ok_or_else(|| {
        LookupError::ContextDeductionError(
            "Could not find application directory for given executable ".to_owned()
                + &path_to_string(binary),
        )
    })?;
    Ok(if parent.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        parent.to_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_query() -> Result<(), LookupError> {
        let query = LookupQuery::deduce_from_executable_locations(&[
            "build/bin/app.exe",
            "build/plugins/plugin.dll",
        ])?;
        assert_eq!(query.roots.len(), 2);
        assert_eq!(query.working_dir, PathBuf::from("build/bin"));
        assert!(query.user_path.is_empty());
        assert_eq!(query.parameters, LookupParameters::default());
        assert!(query.parameters.follow_forwarders);
        assert!(!query.parameters.decode_resources);
        Ok(())
    }

    #[test]
    fn bare_file_name_runs_in_current_dir() -> Result<(), LookupError> {
        let query = LookupQuery::deduce_from_executable_locations(&["app.exe"])?;
        assert_eq!(query.working_dir, PathBuf::from("."));
        Ok(())
    }

    #[test]
    fn empty_query_is_an_error() {
        let roots: [&str; 0] = [];
        assert!(matches!(
            LookupQuery::deduce_from_executable_locations(&roots),
            Err(LookupError::ContextDeductionError(_))
        ));
    }
}
