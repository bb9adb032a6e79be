//! Import table decoder: statically bound and delay-loaded dependencies

use crate::common::{Diagnostics, FormatError};
use crate::image::{DataDirectoryKind, Image};
use crate::interner::{StringInterner, Sym};
use crate::raw::{DelayLoadDescriptor, ImportDescriptor};
use serde::Serialize;
use std::mem::size_of;

/// Counts are kept within 16 bits, like the ordinals they sit next to
const MAX_COUNT: u64 = u16::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadKind {
    /// resolved by the loader when the image is mapped
    Static,
    /// resolved lazily on first call
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImportTarget {
    Ordinal(u16),
    Name { hint: u16, name: Sym },
}

/// An export of another module, identified by that module's path key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExportRef {
    pub module: Sym,
    pub export: usize,
}

/// Outcome of matching one import against the exports of its module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImportResolution {
    /// matching has not run yet
    Pending,
    Matched {
        export: usize,
    },
    /// matched a forwarder export; `target` is the end of the forwarder chain, if it resolves
    Forwarded {
        export: usize,
        target: Option<ExportRef>,
    },
    /// the module was analyzed but exports nothing that satisfies the import
    Unmatched,
    /// the module could not be located or analyzed
    ModuleUnavailable,
}

impl ImportResolution {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Matched { .. } | Self::Forwarded { .. })
    }

    /// Index of the export that satisfied the import in its module's export table
    pub fn export(&self) -> Option<usize> {
        match self {
            Self::Matched { export } | Self::Forwarded { export, .. } => Some(*export),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedSymbol {
    pub target: ImportTarget,
    pub resolution: ImportResolution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedModule {
    /// name as spelled in the import descriptor
    pub name: Sym,
    pub load: LoadKind,
    pub symbols: Vec<ImportedSymbol>,
    /// path key of the module this name resolved to, filled in by the engine
    pub resolved_path: Option<Sym>,
}

/// Statically bound modules first, then delay-loaded ones
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportTable {
    pub modules: Vec<ImportedModule>,
}

impl ImportTable {
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn static_count(&self) -> usize {
        self.modules
            .iter()
            .filter(|m| m.load == LoadKind::Static)
            .count()
    }

    pub fn symbol_count(&self) -> usize {
        self.modules.iter().map(|m| m.symbols.len()).sum()
    }

    fn contains_module(&self, name: &str, strings: &StringInterner) -> bool {
        self.modules
            .iter()
            .any(|m| strings.resolve(m.name).eq_ignore_ascii_case(name))
    }
}

fn count_check(what: &'static str, count: u64) -> Result<(), FormatError> {
    if count > MAX_COUNT {
        return Err(FormatError::CountOutOfRange {
            what,
            count,
            limit: MAX_COUNT,
        });
    }
    Ok(())
}

fn offset_rva(base: u32, index: u64, width: u64) -> Result<u32, FormatError> {
    u64::from(base)
        .checked_add(index * width)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(FormatError::Malformed("table runs past the 32-bit address space"))
}

/// Turn an address from an old-style delay-load descriptor into an RVA
fn va_to_rva(image: &Image, va: u64) -> Result<u32, FormatError> {
    va.checked_sub(image.info().image_base)
        .and_then(|r| u32::try_from(r).ok())
        .ok_or(FormatError::Malformed("delay-load address outside of the image"))
}

/// Decode a zero-terminated array of import lookup entries
fn decode_thunks(
    image: &Image,
    table_rva: u32,
    va_based: bool,
    strings: &mut StringInterner,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<ImportedSymbol>, FormatError> {
    let is_pe32 = image.info().is_pe32;
    let (width, ordinal_flag) = if is_pe32 {
        (4u64, 1u64 << 31)
    } else {
        (8u64, 1u64 << 63)
    };
    let section = image.rva_to_disk(table_rva, None)?.section;

    let mut symbols = Vec::new();
    for index in 0u64.. {
        count_check("imported symbols of one module", index)?;
        let rva = offset_rva(table_rva, index, width)?;
        let value: u64 = if is_pe32 {
            u64::from(image.read_at::<u32>(rva, Some(section), "import lookup entry")?.0)
        } else {
            image.read_at::<u64>(rva, Some(section), "import lookup entry")?.0
        };
        if value == 0 {
            break;
        }

        let target = if value & ordinal_flag != 0 {
            if value & !ordinal_flag & !0xFFFF != 0 {
                diagnostics.warn(format!(
                    "import by ordinal {:#x} has reserved bits set",
                    value
                ));
            }
            ImportTarget::Ordinal(value as u16)
        } else {
            let hint_name = if va_based {
                va_to_rva(image, value)?
            } else {
                if value > 0x7FFF_FFFF {
                    diagnostics.warn(format!(
                        "import by name entry {:#x} has reserved bits set",
                        value
                    ));
                }
                (value & 0x7FFF_FFFF) as u32
            };
            let (hint, loc) = image.read_at::<u16>(hint_name, None, "import hint")?;
            let name_rva = hint_name
                .checked_add(2)
                .ok_or(FormatError::Malformed("import by name entry"))?;
            let name = image.read_cstr(name_rva, Some(loc.section), "imported symbol name")?;
            ImportTarget::Name {
                hint,
                name: strings.intern(&name),
            }
        };
        symbols.push(ImportedSymbol {
            target,
            resolution: ImportResolution::Pending,
        });
    }
    Ok(symbols)
}

/// Decode the import and delay-import directories of an image
///
/// Walks each descriptor array up to its all-zero sentinel; the walk must not leave the section
/// the array starts in. A delay-loaded module whose name was already seen is skipped.
pub fn decode_imports(
    image: &Image,
    strings: &mut StringInterner,
    diagnostics: &mut Diagnostics,
) -> Result<ImportTable, FormatError> {
    let mut table = ImportTable::default();

    if let Some(dir) = image.directory(DataDirectoryKind::Import) {
        let section = image.rva_to_disk(dir.virtual_address, None)?.section;
        for index in 0u64.. {
            count_check("imported modules", index)?;
            let rva = offset_rva(dir.virtual_address, index, size_of::<ImportDescriptor>() as u64)?;
            let (desc, _) =
                image.read_at::<ImportDescriptor>(rva, Some(section), "import descriptor")?;
            if desc.is_sentinel() {
                break;
            }
            let name = image.read_cstr(desc.name, None, "imported module name")?;
            if name.is_empty() {
                diagnostics.warn("import descriptor with an empty module name");
            }
            let lookup = if desc.original_first_thunk != 0 {
                desc.original_first_thunk
            } else if desc.first_thunk != 0 {
                diagnostics.warn(format!(
                    "imports from {name} have no lookup table, reading the import address table"
                ));
                desc.first_thunk
            } else {
                return Err(FormatError::Malformed("import descriptor without lookup table"));
            };
            let symbols = decode_thunks(image, lookup, false, strings, diagnostics)?;
            table.modules.push(ImportedModule {
                name: strings.intern(&name),
                load: LoadKind::Static,
                symbols,
                resolved_path: None,
            });
        }
    }

    if let Some(dir) = image.directory(DataDirectoryKind::DelayImport) {
        let section = image.rva_to_disk(dir.virtual_address, None)?.section;
        for index in 0u64.. {
            count_check("delay-loaded modules", index)?;
            let rva = offset_rva(
                dir.virtual_address,
                index,
                size_of::<DelayLoadDescriptor>() as u64,
            )?;
            let (desc, _) =
                image.read_at::<DelayLoadDescriptor>(rva, Some(section), "delay-load descriptor")?;
            if desc.is_sentinel() {
                break;
            }
            let va_based = desc.attributes & 1 == 0;
            let to_rva = |v: u32| {
                if va_based {
                    va_to_rva(image, u64::from(v))
                } else {
                    Ok(v)
                }
            };
            let name = image.read_cstr(to_rva(desc.dll_name_rva)?, None, "delay-loaded module name")?;
            if va_based {
                diagnostics.warn(format!(
                    "delay-load descriptor for {name} uses virtual addresses"
                ));
            }
            if table.contains_module(&name, strings) {
                tracing::debug!("delay-loaded {} is already imported, skipping", name);
                continue;
            }
            if desc.import_name_table_rva == 0 {
                return Err(FormatError::Malformed("delay-load descriptor without name table"));
            }
            let names = to_rva(desc.import_name_table_rva)?;
            let symbols = decode_thunks(image, names, va_based, strings, diagnostics)?;
            table.modules.push(ImportedModule {
                name: strings.intern(&name),
                load: LoadKind::Delayed,
                symbols,
                resolved_path: None,
            });
        }
    }

    Ok(table)
}
