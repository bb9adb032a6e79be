//! Export table decoder
//!
//! The address table is indexed by `ordinal - base`; the name-pointer and ordinal tables are
//! parallel arrays mapping names to address-table slots. An address that points back inside the
//! export directory is a forwarder string (`Module.Symbol` or `Module.#ordinal`), not code.

use crate::common::{Diagnostics, FormatError};
use crate::image::{DataDirectoryKind, Image};
use crate::interner::{StringInterner, Sym};
use crate::raw::{self, ExportDirectory};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

const MAX_ORDINAL: u64 = u16::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExportAddress {
    /// code or data inside the module
    Rva(u32),
    /// redirection to a symbol of another module
    Forwarder(Sym),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Export {
    pub ordinal: u16,
    pub address: ExportAddress,
    pub name: Option<Sym>,
    /// index of the name in the name-pointer table
    pub hint: Option<u16>,
    pub debug_name: Option<String>,
    /// set when an import somewhere in the graph resolves to this export
    pub used: bool,
}

impl Export {
    pub fn is_forwarder(&self) -> bool {
        matches!(self.address, ExportAddress::Forwarder(_))
    }
}

/// Exports ordered by ascending ordinal, with a name index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportTable {
    pub module_name: Option<Sym>,
    pub ordinal_base: u32,
    pub entries: Vec<Export>,
    #[serde(skip)]
    names: HashMap<Sym, usize>,
}

impl ExportTable {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn by_ordinal(&self, ordinal: u16) -> Option<usize> {
        self.entries
            .binary_search_by_key(&ordinal, |e| e.ordinal)
            .ok()
    }

    /// First export carrying exactly this name
    pub fn by_name(&self, name: Sym) -> Option<usize> {
        self.names.get(&name).copied()
    }

    pub fn forwarders(&self) -> impl Iterator<Item = (usize, Sym)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e.address {
                ExportAddress::Forwarder(f) => Some((i, f)),
                ExportAddress::Rva(_) => None,
            })
    }
}

/// Symbol part of a forwarder string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardedSymbol<'a> {
    Name(&'a str),
    Ordinal(u16),
}

/// Split `Module.Symbol` / `Module.#123` into its parts
pub fn split_forwarder(forwarder: &str) -> Option<(&str, ForwardedSymbol<'_>)> {
    let (module, symbol) = forwarder.rsplit_once('.')?;
    if module.is_empty() || symbol.is_empty() {
        return None;
    }
    let symbol = match symbol.strip_prefix('#') {
        Some(ordinal) => ForwardedSymbol::Ordinal(ordinal.parse().ok()?),
        None => ForwardedSymbol::Name(symbol),
    };
    Some((module, symbol))
}

/// File name of the module a forwarder points at; the loader assumes `.dll` when none is given
pub fn forwarded_module_file_name(module: &str) -> String {
    if Path::new(module).extension().is_some() {
        module.to_owned()
    } else {
        format!("{module}.dll")
    }
}

/// Human-readable form of an MSVC-decorated name
pub fn demangle_symbol(symbol: &str) -> Option<String> {
    if !symbol.starts_with('?') {
        return None;
    }
    let flags =
        msvc_demangler::DemangleFlags::llvm() | msvc_demangler::DemangleFlags::NO_MS_KEYWORDS;
    msvc_demangler::demangle(symbol, flags).ok()
}

fn read_u32(image: &Image, table: u64, index: u64, what: &'static str) -> Result<u32, FormatError> {
    raw::read(image.data(), table + 4 * index, what)
}

fn read_u16(image: &Image, table: u64, index: u64, what: &'static str) -> Result<u16, FormatError> {
    raw::read(image.data(), table + 2 * index, what)
}

pub fn decode_exports(
    image: &Image,
    strings: &mut StringInterner,
    diagnostics: &mut Diagnostics,
    demangle: bool,
) -> Result<ExportTable, FormatError> {
    let Some(dir) = image.directory(DataDirectoryKind::Export) else {
        return Ok(ExportTable::default());
    };
    let (ed, _) = image.read_at::<ExportDirectory>(dir.virtual_address, None, "export directory")?;
    if ed.characteristics != 0 {
        diagnostics.warn(format!(
            "export directory flags are {:#x}, expected zero",
            ed.characteristics
        ));
    }

    let function_count = u64::from(ed.number_of_functions);
    let name_count = u64::from(ed.number_of_names);
    for (what, count) in [
        ("exported functions", function_count),
        ("exported names", name_count),
    ] {
        if count > MAX_ORDINAL {
            return Err(FormatError::CountOutOfRange {
                what,
                count,
                limit: MAX_ORDINAL,
            });
        }
    }
    if function_count > 0 {
        let last = u64::from(ed.base) + function_count - 1;
        if last > MAX_ORDINAL {
            return Err(FormatError::CountOutOfRange {
                what: "export ordinals",
                count: last,
                limit: MAX_ORDINAL,
            });
        }
    }

    let module_name = match ed.name {
        0 => None,
        rva => Some(strings.intern(&image.read_cstr(rva, None, "exporting module name")?)),
    };

    // slot index -> (name, position in the name-pointer table)
    let mut slot_names: Vec<Option<(Sym, u16)>> = vec![None; function_count as usize];
    // every (name, slot) pair in name-table order
    let mut definitions: Vec<(Sym, usize)> = Vec::new();
    let mut defined: HashSet<Sym> = HashSet::new();
    if name_count > 0 {
        let npt = image.span(ed.address_of_names, 4 * name_count, None, "export name pointer table")?;
        let eot = image.span(ed.address_of_name_ordinals, 2 * name_count, None, "export ordinal table")?;
        let mut previous: Option<Sym> = None;
        let mut unsorted = false;
        for i in 0..name_count {
            let name_rva = read_u32(image, npt.offset, i, "export name pointer")?;
            let slot = u64::from(read_u16(image, eot.offset, i, "export ordinal table entry")?);
            if slot >= function_count {
                return Err(FormatError::CountOutOfRange {
                    what: "export ordinal table entry",
                    count: slot,
                    limit: function_count,
                });
            }
            let name = strings.intern(&image.read_cstr(name_rva, None, "export name")?);
            if let Some(prev) = previous {
                if !unsorted && strings.resolve(prev).as_bytes() > strings.resolve(name).as_bytes() {
                    unsorted = true;
                    diagnostics.warn("export names are not sorted, lookups by name may fail at load time");
                }
            }
            previous = Some(name);

            if !defined.insert(name) {
                diagnostics.warn(format!(
                    "export name {} is defined more than once, the first definition is used",
                    strings.resolve(name)
                ));
            }
            definitions.push((name, slot as usize));
            if let Some((kept, _)) = slot_names[slot as usize] {
                diagnostics.warn(format!(
                    "export ordinal {} is named both {} and {}, keeping the first",
                    u64::from(ed.base) + slot,
                    strings.resolve(kept),
                    strings.resolve(name)
                ));
            } else {
                slot_names[slot as usize] = Some((name, i as u16));
            }
        }
    }

    let mut entries = Vec::new();
    let mut entry_by_slot = HashMap::new();
    if function_count > 0 {
        let eat = image.span(ed.address_of_functions, 4 * function_count, None, "export address table")?;
        for slot in 0..function_count {
            let value = read_u32(image, eat.offset, slot, "export address")?;
            if value == 0 {
                continue;
            }
            let address = if dir.contains(value) {
                let forwarder = image.read_cstr(value, None, "export forwarder")?;
                if split_forwarder(&forwarder).is_none() {
                    diagnostics.warn(format!("export forwarder {forwarder:?} is not of the form Module.Symbol"));
                }
                ExportAddress::Forwarder(strings.intern(&forwarder))
            } else {
                ExportAddress::Rva(value)
            };
            let (name, hint) = match slot_names[slot as usize] {
                Some((name, hint)) => (Some(name), Some(hint)),
                None => (None, None),
            };
            let debug_name = match name {
                Some(n) if demangle => demangle_symbol(strings.resolve(n)),
                _ => None,
            };
            entry_by_slot.insert(slot as usize, entries.len());
            entries.push(Export {
                ordinal: (u64::from(ed.base) + slot) as u16,
                address,
                name,
                hint,
                debug_name,
                used: false,
            });
        }
    }

    // a definition pointing at an unused slot does not shadow a later one
    let mut names = HashMap::new();
    for (name, slot) in definitions {
        if let Some(&entry) = entry_by_slot.get(&slot) {
            names.entry(name).or_insert(entry);
        }
    }

    Ok(ExportTable {
        module_name,
        ordinal_base: ed.base,
        entries,
        names,
    })
}
