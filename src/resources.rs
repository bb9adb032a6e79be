//! Resource tree decoder
//!
//! The tree has exactly three levels (type, name, language) of directory tables whose entries
//! point further down with directory-relative offsets. Leaves are data entries locating the
//! payload by RVA. The decoded form is a flat list in tree order.

use crate::common::{Diagnostics, FormatError};
use crate::image::{DataDirectoryKind, Image};
use crate::interner::{StringInterner, Sym};
use crate::raw::{self, ResourceDataEntry, ResourceDirectoryEntry, ResourceDirectoryTable, HIGH_BIT};
use serde::Serialize;
use std::collections::HashSet;
use std::mem::size_of;

const MAX_ENTRIES: u64 = u16::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceId {
    Name(Sym),
    Id(u16),
}

impl ResourceId {
    /// Display form of a resource type, using the predefined type names where they apply
    pub fn type_label(&self, strings: &StringInterner) -> String {
        match *self {
            ResourceId::Name(s) => strings.resolve(s).to_owned(),
            ResourceId::Id(id) => match predefined_type_name(id) {
                Some(name) => name.to_owned(),
                None => id.to_string(),
            },
        }
    }

    pub fn label(&self, strings: &StringInterner) -> String {
        match *self {
            ResourceId::Name(s) => strings.resolve(s).to_owned(),
            ResourceId::Id(id) => id.to_string(),
        }
    }
}

fn predefined_type_name(id: u16) -> Option<&'static str> {
    Some(match id {
        1 => "CURSOR",
        2 => "BITMAP",
        3 => "ICON",
        4 => "MENU",
        5 => "DIALOG",
        6 => "STRING",
        7 => "FONTDIR",
        8 => "FONT",
        9 => "ACCELERATOR",
        10 => "RCDATA",
        11 => "MESSAGETABLE",
        12 => "GROUP_CURSOR",
        14 => "GROUP_ICON",
        16 => "VERSION",
        17 => "DLGINCLUDE",
        19 => "PLUGPLAY",
        20 => "VXD",
        21 => "ANICURSOR",
        22 => "ANIICON",
        23 => "HTML",
        24 => "MANIFEST",
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub kind: ResourceId,
    pub name: ResourceId,
    pub language: ResourceId,
    pub data_rva: u32,
    pub size: u32,
    /// file offset of the payload
    pub file_offset: u64,
    pub code_page: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceTable {
    pub resources: Vec<Resource>,
}

impl ResourceTable {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }
}

/// Tagged target of a directory entry
enum EntryTarget {
    Subdirectory(u32),
    Data(u32),
}

/// The bytes declared by the resource data directory; every offset is checked against them
struct ResourceTree<'a> {
    bytes: &'a [u8],
}

impl<'a> ResourceTree<'a> {
    fn check(&self, offset: u64, len: u64, what: &'static str) -> Result<u64, FormatError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() as u64 => Ok(offset),
            _ => Err(FormatError::OutOfDirectory {
                what,
                offset,
                len,
                size: self.bytes.len() as u32,
            }),
        }
    }

    fn read<T: dataview::Pod>(&self, offset: u64, what: &'static str) -> Result<T, FormatError> {
        self.check(offset, size_of::<T>() as u64, what)?;
        raw::read(self.bytes, offset, what)
    }

    /// Length-prefixed UTF-16 string, aligned and non-empty
    fn string(&self, offset: u32) -> Result<String, FormatError> {
        if offset % 2 != 0 {
            return Err(FormatError::Malformed("resource name is not 16-bit aligned"));
        }
        let len: u16 = self.read(u64::from(offset), "resource name length")?;
        if len == 0 {
            return Err(FormatError::Malformed("empty resource name"));
        }
        let start = self.check(u64::from(offset) + 2, 2 * u64::from(len), "resource name")?;
        let units: Vec<u16> = (0..u64::from(len))
            .map(|i| raw::read::<u16>(self.bytes, start + 2 * i, "resource name"))
            .collect::<Result<_, _>>()?;
        Ok(String::from_utf16_lossy(&units))
    }

    fn entries(
        &self,
        table_offset: u32,
        level: &'static str,
        strings: &mut StringInterner,
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<(ResourceId, EntryTarget)>, FormatError> {
        let table_offset = u64::from(table_offset);
        let table: ResourceDirectoryTable = self.read(table_offset, "resource directory table")?;
        if table.characteristics != 0 {
            diagnostics.warn(format!(
                "{level} resource directory has characteristics {:#x}, expected zero",
                table.characteristics
            ));
        }
        let named = u64::from(table.number_of_named_entries);
        let count = named + u64::from(table.number_of_id_entries);
        if count > MAX_ENTRIES {
            return Err(FormatError::CountOutOfRange {
                what: "resource directory entries",
                count,
                limit: MAX_ENTRIES,
            });
        }
        let entry_size = size_of::<ResourceDirectoryEntry>() as u64;
        let first = table_offset + size_of::<ResourceDirectoryTable>() as u64;
        self.check(first, count * entry_size, "resource directory entries")?;

        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry: ResourceDirectoryEntry =
                self.read(first + i * entry_size, "resource directory entry")?;
            let is_named = entry.name & HIGH_BIT != 0;
            // named entries come first, then numbered ones
            if is_named != (i < named) {
                return Err(FormatError::Malformed(
                    "resource entry name tag disagrees with its position",
                ));
            }
            let id = if is_named {
                let name = self.string(entry.name & !HIGH_BIT)?;
                ResourceId::Name(strings.intern(&name))
            } else {
                if entry.name > u32::from(u16::MAX) {
                    diagnostics.warn(format!(
                        "{level} resource id {:#x} does not fit in 16 bits",
                        entry.name
                    ));
                }
                ResourceId::Id(entry.name as u16)
            };
            let target = if entry.offset & HIGH_BIT != 0 {
                EntryTarget::Subdirectory(entry.offset & !HIGH_BIT)
            } else {
                EntryTarget::Data(entry.offset)
            };
            out.push((id, target));
        }
        Ok(out)
    }

    fn subdirectories(
        &self,
        table_offset: u32,
        level: &'static str,
        strings: &mut StringInterner,
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<(ResourceId, u32)>, FormatError> {
        self.entries(table_offset, level, strings, diagnostics)?
            .into_iter()
            .map(|(id, target)| match target {
                EntryTarget::Subdirectory(offset) => Ok((id, offset)),
                EntryTarget::Data(_) => Err(FormatError::Malformed(
                    "resource data entry above the language level",
                )),
            })
            .collect()
    }
}

pub fn decode_resources(
    image: &Image,
    strings: &mut StringInterner,
    diagnostics: &mut Diagnostics,
) -> Result<ResourceTable, FormatError> {
    let Some(dir) = image.directory(DataDirectoryKind::Resource) else {
        return Ok(ResourceTable::default());
    };
    let loc = image.span(dir.virtual_address, u64::from(dir.size), None, "resource directory")?;
    let start = loc.offset as usize;
    let tree = ResourceTree {
        bytes: &image.data()[start..start + dir.size as usize],
    };

    // each table is walked once, so the leaf count stays bounded by the directory size
    let mut visited: HashSet<u32> = HashSet::from([0]);
    let mut first_visit = |table: u32| {
        if visited.insert(table) {
            Ok(table)
        } else {
            Err(FormatError::Malformed("resource directory table is shared"))
        }
    };

    let mut resources = Vec::new();
    for (kind, kind_table) in tree.subdirectories(0, "type", strings, diagnostics)? {
        let kind_table = first_visit(kind_table)?;
        for (name, name_table) in tree.subdirectories(kind_table, "name", strings, diagnostics)? {
            let name_table = first_visit(name_table)?;
            for (language, target) in tree.entries(name_table, "language", strings, diagnostics)? {
                let EntryTarget::Data(leaf) = target else {
                    return Err(FormatError::Malformed(
                        "resource subdirectory below the language level",
                    ));
                };
                let data: ResourceDataEntry = tree.read(u64::from(leaf), "resource data entry")?;
                if data.reserved != 0 {
                    diagnostics.warn(format!(
                        "resource data entry at {leaf:#x} has reserved field {:#x}",
                        data.reserved
                    ));
                }
                let payload =
                    image.span(data.data_rva, u64::from(data.size), None, "resource data")?;
                resources.push(Resource {
                    kind,
                    name,
                    language,
                    data_rva: data.data_rva,
                    size: data.size,
                    file_offset: payload.offset,
                    code_page: data.code_page,
                });
            }
        }
    }
    tracing::debug!("decoded {} resources", resources.len());
    Ok(ResourceTable { resources })
}
