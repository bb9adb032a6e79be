//! Synthetic PE images for the unit tests
//!
//! Everything lives in a single `.rdata` section mapped at `SECTION_RVA`; the writer hands out
//! RVAs as it appends, and tables are patched in place once the referenced data exists.

use crate::image::{DataDirectoryKind, DATA_DIRECTORY_SLOTS};
use std::path::{Path, PathBuf};

pub(crate) const SECTION_RVA: u32 = 0x1000;
pub(crate) const SECTION_RAW_PTR: u32 = 0x200;
const FILE_ALIGNMENT: u32 = 0x200;

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

#[derive(Default)]
pub(crate) struct SectionWriter {
    bytes: Vec<u8>,
}

impl SectionWriter {
    /// Reserve `len` zeroed bytes, 4-byte aligned, and return their RVA
    pub fn alloc(&mut self, len: u32) -> u32 {
        let start = align_up(self.bytes.len() as u32, 4);
        self.bytes.resize((start + len) as usize, 0);
        SECTION_RVA + start
    }

    pub fn push_bytes(&mut self, data: &[u8]) -> u32 {
        let rva = self.alloc(data.len() as u32);
        let at = (rva - SECTION_RVA) as usize;
        self.bytes[at..at + data.len()].copy_from_slice(data);
        rva
    }

    pub fn push_cstr(&mut self, s: &str) -> u32 {
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        self.push_bytes(&data)
    }

    pub fn put_u8(&mut self, rva: u32, v: u8) {
        self.bytes[(rva - SECTION_RVA) as usize] = v;
    }

    pub fn put_u16(&mut self, rva: u32, v: u16) {
        let at = (rva - SECTION_RVA) as usize;
        self.bytes[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, rva: u32, v: u32) {
        let at = (rva - SECTION_RVA) as usize;
        self.bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, rva: u32, v: u64) {
        let at = (rva - SECTION_RVA) as usize;
        self.bytes[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn end_rva(&self) -> u32 {
        SECTION_RVA + self.bytes.len() as u32
    }
}

pub(crate) enum ExportSpec<'a> {
    Code { name: Option<&'a str>, rva: u32 },
    Forward { name: Option<&'a str>, target: &'a str },
    Unused,
}

#[derive(Clone, Copy)]
pub(crate) enum ImportSpec<'a> {
    Name(&'a str, u16),
    Ordinal(u16),
}

pub(crate) struct ModuleSpec<'a> {
    pub name: &'a str,
    pub symbols: Vec<ImportSpec<'a>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResId<'a> {
    Id(u16),
    Name(&'a str),
}

pub(crate) struct ResourceSpec<'a> {
    pub kind: ResId<'a>,
    pub name: ResId<'a>,
    pub lang: u16,
    pub data: &'a [u8],
}

pub(crate) struct ImageBuilder {
    is_64: bool,
    section: SectionWriter,
    directories: [(u32, u32); DATA_DIRECTORY_SLOTS],
    zero_fill: u32,
    omit_lookup_tables: bool,
    va_based_delay_imports: bool,
}

impl ImageBuilder {
    pub fn new(is_64: bool) -> Self {
        Self {
            is_64,
            section: SectionWriter::default(),
            directories: [(0, 0); DATA_DIRECTORY_SLOTS],
            zero_fill: 0,
            omit_lookup_tables: false,
            va_based_delay_imports: false,
        }
    }

    pub fn image_base(&self) -> u64 {
        if self.is_64 {
            0x1_8000_0000
        } else {
            0x1000_0000
        }
    }

    pub fn section_mut(&mut self) -> &mut SectionWriter {
        &mut self.section
    }

    /// Extend the virtual size of the section beyond its raw data
    pub fn set_zero_fill(&mut self, len: u32) {
        self.zero_fill = len;
    }

    /// Point import descriptors at the IAT only, as bound images do
    pub fn omit_lookup_tables(&mut self) {
        self.omit_lookup_tables = true;
    }

    /// Write delay-load descriptors in the old layout, holding virtual addresses
    pub fn va_based_delay_imports(&mut self) {
        self.va_based_delay_imports = true;
    }

    pub fn set_directory(&mut self, kind: DataDirectoryKind, rva: u32, size: u32) {
        self.directories[kind as usize] = (rva, size);
    }

    /// Lay out an export directory; returns its RVA
    pub fn exports(&mut self, dll_name: &str, base: u32, entries: &[ExportSpec]) -> u32 {
        let s = &mut self.section;
        let dir = s.alloc(40);
        let mut names: Vec<(&str, u16)> = entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                ExportSpec::Code { name: Some(n), .. } | ExportSpec::Forward { name: Some(n), .. } => {
                    Some((*n, i as u16))
                }
                _ => None,
            })
            .collect();
        names.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

        let eat = s.alloc(4 * entries.len() as u32);
        let npt = s.alloc(4 * names.len() as u32);
        let eot = s.alloc(2 * names.len() as u32);
        let dll = s.push_cstr(dll_name);
        for (i, (name, slot)) in names.iter().enumerate() {
            let name_rva = s.push_cstr(name);
            s.put_u32(npt + 4 * i as u32, name_rva);
            s.put_u16(eot + 2 * i as u32, *slot);
        }
        for (i, e) in entries.iter().enumerate() {
            let value = match e {
                ExportSpec::Code { rva, .. } => *rva,
                ExportSpec::Forward { target, .. } => s.push_cstr(target),
                ExportSpec::Unused => 0,
            };
            s.put_u32(eat + 4 * i as u32, value);
        }
        s.put_u32(dir + 12, dll);
        s.put_u32(dir + 16, base);
        s.put_u32(dir + 20, entries.len() as u32);
        s.put_u32(dir + 24, names.len() as u32);
        s.put_u32(dir + 28, eat);
        s.put_u32(dir + 32, npt);
        s.put_u32(dir + 36, eot);
        let size = s.end_rva() - dir;
        self.set_directory(DataDirectoryKind::Export, dir, size);
        dir
    }

    // `name_base` is added to the address of each hint/name entry
    fn thunk_array(&mut self, symbols: &[ImportSpec], name_base: u64) -> u32 {
        let width = if self.is_64 { 8 } else { 4 };
        let table = self.section.alloc(width * (symbols.len() as u32 + 1));
        for (i, sym) in symbols.iter().enumerate() {
            let at = table + width * i as u32;
            let value: u64 = match sym {
                ImportSpec::Ordinal(o) => {
                    let flag = if self.is_64 { 1u64 << 63 } else { 1u64 << 31 };
                    flag | u64::from(*o)
                }
                ImportSpec::Name(name, hint) => {
                    let hn = self.section.alloc(2 + name.len() as u32 + 1);
                    self.section.put_u16(hn, *hint);
                    for (j, b) in name.bytes().enumerate() {
                        self.section.put_u8(hn + 2 + j as u32, b);
                    }
                    name_base + u64::from(hn)
                }
            };
            if self.is_64 {
                self.section.put_u64(at, value);
            } else {
                self.section.put_u32(at, value as u32);
            }
        }
        table
    }

    /// Lay out an import directory; returns its RVA
    pub fn imports(&mut self, modules: &[ModuleSpec]) -> u32 {
        let descriptors = self.section.alloc(20 * (modules.len() as u32 + 1));
        for (i, m) in modules.iter().enumerate() {
            let d = descriptors + 20 * i as u32;
            let lookup = self.thunk_array(&m.symbols, 0);
            let iat = self.thunk_array(&m.symbols, 0);
            let name = self.section.push_cstr(m.name);
            if !self.omit_lookup_tables {
                self.section.put_u32(d, lookup);
            }
            self.section.put_u32(d + 12, name);
            self.section.put_u32(d + 16, iat);
        }
        let size = 20 * (modules.len() as u32 + 1);
        self.set_directory(DataDirectoryKind::Import, descriptors, size);
        descriptors
    }

    /// Lay out a delay-load directory; returns its RVA
    ///
    /// Descriptors are RVA-based unless `va_based_delay_imports` was called, which only fits
    /// PE32 images since the fields are 32 bits wide.
    pub fn delay_imports(&mut self, modules: &[ModuleSpec]) -> u32 {
        let (attributes, base) = if self.va_based_delay_imports {
            (0, self.image_base())
        } else {
            (1, 0)
        };
        let descriptors = self.section.alloc(32 * (modules.len() as u32 + 1));
        for (i, m) in modules.iter().enumerate() {
            let d = descriptors + 32 * i as u32;
            let handle = self.section.alloc(8);
            let iat = self.thunk_array(&m.symbols, base);
            let names = self.thunk_array(&m.symbols, base);
            let name = self.section.push_cstr(m.name);
            let base = base as u32;
            self.section.put_u32(d, attributes);
            self.section.put_u32(d + 4, base + name);
            self.section.put_u32(d + 8, base + handle);
            self.section.put_u32(d + 12, base + iat);
            self.section.put_u32(d + 16, base + names);
        }
        let size = 32 * (modules.len() as u32 + 1);
        self.set_directory(DataDirectoryKind::DelayImport, descriptors, size);
        descriptors
    }

    fn resource_string(&mut self, root: u32, s: &str) -> u32 {
        let units: Vec<u16> = s.encode_utf16().collect();
        let at = self.section.alloc(2 + 2 * units.len() as u32);
        self.section.put_u16(at, units.len() as u16);
        for (i, u) in units.iter().enumerate() {
            self.section.put_u16(at + 2 + 2 * i as u32, *u);
        }
        (at - root) | (1 << 31)
    }

    fn resource_id(&mut self, root: u32, id: ResId) -> u32 {
        match id {
            ResId::Id(v) => u32::from(v),
            ResId::Name(s) => self.resource_string(root, s),
        }
    }

    fn resource_table(&mut self, named: usize, ids: usize) -> u32 {
        let table = self.section.alloc(16 + 8 * (named + ids) as u32);
        self.section.put_u16(table + 12, named as u16);
        self.section.put_u16(table + 14, ids as u16);
        table
    }

    /// Lay out a three-level resource tree; returns the RVA of its root table
    pub fn resources(&mut self, specs: &[ResourceSpec]) -> u32 {
        fn group<'a, T>(items: Vec<(ResId<'a>, T)>) -> Vec<(ResId<'a>, Vec<T>)> {
            let mut out: Vec<(ResId<'a>, Vec<T>)> = Vec::new();
            for (k, v) in items {
                match out.iter_mut().find(|(key, _)| *key == k) {
                    Some((_, vs)) => vs.push(v),
                    None => out.push((k, vec![v])),
                }
            }
            // the format stores named entries before id entries
            out.sort_by_key(|(k, _)| matches!(k, ResId::Id(_)));
            out
        }
        fn named_count<T>(v: &[(ResId, T)]) -> usize {
            v.iter().filter(|(k, _)| matches!(k, ResId::Name(_))).count()
        }

        let types = group(specs.iter().map(|s| (s.kind, s)).collect());
        let root = self.resource_table(named_count(&types), types.len() - named_count(&types));
        for (ti, (kind, members)) in types.iter().enumerate() {
            let names = group(members.iter().map(|s| (s.name, *s)).collect());
            let name_table =
                self.resource_table(named_count(&names), names.len() - named_count(&names));
            let entry = root + 16 + 8 * ti as u32;
            let kind_field = self.resource_id(root, *kind);
            self.section.put_u32(entry, kind_field);
            self.section.put_u32(entry + 4, (name_table - root) | (1 << 31));
            for (ni, (name, langs)) in names.iter().enumerate() {
                let lang_table = self.resource_table(0, langs.len());
                let entry = name_table + 16 + 8 * ni as u32;
                let name_field = self.resource_id(root, *name);
                self.section.put_u32(entry, name_field);
                self.section.put_u32(entry + 4, (lang_table - root) | (1 << 31));
                for (li, spec) in langs.iter().enumerate() {
                    let leaf = self.section.alloc(16);
                    let data = self.section.push_bytes(spec.data);
                    self.section.put_u32(leaf, data);
                    self.section.put_u32(leaf + 4, spec.data.len() as u32);
                    self.section.put_u32(leaf + 8, 1252);
                    let entry = lang_table + 16 + 8 * li as u32;
                    self.section.put_u32(entry, u32::from(spec.lang));
                    self.section.put_u32(entry + 4, leaf - root);
                }
            }
        }
        let size = self.section.end_rva() - root;
        self.set_directory(DataDirectoryKind::Resource, root, size);
        root
    }

    pub fn finish(&self) -> Vec<u8> {
        let optional_size: u16 = if self.is_64 { 240 } else { 224 };
        let raw_size = align_up(self.section.bytes.len() as u32, FILE_ALIGNMENT);
        let mut out = vec![0u8; SECTION_RAW_PTR as usize];

        out[0..2].copy_from_slice(b"MZ");
        out[0x3C..0x40].copy_from_slice(&0x40u32.to_le_bytes());

        let mut at = 0x40;
        let mut put = |out: &mut Vec<u8>, bytes: &[u8]| {
            out[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        put(&mut out, b"PE\0\0");
        let machine: u16 = if self.is_64 { 0x8664 } else { 0x014C };
        put(&mut out, &machine.to_le_bytes());
        put(&mut out, &1u16.to_le_bytes());
        put(&mut out, &[0u8; 12]);
        put(&mut out, &optional_size.to_le_bytes());
        put(&mut out, &0x2102u16.to_le_bytes());

        let opt = 0x58;
        let magic: u16 = if self.is_64 { 0x020B } else { 0x010B };
        out[opt..opt + 2].copy_from_slice(&magic.to_le_bytes());
        if self.is_64 {
            out[opt + 24..opt + 32].copy_from_slice(&self.image_base().to_le_bytes());
        } else {
            out[opt + 28..opt + 32].copy_from_slice(&(self.image_base() as u32).to_le_bytes());
        }
        out[opt + 32..opt + 36].copy_from_slice(&0x1000u32.to_le_bytes());
        out[opt + 36..opt + 40].copy_from_slice(&FILE_ALIGNMENT.to_le_bytes());
        let size_of_image = align_up(SECTION_RVA + raw_size + self.zero_fill, 0x1000);
        out[opt + 56..opt + 60].copy_from_slice(&size_of_image.to_le_bytes());
        out[opt + 60..opt + 64].copy_from_slice(&SECTION_RAW_PTR.to_le_bytes());
        let fixed = if self.is_64 { 112 } else { 96 };
        out[opt + fixed - 4..opt + fixed].copy_from_slice(&(DATA_DIRECTORY_SLOTS as u32).to_le_bytes());
        for (i, (rva, size)) in self.directories.iter().enumerate() {
            let d = opt + fixed + 8 * i;
            out[d..d + 4].copy_from_slice(&rva.to_le_bytes());
            out[d + 4..d + 8].copy_from_slice(&size.to_le_bytes());
        }

        let sh = opt + optional_size as usize;
        out[sh..sh + 6].copy_from_slice(b".rdata");
        out[sh + 8..sh + 12].copy_from_slice(&(raw_size + self.zero_fill).to_le_bytes());
        out[sh + 12..sh + 16].copy_from_slice(&SECTION_RVA.to_le_bytes());
        out[sh + 16..sh + 20].copy_from_slice(&raw_size.to_le_bytes());
        out[sh + 20..sh + 24].copy_from_slice(&SECTION_RAW_PTR.to_le_bytes());
        out[sh + 36..sh + 40].copy_from_slice(&0x4000_0040u32.to_le_bytes());

        out.extend_from_slice(&self.section.bytes);
        out.resize((SECTION_RAW_PTR + raw_size) as usize, 0);
        out
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<PathBuf> {
        fs_err::write(path, self.finish())?;
        Ok(path.to_owned())
    }
}

/// A DLL exporting the given names, each at its own code RVA
pub(crate) fn dll_exporting(dll_name: &str, names: &[&str]) -> ImageBuilder {
    let mut b = ImageBuilder::new(true);
    let entries: Vec<ExportSpec> = names
        .iter()
        .enumerate()
        .map(|(i, n)| ExportSpec::Code {
            name: Some(*n),
            rva: 0x8000 + 0x10 * i as u32,
        })
        .collect();
    b.exports(dll_name, 1, &entries);
    b
}
