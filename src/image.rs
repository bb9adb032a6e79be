//! Binary container reader: legacy stub, COFF/PE headers, section table and RVA translation

use crate::common::{Diagnostics, FormatError};
pub use crate::raw::DataDirectory;
use crate::raw::{self, CoffHeader, OptionalHeader32, OptionalHeader64, SectionHeader, StubHeader};
use serde::Serialize;
use std::borrow::Cow;
use std::mem::size_of;

/// Fixed enumeration indexing the data-directory array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DataDirectoryKind {
    Export = 0,
    Import,
    Resource,
    Exception,
    Certificate,
    Relocation,
    Debug,
    Architecture,
    GlobalPtr,
    Tls,
    LoadConfig,
    BoundImport,
    ImportAddress,
    DelayImport,
    ClrHeader,
    Reserved,
}

pub const DATA_DIRECTORY_SLOTS: usize = 16;

/// Metadata derived once from the headers of a loaded binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub pe_header_start: u32,
    pub is_pe32: bool,
    pub machine: u16,
    pub characteristics: u16,
    pub image_base: u64,
    pub data_directory_count: u32,
    pub data_directory_start: u64,
    pub section_count: u16,
    pub section_headers_start: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_ptr: u32,
    pub raw_size: u32,
    pub characteristics: u32,
}

impl Section {
    fn from_header(h: &SectionHeader) -> Self {
        let len = h.name.iter().position(|&b| b == 0).unwrap_or(h.name.len());
        Self {
            name: String::from_utf8_lossy(&h.name[..len]).into_owned(),
            virtual_address: h.virtual_address,
            virtual_size: h.virtual_size,
            raw_ptr: h.pointer_to_raw_data,
            raw_size: h.size_of_raw_data,
            characteristics: h.characteristics,
        }
    }

    fn raw_end(&self) -> u64 {
        u64::from(self.raw_ptr) + u64::from(self.raw_size)
    }
}

/// Where an RVA lives on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskLocation {
    /// index into the section table
    pub section: usize,
    /// file offset
    pub offset: u64,
}

/// A validated view over the bytes of one binary
#[derive(Debug, Clone)]
pub struct Image<'a> {
    data: &'a [u8],
    info: ImageInfo,
    directories: Vec<DataDirectory>,
    sections: Vec<Section>,
}

impl<'a> Image<'a> {
    /// Validate the headers of a binary and build its metadata
    ///
    /// Each step is checked against the buffer length before the next one proceeds; the first
    /// violation is returned and nothing partial is kept.
    pub fn parse(data: &'a [u8], diagnostics: &mut Diagnostics) -> Result<Self, FormatError> {
        let stub: StubHeader = raw::read(data, 0, "legacy stub header")?;
        if stub.e_magic != raw::STUB_SIGNATURE {
            return Err(FormatError::BadStubSignature(stub.e_magic));
        }

        let pe_start = u64::from(stub.e_lfanew);
        let signature: u32 = raw::read(data, pe_start, "PE signature")?;
        if signature != raw::PE_SIGNATURE {
            return Err(FormatError::BadPeSignature(signature));
        }
        let coff: CoffHeader = raw::read(data, pe_start + 4, "COFF header")?;

        let optional_start = pe_start + 4 + size_of::<CoffHeader>() as u64;
        let magic: u16 = raw::read(data, optional_start, "optional header magic")?;
        let (is_pe32, image_base, data_directory_count, fixed_size) = match magic {
            raw::PE32_MAGIC => {
                let oh: OptionalHeader32 = raw::read(data, optional_start, "PE32 optional header")?;
                (
                    true,
                    u64::from(oh.image_base),
                    oh.number_of_rva_and_sizes,
                    size_of::<OptionalHeader32>() as u64,
                )
            }
            raw::PE32_PLUS_MAGIC => {
                let oh: OptionalHeader64 =
                    raw::read(data, optional_start, "PE32+ optional header")?;
                (
                    false,
                    oh.image_base,
                    oh.number_of_rva_and_sizes,
                    size_of::<OptionalHeader64>() as u64,
                )
            }
            other => return Err(FormatError::BadOptionalHeaderMagic(other)),
        };

        let required = fixed_size
            + u64::from(data_directory_count) * size_of::<DataDirectory>() as u64;
        if u64::from(coff.size_of_optional_header) < required {
            return Err(FormatError::OptionalHeaderTooSmall {
                declared: coff.size_of_optional_header,
                required,
            });
        }
        if data_directory_count as usize > DATA_DIRECTORY_SLOTS {
            diagnostics.warn(format!(
                "data directory count {data_directory_count} exceeds {DATA_DIRECTORY_SLOTS}, extra entries ignored"
            ));
        }

        let data_directory_start = optional_start + fixed_size;
        let directories = (0..u64::from(data_directory_count).min(DATA_DIRECTORY_SLOTS as u64))
            .map(|i| {
                raw::read::<DataDirectory>(
                    data,
                    data_directory_start + i * size_of::<DataDirectory>() as u64,
                    "data directory",
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let section_headers_start = optional_start + u64::from(coff.size_of_optional_header);
        let section_table_len =
            u64::from(coff.number_of_sections) * size_of::<SectionHeader>() as u64;
        if section_headers_start + section_table_len > data.len() as u64 {
            return Err(FormatError::Truncated {
                what: "section table",
                offset: section_headers_start,
                needed: section_table_len,
                file_size: data.len() as u64,
            });
        }
        let sections = (0..u64::from(coff.number_of_sections))
            .map(|i| {
                raw::read::<SectionHeader>(
                    data,
                    section_headers_start + i * size_of::<SectionHeader>() as u64,
                    "section header",
                )
                .map(|h| Section::from_header(&h))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for s in &sections {
            if s.raw_end() > data.len() as u64 {
                diagnostics.warn(format!(
                    "raw data of section {} extends past the end of the file",
                    s.name
                ));
            }
        }

        Ok(Self {
            data,
            info: ImageInfo {
                pe_header_start: stub.e_lfanew,
                is_pe32,
                machine: coff.machine,
                characteristics: coff.characteristics,
                image_base,
                data_directory_count,
                data_directory_start,
                section_count: coff.number_of_sections,
                section_headers_start,
            },
            directories,
            sections,
        })
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// The data directory of the given kind, or `None` if the image declares fewer directories
    /// or the entry is empty
    pub fn directory(&self, kind: DataDirectoryKind) -> Option<DataDirectory> {
        self.directories
            .get(kind as usize)
            .copied()
            .filter(|d| !d.is_empty())
    }

    /// Translate an RVA to its file offset
    ///
    /// With a section hint only that section is considered. An RVA inside the zero-filled tail
    /// of a section (beyond its raw data, within its virtual size) fails with
    /// `RvaNotOnDisk`; an RVA that no section covers fails with `RvaUnmapped`.
    pub fn rva_to_disk(&self, rva: u32, hint: Option<usize>) -> Result<DiskLocation, FormatError> {
        let rva64 = u64::from(rva);
        let candidates: Box<dyn Iterator<Item = (usize, &Section)>> = match hint {
            Some(i) => Box::new(self.sections.get(i).map(|s| (i, s)).into_iter()),
            None => Box::new(self.sections.iter().enumerate()),
        };
        for (i, s) in candidates {
            let va = u64::from(s.virtual_address);
            let raw_end = va + u64::from(s.raw_size);
            let virtual_end = va + u64::from(s.virtual_size);
            if rva64 >= va && rva64 < raw_end {
                return Ok(DiskLocation {
                    section: i,
                    offset: u64::from(s.raw_ptr) + (rva64 - va),
                });
            }
            if rva64 >= raw_end && rva64 < virtual_end {
                return Err(FormatError::RvaNotOnDisk {
                    rva,
                    section: s.name.clone(),
                });
            }
        }
        Err(FormatError::RvaUnmapped { rva })
    }

    /// Translate `[rva, rva + len)` and check it is backed by the raw data of a single section
    /// and by the file
    pub(crate) fn span(
        &self,
        rva: u32,
        len: u64,
        hint: Option<usize>,
        what: &'static str,
    ) -> Result<DiskLocation, FormatError> {
        let loc = self.rva_to_disk(rva, hint)?;
        let section_end = self.sections[loc.section].raw_end();
        if loc.offset + len > section_end {
            return Err(FormatError::OutOfSection { what, rva, len });
        }
        if loc.offset + len > self.data.len() as u64 {
            return Err(FormatError::Truncated {
                what,
                offset: loc.offset,
                needed: len,
                file_size: self.data.len() as u64,
            });
        }
        Ok(loc)
    }

    /// Read a `T` stored at an RVA
    pub(crate) fn read_at<T: dataview::Pod>(
        &self,
        rva: u32,
        hint: Option<usize>,
        what: &'static str,
    ) -> Result<(T, DiskLocation), FormatError> {
        let loc = self.span(rva, size_of::<T>() as u64, hint, what)?;
        Ok((raw::read(self.data, loc.offset, what)?, loc))
    }

    /// Read a NUL-terminated string stored at an RVA; the terminator must lie within the raw
    /// data of the same section
    pub(crate) fn read_cstr(
        &self,
        rva: u32,
        hint: Option<usize>,
        what: &'static str,
    ) -> Result<Cow<'a, str>, FormatError> {
        let loc = self.rva_to_disk(rva, hint)?;
        let end = self.sections[loc.section]
            .raw_end()
            .min(self.data.len() as u64);
        if loc.offset >= end {
            return Err(FormatError::UnterminatedString { what, rva });
        }
        let bytes = &self.data[loc.offset as usize..end as usize];
        let len = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or(FormatError::UnterminatedString { what, rva })?;
        Ok(String::from_utf8_lossy(&bytes[..len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ImageBuilder, SECTION_RAW_PTR, SECTION_RVA};

    #[test]
    fn parse_pe32_headers() -> Result<(), FormatError> {
        let bytes = ImageBuilder::new(false).finish();
        let mut diag = Diagnostics::new();
        let image = Image::parse(&bytes, &mut diag)?;
        let info = image.info();
        assert!(info.is_pe32);
        assert_eq!(info.image_base, 0x1000_0000);
        assert_eq!(info.data_directory_count, 16);
        assert_eq!(info.section_count, 1);
        assert_eq!(image.sections()[0].name, ".rdata");
        assert!(image.directory(DataDirectoryKind::Import).is_none());
        assert!(diag.is_empty());
        Ok(())
    }

    #[test]
    fn parse_pe32_plus_headers() -> Result<(), FormatError> {
        let bytes = ImageBuilder::new(true).finish();
        let image = Image::parse(&bytes, &mut Diagnostics::new())?;
        assert!(!image.info().is_pe32);
        assert_eq!(image.info().image_base, 0x1_8000_0000);
        assert_eq!(image.info().section_headers_start, 0x40 + 24 + 240);
        Ok(())
    }

    #[test]
    fn bad_signatures() {
        let mut bytes = ImageBuilder::new(false).finish();
        bytes[0] = b'Z';
        assert!(matches!(
            Image::parse(&bytes, &mut Diagnostics::new()),
            Err(FormatError::BadStubSignature(_))
        ));

        let mut bytes = ImageBuilder::new(false).finish();
        bytes[0x41] = b'X';
        assert!(matches!(
            Image::parse(&bytes, &mut Diagnostics::new()),
            Err(FormatError::BadPeSignature(_))
        ));

        let mut bytes = ImageBuilder::new(false).finish();
        bytes[0x58] = 0x07;
        assert!(matches!(
            Image::parse(&bytes, &mut Diagnostics::new()),
            Err(FormatError::BadOptionalHeaderMagic(0x0107))
        ));
    }

    #[test]
    fn truncated_headers_fail_cleanly() {
        let bytes = ImageBuilder::new(true).finish();
        let headers_end = 0x40 + 24 + 240 + 40;
        for len in 0..headers_end {
            let res = Image::parse(&bytes[..len], &mut Diagnostics::new());
            assert!(
                matches!(res, Err(FormatError::Truncated { .. })),
                "prefix of {len} bytes: {res:?}"
            );
        }
    }

    #[test]
    fn too_many_data_directories_for_optional_header() {
        let mut bytes = ImageBuilder::new(false).finish();
        // NumberOfRvaAndSizes of a PE32 header sits at optional header + 92
        let at = 0x58 + 92;
        bytes[at..at + 4].copy_from_slice(&0x1000_0000u32.to_le_bytes());
        assert!(matches!(
            Image::parse(&bytes, &mut Diagnostics::new()),
            Err(FormatError::OptionalHeaderTooSmall { .. })
        ));
    }

    #[test]
    fn rva_translation() -> Result<(), FormatError> {
        let mut builder = ImageBuilder::new(false);
        builder.section_mut().alloc(0x10);
        builder.set_zero_fill(0x800);
        let bytes = builder.finish();
        let image = Image::parse(&bytes, &mut Diagnostics::new())?;
        let s = image.sections()[0].clone();
        assert_eq!(s.raw_size, 0x200);

        for delta in 0..s.raw_size {
            let loc = image.rva_to_disk(SECTION_RVA + delta, None)?;
            assert_eq!(loc.section, 0);
            assert_eq!(loc.offset, u64::from(SECTION_RAW_PTR + delta));
            assert!(loc.offset < u64::from(s.raw_ptr + s.raw_size));
        }
        assert_eq!(
            image.rva_to_disk(SECTION_RVA + 4, Some(0))?.offset,
            u64::from(SECTION_RAW_PTR + 4)
        );

        assert!(matches!(
            image.rva_to_disk(SECTION_RVA + s.raw_size, None),
            Err(FormatError::RvaNotOnDisk { .. })
        ));
        assert!(matches!(
            image.rva_to_disk(SECTION_RVA - 1, None),
            Err(FormatError::RvaUnmapped { .. })
        ));
        assert!(matches!(
            image.rva_to_disk(SECTION_RVA + 0x10_0000, None),
            Err(FormatError::RvaUnmapped { .. })
        ));
        assert!(matches!(
            image.rva_to_disk(SECTION_RVA, Some(3)),
            Err(FormatError::RvaUnmapped { .. })
        ));
        Ok(())
    }

    #[test]
    fn span_and_strings_stay_in_section() -> Result<(), FormatError> {
        let mut builder = ImageBuilder::new(false);
        let rva = builder.section_mut().push_cstr("KERNEL32.dll");
        let bytes = builder.finish();
        let image = Image::parse(&bytes, &mut Diagnostics::new())?;
        assert_eq!(image.read_cstr(rva, None, "name")?, "KERNEL32.dll");
        assert!(matches!(
            image.span(SECTION_RVA + 0x1F0, 0x20, None, "table"),
            Err(FormatError::OutOfSection { .. })
        ));
        Ok(())
    }

    #[test]
    fn unterminated_string() -> Result<(), FormatError> {
        let mut builder = ImageBuilder::new(false);
        let sect = builder.section_mut();
        let rva = sect.alloc(0x200);
        for i in 0..0x200 {
            sect.put_u8(rva + i, b'A');
        }
        let bytes = builder.finish();
        let image = Image::parse(&bytes, &mut Diagnostics::new())?;
        assert!(matches!(
            image.read_cstr(rva + 0x100, None, "name"),
            Err(FormatError::UnterminatedString { .. })
        ));
        Ok(())
    }
}
