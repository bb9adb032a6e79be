//! On-disk layouts of the PE/COFF structures the decoders read
//!
//! Every structure is plain old data with the exact size the format mandates; values are read
//! unaligned from the file buffer and only after the containing range has been bounds-checked.

use crate::common::FormatError;
use dataview::{DataView, Pod};
use std::mem::size_of;

pub(crate) const STUB_SIGNATURE: u16 = 0x5A4D; // "MZ"
pub(crate) const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub(crate) const PE32_MAGIC: u16 = 0x010B;
pub(crate) const PE32_PLUS_MAGIC: u16 = 0x020B;

#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub(crate) struct StubHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    pub e_lfanew: u32,
}

#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub(crate) struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Standard and Windows-specific fields of a PE32 optional header, data directories excluded
#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub(crate) struct OptionalHeader32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// Standard and Windows-specific fields of a PE32+ optional header, data directories excluded
#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub(crate) struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, serde::Serialize)]
#[repr(C)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_empty(&self) -> bool {
        self.virtual_address == 0 || self.size == 0
    }

    /// Whether an RVA falls inside the range this directory declares
    pub fn contains(&self, rva: u32) -> bool {
        let start = u64::from(self.virtual_address);
        let end = start + u64::from(self.size);
        (start..end).contains(&u64::from(rva))
    }
}

#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub(crate) struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod)]
#[repr(C)]
pub(crate) struct ImportDescriptor {
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name: u32,
    pub first_thunk: u32,
}

impl ImportDescriptor {
    pub fn is_sentinel(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod)]
#[repr(C)]
pub(crate) struct DelayLoadDescriptor {
    pub attributes: u32,
    pub dll_name_rva: u32,
    pub module_handle_rva: u32,
    pub import_address_table_rva: u32,
    pub import_name_table_rva: u32,
    pub bound_import_address_table_rva: u32,
    pub unload_information_table_rva: u32,
    pub time_date_stamp: u32,
}

impl DelayLoadDescriptor {
    pub fn is_sentinel(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub(crate) struct ExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name: u32,
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub(crate) struct ResourceDirectoryTable {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub number_of_named_entries: u16,
    pub number_of_id_entries: u16,
}

/// Bit 31 of either field tags the other interpretation: name string vs. numeric id in `name`,
/// subdirectory vs. leaf data entry in `offset`
#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub(crate) struct ResourceDirectoryEntry {
    pub name: u32,
    pub offset: u32,
}

#[derive(Copy, Clone, Debug, Default, Pod)]
#[repr(C)]
pub(crate) struct ResourceDataEntry {
    pub data_rva: u32,
    pub size: u32,
    pub code_page: u32,
    pub reserved: u32,
}

pub(crate) const HIGH_BIT: u32 = 1 << 31;

/// Read a `T` at a file offset, failing instead of reading past the end of the buffer
pub(crate) fn read<T: Pod>(data: &[u8], offset: u64, what: &'static str) -> Result<T, FormatError> {
    let needed = size_of::<T>() as u64;
    let file_size = data.len() as u64;
    let truncated = || FormatError::Truncated {
        what,
        offset,
        needed,
        file_size,
    };
    match offset.checked_add(needed) {
        Some(end) if end <= file_size => {}
        _ => return Err(truncated()),
    }
    // the range check above guarantees the offset fits in usize
    DataView::from(data)
        .try_read::<T>(offset as usize)
        .ok_or_else(truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_are_bit_exact() {
        assert_eq!(size_of::<StubHeader>(), 64);
        assert_eq!(size_of::<CoffHeader>(), 20);
        assert_eq!(size_of::<OptionalHeader32>(), 96);
        assert_eq!(size_of::<OptionalHeader64>(), 112);
        assert_eq!(size_of::<DataDirectory>(), 8);
        assert_eq!(size_of::<SectionHeader>(), 40);
        assert_eq!(size_of::<ImportDescriptor>(), 20);
        assert_eq!(size_of::<DelayLoadDescriptor>(), 32);
        assert_eq!(size_of::<ExportDirectory>(), 40);
        assert_eq!(size_of::<ResourceDirectoryTable>(), 16);
        assert_eq!(size_of::<ResourceDirectoryEntry>(), 8);
        assert_eq!(size_of::<ResourceDataEntry>(), 16);
    }

    #[test]
    fn read_never_passes_the_end() {
        let data = [1u8, 0, 0, 0, 2, 0];
        assert_eq!(read::<u32>(&data, 0, "value"), Ok(1));
        assert!(matches!(
            read::<u32>(&data, 4, "value"),
            Err(FormatError::Truncated { offset: 4, needed: 4, file_size: 6, .. })
        ));
        assert!(read::<u32>(&data, u64::MAX - 1, "value").is_err());
    }
}
