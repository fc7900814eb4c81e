//! Minidump encoding of a [`DumpAssembly`].
//!
//! Writes the four streams credential-extraction tooling expects from a
//! full-memory process dump: SystemInfo, ModuleList, MemoryInfoList and
//! Memory64List. The secure-world blob, when present, rides along as a
//! user-defined stream so the main container stays self-contained.
//!
//! Layout is fixed: header, stream directory, metadata streams, then the
//! raw memory content last so every directory RVA fits in 32 bits.

use std::io::{Cursor, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use physdump::builder::{BuildError, ContainerBuilder};
use physdump::model::{DumpAssembly, MemoryRegion, ModuleDescriptor, SystemInfo};

const SIGNATURE: u32 = 0x504D_444D; // "MDMP"
const VERSION: u32 = 0xA793;
const FLAG_FULL_MEMORY: u64 = 0x2;

const STREAM_MODULE_LIST: u32 = 4;
const STREAM_SYSTEM_INFO: u32 = 7;
const STREAM_MEMORY64_LIST: u32 = 9;
const STREAM_MEMORY_INFO_LIST: u32 = 16;
/// User-defined stream range starts past LastReservedStream (0xffff).
const STREAM_SECURE_WORLD: u32 = 0x1_0000;

const HEADER_SIZE: usize = 32;
const DIR_ENTRY_SIZE: usize = 12;
const SYSTEM_INFO_SIZE: usize = 56;
const MODULE_ENTRY_SIZE: usize = 108;
const MEMINFO_HEADER_SIZE: usize = 16;
const MEMINFO_ENTRY_SIZE: usize = 48;
const DESCRIPTOR64_SIZE: usize = 16;
// u32 length prefix, no characters, u16 terminator.
const EMPTY_STRING_SIZE: usize = 6;

const PROCESSOR_ARCHITECTURE_AMD64: u16 = 9;
const VER_PLATFORM_WIN32_NT: u32 = 2;
const VER_NT_WORKSTATION: u8 = 1;

/// Encodes assemblies into minidump buffers.
pub struct MinidumpBuilder {
    timestamp: u32,
}

impl MinidumpBuilder {
    pub fn new() -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Self { timestamp }
    }

    /// Fixed header timestamp, for reproducible buffers.
    pub fn with_timestamp(timestamp: u32) -> Self {
        Self { timestamp }
    }
}

impl Default for MinidumpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerBuilder for MinidumpBuilder {
    fn build(&self, assembly: &DumpAssembly) -> Result<Vec<u8>, BuildError> {
        let system_info = assembly.system_info.ok_or(BuildError::MissingSystemInfo)?;
        if assembly.modules.is_empty() {
            return Err(BuildError::MissingModules);
        }
        if assembly.regions.is_empty() {
            return Err(BuildError::MissingMemory);
        }
        if assembly.regions.len() != assembly.content.len() {
            return Err(BuildError::Inconsistent {
                regions: assembly.regions.len(),
                blocks: assembly.content.len(),
            });
        }

        let layout = Layout::of(assembly);
        let mut w = Cursor::new(Vec::with_capacity(layout.total_len));

        write_header(&mut w, &layout, self.timestamp)?;
        write_directory(&mut w, &layout)?;
        write_system_info(&mut w, &layout, &system_info)?;
        write_empty_string(&mut w)?;
        write_module_list(&mut w, &layout, &assembly.modules)?;
        write_memory_info_list(&mut w, &assembly.regions)?;
        if let Some(blob) = &assembly.secure_world {
            w.write_all(blob)?;
        }
        write_memory64_list(&mut w, &layout, assembly)?;

        let buffer = w.into_inner();
        debug_assert_eq!(buffer.len(), layout.total_len);
        Ok(buffer)
    }
}

/// Precomputed stream offsets; everything downstream of the directory is
/// position-dependent, so the whole file is laid out before a byte is
/// written.
struct Layout {
    stream_count: usize,
    system_info_off: usize,
    csd_off: usize,
    module_list_off: usize,
    module_list_len: usize,
    module_names_off: usize,
    meminfo_off: usize,
    meminfo_len: usize,
    secure_off: usize,
    secure_len: usize,
    mem64_off: usize,
    mem64_len: usize,
    total_len: usize,
}

impl Layout {
    fn of(assembly: &DumpAssembly) -> Self {
        let stream_count = 4 + usize::from(assembly.secure_world.is_some());
        let system_info_off = HEADER_SIZE + stream_count * DIR_ENTRY_SIZE;
        let csd_off = system_info_off + SYSTEM_INFO_SIZE;

        let module_list_off = csd_off + EMPTY_STRING_SIZE;
        let module_list_len = 4 + assembly.modules.len() * MODULE_ENTRY_SIZE;
        let module_names_off = module_list_off + module_list_len;
        let module_names_len: usize = assembly
            .modules
            .iter()
            .map(|m| encoded_string_len(&m.path))
            .sum();

        let meminfo_off = module_names_off + module_names_len;
        let meminfo_len = MEMINFO_HEADER_SIZE + assembly.regions.len() * MEMINFO_ENTRY_SIZE;

        let secure_off = meminfo_off + meminfo_len;
        let secure_len = assembly.secure_world.as_ref().map_or(0, Vec::len);

        let mem64_off = secure_off + secure_len;
        let mem64_len = 16 + assembly.content.len() * DESCRIPTOR64_SIZE;
        let content_len: usize = assembly.content.iter().map(|b| b.bytes.len()).sum();
        let total_len = mem64_off + mem64_len + content_len;

        Self {
            stream_count,
            system_info_off,
            csd_off,
            module_list_off,
            module_list_len,
            module_names_off,
            meminfo_off,
            meminfo_len,
            secure_off,
            secure_len,
            mem64_off,
            mem64_len,
            total_len,
        }
    }

    fn base_rva(&self) -> u64 {
        (self.mem64_off + self.mem64_len) as u64
    }
}

fn encoded_string_len(s: &str) -> usize {
    4 + 2 * (s.encode_utf16().count() + 1)
}

type W = Cursor<Vec<u8>>;

fn write_header(w: &mut W, layout: &Layout, timestamp: u32) -> Result<(), BuildError> {
    w.write_u32::<LittleEndian>(SIGNATURE)?;
    w.write_u32::<LittleEndian>(VERSION)?;
    w.write_u32::<LittleEndian>(layout.stream_count as u32)?;
    w.write_u32::<LittleEndian>(HEADER_SIZE as u32)?;
    w.write_u32::<LittleEndian>(0)?; // checksum, unused
    w.write_u32::<LittleEndian>(timestamp)?;
    w.write_u64::<LittleEndian>(FLAG_FULL_MEMORY)?;
    Ok(())
}

fn write_directory(w: &mut W, layout: &Layout) -> Result<(), BuildError> {
    fn entry(w: &mut W, stream: u32, len: usize, off: usize) -> Result<(), BuildError> {
        w.write_u32::<LittleEndian>(stream)?;
        w.write_u32::<LittleEndian>(len as u32)?;
        w.write_u32::<LittleEndian>(off as u32)?;
        Ok(())
    }

    entry(w, STREAM_SYSTEM_INFO, SYSTEM_INFO_SIZE, layout.system_info_off)?;
    entry(w, STREAM_MODULE_LIST, layout.module_list_len, layout.module_list_off)?;
    entry(w, STREAM_MEMORY_INFO_LIST, layout.meminfo_len, layout.meminfo_off)?;
    entry(w, STREAM_MEMORY64_LIST, layout.mem64_len, layout.mem64_off)?;
    if layout.stream_count == 5 {
        entry(w, STREAM_SECURE_WORLD, layout.secure_len, layout.secure_off)?;
    }
    Ok(())
}

fn write_system_info(w: &mut W, layout: &Layout, info: &SystemInfo) -> Result<(), BuildError> {
    w.write_u16::<LittleEndian>(PROCESSOR_ARCHITECTURE_AMD64)?;
    w.write_u16::<LittleEndian>(0)?; // processor level
    w.write_u16::<LittleEndian>(0)?; // processor revision
    w.write_u8(1)?; // number of processors
    w.write_u8(VER_NT_WORKSTATION)?;
    w.write_u32::<LittleEndian>(info.major_version)?;
    w.write_u32::<LittleEndian>(info.minor_version)?;
    w.write_u32::<LittleEndian>(info.build_number)?;
    w.write_u32::<LittleEndian>(VER_PLATFORM_WIN32_NT)?;
    w.write_u32::<LittleEndian>(layout.csd_off as u32)?;
    w.write_u16::<LittleEndian>(0)?; // suite mask
    w.write_u16::<LittleEndian>(0)?; // reserved2
    w.write_all(&[0u8; 24])?; // CPU_INFORMATION
    Ok(())
}

fn write_empty_string(w: &mut W) -> Result<(), BuildError> {
    w.write_u32::<LittleEndian>(0)?;
    w.write_u16::<LittleEndian>(0)?;
    Ok(())
}

fn write_minidump_string(w: &mut W, s: &str) -> Result<(), BuildError> {
    let units: Vec<u16> = s.encode_utf16().collect();
    w.write_u32::<LittleEndian>((units.len() * 2) as u32)?;
    for unit in units {
        w.write_u16::<LittleEndian>(unit)?;
    }
    w.write_u16::<LittleEndian>(0)?;
    Ok(())
}

fn write_module_list(
    w: &mut W,
    layout: &Layout,
    modules: &[ModuleDescriptor],
) -> Result<(), BuildError> {
    w.write_u32::<LittleEndian>(modules.len() as u32)?;

    let mut name_rva = layout.module_names_off;
    for module in modules {
        w.write_u64::<LittleEndian>(module.base)?;
        w.write_u32::<LittleEndian>(module.size as u32)?;
        w.write_u32::<LittleEndian>(0)?; // checksum
        w.write_u32::<LittleEndian>(0)?; // timestamp
        w.write_u32::<LittleEndian>(name_rva as u32)?;
        w.write_all(&[0u8; 52])?; // VS_FIXEDFILEINFO, not recoverable offline
        w.write_u64::<LittleEndian>(0)?; // CV record
        w.write_u64::<LittleEndian>(0)?; // misc record
        w.write_u64::<LittleEndian>(0)?; // reserved0
        w.write_u64::<LittleEndian>(0)?; // reserved1
        name_rva += encoded_string_len(&module.path);
    }

    for module in modules {
        write_minidump_string(w, &module.path)?;
    }
    Ok(())
}

fn write_memory_info_list(w: &mut W, regions: &[MemoryRegion]) -> Result<(), BuildError> {
    w.write_u32::<LittleEndian>(MEMINFO_HEADER_SIZE as u32)?;
    w.write_u32::<LittleEndian>(MEMINFO_ENTRY_SIZE as u32)?;
    w.write_u64::<LittleEndian>(regions.len() as u64)?;

    for region in regions {
        w.write_u64::<LittleEndian>(region.base)?;
        w.write_u64::<LittleEndian>(region.allocation_base)?;
        w.write_u32::<LittleEndian>(region.allocation_protect)?;
        w.write_u32::<LittleEndian>(0)?; // alignment
        w.write_u64::<LittleEndian>(region.region_size)?;
        w.write_u32::<LittleEndian>(region.state)?;
        w.write_u32::<LittleEndian>(region.protect)?;
        w.write_u32::<LittleEndian>(region.region_type.as_flag())?;
        w.write_u32::<LittleEndian>(0)?; // alignment
    }
    Ok(())
}

fn write_memory64_list(w: &mut W, layout: &Layout, assembly: &DumpAssembly) -> Result<(), BuildError> {
    w.write_u64::<LittleEndian>(assembly.content.len() as u64)?;
    w.write_u64::<LittleEndian>(layout.base_rva())?;

    for block in &assembly.content {
        w.write_u64::<LittleEndian>(block.start)?;
        w.write_u64::<LittleEndian>(block.size())?;
    }
    for block in &assembly.content {
        w.write_all(&block.bytes)?;
    }
    Ok(())
}
