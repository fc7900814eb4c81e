//! Records exchanged between the enumeration side and the container builder.

/// Architecture page size. Both the scanner and the reconciliation engine
/// assume 4 KiB pages.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_BITS: u32 = 12;

/// Windows memory type flag for mapped (section-backed) regions.
pub const MEM_MAPPED: u32 = 0x40000;
/// Windows memory type flag for private (heap/stack) regions.
pub const MEM_PRIVATE: u32 = 0x20000;

/// One loaded module of the target process, as enumerated from its loader
/// data. `base..base + size` is a claim, not a guarantee: parts of the span
/// may be paged out or otherwise absent from the live address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub path: String,
    pub base: u64,
    pub size: u64,
}

impl ModuleDescriptor {
    /// End of the claimed span. Saturates: a corrupt loader entry must not
    /// panic the run.
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

/// Backing type of a live region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegionType {
    #[default]
    Unknown,
    Mapped,
    Private,
}

impl RegionType {
    /// The `MEM_*` flag value written into the container.
    pub fn as_flag(self) -> u32 {
        match self {
            RegionType::Unknown => 0,
            RegionType::Mapped => MEM_MAPPED,
            RegionType::Private => MEM_PRIVATE,
        }
    }
}

/// One contiguous run of same-attribute memory in the reconstructed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub allocation_base: u64,
    pub allocation_protect: u32,
    pub region_size: u64,
    pub protect: u32,
    pub state: u32,
    pub region_type: RegionType,
}

impl MemoryRegion {
    /// Region record carrying no protection metadata, used for spans the
    /// reconciliation engine synthesized rather than enumerated.
    pub fn bare(base: u64, region_size: u64) -> Self {
        Self {
            base,
            allocation_base: 0,
            allocation_protect: 0,
            region_size,
            protect: 0,
            state: 0,
            region_type: RegionType::Unknown,
        }
    }
}

/// The bytes recovered for one operation of the reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryContentBlock {
    pub start: u64,
    pub bytes: Vec<u8>,
}

impl MemoryContentBlock {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// OS identity of the captured machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
}

/// Everything one run collected, handed to the container builder exactly
/// once. Regions and content blocks are parallel sequences: entry `i` of
/// each describes the same span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DumpAssembly {
    pub system_info: Option<SystemInfo>,
    pub modules: Vec<ModuleDescriptor>,
    pub regions: Vec<MemoryRegion>,
    pub content: Vec<MemoryContentBlock>,
    pub secure_world: Option<Vec<u8>>,
}
