//! Interface boundary to the memory-forensics engine.
//!
//! Address-space translation, profile resolution and the enumeration
//! plugins all live on the far side of [`ForensicsEngine`]. This crate only
//! consumes rows and byte buffers; it never walks page tables itself.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::RegionType;

/// Errors surfaced by an engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to read {size} bytes at {address:#x}")]
    ReadFailed { address: u64, size: usize },

    #[error("enumeration failed: {0}")]
    Enumeration(String),

    #[error("engine session error: {0}")]
    Session(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Caching behavior of the engine's metadata cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    Disabled,
    /// Entries expire on their own; the engine decides the horizon.
    #[default]
    Timed,
}

impl CacheMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheMode::Disabled => "disabled",
            CacheMode::Timed => "timed",
        }
    }
}

/// Everything the engine needs to bind a session to a capture image.
/// Passed once at construction; there is no ambient session state.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub image: PathBuf,
    pub dtb: Option<u64>,
    pub kernel_base: Option<u64>,
    pub cache_mode: CacheMode,
    pub cache_dir: PathBuf,
    pub profile_repositories: Vec<String>,
}

impl SessionConfig {
    pub fn new(image: PathBuf) -> Self {
        Self {
            image,
            dtb: None,
            kernel_base: None,
            cache_mode: CacheMode::Timed,
            cache_dir: PathBuf::from(".physdump_cache"),
            profile_repositories: vec![
                "https://github.com/google/rekall-profiles/raw/master".into(),
                "http://profiles.rekall-forensic.com".into(),
            ],
        }
    }
}

/// One process as reported by an enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    pub pid: u32,
    pub name: String,
}

/// One loaded module as reported by the loader-walk plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRow {
    pub path: String,
    pub base: u64,
    pub size: u64,
}

/// One live address range of a process, with its protection metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRow {
    pub start: u64,
    pub end: u64,
    pub protect: u32,
    pub kind: RegionType,
}

/// Key/value row from the engine's image-info enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledRow {
    pub key: String,
    pub value: String,
}

/// Page-frame metadata record for one physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PfnMetadata {
    pub reference_count: u32,
    pub share_count: u64,
    pub pte_address: u64,
}

/// Capabilities consumed from the memory-forensics engine.
pub trait ForensicsEngine {
    /// Cheap process enumeration (single-source list walk). Used to locate
    /// the target without paying for the richer cross-checked listing.
    fn fast_process_list(&mut self) -> Result<Vec<ProcessRow>, EngineError>;

    /// Full process enumeration.
    fn process_list(&mut self) -> Result<Vec<ProcessRow>, EngineError>;

    fn modules(&mut self, pid: u32) -> Result<Vec<ModuleRow>, EngineError>;

    /// Live address ranges of `pid`, bounded above by `max_address`,
    /// ordered by start.
    fn address_ranges(&mut self, pid: u32, max_address: u64) -> Result<Vec<RangeRow>, EngineError>;

    /// The architecture's highest user-mode address for the captured OS.
    fn highest_usermode_address(&mut self) -> Result<u64, EngineError>;

    fn read_virtual(&mut self, pid: u32, address: u64, size: usize)
        -> Result<Vec<u8>, EngineError>;

    /// Raw read from the physical image, no translation.
    fn read_physical(&mut self, address: u64, size: usize) -> Result<Vec<u8>, EngineError>;

    fn pfn_metadata(&mut self, pfn: u64) -> Result<PfnMetadata, EngineError>;

    /// `(start, end)` pairs of the populated physical runs.
    fn physical_extents(&mut self) -> Result<Vec<(u64, u64)>, EngineError>;

    /// OS major/minor version from the resolved profile.
    fn profile_version(&mut self) -> Result<(u32, u32), EngineError>;

    /// Labeled rows from the image-info enumeration (build number lives in
    /// the row keyed `NT Build`).
    fn image_info(&mut self) -> Result<Vec<LabeledRow>, EngineError>;
}
