//! Interface boundary to the dump container builder.

use thiserror::Error;

use crate::model::DumpAssembly;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("assembly carries no system info")]
    MissingSystemInfo,

    #[error("assembly carries no modules")]
    MissingModules,

    #[error("assembly carries no memory regions")]
    MissingMemory,

    #[error("region and content sequences disagree: {regions} regions, {blocks} blocks")]
    Inconsistent { regions: usize, blocks: usize },

    #[error("container encoding failed: {0}")]
    Encode(#[from] std::io::Error),
}

/// Encodes a finished [`DumpAssembly`] into the container byte buffer. The
/// encoding itself is a black box to the orchestrator.
pub trait ContainerBuilder {
    fn build(&self, assembly: &DumpAssembly) -> Result<Vec<u8>, BuildError>;
}
