//! # physdump
//!
//! Carve a credential-store process image out of an offline physical-memory
//! capture and repackage it as a process-memory-dump container.
//!
//! The crate owns the two pieces of real work:
//! - reconciling the target's module list against its live address ranges
//!   into one gap-free read/zero-fill plan ([`interval`], [`gather`]);
//! - the linear page-frame scan locating secure-world pages ([`scanner`]).
//!
//! Address-space translation and container encoding stay behind the
//! [`engine::ForensicsEngine`] and [`builder::ContainerBuilder`] traits.
//!
//! ## Example
//!
//! ```no_run
//! use physdump::orchestrator::Orchestrator;
//!
//! # fn run(
//! #     engine: &mut impl physdump::engine::ForensicsEngine,
//! #     builder: &impl physdump::builder::ContainerBuilder,
//! # ) -> Result<(), physdump::orchestrator::DumpError> {
//! let mut orchestrator = Orchestrator::new("hostname");
//! orchestrator.build = Some(19041);
//! let outcome = orchestrator.run(engine, builder)?;
//! println!("dump written to {}", outcome.dump_path.display());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod engine;
pub mod gather;
pub mod interval;
pub mod model;
pub mod orchestrator;
pub mod scanner;
pub mod wait;

// Re-export commonly used items
#[doc(inline)]
pub use builder::{BuildError, ContainerBuilder};
#[doc(inline)]
pub use engine::{EngineError, ForensicsEngine, SessionConfig};
#[doc(inline)]
pub use interval::{plan_operations, OpKind, Operation, Span};
#[doc(inline)]
pub use model::{
    DumpAssembly, MemoryContentBlock, MemoryRegion, ModuleDescriptor, RegionType, SystemInfo,
    PAGE_SIZE,
};
#[doc(inline)]
pub use orchestrator::{DumpError, DumpOutcome, Orchestrator};
