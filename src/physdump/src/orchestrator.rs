//! End-to-end dump pipeline.
//!
//! A strict state sequence, each state a hard dependency on the previous:
//! locate the credential-store process, detect the isolated-LSA helper,
//! optionally extract the secure-world pages, gather identity, modules and
//! memory, assemble, and persist. The run is atomic at the level of "did a
//! dump file get written": nothing after the target lookup is individually
//! recoverable.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::builder::{BuildError, ContainerBuilder};
use crate::engine::{EngineError, ForensicsEngine};
use crate::gather::gather_memory;
use crate::model::{DumpAssembly, ModuleDescriptor, SystemInfo, PAGE_SIZE};
use crate::scanner;
use crate::wait::FileMissing;

/// The credential-store process this tool targets.
pub const TARGET_PROCESS: &str = "lsass.exe";
/// The isolated-LSA helper whose presence flags Credential Guard.
pub const ISOLATED_LSA_PROCESS: &str = "lsaiso.exe";
/// Required extension of a local capture image.
pub const IMAGE_EXTENSION: &str = "vmem";
/// Extension of the companion snapshot-state file some captures need.
pub const SNAPSHOT_STATE_EXTENSION: &str = "vmss";

const GB: u64 = 1024 * 1024 * 1024;
const MB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("image file must have a .vmem extension: {}", .0.display())]
    BadImageExtension(PathBuf),

    #[error("no lsass.exe process found in the capture")]
    TargetNotFound,

    #[error(transparent)]
    FileMissing(#[from] FileMissing),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("failed to persist output: {0}")]
    Io(#[from] io::Error),
}

/// Reject capture paths that do not carry the designated extension. Runs
/// before any session is opened.
pub fn validate_image_extension(path: &Path) -> Result<(), DumpError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case(IMAGE_EXTENSION) => Ok(()),
        _ => Err(DumpError::BadImageExtension(path.to_path_buf())),
    }
}

/// Where one run left its artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOutcome {
    pub dump_path: PathBuf,
    pub secure_world_path: Option<PathBuf>,
    pub credential_guard: bool,
}

pub struct Orchestrator {
    /// Output files are named `<label>-<date>-…`.
    pub label: String,
    /// Present when analyzing a local capture; enables the secure-world
    /// extraction and the snapshot-state hints.
    pub local_image: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Pre-supplied Windows build number; skips the image-info lookup.
    pub build: Option<u32>,
}

impl Orchestrator {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            local_image: None,
            output_dir: PathBuf::from("output"),
            build: None,
        }
    }

    /// Drive the whole pipeline against an already-bound engine session.
    pub fn run<E, B>(&self, engine: &mut E, builder: &B) -> Result<DumpOutcome, DumpError>
    where
        E: ForensicsEngine,
        B: ContainerBuilder,
    {
        println!("[*] Finding LSASS process");
        let pid = self.locate_target(engine)?;
        println!("[*] LSASS found");

        println!("[*] Checking for Credential Guard...");
        let credential_guard = engine
            .process_list()?
            .iter()
            .any(|p| p.name.eq_ignore_ascii_case(ISOLATED_LSA_PROCESS));

        let mut secure_world = None;
        let mut secure_world_path = None;
        if credential_guard {
            println!("[*] Credential Guard detected!");
            if let Some(image) = self.local_image.clone() {
                let blob = self.extract_secure_world(engine, &image)?;
                fs::create_dir_all(&self.output_dir)?;
                let path = self.output_path("secure-world.raw");
                println!("[*] Writing Secure World data to {}", path.display());
                write_via_partial(&path, &blob)?;
                secure_world = Some(blob);
                secure_world_path = Some(path);
            }
        } else {
            println!("[*] No Credential Guard detected");
        }

        println!("[*] Collecting data for minidump: system info");
        let system_info = self.gather_identity(engine)?;

        println!("[*] Collecting data for minidump: module info");
        let modules = gather_modules(engine, pid)?;

        println!("[*] Collecting data for minidump: memory info and content");
        let max_address = engine.highest_usermode_address()?;
        let ranges = engine.address_ranges(pid, max_address)?;
        let (regions, content) = gather_memory(&modules, &ranges, |address, size| {
            engine.read_virtual(pid, address, size)
        });

        println!("[*] Generating the minidump file");
        let assembly = DumpAssembly {
            system_info: Some(system_info),
            modules,
            regions,
            content,
            secure_world,
        };
        let buffer = builder.build(&assembly)?;

        fs::create_dir_all(&self.output_dir)?;
        let dump_path = self.output_path("lsass.dmp");
        write_via_partial(&dump_path, &buffer)?;
        println!("[*] Wrote LSASS minidump to {}", dump_path.display());

        Ok(DumpOutcome {
            dump_path,
            secure_world_path,
            credential_guard,
        })
    }

    fn locate_target<E: ForensicsEngine>(&self, engine: &mut E) -> Result<u32, DumpError> {
        let processes = engine.fast_process_list()?;
        match processes
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(TARGET_PROCESS))
        {
            Some(target) => Ok(target.pid),
            None => {
                println!("[-] No LSASS found");
                self.hint_snapshot_state();
                Err(DumpError::TargetNotFound)
            }
        }
    }

    /// Some hypervisor captures keep the page tables in a separate
    /// snapshot-state file; without it the capture looks empty.
    fn hint_snapshot_state(&self) {
        if let Some(image) = &self.local_image {
            if !image.with_extension(SNAPSHOT_STATE_EXTENSION).exists() {
                println!(
                    "[!] .vmss file is most likely required. If you have a .vmsn file, \
                     please rename it to .vmss and try again"
                );
            }
        }
    }

    fn extract_secure_world<E: ForensicsEngine>(
        &self,
        engine: &mut E,
        image: &Path,
    ) -> Result<Vec<u8>, DumpError> {
        println!("[*] Getting physical memory layout");
        let image_size = engine
            .physical_extents()?
            .iter()
            .map(|&(_, end)| end)
            .max()
            .unwrap_or(0);

        let on_disk = fs::metadata(image).map(|m| m.len()).unwrap_or(0);
        if image_size == 0 || image_size != on_disk {
            self.hint_snapshot_state();
        }

        println!(
            "[*] Largest physical address is {:#x} ({} GB)",
            image_size,
            image_size / GB
        );
        println!(
            "[*] Finding Secure World pages (this will take about {} minutes)",
            image_size / GB
        );

        let pages = scanner::scan_secure_world(
            image_size,
            |pfn| engine.pfn_metadata(pfn),
            |analyzed, total| println!("[*] {}/{} MB analyzed", analyzed / MB, total / MB),
        )?;

        println!(
            "[*] Reading {} MB of Secure World data from the capture",
            pages.len() as u64 * PAGE_SIZE / MB
        );
        let blob = scanner::read_secure_world(&pages, |address, size| {
            engine.read_physical(address, size)
        })?;
        Ok(blob)
    }

    fn gather_identity<E: ForensicsEngine>(
        &self,
        engine: &mut E,
    ) -> Result<SystemInfo, DumpError> {
        let build_number = match self.build {
            Some(build) => build,
            None => {
                println!("[*] Windows build number not known, collecting it from image info");
                engine
                    .image_info()?
                    .iter()
                    .find(|row| row.key == "NT Build")
                    .and_then(|row| row.value.split('.').next())
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(0)
            }
        };

        let (major_version, minor_version) = engine.profile_version()?;
        Ok(SystemInfo {
            major_version,
            minor_version,
            build_number,
        })
    }

    fn output_path(&self, suffix: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}-{}", self.label, date_stamp(), suffix))
    }
}

fn gather_modules<E: ForensicsEngine>(
    engine: &mut E,
    pid: u32,
) -> Result<Vec<ModuleDescriptor>, DumpError> {
    Ok(engine
        .modules(pid)?
        .into_iter()
        .filter(|row| row.path.len() > 1)
        .map(|row| ModuleDescriptor {
            path: row.path,
            base: row.base,
            size: row.size,
        })
        .collect())
}

fn date_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// The buffer lands in a `.partial`-suffixed sibling first and is renamed
/// into place, so an interrupted run leaves at most a clearly-marked
/// partial file and never a truncated artifact under the final name.
fn write_via_partial(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    fs::write(&partial, bytes)?;
    fs::rename(&partial, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::engine::{LabeledRow, ModuleRow, PfnMetadata, ProcessRow, RangeRow};
    use crate::model::RegionType;

    const SECURE_PFN: PfnMetadata = PfnMetadata {
        reference_count: 2,
        share_count: 1,
        pte_address: 0,
    };

    #[derive(Default, Clone)]
    struct FakeEngine {
        processes: Vec<ProcessRow>,
        modules: Vec<ModuleRow>,
        ranges: Vec<RangeRow>,
        secure_pfns: Vec<u64>,
        physical_size: u64,
        physical_read_fails: bool,
        build_rows: Vec<LabeledRow>,
    }

    impl ForensicsEngine for FakeEngine {
        fn fast_process_list(&mut self) -> Result<Vec<ProcessRow>, EngineError> {
            Ok(self.processes.clone())
        }

        fn process_list(&mut self) -> Result<Vec<ProcessRow>, EngineError> {
            Ok(self.processes.clone())
        }

        fn modules(&mut self, _pid: u32) -> Result<Vec<ModuleRow>, EngineError> {
            Ok(self.modules.clone())
        }

        fn address_ranges(
            &mut self,
            _pid: u32,
            max_address: u64,
        ) -> Result<Vec<RangeRow>, EngineError> {
            Ok(self
                .ranges
                .iter()
                .copied()
                .filter(|r| r.end <= max_address)
                .collect())
        }

        fn highest_usermode_address(&mut self) -> Result<u64, EngineError> {
            Ok(0x7FFF_FFFE_FFFF)
        }

        fn read_virtual(
            &mut self,
            _pid: u32,
            address: u64,
            size: usize,
        ) -> Result<Vec<u8>, EngineError> {
            let end = address + size as u64;
            if self
                .ranges
                .iter()
                .any(|r| r.start <= address && end <= r.end)
            {
                Ok((0..size)
                    .map(|i| (address as u8).wrapping_add(i as u8))
                    .collect())
            } else {
                Err(EngineError::ReadFailed { address, size })
            }
        }

        fn read_physical(&mut self, address: u64, size: usize) -> Result<Vec<u8>, EngineError> {
            if self.physical_read_fails {
                Err(EngineError::ReadFailed { address, size })
            } else {
                Ok(vec![(address / PAGE_SIZE) as u8; size])
            }
        }

        fn pfn_metadata(&mut self, pfn: u64) -> Result<PfnMetadata, EngineError> {
            Ok(if self.secure_pfns.contains(&pfn) {
                SECURE_PFN
            } else {
                PfnMetadata::default()
            })
        }

        fn physical_extents(&mut self) -> Result<Vec<(u64, u64)>, EngineError> {
            Ok(vec![(0, self.physical_size)])
        }

        fn profile_version(&mut self) -> Result<(u32, u32), EngineError> {
            Ok((10, 0))
        }

        fn image_info(&mut self) -> Result<Vec<LabeledRow>, EngineError> {
            Ok(self.build_rows.clone())
        }
    }

    #[derive(Default)]
    struct CapturingBuilder {
        captured: RefCell<Vec<DumpAssembly>>,
    }

    impl ContainerBuilder for CapturingBuilder {
        fn build(&self, assembly: &DumpAssembly) -> Result<Vec<u8>, BuildError> {
            self.captured.borrow_mut().push(assembly.clone());
            Ok(b"MDMP-TEST".to_vec())
        }
    }

    fn lsass_engine() -> FakeEngine {
        FakeEngine {
            processes: vec![
                ProcessRow {
                    pid: 4,
                    name: "System".into(),
                },
                ProcessRow {
                    pid: 652,
                    name: "lsass.exe".into(),
                },
            ],
            modules: vec![
                ModuleRow {
                    path: "C:\\Windows\\System32\\lsass.exe".into(),
                    base: 0x7FF6_0000_0000,
                    size: 0x10000,
                },
                // Degenerate entries the gather step must drop.
                ModuleRow {
                    path: String::new(),
                    base: 0,
                    size: 0,
                },
                ModuleRow {
                    path: "C".into(),
                    base: 0x1000,
                    size: 0x1000,
                },
            ],
            ranges: vec![
                RangeRow {
                    start: 0x10000,
                    end: 0x20000,
                    protect: 0x04,
                    kind: RegionType::Private,
                },
                RangeRow {
                    start: 0x7FF6_0000_0000,
                    end: 0x7FF6_0000_8000,
                    protect: 0x20,
                    kind: RegionType::Mapped,
                },
            ],
            build_rows: vec![LabeledRow {
                key: "NT Build".into(),
                value: "19041.1.amd64fre".into(),
            }],
            ..Default::default()
        }
    }

    fn orchestrator_in(dir: &Path) -> Orchestrator {
        let mut orchestrator = Orchestrator::new("testbox");
        orchestrator.output_dir = dir.join("output");
        orchestrator
    }

    #[test]
    fn missing_target_terminates_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let mut engine = FakeEngine {
            processes: vec![ProcessRow {
                pid: 4,
                name: "System".into(),
            }],
            ..Default::default()
        };

        let err = orchestrator
            .run(&mut engine, &CapturingBuilder::default())
            .unwrap_err();
        assert!(matches!(err, DumpError::TargetNotFound));
        assert!(!orchestrator.output_dir.exists());
    }

    #[test]
    fn full_run_writes_dump_and_filters_modules() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let mut engine = lsass_engine();
        let builder = CapturingBuilder::default();

        let outcome = orchestrator.run(&mut engine, &builder).unwrap();
        assert!(!outcome.credential_guard);
        assert!(outcome.secure_world_path.is_none());
        assert_eq!(fs::read(&outcome.dump_path).unwrap(), b"MDMP-TEST");
        let name = outcome.dump_path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("testbox-"));
        assert!(name.ends_with("-lsass.dmp"));

        let captured = builder.captured.borrow();
        let assembly = &captured[0];
        assert_eq!(assembly.modules.len(), 1);
        assert_eq!(assembly.modules[0].path, "C:\\Windows\\System32\\lsass.exe");

        let info = assembly.system_info.unwrap();
        assert_eq!(
            (info.major_version, info.minor_version, info.build_number),
            (10, 0, 19041)
        );

        let region_total: u64 = assembly.regions.iter().map(|r| r.region_size).sum();
        let content_total: u64 = assembly.content.iter().map(|b| b.size()).sum();
        assert_eq!(region_total, content_total);
        assert!(assembly.secure_world.is_none());
    }

    #[test]
    fn build_override_skips_image_info_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = orchestrator_in(dir.path());
        orchestrator.build = Some(22621);
        let mut engine = lsass_engine();
        engine.build_rows.clear();
        let builder = CapturingBuilder::default();

        orchestrator.run(&mut engine, &builder).unwrap();
        let captured = builder.captured.borrow();
        assert_eq!(captured[0].system_info.unwrap().build_number, 22621);
    }

    #[test]
    fn absent_build_row_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let mut engine = lsass_engine();
        engine.build_rows.clear();
        let builder = CapturingBuilder::default();

        orchestrator.run(&mut engine, &builder).unwrap();
        let captured = builder.captured.borrow();
        assert_eq!(captured[0].system_info.unwrap().build_number, 0);
    }

    #[test]
    fn credential_guard_extracts_secure_world_from_local_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("capture.vmem");
        fs::write(&image, vec![0u8; 10 * PAGE_SIZE as usize]).unwrap();

        let mut orchestrator = orchestrator_in(dir.path());
        orchestrator.local_image = Some(image);
        let mut engine = lsass_engine();
        engine.processes.push(ProcessRow {
            pid: 900,
            name: "LsaIso.exe".into(),
        });
        engine.secure_pfns = vec![3, 7];
        engine.physical_size = 10 * PAGE_SIZE;
        let builder = CapturingBuilder::default();

        let outcome = orchestrator.run(&mut engine, &builder).unwrap();
        assert!(outcome.credential_guard);

        let raw_path = outcome.secure_world_path.unwrap();
        let raw = fs::read(&raw_path).unwrap();
        assert_eq!(raw.len(), 2 * PAGE_SIZE as usize);
        assert!(raw[..PAGE_SIZE as usize].iter().all(|&b| b == 3));
        assert!(raw[PAGE_SIZE as usize..].iter().all(|&b| b == 7));

        let captured = builder.captured.borrow();
        assert_eq!(captured[0].secure_world.as_deref(), Some(raw.as_slice()));
    }

    #[test]
    fn credential_guard_without_local_image_skips_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let mut engine = lsass_engine();
        engine.processes.push(ProcessRow {
            pid: 900,
            name: "lsaiso.exe".into(),
        });
        let builder = CapturingBuilder::default();

        let outcome = orchestrator.run(&mut engine, &builder).unwrap();
        assert!(outcome.credential_guard);
        assert!(outcome.secure_world_path.is_none());
        assert!(builder.captured.borrow()[0].secure_world.is_none());
    }

    #[test]
    fn physical_read_failure_aborts_the_whole_run() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("capture.vmem");
        fs::write(&image, vec![0u8; 10 * PAGE_SIZE as usize]).unwrap();

        let mut orchestrator = orchestrator_in(dir.path());
        orchestrator.local_image = Some(image);
        let mut engine = lsass_engine();
        engine.processes.push(ProcessRow {
            pid: 900,
            name: "lsaiso.exe".into(),
        });
        engine.secure_pfns = vec![3];
        engine.physical_size = 10 * PAGE_SIZE;
        engine.physical_read_fails = true;

        let err = orchestrator
            .run(&mut engine, &CapturingBuilder::default())
            .unwrap_err();
        assert!(matches!(err, DumpError::Engine(_)));
        // Atomicity: the aborted run must not have produced a dump file.
        assert!(fs::read_dir(&orchestrator.output_dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true));
    }

    #[test]
    fn structure_is_idempotent_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_in(dir.path());
        let builder = CapturingBuilder::default();

        orchestrator.run(&mut lsass_engine(), &builder).unwrap();
        orchestrator.run(&mut lsass_engine(), &builder).unwrap();

        let captured = builder.captured.borrow();
        assert_eq!(captured[0], captured[1]);
    }

    #[test]
    fn image_extension_is_validated_case_insensitively() {
        validate_image_extension(Path::new("host.vmem")).unwrap();
        validate_image_extension(Path::new("HOST.VMEM")).unwrap();
        assert!(matches!(
            validate_image_extension(Path::new("host.raw")),
            Err(DumpError::BadImageExtension(_))
        ));
        assert!(validate_image_extension(Path::new("host")).is_err());
    }
}
