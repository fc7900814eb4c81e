//! Stdio bridge to the analysis-engine helper process.
//!
//! The memory-forensics engine (address-space translation, profile
//! resolution, enumeration plugins) runs as a separate helper; this module
//! drives it over a line-oriented JSON protocol on its stdin/stdout and
//! adapts the replies to the [`ForensicsEngine`] trait. Byte payloads
//! travel base64-encoded.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use physdump::engine::{
    EngineError, ForensicsEngine, LabeledRow, ModuleRow, PfnMetadata, ProcessRow, RangeRow,
    SessionConfig,
};
use physdump::model::RegionType;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    OpenSession {
        image: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        dtb: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        kernel_base: Option<u64>,
        cache_mode: &'a str,
        cache_dir: &'a str,
        profile_repositories: &'a [String],
    },
    ProcessList {
        fast: bool,
    },
    Modules {
        pid: u32,
    },
    AddressRanges {
        pid: u32,
        max_address: u64,
    },
    HighestUsermodeAddress,
    ReadVirtual {
        pid: u32,
        address: u64,
        size: usize,
    },
    ReadPhysical {
        address: u64,
        size: usize,
    },
    PfnMetadata {
        pfn: u64,
    },
    PhysicalExtents,
    ProfileVersion,
    ImageInfo,
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response<T> {
    Ok { data: T },
    Err { message: String },
}

#[derive(Debug, Deserialize)]
struct WireProcess {
    pid: u32,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireModule {
    path: String,
    base: u64,
    size: u64,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireRegionKind {
    #[default]
    Unknown,
    Mapped,
    Private,
}

impl From<WireRegionKind> for RegionType {
    fn from(kind: WireRegionKind) -> Self {
        match kind {
            WireRegionKind::Unknown => RegionType::Unknown,
            WireRegionKind::Mapped => RegionType::Mapped,
            WireRegionKind::Private => RegionType::Private,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireRange {
    start: u64,
    end: u64,
    #[serde(default)]
    protect: u32,
    #[serde(default)]
    kind: WireRegionKind,
}

#[derive(Debug, Deserialize)]
struct WirePfn {
    reference_count: u32,
    share_count: u64,
    pte_address: u64,
}

#[derive(Debug, Deserialize)]
struct WireBytes {
    data: String,
}

#[derive(Debug, Deserialize)]
struct WireRow {
    key: String,
    value: String,
}

/// `ForensicsEngine` backed by a helper subprocess.
pub struct BridgeEngine {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BridgeEngine {
    /// Spawn the helper and bind it to the capture described by `session`.
    pub fn spawn(command: &str, session: &SessionConfig) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next().context("empty engine command")?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start analysis engine: {command}"))?;

        let stdin = child.stdin.take().context("engine stdin unavailable")?;
        let stdout = BufReader::new(child.stdout.take().context("engine stdout unavailable")?);
        let mut engine = Self {
            child,
            stdin,
            stdout,
        };

        let image = session.image.display().to_string();
        let cache_dir = session.cache_dir.display().to_string();
        engine
            .call::<serde_json::Value>(&Request::OpenSession {
                image: &image,
                dtb: session.dtb,
                kernel_base: session.kernel_base,
                cache_mode: session.cache_mode.as_str(),
                cache_dir: &cache_dir,
                profile_repositories: &session.profile_repositories,
            })
            .map_err(|e| anyhow!("engine session bind failed: {e}"))?;
        Ok(engine)
    }

    fn call<T: DeserializeOwned>(&mut self, request: &Request<'_>) -> Result<T, EngineError> {
        let mut line =
            serde_json::to_string(request).map_err(|e| EngineError::Session(e.to_string()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.flush()?;

        let mut reply = String::new();
        if self.stdout.read_line(&mut reply)? == 0 {
            return Err(EngineError::Session("engine closed the connection".into()));
        }

        match serde_json::from_str::<Response<T>>(&reply)
            .map_err(|e| EngineError::Session(format!("malformed engine reply: {e}")))?
        {
            Response::Ok { data } => Ok(data),
            Response::Err { message } => Err(EngineError::Session(message)),
        }
    }

    fn read_bytes(
        &mut self,
        request: &Request<'_>,
        address: u64,
        size: usize,
    ) -> Result<Vec<u8>, EngineError> {
        let wire: WireBytes = self
            .call(request)
            .map_err(|_| EngineError::ReadFailed { address, size })?;
        BASE64
            .decode(wire.data)
            .map_err(|_| EngineError::ReadFailed { address, size })
    }

    fn process_rows(&mut self, fast: bool) -> Result<Vec<ProcessRow>, EngineError> {
        let rows: Vec<WireProcess> = self.call(&Request::ProcessList { fast })?;
        Ok(rows
            .into_iter()
            .map(|row| ProcessRow {
                pid: row.pid,
                name: row.name,
            })
            .collect())
    }
}

impl Drop for BridgeEngine {
    fn drop(&mut self) {
        let _ = self.call::<serde_json::Value>(&Request::Shutdown);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl ForensicsEngine for BridgeEngine {
    fn fast_process_list(&mut self) -> Result<Vec<ProcessRow>, EngineError> {
        self.process_rows(true)
    }

    fn process_list(&mut self) -> Result<Vec<ProcessRow>, EngineError> {
        self.process_rows(false)
    }

    fn modules(&mut self, pid: u32) -> Result<Vec<ModuleRow>, EngineError> {
        let rows: Vec<WireModule> = self.call(&Request::Modules { pid })?;
        Ok(rows
            .into_iter()
            .map(|row| ModuleRow {
                path: row.path,
                base: row.base,
                size: row.size,
            })
            .collect())
    }

    fn address_ranges(&mut self, pid: u32, max_address: u64) -> Result<Vec<RangeRow>, EngineError> {
        let rows: Vec<WireRange> = self.call(&Request::AddressRanges { pid, max_address })?;
        Ok(rows
            .into_iter()
            .map(|row| RangeRow {
                start: row.start,
                end: row.end,
                protect: row.protect,
                kind: row.kind.into(),
            })
            .collect())
    }

    fn highest_usermode_address(&mut self) -> Result<u64, EngineError> {
        self.call(&Request::HighestUsermodeAddress)
    }

    fn read_virtual(
        &mut self,
        pid: u32,
        address: u64,
        size: usize,
    ) -> Result<Vec<u8>, EngineError> {
        self.read_bytes(&Request::ReadVirtual { pid, address, size }, address, size)
    }

    fn read_physical(&mut self, address: u64, size: usize) -> Result<Vec<u8>, EngineError> {
        self.read_bytes(&Request::ReadPhysical { address, size }, address, size)
    }

    fn pfn_metadata(&mut self, pfn: u64) -> Result<PfnMetadata, EngineError> {
        let wire: WirePfn = self.call(&Request::PfnMetadata { pfn })?;
        Ok(PfnMetadata {
            reference_count: wire.reference_count,
            share_count: wire.share_count,
            pte_address: wire.pte_address,
        })
    }

    fn physical_extents(&mut self) -> Result<Vec<(u64, u64)>, EngineError> {
        self.call(&Request::PhysicalExtents)
    }

    fn profile_version(&mut self) -> Result<(u32, u32), EngineError> {
        self.call(&Request::ProfileVersion)
    }

    fn image_info(&mut self) -> Result<Vec<LabeledRow>, EngineError> {
        let rows: Vec<WireRow> = self.call(&Request::ImageInfo)?;
        Ok(rows
            .into_iter()
            .map(|row| LabeledRow {
                key: row.key,
                value: row.value,
            })
            .collect())
    }
}
