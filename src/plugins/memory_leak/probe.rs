use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::AgentConfig;
use crate::error::{PluginError, Result};

/// Kernels before this release have no RssAnon in /proc/<pid>/status
const STATUS_RSS_SINCE: KernelVersion = KernelVersion { major: 4, minor: 5 };

/// Distribution that backports RssAnon to its older kernels
const BACKPORT_ID: &str = "centos";
const BACKPORT_VERSION_ID: &str = "7";

static KERNEL_RELEASE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(?:\.(\d+))?").expect("invalid kernel release regex"));

/// How the anonymous memory of a process is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `/proc/<pid>/statm`: resident minus shared pages
    Legacy { page_size: u64 },
    /// `/proc/<pid>/status`: RssAnon
    Modern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
}

impl KernelVersion {
    /// Leading `major.minor` of a release string such as `4.4.0-210-generic`
    pub fn parse(release: &str) -> Option<Self> {
        let caps = KERNEL_RELEASE_REGEX.captures(release.trim())?;
        let major = caps.get(1)?.as_str().parse().ok()?;
        let minor = match caps.get(2) {
            Some(m) => m.as_str().parse().ok()?,
            None => 0,
        };
        Some(Self { major, minor })
    }
}

/// `ID` and `VERSION_ID` from os-release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub version_id: String,
}

impl OsRelease {
    pub fn parse(content: &str) -> Self {
        let mut release = OsRelease::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else { continue };
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            match key.trim() {
                "ID" => release.id = value.to_string(),
                "VERSION_ID" => release.version_id = value.to_string(),
                _ => {}
            }
        }
        release
    }
}

pub fn select_strategy(kernel: KernelVersion, os: &OsRelease, page_size: u64) -> Strategy {
    let backported = os.id == BACKPORT_ID && os.version_id == BACKPORT_VERSION_ID;
    if kernel < STATUS_RSS_SINCE && !backported {
        Strategy::Legacy { page_size }
    } else {
        Strategy::Modern
    }
}

/// Host facts the memory diagnostic depends on
#[derive(Debug, Clone)]
pub struct HostProbe {
    pub os: String,
    pub proc_root: PathBuf,
    pub os_release: PathBuf,
    pub page_size: u64,
}

impl HostProbe {
    pub fn from_host(agent: &AgentConfig) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            proc_root: PathBuf::from(&agent.proc_root),
            os_release: PathBuf::from(&agent.os_release),
            page_size: page_size(),
        }
    }

    pub fn is_linux(&self) -> bool {
        self.os == "linux"
    }

    /// Kernel release, the same string `uname -r` prints
    pub fn kernel_release(&self) -> Result<String> {
        let path = self.proc_root.join("sys/kernel/osrelease");
        read(&path).map(|s| s.trim().to_string())
    }

    pub fn os_release(&self) -> Result<OsRelease> {
        read(&self.os_release).map(|s| OsRelease::parse(&s))
    }

    /// Decide the measuring strategy once, from kernel and distribution
    pub fn strategy(&self) -> Result<Strategy> {
        let release = self.kernel_release()?;
        let kernel = KernelVersion::parse(&release).ok_or_else(|| PluginError::HostProbe {
            path: self.proc_root.join("sys/kernel/osrelease").display().to_string(),
            reason: format!("unrecognized kernel release '{}'", release),
        })?;
        let os = self.os_release()?;
        let strategy = select_strategy(kernel, &os, self.page_size);
        tracing::info!(
            kernel = %release,
            os = %os.id,
            os_version = %os.version_id,
            strategy = ?strategy,
            "Selected memory accounting strategy"
        );
        Ok(strategy)
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| PluginError::HostProbe {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(unix)]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}

#[cfg(not(unix))]
fn page_size() -> u64 {
    4096
}
