use std::path::Path;

use anyhow::{anyhow, Result};

use super::probe::Strategy;

/// Memory accounting of one backend process, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySample {
    Legacy {
        resident: u64,
        shared: u64,
    },
    Modern {
        vm_rss: u64,
        rss_anon: u64,
        rss_file: u64,
        rss_shmem: u64,
    },
}

impl MemorySample {
    /// Private anonymous memory, approximated as resident minus shared on old kernels
    pub fn anonymous(&self) -> u64 {
        match *self {
            MemorySample::Legacy { resident, shared } => resident.saturating_sub(shared),
            MemorySample::Modern { rss_anon, .. } => rss_anon,
        }
    }

    /// One diagnostic line, newline terminated
    pub fn describe(&self, pid: i64, threshold: u64) -> String {
        match *self {
            MemorySample::Legacy { resident, shared } => format!(
                "pid: {},  RES {} - SHR {} more than {}\n",
                pid, resident, shared, threshold
            ),
            MemorySample::Modern { vm_rss, rss_anon, rss_file, rss_shmem } => format!(
                "pid: {},  RssAnon {} more than {}, VmRSS {}, RssFile {}, RssShmem {}\n",
                pid, rss_anon, threshold, vm_rss, rss_file, rss_shmem
            ),
        }
    }
}

/// `/proc/<pid>/statm`: size resident shared text lib data dt, in pages
pub fn parse_statm(content: &str, page_size: u64) -> Result<MemorySample> {
    let fields: Vec<u64> = content
        .split_whitespace()
        .take(3)
        .map(|f| f.parse::<u64>())
        .collect::<std::result::Result<_, _>>()?;
    if fields.len() < 3 {
        return Err(anyhow!("statm has {} fields, expected at least 3", fields.len()));
    }
    Ok(MemorySample::Legacy {
        resident: fields[1] * page_size,
        shared: fields[2] * page_size,
    })
}

/// `/proc/<pid>/status`: `Key:\tvalue kB` lines; absent fields count as zero
pub fn parse_status(content: &str) -> MemorySample {
    let mut vm_rss = 0;
    let mut rss_anon = 0;
    let mut rss_file = 0;
    let mut rss_shmem = 0;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let target = match key.trim() {
            "VmRSS" => &mut vm_rss,
            "RssAnon" => &mut rss_anon,
            "RssFile" => &mut rss_file,
            "RssShmem" => &mut rss_shmem,
            _ => continue,
        };
        let kb: u64 = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        *target = kb * 1024;
    }

    MemorySample::Modern { vm_rss, rss_anon, rss_file, rss_shmem }
}

impl Strategy {
    /// Read the sample of `pid`. Errors mean the process could not be
    /// inspected, usually because it has exited.
    pub async fn read(&self, proc_root: &Path, pid: i64) -> Result<MemorySample> {
        let dir = proc_root.join(pid.to_string());
        match *self {
            Strategy::Legacy { page_size } => {
                let content = tokio::fs::read_to_string(dir.join("statm")).await?;
                parse_statm(&content, page_size)
            }
            Strategy::Modern => {
                let content = tokio::fs::read_to_string(dir.join("status")).await?;
                Ok(parse_status(&content))
            }
        }
    }
}
