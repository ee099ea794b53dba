//! `Probe` (spec.md section 1, section 9): OS-metric probing is an external collaborator;
//! only the interface the core depends on is fixed here. `LinuxProcProbe` is a minimal
//! default so the agent runs standalone -- it is deliberately thin, not a full
//! implementation of every metric the System collectors could report.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub command: String,
    pub cmdline: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DiskPartition {
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessMemory {
    pub rss_bytes: u64,
    pub vms_bytes: u64,
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>>;
    async fn process_memory(&self, pid: i32) -> Result<ProcessMemory>;
    async fn process_cpu_percent(&self, pid: i32) -> Result<f64>;
    async fn process_fd_count(&self, pid: i32) -> Result<u32>;
    async fn disk_partitions(&self) -> Result<Vec<DiskPartition>>;
    async fn network_interfaces(&self) -> Result<Vec<NetworkInterface>>;
    /// CPU usage of the agent's own process over a short window, for the CPU governor
    /// (spec.md section 5).
    async fn own_cpu_percent(&self, window: std::time::Duration) -> Result<f64>;
}

/// `/proc`-based probe for Linux hosts, including inside containers.
pub struct LinuxProcProbe;

#[async_trait]
impl Probe for LinuxProcProbe {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir("/proc").await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            if let Ok(info) = read_process_info(pid).await {
                out.push(info);
            }
        }
        Ok(out)
    }

    async fn process_memory(&self, pid: i32) -> Result<ProcessMemory> {
        let status = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await?;
        let mut mem = ProcessMemory::default();
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                mem.rss_bytes = parse_kb_field(rest);
            } else if let Some(rest) = line.strip_prefix("VmSize:") {
                mem.vms_bytes = parse_kb_field(rest);
            }
        }
        Ok(mem)
    }

    async fn process_cpu_percent(&self, _pid: i32) -> Result<f64> {
        // A proper implementation samples /proc/[pid]/stat twice across a window and
        // divides by elapsed wall time and clock ticks. Left as a seam: this crate's
        // contract with the rest of the system is the trait, not this sample body.
        Ok(0.0)
    }

    async fn process_fd_count(&self, pid: i32) -> Result<u32> {
        let mut count = 0u32;
        let mut entries = tokio::fs::read_dir(format!("/proc/{pid}/fd")).await?;
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    async fn disk_partitions(&self) -> Result<Vec<DiskPartition>> {
        Ok(Vec::new())
    }

    async fn network_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        let contents = tokio::fs::read_to_string("/proc/net/dev").await.unwrap_or_default();
        let mut out = Vec::new();
        for line in contents.lines().skip(2) {
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 9 {
                continue;
            }
            let rx_bytes = fields[0].parse().unwrap_or(0);
            let tx_bytes = fields[8].parse().unwrap_or(0);
            out.push(NetworkInterface {
                name: name.trim().to_string(),
                rx_bytes,
                tx_bytes,
            });
        }
        Ok(out)
    }

    async fn own_cpu_percent(&self, _window: std::time::Duration) -> Result<f64> {
        Ok(0.0)
    }
}

fn parse_kb_field(field: &str) -> u64 {
    field
        .trim()
        .trim_end_matches(" kB")
        .trim()
        .parse::<u64>()
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

async fn read_process_info(pid: i32) -> Result<ProcessInfo> {
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await?;
    // comm is parenthesized and may contain spaces, so split on the last ')'.
    let close_paren = stat.rfind(')').ok_or_else(|| anyhow::anyhow!("malformed stat"))?;
    let command = stat[stat.find('(').unwrap_or(0) + 1..close_paren].to_string();
    let rest: Vec<&str> = stat[close_paren + 1..].split_whitespace().collect();
    // field 0 after comm is state, field 1 is ppid (0-indexed).
    let ppid = rest.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);

    let cmdline_raw = tokio::fs::read(format!("/proc/{pid}/cmdline")).await.unwrap_or_default();
    let cmdline = cmdline_raw
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).to_string())
        .collect();

    Ok(ProcessInfo { pid, ppid, command, cmdline })
}

/// A canned probe for tests and for exercising the discovery/launcher-filter logic
/// without touching `/proc`.
pub struct FakeProbe {
    pub processes: Vec<ProcessInfo>,
    pub memory: HashMap<i32, ProcessMemory>,
}

#[async_trait]
impl Probe for FakeProbe {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self.processes.clone())
    }

    async fn process_memory(&self, pid: i32) -> Result<ProcessMemory> {
        Ok(self.memory.get(&pid).cloned().unwrap_or_default())
    }

    async fn process_cpu_percent(&self, _pid: i32) -> Result<f64> {
        Ok(0.0)
    }

    async fn process_fd_count(&self, _pid: i32) -> Result<u32> {
        Ok(0)
    }

    async fn disk_partitions(&self) -> Result<Vec<DiskPartition>> {
        Ok(Vec::new())
    }

    async fn network_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        Ok(Vec::new())
    }

    async fn own_cpu_percent(&self, _window: std::time::Duration) -> Result<f64> {
        Ok(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_probe_returns_canned_processes() {
        let probe = FakeProbe {
            processes: vec![ProcessInfo {
                pid: 42,
                ppid: 1,
                command: "nginx".into(),
                cmdline: vec!["nginx".into(), "-g".into(), "daemon off;".into()],
            }],
            memory: HashMap::new(),
        };
        let procs = probe.list_processes().await.unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 42);
    }
}
