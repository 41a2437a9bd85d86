//! Resident-memory sampling for cycle records and the maintenance trigger.

/// Source of the process's resident set size.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size in megabytes, `None` when unavailable.
    fn rss_mb(&self) -> Option<f64>;
}

/// Reads `VmRSS` from `/proc/self/status`. Always `None` off Linux.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn rss_mb(&self) -> Option<f64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss_mb(&status)
    }
}

/// Fixed reading, for tests and platforms without `/proc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedMemoryProbe(pub Option<f64>);

impl MemoryProbe for FixedMemoryProbe {
    fn rss_mb(&self) -> Option<f64> {
        self.0
    }
}

pub(crate) fn parse_vm_rss_mb(status: &str) -> Option<f64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: f64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb / 1024.0)
}
