//! Reads broker CPU ticks, RSS, and context-switch counters from `/proc`.
//!
//! Stateless and cheap — called once per step. CPU is reported as a
//! cumulative ratio, not a per-interval delta; this is inherited from the
//! source system and preserved verbatim for behavioral equivalence.

use std::fs;

/// Normalization divisors for the three probed quantities.
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// logical cores × 100, e.g. 400.0 on a 4-core host.
    pub cpu_norm: f64,
    /// 1 GiB by default.
    pub mem_norm: f64,
    pub ctxt_norm: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            cpu_norm: 400.0,
            mem_norm: (1024 * 1024 * 1024) as f64,
            ctxt_norm: 1_000_000.0,
        }
    }
}

/// Normalized, clamped-to-[0,1] readings for one process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbeReading {
    pub cpu_ratio: f64,
    pub mem_ratio: f64,
    pub ctxt_ratio: f64,
}

/// Stateless reader of `/proc/<pid>/stat` and `/proc/<pid>/status`.
pub struct ProcessProbe {
    cfg: ProbeConfig,
}

impl ProcessProbe {
    pub fn new(cfg: ProbeConfig) -> Self {
        ProcessProbe { cfg }
    }

    /// Reads and normalizes the broker's CPU/memory/context-switch counters.
    ///
    /// Returns all zeros if the process file is absent (broker not running
    /// or mid-restart) rather than erroring — the probe never fails the step.
    pub fn read(&self, pid: i32) -> ProbeReading {
        if pid <= 0 {
            return ProbeReading::default();
        }
        let cpu_ticks = read_cpu_ticks(pid).unwrap_or(0.0);
        let (rss_kb, voluntary, nonvoluntary) = read_status(pid).unwrap_or((0.0, 0.0, 0.0));

        ProbeReading {
            cpu_ratio: (cpu_ticks / self.cfg.cpu_norm).clamp(0.0, 1.0),
            mem_ratio: ((rss_kb * 1024.0) / self.cfg.mem_norm).clamp(0.0, 1.0),
            ctxt_ratio: ((voluntary + nonvoluntary) / self.cfg.ctxt_norm).clamp(0.0, 1.0),
        }
    }
}

fn read_cpu_ticks(pid: i32) -> Option<f64> {
    let content = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields are whitespace-separated, but field 2 (comm) may itself contain
    // spaces inside parens — split after the closing paren to stay safe.
    let after_comm = content.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] here is field 3 (state) of /proc/pid/stat; fields 14/15 are
    // utime/stime, i.e. indices 11 and 12 of this slice.
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn read_status(pid: i32) -> Option<(f64, f64, f64)> {
    let content = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let mut rss_kb = 0.0;
    let mut voluntary = 0.0;
    let mut nonvoluntary = 0.0;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss_kb = parse_kb_field(rest);
        } else if let Some(rest) = line.strip_prefix("voluntary_ctxt_switches:") {
            voluntary = rest.trim().parse().unwrap_or(0.0);
        } else if let Some(rest) = line.strip_prefix("nonvoluntary_ctxt_switches:") {
            nonvoluntary = rest.trim().parse().unwrap_or(0.0);
        }
    }
    Some((rss_kb, voluntary, nonvoluntary))
}

fn parse_kb_field(rest: &str) -> f64 {
    rest.trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_process_returns_zeros() {
        let probe = ProcessProbe::new(ProbeConfig::default());
        // pid 0 is never a real process.
        assert_eq!(probe.read(0), ProbeReading::default());
    }

    #[test]
    fn self_pid_produces_nonzero_memory() {
        let probe = ProcessProbe::new(ProbeConfig::default());
        let pid = std::process::id() as i32;
        let reading = probe.read(pid);
        assert!(reading.mem_ratio > 0.0);
        assert!(reading.mem_ratio <= 1.0);
    }

    #[test]
    fn parse_kb_field_strips_unit() {
        assert_eq!(parse_kb_field("  1234 kB"), 1234.0);
    }
}
