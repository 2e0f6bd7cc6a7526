// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fs;

/// Computes CPU usage from successive reads of `/proc/stat`.
#[derive(Debug, Default)]
pub(super) struct CpuSampler {
    last: Option<CpuTimes>,
}

#[derive(Clone, Copy, Debug)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl CpuSampler {
    pub(super) fn sample(&mut self) -> Option<f64> {
        let current = read_cpu_times()?;
        let previous = self.last.replace(current);
        let previous = previous?;

        let total = current.total.saturating_sub(previous.total);
        if total == 0 {
            return Some(0.0);
        }
        let idle = current.idle.saturating_sub(previous.idle);
        Some(100.0 * (1.0 - idle as f64 / total as f64))
    }
}

fn read_cpu_times() -> Option<CpuTimes> {
    let stat = fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(stat.lines().next()?)
}

fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.map(|f| f.parse().ok()).collect::<Option<_>>()?;
    // user nice system idle iowait irq softirq steal ...
    let idle = values.get(3)? + values.get(4).copied().unwrap_or(0);
    let total = values.iter().take(8).sum();
    Some(CpuTimes { idle, total })
}

/// Returns the resident set size of this process.
pub(super) fn resident_memory() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(page_size)
        .ok()
        .map(|page_size| resident_pages * page_size)
}
