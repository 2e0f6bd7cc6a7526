// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::config::get_num_cpus;

/// Approximates CPU usage with the one-minute load average.
#[derive(Debug, Default)]
pub(super) struct CpuSampler;

impl CpuSampler {
    pub(super) fn sample(&mut self) -> Option<f64> {
        let mut loadavg = [0.0f64; 1];
        // SAFETY: the buffer holds exactly the one element requested.
        let ret = unsafe { libc::getloadavg(loadavg.as_mut_ptr(), 1) };
        if ret < 1 {
            return None;
        }
        Some(100.0 * loadavg[0] / get_num_cpus() as f64)
    }
}

/// Returns the peak resident set size of this process.
pub(super) fn resident_memory() -> Option<u64> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::uninit();
    // SAFETY: getrusage fully initializes `usage` when it returns 0.
    let usage = unsafe {
        if libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) != 0 {
            return None;
        }
        usage.assume_init()
    };
    let max_rss = u64::try_from(usage.ru_maxrss).ok()?;
    // macOS reports bytes, the BSDs report kilobytes.
    if cfg!(target_vendor = "apple") {
        Some(max_rss)
    } else {
        Some(max_rss * 1024)
    }
}
