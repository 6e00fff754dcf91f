// src/utils/system.rs: System functions

use sysinfo::{CpuRefreshKind, RefreshKind, System};


/// Determines number of cores available for the external tools.
///
/// Physical cores when sysinfo can tell, logical CPUs otherwise, and never
/// less than one.
///
/// # Returns
/// usize thread count
pub fn detect_cores() -> usize {
    if let Some(physical) = System::physical_core_count() {
        if physical > 0 {
            return physical;
        }
    }
    let system = System::new_with_specifics(RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing()));
    system.cpus().len().max(1)
}
