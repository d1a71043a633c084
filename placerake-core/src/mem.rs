//! Resident-memory probe used by the batch governor.

/// Current resident set size in megabytes. Returns 0 when the value
/// cannot be read, which disables threshold-based recycling but never
/// blocks the run.
pub fn resident_mb() -> u64 {
    read_vm_rss_kb().map(|kb| kb / 1024).unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn read_vm_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss_kb(&status)
}

#[cfg(not(target_os = "linux"))]
fn read_vm_rss_kb() -> Option<u64> {
    None
}

#[allow(dead_code)]
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_status_line() {
        let status = "Name:\tplacerake\nVmPeak:\t  123456 kB\nVmRSS:\t   98304 kB\nThreads:\t12\n";
        assert_eq!(parse_vm_rss_kb(status), Some(98304));
    }

    #[test]
    fn missing_line_yields_none() {
        assert_eq!(parse_vm_rss_kb("Name:\tplacerake\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn probe_reports_something_on_linux() {
        assert!(resident_mb() > 0);
    }
}
