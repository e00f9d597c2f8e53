//! Total system memory, read once per process.

use once_cell::sync::Lazy;
use tracing::debug;

static TOTAL_MEMORY: Lazy<Option<u64>> = Lazy::new(|| {
    let total = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|text| parse_meminfo(&text));
    debug!(total_bytes = ?total, "Queried system memory");
    total
});

/// Total physical memory in bytes, or `None` if it cannot be determined.
#[must_use]
pub fn total_memory() -> Option<u64> {
    *TOTAL_MEMORY
}

/// Extract `MemTotal` (reported in KiB) from `/proc/meminfo` text.
pub(crate) fn parse_meminfo(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib.saturating_mul(1024))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:        3884096 kB\nMemFree:          123456 kB\n";
        assert_eq!(parse_meminfo(text), Some(3_884_096 * 1024));
    }

    #[test]
    fn test_parse_meminfo_missing_field() {
        assert_eq!(parse_meminfo("MemFree: 10 kB\n"), None);
        assert_eq!(parse_meminfo("MemTotal: lots\n"), None);
    }

    #[test]
    fn test_total_memory_is_stable() {
        assert_eq!(total_memory(), total_memory());
    }
}
