use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Check whether a cancellation flag has been raised.
#[must_use]
pub fn cancel_requested(cancel: &Arc<AtomicBool>) -> bool {
    cancel.load(Ordering::SeqCst)
}

/// Drop line separators and NUL bytes that servers and editors leave behind.
#[must_use]
pub fn strip_line_noise(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '\0'))
        .collect()
}

/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    const KIB: f32 = 1024.0;
    const MIB: f32 = KIB * 1024.0;

    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / MIB)
    }
}

/// Compute download progress as a percentage.
#[must_use]
pub fn progress_percent(downloaded: u64, total: Option<u64>) -> f32 {
    match total {
        Some(total) if total > 0 => (downloaded as f32 / total as f32) * 100.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_speed_human_readable() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(2_048.0), "2.0 KB/s");
        assert_eq!(format_speed(5_242_880.0), "5.0 MB/s");
    }

    #[test]
    fn calculates_progress_percent() {
        assert_eq!(progress_percent(0, Some(10)), 0.0);
        assert_eq!(progress_percent(5, Some(10)), 50.0);
        assert_eq!(progress_percent(10, Some(10)), 100.0);
        assert_eq!(progress_percent(5, None), 0.0);
    }

    #[test]
    fn respects_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!cancel_requested(&flag));
        flag.store(true, Ordering::SeqCst);
        assert!(cancel_requested(&flag));
    }

    #[test]
    fn strips_separators_and_nul() {
        assert_eq!(strip_line_noise("1.2.3\r\n"), "1.2.3");
        assert_eq!(strip_line_noise("a\0b\nc"), "abc");
        assert_eq!(strip_line_noise(""), "");
    }
}
