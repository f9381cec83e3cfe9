/// Compact elapsed time for log lines, e.g. `2h05m09s`, `4m30s` or `12s`.
pub fn human_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (hours, rest) = (secs / 3600, secs % 3600);
    let (mins, secs) = (rest / 60, rest % 60);

    if hours > 0 {
        format!("{}h{:02}m{:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m{:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Integer percentage of `part` in `total`, 0 when there is nothing to count.
pub fn percent(part: usize, total: usize) -> i64 {
    if total == 0 {
        0
    } else {
        ((part as f64 / total as f64) * 100.0).round() as i64
    }
}
