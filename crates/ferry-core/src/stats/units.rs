//! Human-readable quantities as they appear in stats blocks.
//!
//! Sizes use 1024-based multipliers whatever the spelling (`K`, `Ki`, `KiB`, `KB`),
//! optionally separated from the number by whitespace. Durations come either in
//! the tool's compact form (`1h2m3.5s`) or as `h:m:s` / `m:s`.

use std::time::Duration;

/// Parse a size such as `15.031 MiB`, `512MiB`, `233.367Mi` or `0 B` into bytes.
pub fn parse_size(text: &str) -> Option<u64> {
    let (value, unit) = split_number(text)?;
    let multiplier = unit_multiplier(unit)?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return None;
    }
    Some(bytes.round() as u64)
}

/// Parse a rate such as `817.606 KiB/s` or `10MiB/s` into bytes per second.
pub fn parse_speed(text: &str) -> Option<u64> {
    let text = text.trim();
    let size = text.strip_suffix("/s")?;
    parse_size(size)
}

/// Parse a percentage such as `6%`.
pub fn parse_percent(text: &str) -> Option<u8> {
    let digits = text.trim().strip_suffix('%')?.trim();
    let value: u32 = digits.parse().ok()?;
    u8::try_from(value.min(100)).ok()
}

/// True for the placeholders the tool prints when an estimate is not available.
pub fn is_unknown(text: &str) -> bool {
    matches!(text.trim(), "" | "-" | "--")
}

/// Parse a duration: `4m33s`, `1h2m3.4s`, `19.0s`, `500ms`, `1d2h`, `01:02:03`, `4:33`.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.contains(':') {
        return parse_clock(text);
    }

    let mut total = 0.0_f64;
    let mut rest = text;
    while !rest.is_empty() {
        let (value, after) = split_number(rest)?;
        let unit_len = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, tail) = after.split_at(unit_len);
        let seconds = match unit.trim() {
            "y" => 365.0 * 86_400.0,
            "w" => 7.0 * 86_400.0,
            "d" => 86_400.0,
            "h" => 3_600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return None,
        };
        total += value * seconds;
        rest = tail.trim_start();
    }
    seconds_to_duration(total)
}

fn parse_clock(text: &str) -> Option<Duration> {
    let parts: Vec<&str> = text.split(':').map(str::trim).collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [m, s] => ("0", *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    let hours: u64 = hours.parse().ok()?;
    let minutes: u64 = minutes.parse().ok()?;
    let seconds: f64 = seconds.parse().ok()?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    let whole = hours.checked_mul(3_600)?.checked_add(minutes * 60)?;
    seconds_to_duration(whole as f64 + seconds)
}

fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds < 0.0 || seconds > u32::MAX as f64 * 1_000.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

fn split_number(text: &str) -> Option<(f64, &str)> {
    let text = text.trim_start();
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    if end == 0 {
        return None;
    }
    let value: f64 = text[..end].parse().ok()?;
    Some((value, text[end..].trim()))
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    let mut chars = unit.chars();
    let Some(first) = chars.next() else {
        return Some(1);
    };
    let rest = chars.as_str();
    let exponent = match first.to_ascii_uppercase() {
        'B' => return rest.is_empty().then_some(1),
        'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        'P' => 5,
        'E' => 6,
        _ => return None,
    };
    match rest {
        "" | "i" | "B" | "iB" => Some(1024_u64.pow(exponent)),
        _ => None,
    }
}
