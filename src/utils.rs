use chrono::{Local, TimeZone};
use crate::segment::SharedObject;
use crc::{Crc, CRC_32_CKSUM};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub fn now_micros() -> u64 {
    return std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
}

pub fn duration_micros(d: Duration) -> u64 {
    return d.as_micros().min(u64::MAX as u128) as u64;
}

pub fn compute_crc32(data: &[u8]) -> u32 {
    let crc = Crc::<u32>::new(&CRC_32_CKSUM);
    let mut digest = crc.digest();
    digest.update(data);
    return digest.finalize();
}

/// Fingerprint used to check that a named object is read back as the type
/// it was constructed with.
pub fn type_fingerprint<T: SharedObject>() -> u32 {
    let mut data = T::type_tag().into_bytes();
    data.extend_from_slice(&(std::mem::size_of::<T>() as u64).to_ne_bytes());
    data.extend_from_slice(&(std::mem::align_of::<T>() as u64).to_ne_bytes());
    return compute_crc32(&data);
}

/// A segment name nobody else is using, for tests and throwaway brokers.
pub fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    return format!("/{}_{}_{}_{}", prefix, std::process::id(), n, nanos);
}

/// Renders a micros-since-epoch timestamp the way the inspector shows it,
/// 0 means "never".
pub fn format_micros(micros: u64) -> String {
    if micros == 0 {
        return "never".to_string();
    }
    let secs = (micros / 1_000_000) as i64;
    let nanos = ((micros % 1_000_000) * 1000) as u32;
    return match Local.timestamp_opt(secs, nanos).single() {
        Some(t) => t.format("%a, %d.%m.%Y %H:%M:%S").to_string(),
        None => format!("{}us", micros),
    };
}

/// Inverse of parse_duration_micros, to whole seconds: "[-]h:mm:ss".
pub fn format_duration_micros(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let secs = micros.unsigned_abs() / 1_000_000;
    return format!(
        "{}{}:{:02}:{:02}",
        sign,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    );
}

/// Parses "[-]h[h][:mm][:ss][.fff]" into a signed number of microseconds.
pub fn parse_duration_micros(s: &str) -> Option<i64> {
    let s = s.trim();
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if body.is_empty() {
        return None;
    }

    let (clock, fraction) = match body.split_once(['.', ',']) {
        Some((c, f)) => (c, Some(f)),
        None => (body, None),
    };

    let mut parts = clock.split([':', '-']);
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    let seconds: i64 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 || hours < 0 {
        return None;
    }

    let mut micros = hours
        .checked_mul(3600)?
        .checked_add(minutes * 60 + seconds)?
        .checked_mul(1_000_000)?;
    if let Some(f) = fraction {
        if f.is_empty() || f.len() > 6 || !f.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let scale = 10i64.pow(6 - f.len() as u32);
        micros = micros.checked_add(f.parse::<i64>().ok()? * scale)?;
    }

    return Some(if negative { -micros } else { micros });
}
