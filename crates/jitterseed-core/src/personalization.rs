//! Per-instance personalisation string.
//!
//! Mixed into the conditioner key so that two TRNG instances started from the
//! same noise never produce the same output stream. None of it is secret or
//! counted as entropy.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::counter::{read_raw_counter, spin_delay};

/// Counter readings sampled into the personalisation string.
const JITTER_READS: usize = 16;

/// Builder for the personalisation bytes. Fields are length-prefixed so that
/// no two distinct inputs serialise identically.
#[derive(Debug, Default, Clone)]
pub struct Personalization {
    bytes: Vec<u8>,
}

impl Personalization {
    /// Empty personalisation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wall clock, process, thread, host and counter jitter, followed by the
    /// caller's `extra` input.
    pub fn gather(extra: &[u8]) -> Self {
        let mut p = Self::new();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        p.push(b"time", &now.to_le_bytes());
        p.push(b"pid", &std::process::id().to_le_bytes());
        p.push(b"tid", &thread_id());
        if let Some(host) = hostname() {
            p.push(b"host", &host);
        }
        p.push(b"jitter", &counter_jitter());
        p.push(b"extra", extra);
        p
    }

    /// Append one labelled field.
    pub fn push(&mut self, label: &[u8], value: &[u8]) -> &mut Self {
        self.bytes.push(label.len() as u8);
        self.bytes.extend_from_slice(label);
        self.bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(value);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(target_os = "linux")]
fn thread_id() -> Vec<u8> {
    // SAFETY: gettid takes no arguments and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    tid.to_le_bytes().to_vec()
}

#[cfg(not(target_os = "linux"))]
fn thread_id() -> Vec<u8> {
    format!("{:?}", std::thread::current().id()).into_bytes()
}

#[cfg(unix)]
fn hostname() -> Option<Vec<u8>> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(buf[..len].to_vec())
}

#[cfg(not(unix))]
fn hostname() -> Option<Vec<u8>> {
    None
}

fn counter_jitter() -> Vec<u8> {
    let mut out = Vec::with_capacity(JITTER_READS * 8);
    for i in 0..JITTER_READS {
        spin_delay(i as u32 * 7 + 1);
        out.extend_from_slice(&read_raw_counter().to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_length_prefixed() {
        let mut a = Personalization::new();
        a.push(b"x", b"ab").push(b"y", b"c");
        let mut b = Personalization::new();
        b.push(b"x", b"a").push(b"y", b"bc");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn gather_includes_extra_input() {
        let p = Personalization::gather(b"caller-context");
        let bytes = p.into_bytes();
        assert!(
            bytes
                .windows(b"caller-context".len())
                .any(|w| w == b"caller-context")
        );
    }

    #[test]
    fn consecutive_gathers_differ() {
        let a = Personalization::gather(b"");
        let b = Personalization::gather(b"");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
