//! Shared audio utilities.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since UNIX epoch.
/// Used for event timestamps and stage timings.
#[inline]
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a simple unique id based on current time in nanoseconds.
/// Sufficient for naming short-lived WAV files.
#[inline]
pub(crate) fn gen_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos)
}

pub(crate) fn get_from_env_or_path(env_key: &str, default_bin: &str) -> Option<PathBuf> {
    if let Ok(p) = std::env::var(env_key) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Some(pb);
        }
    }
    get_from_path(default_bin)
}

pub(crate) fn get_from_path(bin: &str) -> Option<PathBuf> {
    // If a path-like string is provided, respect it directly
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let p = PathBuf::from(bin);
        return if p.exists() { Some(p) } else { None };
    }

    if let Some(paths_os) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths_os) {
            let candidate = dir.join(bin);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Scales 16-bit PCM samples of a WAV buffer in place. Buffers that are not
/// RIFF/WAVE or have no data chunk are left untouched.
pub(crate) fn scale_wav_pcm16(buf: &mut [u8], gain: f32) -> bool {
    if buf.len() < 12 || &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return false;
    }
    let mut idx = 12;
    while idx + 8 <= buf.len() {
        let chunk_id = [buf[idx], buf[idx + 1], buf[idx + 2], buf[idx + 3]];
        let sz =
            u32::from_le_bytes([buf[idx + 4], buf[idx + 5], buf[idx + 6], buf[idx + 7]]) as usize;
        if &chunk_id == b"data" {
            let start = idx + 8;
            let end = (start + sz).min(buf.len());
            for chunk in buf[start..end].chunks_exact_mut(2) {
                let s = i16::from_le_bytes([chunk[0], chunk[1]]);
                let scaled = (s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                chunk.copy_from_slice(&scaled.to_le_bytes());
            }
            return true;
        }
        idx += 8 + sz;
    }
    false
}

pub(crate) fn is_executable_name(path: &Path, name: &str) -> bool {
    path.file_name().and_then(|s| s.to_str()) == Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav(samples: &[i16]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"RIFF");
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(b"WAVE");
        buf.extend_from_slice(b"fmt ");
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(b"data");
        buf.extend_from_slice(&((samples.len() * 2) as u32).to_le_bytes());
        for s in samples {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        buf
    }

    #[test]
    fn scales_and_clamps_samples() {
        let mut buf = wav(&[100, -100, 30_000]);
        assert!(scale_wav_pcm16(&mut buf, 2.0));
        let data = &buf[buf.len() - 6..];
        assert_eq!(i16::from_le_bytes([data[0], data[1]]), 200);
        assert_eq!(i16::from_le_bytes([data[2], data[3]]), -200);
        assert_eq!(i16::from_le_bytes([data[4], data[5]]), i16::MAX);
    }

    #[test]
    fn ignores_non_wav() {
        let mut buf = b"not a wav".to_vec();
        assert!(!scale_wav_pcm16(&mut buf, 2.0));
    }
}
