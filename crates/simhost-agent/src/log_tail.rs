use std::{
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

pub const DEFAULT_TAIL_BYTES: u64 = 16 * 1024;
pub const DEFAULT_TAIL_LINES: usize = 40;

/// Returns at most the last `max_lines` lines found in the last `max_bytes` of `path`.
///
/// Missing or unreadable logs yield an empty string; the tail only decorates errors.
pub fn read_log_tail(path: &Path, max_bytes: u64, max_lines: usize) -> String {
    match read_tail_bytes(path, max_bytes) {
        Ok(bytes) => last_lines(&String::from_utf8_lossy(&bytes), max_lines),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "log tail unavailable");
            String::new()
        }
    }
}

fn read_tail_bytes(path: &Path, max_bytes: u64) -> io::Result<Vec<u8>> {
    let mut f = std::fs::File::open(path)?;
    let len = f.metadata()?.len();
    let start = len.saturating_sub(max_bytes);
    f.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    f.take(max_bytes).read_to_end(&mut buf)?;

    // Drop the partial first line when we started mid-file.
    if start > 0
        && let Some(nl) = buf.iter().position(|b| *b == b'\n')
    {
        buf.drain(..=nl);
    }
    Ok(buf)
}

fn last_lines(s: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let from = lines.len().saturating_sub(max_lines);
    lines[from..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("carla.log");
        let body: String = (0..100).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&p, body).unwrap();

        assert_eq!(read_log_tail(&p, 1 << 20, 3), "line 97\nline 98\nline 99");
    }

    #[test]
    fn byte_window_drops_partial_first_line() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("carla.log");
        std::fs::write(&p, "aaaaaaaaaa\nbbbb\ncccc\n").unwrap();

        assert_eq!(read_log_tail(&p, 12, 10), "bbbb\ncccc");
    }

    #[test]
    fn missing_log_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_log_tail(&tmp.path().join("nope.log"), 1024, 10), "");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("carla.log");
        std::fs::write(&p, b"ok\n\xff\xfe boom\n").unwrap();
        let tail = read_log_tail(&p, 1024, 10);
        assert!(tail.starts_with("ok\n"));
        assert!(tail.ends_with(" boom"));
    }
}
