/// One live entry of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    pub pgid: Option<i32>,
    pub state: char,
    pub cmdline: String,
}

impl ProcEntry {
    pub fn leads_group(&self) -> bool {
        self.pgid == Some(self.pid as i32)
    }
}

/// Parses `(state, pgid)` out of `/proc/<pid>/stat`.
///
/// The command name field may contain spaces and parentheses, so fields are read after
/// the last `)`.
fn parse_stat(s: &str) -> Option<(char, Option<i32>)> {
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let mut it = rest.split_whitespace();
    let state = it.next()?.chars().next()?;
    let _ppid = it.next();
    let pgid = it.next().and_then(|v| v.parse::<i32>().ok());
    Some((state, pgid))
}

fn join_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(target_os = "linux")]
fn read_entry(pid: u32) -> Option<ProcEntry> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    // Kernel threads have an empty cmdline.
    if raw.is_empty() {
        return None;
    }
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (state, pgid) = parse_stat(&stat)?;
    Some(ProcEntry {
        pid,
        pgid,
        state,
        cmdline: join_cmdline(&raw),
    })
}

/// Snapshot of live processes, excluding zombies and the current process.
#[cfg(target_os = "linux")]
pub fn scan() -> Vec<ProcEntry> {
    let me = std::process::id();
    let Ok(rd) = std::fs::read_dir("/proc") else {
        tracing::warn!("/proc not readable; process table scan returns nothing");
        return Vec::new();
    };

    let mut out = Vec::new();
    for e in rd.flatten() {
        let Some(pid) = e.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == me {
            continue;
        }
        // Processes may vanish between readdir and read; that is not an error.
        let Some(entry) = read_entry(pid) else {
            continue;
        };
        if matches!(entry.state, 'Z' | 'X') {
            continue;
        }
        out.push(entry);
    }
    out.sort_by_key(|e| e.pid);
    out
}

#[cfg(not(target_os = "linux"))]
pub fn scan() -> Vec<ProcEntry> {
    Vec::new()
}

pub fn find_matching(signature: &str) -> Vec<ProcEntry> {
    if signature.trim().is_empty() {
        return Vec::new();
    }
    scan()
        .into_iter()
        .filter(|e| e.cmdline.contains(signature))
        .collect()
}

pub fn pids(entries: &[ProcEntry]) -> Vec<u32> {
    entries.iter().map(|e| e.pid).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_with_spaces_in_comm() {
        let s = "4242 (Carla UE4 (x)) S 1 4242 4242 0 -1 4194560 123";
        assert_eq!(parse_stat(s), Some(('S', Some(4242))));
    }

    #[test]
    fn stat_zombie() {
        let s = "77 (sh) Z 1 70 70 0";
        assert_eq!(parse_stat(s), Some(('Z', Some(70))));
    }

    #[test]
    fn stat_garbage() {
        assert_eq!(parse_stat("no parens here"), None);
    }

    #[test]
    fn cmdline_is_space_joined() {
        let raw = b"/opt/carla/CarlaUE4.sh\0-RenderOffScreen\0-carla-rpc-port=2000\0";
        assert_eq!(
            join_cmdline(raw),
            "/opt/carla/CarlaUE4.sh -RenderOffScreen -carla-rpc-port=2000"
        );
    }

    #[test]
    fn blank_signature_matches_nothing() {
        assert!(find_matching("  ").is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn scan_skips_self_and_finds_children() {
        let me = std::process::id();
        let mut child = std::process::Command::new("sleep")
            .arg("30.123457")
            .spawn()
            .unwrap();

        // Between fork and exec the child still shows our cmdline.
        let mut found = Vec::new();
        for _ in 0..100 {
            found = find_matching("sleep 30.123457");
            if !found.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        child.kill().unwrap();
        child.wait().unwrap();

        assert!(scan().iter().all(|e| e.pid != me));
        assert_eq!(pids(&found), vec![child.id()]);
    }
}
