//! Minimal streaming `/proc` process table reader.
//!
//! Feeds the telemetry surface with one [`ProcessInfo`] per live process.
//! The iterator is lazy and restartable: directory entries are consumed in
//! pages, a single read buffer is reused across files (grown, never
//! shrunk), and any error reading an individual process is absorbed since
//! the process may have exited between the directory listing and the file
//! read.

use std::collections::VecDeque;
use std::fs::{self, File, ReadDir};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Directory entries consumed per page.
const DIRENT_PAGE_SIZE: usize = 256;

/// Kernel clock ticks per second for utime/stime accounting.
const USER_HZ: u64 = 100;

/// A snapshot of one process.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessInfo {
    /// Process id.
    pub pid: i32,

    /// Parent process id.
    pub ppid: i32,

    /// Single-character process state.
    pub state: String,

    /// Thread count.
    pub threads: i32,

    /// CPU seconds consumed (user + system).
    pub cpu_time: f64,

    /// Virtual memory size in bytes.
    pub virtual_memory: u64,

    /// Resident set size in bytes.
    pub resident_memory: u64,

    /// Resolved `exe` symlink target; empty when unreadable.
    pub executable: String,

    /// Process name from `comm`.
    pub command: String,

    /// Command line with NUL separators replaced by spaces.
    pub args: String,
}

/// Lazy iterator over the process table.
pub struct Processes {
    root: PathBuf,
    dir: ReadDir,
    page: VecDeque<i32>,
    buf: Vec<u8>,
    page_size: u64,
}

impl Processes {
    /// Open the system process table at `/proc`.
    pub fn new() -> io::Result<Self> {
        Self::with_root("/proc")
    }

    /// Open a process table under a different root (for tests).
    pub fn with_root(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let dir = fs::read_dir(&root)?;

        Ok(Self {
            root,
            dir,
            page: VecDeque::with_capacity(DIRENT_PAGE_SIZE),
            buf: Vec::new(),
            page_size: page_size(),
        })
    }

    /// Read the next live process, skipping unreadable ones.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<ProcessInfo> {
        loop {
            let pid = self.next_pid()?;

            if let Some(info) = self.read_process(pid) {
                return Some(info);
            }
        }
    }

    fn next_pid(&mut self) -> Option<i32> {
        if self.page.is_empty() {
            self.fill_page();
        }

        self.page.pop_front()
    }

    fn fill_page(&mut self) {
        while self.page.len() < DIRENT_PAGE_SIZE {
            let Some(entry) = self.dir.next() else {
                break;
            };

            let Ok(entry) = entry else {
                continue;
            };

            if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                self.page.push_back(pid);
            }
        }
    }

    fn read_process(&mut self, pid: i32) -> Option<ProcessInfo> {
        let proc_dir = self.root.join(pid.to_string());

        let executable = fs::read_link(proc_dir.join("exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        read_into(&mut self.buf, &proc_dir.join("comm")).ok()?;
        let command = String::from_utf8_lossy(&self.buf).trim().to_string();

        read_into(&mut self.buf, &proc_dir.join("cmdline")).ok()?;
        let args = decode_cmdline(&self.buf);

        read_into(&mut self.buf, &proc_dir.join("stat")).ok()?;
        let stat = parse_stat(&String::from_utf8_lossy(&self.buf))?;

        Some(ProcessInfo {
            pid,
            ppid: stat.ppid,
            state: stat.state,
            threads: stat.threads,
            cpu_time: (stat.utime + stat.stime) as f64 / USER_HZ as f64,
            virtual_memory: stat.vsize,
            resident_memory: stat.rss.saturating_mul(self.page_size),
            executable,
            command,
            args,
        })
    }
}

impl Iterator for Processes {
    type Item = ProcessInfo;

    fn next(&mut self) -> Option<ProcessInfo> {
        Processes::next(self)
    }
}

/// Read a whole file into the shared buffer, reusing its capacity.
fn read_into(buf: &mut Vec<u8>, path: &Path) -> io::Result<()> {
    buf.clear();
    File::open(path)?.read_to_end(buf)?;

    Ok(())
}

/// NUL-separated command line to a space-separated string, trailing NULs
/// trimmed.
fn decode_cmdline(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);

    String::from_utf8_lossy(&raw[..end]).replace('\0', " ")
}

struct Stat {
    state: String,
    ppid: i32,
    utime: u64,
    stime: u64,
    threads: i32,
    vsize: u64,
    rss: u64,
}

/// Parse `/proc/<pid>/stat`.
///
/// The second field (`comm`) may contain spaces and parentheses; everything
/// before the last `)` is the name, the rest splits on whitespace.
fn parse_stat(raw: &str) -> Option<Stat> {
    let rest = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    Some(Stat {
        state: fields.first()?.to_string(),
        ppid: fields.get(1)?.parse().ok()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        threads: fields.get(17)?.parse().ok()?,
        vsize: fields.get(20)?.parse().ok()?,
        rss: fields.get(21)?.parse().ok()?,
    })
}

fn page_size() -> u64 {
    // sysconf can't fail for _SC_PAGESIZE on Linux; fall back defensively
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if size > 0 {
        size as u64
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_process(root: &Path, pid: i32, comm: &str, stat_comm: &str) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();

        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        fs::write(dir.join("cmdline"), b"/usr/bin/tool\0--flag\0value\0").unwrap();
        fs::write(
            dir.join("stat"),
            format!(
                "{pid} ({stat_comm}) S 1 {pid} {pid} 0 -1 4194560 1000 0 0 0 \
                 250 150 0 0 20 0 3 0 100 12345678 2000 18446744073709551615 \
                 1 1 0 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0"
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_reads_process_fields() {
        let root = tempfile::tempdir().unwrap();
        write_process(root.path(), 42, "tool", "tool");

        let mut procs = Processes::with_root(root.path()).unwrap();
        let info = procs.next().unwrap();

        assert_eq!(info.pid, 42);
        assert_eq!(info.ppid, 1);
        assert_eq!(info.state, "S");
        assert_eq!(info.threads, 3);
        assert_eq!(info.command, "tool");
        assert_eq!(info.args, "/usr/bin/tool --flag value");
        assert_eq!(info.cpu_time, 4.0); // (250 + 150) / 100
        assert_eq!(info.virtual_memory, 12345678);
        assert_eq!(info.resident_memory, 2000 * page_size());

        assert!(procs.next().is_none());
    }

    #[test]
    fn test_comm_with_spaces_and_parens() {
        let root = tempfile::tempdir().unwrap();
        write_process(root.path(), 7, "weird (name)", "weird (name)");

        let mut procs = Processes::with_root(root.path()).unwrap();
        let info = procs.next().unwrap();

        assert_eq!(info.state, "S");
        assert_eq!(info.ppid, 1);
    }

    #[test]
    fn test_broken_process_skipped() {
        let root = tempfile::tempdir().unwrap();

        // half-vanished process: directory without files
        fs::create_dir_all(root.path().join("13")).unwrap();
        write_process(root.path(), 42, "tool", "tool");

        // non-numeric entries are not processes
        fs::create_dir_all(root.path().join("sys")).unwrap();

        let pids: Vec<i32> = Processes::with_root(root.path()).unwrap().map(|p| p.pid).collect();
        assert_eq!(pids, vec![42]);
    }

    #[test]
    fn test_many_processes_paged() {
        let root = tempfile::tempdir().unwrap();

        for pid in 1..=600 {
            write_process(root.path(), pid, "p", "p");
        }

        let count = Processes::with_root(root.path()).unwrap().count();
        assert_eq!(count, 600);
    }
}
