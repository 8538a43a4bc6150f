use std::path::Path;

/// Return the system hostname, or `"unknown"` if it cannot be determined.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".into())
    }

    #[cfg(windows)]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".into())
    }
}

/// Fully qualified domain name. Falls back to the bare hostname when no
/// domain is configured.
pub fn fqdn() -> String {
    // gethostname may or may not include the domain; keep whatever it gives.
    hostname()
}

/// Stable host identifier used in lock entries: FQDN plus a node id that
/// survives hostname changes, overridable for containers and clones.
pub fn host_id(override_id: Option<&str>) -> String {
    if let Some(id) = override_id {
        return id.to_string();
    }
    format!("{}@{}", fqdn(), node_id())
}

/// A per-installation identifier. Uses the machine id where available so
/// two hosts with the same hostname are still distinguishable.
fn node_id() -> String {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = std::fs::read_to_string(path) {
            let id = id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    "unknown-node".into()
}

/// Current username, or `"unknown"`.
pub fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

/// Current process id.
pub fn pid() -> u32 {
    std::process::id()
}

/// Whether a process with the given pid is alive on this machine.
/// Only meaningful when the lock holder's host id matches ours.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true, // exists, owned by someone else
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    // No cheap probe; treat as alive so locks are never broken wrongly.
    true
}

/// Create a symlink (unix only; other platforms get a regular file with
/// the target as content, matching what tar-style tools do).
pub fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(not(unix))]
    {
        std::fs::write(link, target.to_string_lossy().as_bytes())
    }
}

/// Create a FIFO with the given mode (unix only).
#[cfg(unix)]
pub fn create_fifo(path: &Path, mode: u32) -> std::io::Result<()> {
    use nix::sys::stat::Mode;
    nix::unistd::mkfifo(path, Mode::from_bits_truncate(mode))
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

#[cfg(not(unix))]
pub fn create_fifo(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Err(std::io::Error::other("FIFOs are not supported here"))
}

/// Stat fields the engine cares about, in one portable shape.
#[derive(Debug, Clone, Copy)]
pub struct MetadataSummary {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: i64,
    pub atime_ns: Option<i64>,
    pub ctime_ns: i64,
    pub birthtime_ns: Option<i64>,
    pub device: u64,
    pub inode: u64,
    pub rdev: u64,
    pub size: u64,
    pub nlink: u64,
}

pub fn summarize_metadata(metadata: &std::fs::Metadata) -> MetadataSummary {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        MetadataSummary {
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            mtime_ns: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            atime_ns: Some(metadata.atime() * 1_000_000_000 + metadata.atime_nsec()),
            ctime_ns: metadata.ctime() * 1_000_000_000 + metadata.ctime_nsec(),
            birthtime_ns: metadata
                .created()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i64),
            device: metadata.dev(),
            inode: metadata.ino(),
            rdev: metadata.rdev(),
            size: metadata.len(),
            nlink: metadata.nlink(),
        }
    }

    #[cfg(not(unix))]
    {
        let mtime_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        MetadataSummary {
            mode: if metadata.permissions().readonly() {
                0o444
            } else {
                0o644
            },
            uid: 0,
            gid: 0,
            mtime_ns,
            atime_ns: None,
            ctime_ns: mtime_ns,
            birthtime_ns: None,
            device: 0,
            inode: 0,
            rdev: 0,
            size: metadata.len(),
            nlink: 1,
        }
    }
}
