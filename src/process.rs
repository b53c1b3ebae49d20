use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{HarnessError, Result};

pub const ENV_ID: &str = "RLENV_ID";
pub const ENV_ADDR: &str = "RLENV_ADDR";
pub const ENV_PORT: &str = "RLENV_PORT";
pub const ENV_CONFIG: &str = "RLENV_CONFIG";
pub const ENV_WORKDIR: &str = "RLENV_WORKDIR";
pub const ENV_TRAINING_MODE: &str = "RLENV_TRAINING_MODE";

// =============================================================================
// Port Inspection
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortStatus {
    Free,
    HeldBy { pid: u32, name: String },
    /// In use, but the owning process could not be identified.
    HeldByUnknown,
}

/// Finds out who is listening on a local port and can kill stale owners.
pub trait PortInspector: Send + Sync {
    fn status(&self, port: u16) -> io::Result<PortStatus>;
    fn kill(&self, pid: u32) -> io::Result<()>;
}

/// Reads `/proc/net/tcp{,6}` and walks `/proc/<pid>/fd` to map socket inodes
/// back to processes. On other platforms every port reads as free.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcNetInspector;

#[cfg(any(target_os = "linux", test))]
const TCP_TIME_WAIT: &str = "06";

#[cfg(target_os = "linux")]
impl ProcNetInspector {
    fn socket_inodes(port: u16) -> io::Result<Vec<u64>> {
        let mut inodes = Vec::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            let contents = match std::fs::read_to_string(table) {
                Ok(c) => c,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            inodes.extend(parse_tcp_table(&contents, port));
        }
        Ok(inodes)
    }

    fn owner_of(inodes: &[u64]) -> io::Result<Option<u32>> {
        let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();
        for entry in std::fs::read_dir("/proc")? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // processes of other users are unreadable; skip them
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                let Ok(link) = std::fs::read_link(fd.path()) else {
                    continue;
                };
                if targets.iter().any(|t| link.as_os_str() == OsStr::new(t)) {
                    return Ok(Some(pid));
                }
            }
        }
        Ok(None)
    }

    fn process_name(pid: u32) -> Option<String> {
        let proc_dir = PathBuf::from(format!("/proc/{pid}"));
        let comm = std::fs::read_to_string(proc_dir.join("comm")).ok()?;
        let comm = comm.trim_end().to_string();
        // the kernel truncates comm to 15 bytes
        if comm.len() >= 15 {
            let full = std::fs::read_link(proc_dir.join("exe"))
                .ok()
                .and_then(|exe| exe.file_name().and_then(OsStr::to_str).map(str::to_string));
            if let Some(full) = full.filter(|f| f.starts_with(&comm)) {
                return Some(full);
            }
        }
        Some(comm)
    }
}

/// Socket inodes in a `/proc/net/tcp` table bound locally to `port`,
/// excluding connections in `TIME_WAIT`.
#[cfg(any(target_os = "linux", test))]
fn parse_tcp_table(contents: &str, port: u16) -> Vec<u64> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 10 {
                return None;
            }
            let local_port = cols[1].rsplit(':').next()?;
            let local_port = u16::from_str_radix(local_port, 16).ok()?;
            if local_port != port || cols[3] == TCP_TIME_WAIT {
                return None;
            }
            cols[9].parse::<u64>().ok().filter(|&inode| inode != 0)
        })
        .collect()
}

#[cfg(target_os = "linux")]
impl PortInspector for ProcNetInspector {
    fn status(&self, port: u16) -> io::Result<PortStatus> {
        let inodes = Self::socket_inodes(port)?;
        if inodes.is_empty() {
            return Ok(PortStatus::Free);
        }
        match Self::owner_of(&inodes)? {
            Some(pid) => match Self::process_name(pid) {
                Some(name) => Ok(PortStatus::HeldBy { pid, name }),
                None => Ok(PortStatus::HeldByUnknown),
            },
            None => Ok(PortStatus::HeldByUnknown),
        }
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        kill_pid(pid)
    }
}

#[cfg(not(target_os = "linux"))]
impl PortInspector for ProcNetInspector {
    fn status(&self, _port: u16) -> io::Result<PortStatus> {
        Ok(PortStatus::Free)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        kill_pid(pid)
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("bad pid {pid}")))?;
    kill(Pid::from_raw(raw), Signal::SIGKILL).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot kill foreign process {pid} on this platform"),
    ))
}

/// Makes sure nothing but a stale copy of our own executable holds `port`.
///
/// A stale copy is killed and given `grace` to release the port; this repeats
/// up to `attempts` times. A holder with any other name is never touched.
pub fn ensure_port_free(
    inspector: &dyn PortInspector,
    port: u16,
    exe_name: &str,
    attempts: u32,
    grace: Duration,
) -> Result<()> {
    let mut holder = String::from("unknown process");
    for attempt in 1..=attempts.max(1) {
        match inspector.status(port)? {
            PortStatus::Free => return Ok(()),
            PortStatus::HeldBy { pid, name } if name == exe_name => {
                warn!(port, pid, attempt, "killing stale game process holding port");
                inspector.kill(pid)?;
                std::thread::sleep(grace);
                holder = format!("{name} (pid {pid})");
            }
            PortStatus::HeldBy { pid, name } => {
                return Err(HarnessError::PortConflict {
                    port,
                    holder: format!("{name} (pid {pid})"),
                });
            }
            PortStatus::HeldByUnknown => {
                return Err(HarnessError::PortConflict {
                    port,
                    holder: "unknown process".to_string(),
                });
            }
        }
    }
    Err(HarnessError::PortConflict { port, holder })
}

// =============================================================================
// Game Process
// =============================================================================

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub identifier: String,
    pub executable: PathBuf,
    pub host: String,
    pub port: u16,
    pub config_path: PathBuf,
    /// Each launch gets its own uniquely named directory below this root.
    pub work_dir_root: PathBuf,
    pub training_mode: bool,
}

impl ProcessSpec {
    fn exe_name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn exe_dir(&self) -> &Path {
        match self.executable.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

/// Owns the child process handle of one game launch.
pub struct GameProcess {
    spec: ProcessSpec,
    child: Option<Child>,
    work_dir: Option<PathBuf>,
}

impl GameProcess {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            child: None,
            work_dir: None,
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn start(&mut self, inspector: &dyn PortInspector, tuning: &SupervisorConfig) -> Result<()> {
        if self.child.is_some() {
            return Err(HarnessError::invalid_state("game process already started"));
        }
        ensure_port_free(
            inspector,
            self.spec.port,
            &self.spec.exe_name(),
            tuning.port_check_attempts,
            tuning.port_kill_grace,
        )?;

        let work_dir = self
            .spec
            .work_dir_root
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&self.spec.work_dir_root)?;
        std::fs::create_dir(&work_dir)?;

        let child = Command::new(&self.spec.executable)
            .current_dir(self.spec.exe_dir())
            .env("HOME", &work_dir)
            .env(ENV_ID, &self.spec.identifier)
            .env(ENV_ADDR, &self.spec.host)
            .env(ENV_PORT, self.spec.port.to_string())
            .env(ENV_CONFIG, &self.spec.config_path)
            .env(ENV_WORKDIR, &work_dir)
            .env(
                ENV_TRAINING_MODE,
                if self.spec.training_mode { "true" } else { "false" },
            )
            .stdin(Stdio::null())
            .spawn()?;

        info!(
            id = %self.spec.identifier,
            port = self.spec.port,
            pid = child.id(),
            work_dir = %work_dir.display(),
            "spawned game process"
        );
        self.child = Some(child);
        self.work_dir = Some(work_dir);
        Ok(())
    }

    /// Kills the process and waits up to `timeout` for it to exit.
    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = child.id();
        if let Err(e) = child.kill() {
            // already exited and reaped is fine
            if e.kind() != io::ErrorKind::InvalidInput {
                return Err(e.into());
            }
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                debug!(pid, ?status, "game process exited");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::ShutdownTimeout { pid, timeout });
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for GameProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.try_wait();
        }
    }
}
