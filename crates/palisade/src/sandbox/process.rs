//! Running one command inside a sandbox volume.
//!
//! The child becomes the leader of a new session (and so of a new process
//! group), gets CPU, memory and file-size limits, a scrubbed environment, and
//! the network confinement its [`Egress`] asks for. Timeouts and cancellation
//! signal the whole group, never just the leader.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Volume;
use super::egress::{self, Egress};
#[cfg(target_os = "linux")]
use super::netns;
use crate::error::SandboxError;
use crate::limits::{ExecutionLimits, LimitedBuffer, ResourceQuota};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Program and arguments to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandPlan {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
}

impl CommandPlan {
    /// Build a plan from an argv template followed by extra arguments.
    pub(crate) fn from_template(template: &[String], extra: impl IntoIterator<Item = String>) -> Option<Self> {
        let (program, args) = template.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.iter().cloned().chain(extra).collect(),
        })
    }
}

/// Why the process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ended {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct ProcessOutcome {
    pub(crate) ended: Ended,
    pub(crate) exit_code: Option<i32>,
    pub(crate) stdout: LimitedBuffer,
    pub(crate) stderr: LimitedBuffer,
    pub(crate) wall: Duration,
}

enum FirstEvent {
    Exited(io::Result<ExitStatus>),
    Timeout,
    Cancel,
}

/// Run `plan` in `volume` and wait for it within the timeout from `limits`,
/// plus its grace period once the stop signal has been sent.
pub(crate) async fn run(
    plan: &CommandPlan,
    volume: &Volume,
    quota: ResourceQuota,
    limits: &ExecutionLimits,
    egress: &Egress,
    cancel: CancellationToken,
) -> Result<ProcessOutcome, SandboxError> {
    let timeout = limits.timeout;
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .current_dir(volume.work_dir())
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", volume.home_dir())
        .env("TMPDIR", volume.tmp_dir())
        .env("LANG", "C.UTF-8")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if matches!(egress, Egress::Proxied(_)) {
        let proxy = egress::proxy_url();
        for key in egress::PROXY_VARS {
            cmd.env(key, &proxy);
        }
    }
    let namespace = Namespace::prepare(egress)?;

    #[cfg(unix)]
    {
        let setup = namespace.child_setup();
        // SAFETY: the closure only makes async-signal-safe libc calls on
        // buffers prepared before the fork.
        unsafe {
            cmd.pre_exec(move || confine(quota, setup.as_ref()));
        }
    }
    #[cfg(not(unix))]
    let _ = quota;

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| SandboxError::Spawn(format!("{}: {e}", plan.program)))?;
    let pid = child.id();
    debug!(pid, program = %plan.program, egress = ?egress, "Spawned sandboxed process");

    let proxy = match namespace.start_proxy(egress) {
        Ok(proxy) => proxy,
        Err(e) => {
            signal_group(pid, Signal::Kill);
            let _ = child.wait().await;
            return Err(SandboxError::Spawn(format!("egress proxy: {e}")));
        }
    };

    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(drain(out, limits.max_output_bytes)));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(drain(err, limits.max_output_bytes)));

    let first = tokio::select! {
        status = child.wait() => FirstEvent::Exited(status),
        _ = tokio::time::sleep(timeout) => FirstEvent::Timeout,
        _ = cancel.cancelled() => FirstEvent::Cancel,
    };

    let (status, ended) = match first {
        FirstEvent::Exited(status) => (Some(status?), Ended::Exited),
        FirstEvent::Timeout => {
            warn!(pid, timeout_ms = timeout.as_millis() as u64, "Process timed out, sending SIGTERM");
            signal_group(pid, Signal::Terminate);
            let status = match tokio::time::timeout(limits.grace, child.wait()).await {
                Ok(status) => status.ok(),
                Err(_) => {
                    warn!(pid, "Process ignored SIGTERM, killing process group");
                    signal_group(pid, Signal::Kill);
                    child.wait().await.ok()
                }
            };
            (status, Ended::TimedOut)
        }
        FirstEvent::Cancel => {
            debug!(pid, "Cancelling process group");
            signal_group(pid, Signal::Kill);
            (child.wait().await.ok(), Ended::Cancelled)
        }
    };
    let wall = started.elapsed();

    // stragglers left behind by the leader would keep the pipes open
    signal_group(pid, Signal::Kill);
    if let Some(proxy) = proxy {
        proxy.abort();
    }

    let stdout = collect(stdout, limits).await;
    let stderr = collect(stderr, limits).await;

    Ok(ProcessOutcome {
        ended,
        exit_code: status.and_then(exit_code),
        stdout,
        stderr,
        wall,
    })
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> LimitedBuffer {
    let mut buf = LimitedBuffer::new(limit);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.write(&chunk[..n]);
            }
        }
    }
    buf
}

async fn collect(
    task: Option<tokio::task::JoinHandle<LimitedBuffer>>,
    limits: &ExecutionLimits,
) -> LimitedBuffer {
    let empty = || LimitedBuffer::new(limits.max_output_bytes);
    let Some(task) = task else {
        return empty();
    };
    match tokio::time::timeout(limits.grace, task).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            empty()
        }
        Err(_) => {
            warn!("Output pipe still open after the process exited; dropping output");
            empty()
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| 128 + sig))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) with a negative pid signals the process group; the
    // group was created by setsid in the child and holds only its processes.
    unsafe {
        libc::kill(-pid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

/// Network namespace plumbing for one spawn.
#[derive(Debug)]
struct Namespace {
    #[cfg(target_os = "linux")]
    maps: Option<netns::IdMaps>,
    #[cfg(target_os = "linux")]
    channel: Option<(std::os::unix::net::UnixStream, std::os::unix::net::UnixStream)>,
}

/// What the forked child needs to enter its namespace.
#[cfg(unix)]
#[derive(Debug, Clone)]
struct ChildSetup {
    #[cfg(target_os = "linux")]
    maps: netns::IdMaps,
    #[cfg(target_os = "linux")]
    channel: Option<std::os::fd::RawFd>,
}

impl Namespace {
    #[cfg(target_os = "linux")]
    fn prepare(egress: &Egress) -> Result<Self, SandboxError> {
        let (maps, channel) = match egress {
            Egress::Host => (None, None),
            Egress::Blocked => (Some(netns::IdMaps::current()), None),
            Egress::Proxied(_) => {
                let pair = std::os::unix::net::UnixStream::pair()
                    .map_err(|e| SandboxError::Spawn(format!("egress channel: {e}")))?;
                (Some(netns::IdMaps::current()), Some(pair))
            }
        };
        Ok(Self { maps, channel })
    }

    #[cfg(not(target_os = "linux"))]
    fn prepare(egress: &Egress) -> Result<Self, SandboxError> {
        match egress {
            Egress::Host => Ok(Self {}),
            Egress::Blocked | Egress::Proxied(_) => Err(SandboxError::Spawn(
                "network isolation is only available on Linux".to_string(),
            )),
        }
    }

    #[cfg(target_os = "linux")]
    fn child_setup(&self) -> Option<ChildSetup> {
        use std::os::fd::AsRawFd;
        self.maps.clone().map(|maps| ChildSetup {
            maps,
            channel: self.channel.as_ref().map(|(_, child)| child.as_raw_fd()),
        })
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn child_setup(&self) -> Option<ChildSetup> {
        None
    }

    /// Start serving the listener the child exported, if egress is proxied.
    /// Closes the parent's copy of the child's end of the channel.
    #[cfg(target_os = "linux")]
    fn start_proxy(mut self, egress: &Egress) -> io::Result<Option<tokio::task::JoinHandle<()>>> {
        let (Egress::Proxied(allowlist), Some((parent, child))) = (egress, self.channel.take())
        else {
            return Ok(None);
        };
        drop(child);
        let listener = netns::receive_listener(&parent)?;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        Ok(Some(egress::serve(listener, allowlist.clone())))
    }

    #[cfg(not(target_os = "linux"))]
    fn start_proxy(self, _egress: &Egress) -> io::Result<Option<tokio::task::JoinHandle<()>>> {
        Ok(None)
    }
}

/// Runs in the forked child before exec.
#[cfg(unix)]
fn confine(quota: ResourceQuota, setup: Option<&ChildSetup>) -> io::Result<()> {
    macro_rules! limit {
        ($resource:expr, $value:expr) => {{
            let value = $value as libc::rlim_t;
            let rlim = libc::rlimit {
                rlim_cur: value,
                rlim_max: value,
            };
            // SAFETY: plain syscall on a stack value.
            if unsafe { libc::setrlimit($resource, &rlim) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }};
    }

    // SAFETY: setsid is async-signal-safe and only affects the child.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    limit!(libc::RLIMIT_CPU, quota.cpu_seconds);
    limit!(libc::RLIMIT_DATA, quota.memory_bytes);
    limit!(libc::RLIMIT_FSIZE, quota.disk_bytes());

    #[cfg(target_os = "linux")]
    if let Some(setup) = setup {
        netns::enter(&setup.maps)?;
        if let Some(channel) = setup.channel {
            netns::export_listener(channel)?;
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = setup;

    Ok(())
}
