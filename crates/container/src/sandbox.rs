//! The container init process and its control protocol.
//!
//! `cvd` re-executes itself as the init: the host side spawns the current
//! binary with a namespace-entering hook, keeps one end of a socket pair,
//! and drives the init over newline-delimited JSON. The init execs build
//! commands after installing the policy's syscall filter in the child.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::{Duration, Instant};

use chef_policy::Policy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::container::Capabilities;
use crate::{ContainerError, Result};

/// Fixed descriptor the control socket occupies in the init process.
pub const CONTROL_FD: i32 = 3;

/// Argument that routes the binary into init mode instead of the daemon.
pub const INIT_SENTINEL: &str = "sandbox-init";

#[derive(Debug, Serialize, Deserialize)]
pub enum InitRequest {
    /// First message after startup; arms the policy used for every spawn.
    Configure {
        policy: Policy,
        caps: Capabilities,
    },
    Spawn {
        program: String,
        arguments: String,
        env: Vec<String>,
        wait: bool,
    },
    Kill {
        pid: i32,
        signal: i32,
    },
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum InitResponse {
    Ready,
    Spawned { pid: i32 },
    Exited { pid: i32, code: i32 },
    Killed,
    ShuttingDown,
    Error { message: String },
}

/// Host-side handle to a running container init.
pub struct SandboxInit {
    child: Child,
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl SandboxInit {
    /// Spawn the init inside the composed root and arm it with `policy`.
    #[cfg(target_os = "linux")]
    pub fn start(
        root: &Path,
        cgroup_procs: Option<PathBuf>,
        policy: &Policy,
        caps: Capabilities,
    ) -> Result<Self> {
        use std::os::fd::AsRawFd;
        use std::os::unix::process::CommandExt;

        let (host_end, init_end) = UnixStream::pair()
            .map_err(|e| ContainerError::Internal(format!("socketpair failed: {e}")))?;

        let exe = std::env::current_exe()
            .map_err(|e| ContainerError::Internal(format!("cannot resolve own binary: {e}")))?;
        let root = root.to_path_buf();
        let init_fd = init_end.as_raw_fd();
        // Without the IPC capability the container gets its own IPC
        // namespace.
        let isolate_ipc = !caps.contains(Capabilities::IPC);

        let mut command = std::process::Command::new(exe);
        command.arg(INIT_SENTINEL);
        unsafe {
            command.pre_exec(move || {
                // Runs in the child before exec: wire the control fd, join
                // the cgroup, then enter the namespaces and pivot.
                if libc::dup2(init_fd, CONTROL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(procs) = &cgroup_procs {
                    let _ = std::fs::write(procs, std::process::id().to_string());
                }
                linux::enter_sandbox(&root, isolate_ipc).map_err(std::io::Error::other)
            });
        }
        let child = command
            .spawn()
            .map_err(|e| ContainerError::Internal(format!("spawning container init: {e}")))?;
        drop(init_end);

        let reader = BufReader::new(host_end.try_clone().map_err(|e| {
            ContainerError::Internal(format!("cloning control socket: {e}"))
        })?);
        let mut init = Self {
            child,
            writer: host_end,
            reader,
        };

        match init.request(&InitRequest::Configure {
            policy: policy.clone(),
            caps,
        })? {
            InitResponse::Ready => Ok(init),
            other => Err(ContainerError::Internal(format!(
                "container init refused configuration: {other:?}"
            ))),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn start(
        _root: &Path,
        _cgroup_procs: Option<PathBuf>,
        _policy: &Policy,
        _caps: Capabilities,
    ) -> Result<Self> {
        Err(ContainerError::Internal(
            "container init requires Linux".to_string(),
        ))
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// One request/response round-trip on the control socket.
    pub fn request(&mut self, request: &InitRequest) -> Result<InitResponse> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| ContainerError::Internal(format!("encoding init request: {e}")))?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .map_err(|e| ContainerError::Internal(format!("control socket write: {e}")))?;

        let mut response = String::new();
        let read = self
            .reader
            .read_line(&mut response)
            .map_err(|e| ContainerError::Internal(format!("control socket read: {e}")))?;
        if read == 0 {
            return Err(ContainerError::Internal(
                "container init closed the control socket".to_string(),
            ));
        }
        serde_json::from_str(response.trim_end())
            .map_err(|e| ContainerError::Internal(format!("decoding init response: {e}")))
    }

    /// Ask the init to exit, then reap it; escalates to SIGKILL after a
    /// grace period.
    pub fn shutdown(mut self) -> Result<()> {
        match self.request(&InitRequest::Shutdown) {
            Ok(InitResponse::ShuttingDown) => {}
            Ok(other) => debug!(?other, "unexpected shutdown response"),
            Err(e) => debug!(error = %e, "shutdown request failed, killing init"),
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        warn!(pid = self.child.id(), "container init ignored shutdown, killing");
                        let _ = self.child.kill();
                        let _ = self.child.wait();
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(ContainerError::Internal(format!(
                        "waiting for container init: {e}"
                    )))
                }
            }
        }
    }
}

/// Entry point of the init process. Never returns; the caller is the `cvd`
/// binary dispatching on [`INIT_SENTINEL`].
#[cfg(target_os = "linux")]
pub fn init_main() -> ! {
    let code = match linux::serve() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("container init failed: {e}");
            1
        }
    };
    std::process::exit(code);
}

#[cfg(target_os = "linux")]
mod linux {
    use std::io::{BufRead, BufReader, Write};
    use std::os::fd::FromRawFd;
    use std::os::unix::net::UnixStream;
    use std::os::unix::process::CommandExt;
    use std::path::Path;
    use std::process::{Child, Command};

    use chef_policy::{seccomp, Policy};
    use nix::mount::{mount, umount2, MntFlags, MsFlags};
    use nix::sched::{unshare, CloneFlags};
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};
    use nix::unistd::{pivot_root, Uid};

    use super::{InitRequest, InitResponse, CONTROL_FD};
    use crate::container::Capabilities;

    /// Namespace entry, pivot, and minimal filesystem. Runs pre-exec in the
    /// init child while the host's composed mounts are still visible.
    pub(super) fn enter_sandbox(root: &Path, isolate_ipc: bool) -> Result<(), String> {
        if !Uid::effective().is_root() {
            setup_user_namespace()?;
        }

        let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID;
        if isolate_ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        unshare(flags).map_err(|e| format!("unshare failed: {e}"))?;

        // Prevent mount propagation leaks back to the host.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| format!("making mounts private: {e}"))?;

        // pivot_root requires the new root to be a mount point.
        mount(
            Some(root),
            root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| format!("binding new root: {e}"))?;

        let old_root = root.join("old_root");
        std::fs::create_dir_all(&old_root).map_err(|e| format!("creating old_root: {e}"))?;
        pivot_root(root, &old_root).map_err(|e| format!("pivot_root: {e}"))?;
        std::env::set_current_dir("/").map_err(|e| format!("chdir to new root: {e}"))?;

        std::fs::create_dir_all("/proc").map_err(|e| format!("creating /proc: {e}"))?;
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| format!("mounting /proc: {e}"))?;

        setup_minimal_dev()?;

        umount2("/old_root", MntFlags::MNT_DETACH)
            .map_err(|e| format!("detaching old root: {e}"))?;
        let _ = std::fs::remove_dir("/old_root");

        Ok(())
    }

    fn setup_user_namespace() -> Result<(), String> {
        use nix::unistd::{getgid, getuid};

        let uid = getuid();
        let gid = getgid();
        unshare(CloneFlags::CLONE_NEWUSER).map_err(|e| format!("unshare(user): {e}"))?;
        std::fs::write("/proc/self/setgroups", "deny")
            .map_err(|e| format!("setgroups deny: {e}"))?;
        std::fs::write("/proc/self/uid_map", format!("0 {uid} 1"))
            .map_err(|e| format!("uid_map: {e}"))?;
        std::fs::write("/proc/self/gid_map", format!("0 {gid} 1"))
            .map_err(|e| format!("gid_map: {e}"))?;
        Ok(())
    }

    fn setup_minimal_dev() -> Result<(), String> {
        std::fs::create_dir_all("/dev").map_err(|e| format!("creating /dev: {e}"))?;
        let devices = [
            ("null", 1, 3),
            ("zero", 1, 5),
            ("random", 1, 8),
            ("urandom", 1, 9),
            ("tty", 5, 0),
        ];
        for (name, major, minor) in devices {
            let path = Path::new("/dev").join(name);
            if path.exists() {
                continue;
            }
            mknod(
                &path,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o666),
                makedev(major, minor),
            )
            .map_err(|e| format!("mknod /dev/{name}: {e}"))?;
        }
        Ok(())
    }

    struct InitState {
        policy: Option<Policy>,
        caps: Capabilities,
        children: Vec<Child>,
    }

    /// The init serve loop: single-threaded, one request at a time.
    pub(super) fn serve() -> Result<(), String> {
        let control = unsafe { UnixStream::from_raw_fd(CONTROL_FD) };
        let mut writer = control
            .try_clone()
            .map_err(|e| format!("cloning control socket: {e}"))?;
        let reader = BufReader::new(control);

        let mut state = InitState {
            policy: None,
            caps: Capabilities::NONE,
            children: Vec::new(),
        };

        for line in reader.lines() {
            let line = line.map_err(|e| format!("control read: {e}"))?;
            if line.is_empty() {
                continue;
            }
            let request: InitRequest =
                serde_json::from_str(&line).map_err(|e| format!("control decode: {e}"))?;
            reap_finished(&mut state.children);

            let response = match request {
                InitRequest::Configure { policy, caps } => {
                    state.policy = Some(policy);
                    state.caps = caps;
                    InitResponse::Ready
                }
                InitRequest::Spawn {
                    program,
                    arguments,
                    env,
                    wait,
                } => handle_spawn(&mut state, &program, &arguments, &env, wait),
                InitRequest::Kill { pid, signal } => handle_kill(&state, pid, signal),
                InitRequest::Shutdown => {
                    respond(&mut writer, &InitResponse::ShuttingDown)?;
                    for child in &mut state.children {
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                    return Ok(());
                }
            };
            respond(&mut writer, &response)?;
        }
        // Host vanished; take the children down with us.
        for child in &mut state.children {
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }

    fn respond(writer: &mut UnixStream, response: &InitResponse) -> Result<(), String> {
        let mut line =
            serde_json::to_string(response).map_err(|e| format!("control encode: {e}"))?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .map_err(|e| format!("control write: {e}"))
    }

    fn handle_spawn(
        state: &mut InitState,
        program: &str,
        arguments: &str,
        env: &[String],
        wait: bool,
    ) -> InitResponse {
        let Some(policy) = state.policy.clone() else {
            return InitResponse::Error {
                message: "init not configured".to_string(),
            };
        };

        let mut command = Command::new(program);
        command.args(arguments.split_whitespace());
        command.env_clear();
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                command.env(key, value);
            }
        }
        command.current_dir("/");
        unsafe {
            command.pre_exec(move || {
                // Grandchild entry: own session, then the irrevocable
                // filter. Any error here aborts before exec.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                seccomp::apply_syscall_filter(&policy).map_err(std::io::Error::other)
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return InitResponse::Error {
                    message: format!("spawn {program}: {e}"),
                }
            }
        };
        let pid = child.id() as i32;

        if wait {
            match child.wait() {
                Ok(status) => InitResponse::Exited {
                    pid,
                    code: status.code().unwrap_or(-1),
                },
                Err(e) => InitResponse::Error {
                    message: format!("wait on {program}: {e}"),
                },
            }
        } else {
            state.children.push(child);
            InitResponse::Spawned { pid }
        }
    }

    fn handle_kill(state: &InitState, pid: i32, signal: i32) -> InitResponse {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if !state.caps.contains(Capabilities::PROCESS_CONTROL) {
            return InitResponse::Error {
                message: "container lacks the process-control capability".to_string(),
            };
        }
        let signal = match Signal::try_from(signal) {
            Ok(signal) => signal,
            Err(e) => {
                return InitResponse::Error {
                    message: format!("bad signal {signal}: {e}"),
                }
            }
        };
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => InitResponse::Killed,
            Err(e) => InitResponse::Error {
                message: format!("kill {pid}: {e}"),
            },
        }
    }

    fn reap_finished(children: &mut Vec<Child>) {
        children.retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_))));
    }
}
