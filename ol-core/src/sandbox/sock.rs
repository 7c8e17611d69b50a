// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! SOCK backend: lightweight containers from bind mounts, namespaces and a
//! cgroup, with zygote forking over the runtime's Unix socket.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::cgroup::{Cgroup, CgroupPool};
use crate::config::WorkerConfig;
use crate::error::SandboxError;
use crate::storage::{DirMaker, StoreMode};
use crate::types::{RuntimeKind, SandboxId};

use super::fork::fork_request;
use super::mem_pool::MemPool;
use super::{CreateRequest, ForkTarget, RawSandbox, Sandbox, SandboxBackend, SandboxClient};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Paused sandboxes keep this much headroom over their usage.
const PAUSED_HEADROOM_MB: u64 = 5;

/// A zygote needs this much spare memory to fork.
const FORK_SPARE_MB: u64 = 3;

/// How long destroy waits for sock-init to reap its children and exit.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SockBackend {
    cgroups: CgroupPool,
    root_dirs: DirMaker,
    mem: Arc<MemPool>,
    base_path: PathBuf,
    sock_init: PathBuf,
    pkgs_dir: PathBuf,
    seccomp: bool,
    downsize_paused: bool,
}

impl SockBackend {
    pub fn new(config: &WorkerConfig, mem: Arc<MemPool>, name: &str) -> Result<Self, SandboxError> {
        let cgroups = CgroupPool::new(config, name)?;
        let root_dirs = DirMaker::new(
            config.worker_dir.join(format!("root-{}", name)),
            StoreMode::Private,
        )?;

        Ok(Self {
            cgroups,
            root_dirs,
            mem,
            base_path: config.sock_base_path.clone(),
            sock_init: config.sock_init.clone(),
            pkgs_dir: config.pkgs_dir.clone(),
            seccomp: config.features.enable_seccomp,
            downsize_paused: config.features.downsize_paused_mem,
        })
    }

    fn populate_root(&self, root: &Path, scratch: &Path, code: Option<&Path>) -> Result<(), SandboxError> {
        bind(&self.base_path, root)?;
        remount_ro(root)?;
        make_private(root)?;

        if let Some(code) = code {
            let handler = root.join("handler");
            bind(code, &handler)?;
            remount_ro(&handler)?;
        }

        let tmp = scratch.join("tmp");
        if let Err(e) = std::fs::create_dir(&tmp) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(SandboxError::Io {
                    context: "creating scratch tmp",
                    source: e,
                });
            }
        }
        bind(scratch, &root.join("host"))?;
        bind(&tmp, &root.join("tmp"))?;

        let packages = root.join("packages");
        bind(&self.pkgs_dir, &packages)?;
        remount_ro(&packages)?;
        Ok(())
    }

    /// Spawn `sock-init` and move it into the sandbox cgroup.
    fn fresh_proc(&self, sb: &mut SockSandbox, runtime: RuntimeKind) -> Result<(), SandboxError> {
        let init_pipe = sb.scratch_dir.join("init_pipe");
        make_fifo(&init_pipe)?;
        let pipe = open_fifo(&init_pipe)?;

        let log = File::create(sb.scratch_dir.join("ol-runtime.log")).map_err(|e| {
            SandboxError::Io {
                context: "creating runtime log",
                source: e,
            }
        })?;
        let log_err = log.try_clone().map_err(|e| SandboxError::Io {
            context: "creating runtime log",
            source: e,
        })?;

        let child = Command::new(&self.sock_init)
            .arg(&sb.root_dir)
            .arg(&sb.scratch_dir)
            .args(runtime_entrypoint(runtime, self.seccomp))
            .env_clear()
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(|e| SandboxError::Backend {
                reason: format!("spawning {}: {}", self.sock_init.display(), e),
            })?;
        sb.init = Some(child);

        let start = Instant::now();
        let msg = read_handshake(pipe, "sock-init pid")?;
        let pid = parse_pid(&msg)?;
        tracing::debug!(sandbox = %sb.id, pid, elapsed_ms = start.elapsed().as_millis() as u64, "sock-init started");

        sb.cgroup()?.add_pid(pid)
    }
}

impl SandboxBackend for SockBackend {
    fn kind(&self) -> &'static str {
        "sock"
    }

    fn create(
        &self,
        id: SandboxId,
        request: &CreateRequest,
        parent: Option<&Sandbox>,
    ) -> Result<Box<dyn RawSandbox>, SandboxError> {
        if request.is_leaf && request.code.is_none() {
            return Err(SandboxError::Backend {
                reason: "leaf sandboxes must have a code dir".to_string(),
            });
        }

        std::fs::create_dir_all(&request.scratch_dir).map_err(|e| SandboxError::Io {
            context: "creating scratch dir",
            source: e,
        })?;
        let client = SandboxClient::new(
            request.scratch_dir.join("ol.sock"),
            Duration::from_secs(request.meta.runtime_sec),
        )?;

        let cg = self
            .cgroups
            .acquire(request.meta.mem_mb, request.meta.cpu_percent)?;
        tracing::debug!(sandbox = %id, cgroup = cg.name(), "Using cgroup");

        let mut sb = SockSandbox {
            id,
            root_dir: self.root_dirs.get(&format!("SB-{}", id.value())),
            scratch_dir: request.scratch_dir.clone(),
            keep_scratch: request.keep_scratch,
            cg: Some(cg),
            init: None,
            client,
            mem: Arc::clone(&self.mem),
            full_mem_mb: request.meta.mem_mb,
            downsize_paused: self.downsize_paused,
            paused: false,
        };

        match self.start(&mut sb, request, parent) {
            Ok(()) => Ok(Box::new(sb)),
            Err(e) => {
                sb.destroy(&format!("create failed: {}", e));
                Err(e)
            }
        }
    }

    fn cleanup(&self) {
        self.cgroups.destroy_all();
        self.root_dirs.cleanup();
    }
}

impl SockBackend {
    fn start(
        &self,
        sb: &mut SockSandbox,
        request: &CreateRequest,
        parent: Option<&Sandbox>,
    ) -> Result<(), SandboxError> {
        std::fs::create_dir(&sb.root_dir).map_err(|e| SandboxError::Io {
            context: "creating sandbox root",
            source: e,
        })?;
        let code = request.code.as_ref().map(|c| c.path());
        self.populate_root(&sb.root_dir, &sb.scratch_dir, code)?;

        if request.runtime == RuntimeKind::Python {
            let bootstrap = python_bootstrap(request);
            std::fs::write(sb.scratch_dir.join("bootstrap.py"), bootstrap).map_err(|e| {
                SandboxError::Io {
                    context: "writing bootstrap.py",
                    source: e,
                }
            })?;
        }

        let server_pipe = sb.scratch_dir.join("server_pipe");
        make_fifo(&server_pipe)?;
        let ready = open_fifo(&server_pipe)?;

        match parent {
            Some(parent) => {
                let target = ForkTarget {
                    id: sb.id,
                    root_dir: sb.root_dir.clone(),
                    cgroup_procs: Some(sb.cgroup()?.procs_path()),
                };
                parent.fork(&target)?;
            }
            None => self.fresh_proc(sb, request.runtime)?,
        }

        let msg = read_handshake(ready, "server ready")?;
        if &msg != b"ready" {
            return Err(SandboxError::Backend {
                reason: format!(
                    "expected 'ready' on server pipe, got {:?}",
                    String::from_utf8_lossy(&msg)
                ),
            });
        }
        Ok(())
    }
}

struct SockSandbox {
    id: SandboxId,
    root_dir: PathBuf,
    scratch_dir: PathBuf,
    keep_scratch: bool,
    cg: Option<Cgroup>,
    init: Option<Child>,
    client: SandboxClient,
    mem: Arc<MemPool>,
    full_mem_mb: u64,
    downsize_paused: bool,
    paused: bool,
}

impl SockSandbox {
    fn cgroup(&self) -> Result<&Cgroup, SandboxError> {
        self.cg.as_ref().ok_or_else(|| SandboxError::Backend {
            reason: format!("sandbox {} has released its cgroup", self.id),
        })
    }

    fn cgroup_mut(&mut self) -> Result<&mut Cgroup, SandboxError> {
        let id = self.id;
        self.cg.as_mut().ok_or_else(|| SandboxError::Backend {
            reason: format!("sandbox {} has released its cgroup", id),
        })
    }
}

impl RawSandbox for SockSandbox {
    fn pause(&mut self) -> Result<(), SandboxError> {
        self.cgroup()?.pause()?;
        self.paused = true;

        if self.downsize_paused {
            // a frozen sandbox cannot allocate, so shrink to what it uses
            let cg = self.cgroup_mut()?;
            let old = cg.mem_limit_mb();
            let new = cg.mem_usage_mb()? + PAUSED_HEADROOM_MB;
            if new < old {
                cg.set_mem_limit_mb(new)?;
                self.mem.release(old - new);
            }
        }

        self.client.close_idle();
        Ok(())
    }

    fn unpause(&mut self) -> Result<(), SandboxError> {
        if self.downsize_paused {
            let full = self.full_mem_mb;
            let old = self.cgroup()?.mem_limit_mb();
            if full > old {
                self.mem.acquire(full - old)?;
                if let Err(e) = self.cgroup_mut()?.set_mem_limit_mb(full) {
                    self.mem.release(full - old);
                    return Err(e);
                }
            }
        }

        self.cgroup()?.unpause()?;
        self.paused = false;
        Ok(())
    }

    fn destroy(&mut self, reason: &str) {
        tracing::debug!(sandbox = %self.id, reason, "Destroying SOCK sandbox");

        if let Some(cg) = &self.cg {
            if let Err(e) = cg.kill_all() {
                tracing::warn!(sandbox = %self.id, error = %e, "Kill failed");
            }
            // thaw without re-growing the limit so the kill can land
            if self.paused {
                if let Err(e) = cg.unpause() {
                    tracing::warn!(sandbox = %self.id, error = %e, "Thaw failed");
                }
            }
        }

        if let Some(init) = self.init.take() {
            reap_init(&self.id, init);
        }

        if let Err(e) = umount2(&self.root_dir, MntFlags::MNT_DETACH) {
            tracing::debug!(sandbox = %self.id, error = %e, "Unmount root failed");
        }
        if let Err(e) = std::fs::remove_dir_all(&self.root_dir) {
            tracing::debug!(sandbox = %self.id, error = %e, "Remove root failed");
        }
        if !self.keep_scratch {
            if let Err(e) = std::fs::remove_dir_all(&self.scratch_dir) {
                tracing::debug!(sandbox = %self.id, error = %e, "Remove scratch failed");
            }
        }

        if let Some(cg) = self.cg.take() {
            // keep the last limit so the pool releases the right amount
            self.full_mem_mb = cg.mem_limit_mb();
            cg.release();
        }
    }

    fn fork_into(&mut self, target: &ForkTarget) -> Result<(), SandboxError> {
        let cg = self.cgroup()?;
        let spare = cg.mem_limit_mb().saturating_sub(cg.mem_usage_mb()?);
        if spare < FORK_SPARE_MB {
            return Err(SandboxError::ForkFailed {
                parent: self.id,
                reason: format!(
                    "only {}MB of spare memory in parent (need at least {}MB)",
                    spare, FORK_SPARE_MB
                ),
            });
        }

        fork_request(self.id, &self.scratch_dir.join("ol.sock"), target)
    }

    fn client(&self) -> &SandboxClient {
        &self.client
    }

    fn mem_limit_mb(&self) -> u64 {
        match &self.cg {
            Some(cg) => cg.mem_limit_mb(),
            None => self.full_mem_mb,
        }
    }

    fn mem_usage_mb(&self) -> Result<u64, SandboxError> {
        self.cgroup()?.mem_usage_mb()
    }

    fn debug_string(&self) -> String {
        let mut s = format!("SOCK {}\n", self.id);
        s += &format!("ROOT DIR: {}\n", self.root_dir.display());
        s += &format!("HOST DIR: {}\n", self.scratch_dir.display());
        if let Some(cg) = &self.cg {
            s += &cg.debug_string();
        }
        s
    }

    fn runtime_log(&self) -> String {
        std::fs::read_to_string(self.scratch_dir.join("ol-runtime.log")).unwrap_or_default()
    }
}

/// Command that starts the runtime server inside the sandbox root.
pub(super) fn runtime_entrypoint(runtime: RuntimeKind, seccomp: bool) -> Vec<String> {
    let seccomp = seccomp.to_string();
    match runtime {
        RuntimeKind::Python => vec![
            "python3".to_string(),
            "-u".to_string(),
            "/runtimes/python/server.py".to_string(),
            "/host/bootstrap.py".to_string(),
            "1".to_string(),
            seccomp,
        ],
        RuntimeKind::Native => vec!["/runtimes/native/server".to_string(), "1".to_string(), seccomp],
    }
}

/// `bootstrap.py` run by the Python runtime before serving.
pub(super) fn python_bootstrap(request: &CreateRequest) -> String {
    let mut lines = vec!["import os, sys".to_string()];

    for pkg in &request.meta.installs {
        let path = format!("'/packages/{}/files'", pkg.as_str());
        lines.push(format!("if os.path.exists({}):", path));
        lines.push(format!("    if not {} in sys.path:", path));
        lines.push(format!("        sys.path.insert(0, {})", path));
    }

    for module in &request.meta.imports {
        lines.push("try:".to_string());
        lines.push(format!("    import {}", module));
        lines.push("except Exception as e:".to_string());
        lines.push("    print('bootstrap.py error:', e)".to_string());
    }

    lines.push(if request.is_leaf { "web_server()" } else { "fork_server()" }.to_string());
    lines.join("\n") + "\n"
}

fn mount_err(target: &Path, what: &str, e: nix::Error) -> SandboxError {
    SandboxError::Mount {
        target: target.to_path_buf(),
        reason: format!("{}: {}", what, e),
    }
}

fn bind(source: &Path, target: &Path) -> Result<(), SandboxError> {
    mount(Some(source), target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .map_err(|e| mount_err(target, &format!("bind {}", source.display()), e))
}

fn remount_ro(target: &Path) -> Result<(), SandboxError> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| mount_err(target, "remount read-only", e))
}

fn make_private(target: &Path) -> Result<(), SandboxError> {
    mount(None::<&str>, target, None::<&str>, MsFlags::MS_PRIVATE, None::<&str>)
        .map_err(|e| mount_err(target, "make private", e))
}

fn make_fifo(path: &Path) -> Result<(), SandboxError> {
    mkfifo(path, Mode::from_bits_truncate(0o777)).map_err(|e| SandboxError::Backend {
        reason: format!("mkfifo {}: {}", path.display(), e),
    })
}

/// Wait for sock-init to exit; kill it if it outlives [`REAP_TIMEOUT`],
/// which happens when it never made it into the cgroup.
fn reap_init(id: &SandboxId, mut init: Child) {
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match init.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(sandbox = %id, error = %e, "Waiting for sock-init failed");
                break;
            }
        }
    }

    tracing::warn!(sandbox = %id, pid = init.id(), "sock-init did not exit; killing it");
    if let Err(e) = init.kill() {
        tracing::debug!(sandbox = %id, error = %e, "Kill sock-init failed");
    }
    if let Err(e) = init.wait() {
        tracing::warn!(sandbox = %id, error = %e, "Waiting for sock-init failed");
    }
}

/// Open read-write so neither side blocks waiting for a peer.
fn open_fifo(path: &Path) -> Result<File, SandboxError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| SandboxError::Io {
            context: "opening fifo",
            source: e,
        })
}

/// Read one 5-byte message. On timeout, write `timeo` so the blocked reader
/// thread consumes it and exits.
fn read_handshake(pipe: File, what: &'static str) -> Result<[u8; 5], SandboxError> {
    let mut writer = pipe.try_clone().map_err(|e| SandboxError::Io {
        context: "cloning fifo",
        source: e,
    })?;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut reader = pipe;
        let mut buf = [0u8; 5];
        let _ = tx.send(reader.read_exact(&mut buf).map(|()| buf));
    });

    match rx.recv_timeout(HANDSHAKE_TIMEOUT) {
        Ok(Ok(buf)) => Ok(buf),
        Ok(Err(e)) => Err(SandboxError::Io {
            context: what,
            source: e,
        }),
        Err(_) => {
            if let Err(e) = writer.write_all(b"timeo") {
                tracing::warn!(error = %e, "Could not unblock fifo reader");
            }
            Err(SandboxError::Timeout {
                operation: what,
                after_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
            })
        }
    }
}

/// PIDs arrive NUL padded to 5 bytes.
fn parse_pid(msg: &[u8; 5]) -> Result<u32, SandboxError> {
    let end = msg.iter().position(|b| *b == 0).unwrap_or(msg.len());
    std::str::from_utf8(&msg[..end])
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| SandboxError::Backend {
            reason: format!("bad pid from sock-init: {:?}", String::from_utf8_lossy(msg)),
        })
}
