// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Container-daemon backends driven through the `docker` and `ctr` CLIs.
//!
//! These backends have no fork support; every sandbox starts fresh.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use crate::config::WorkerConfig;
use crate::error::SandboxError;
use crate::types::{RuntimeKind, SandboxId};

use super::sock::{python_bootstrap, runtime_entrypoint};
use super::{CreateRequest, ForkTarget, RawSandbox, Sandbox, SandboxBackend, SandboxClient};

const SOCKET_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonKind {
    Docker,
    Containerd,
}

impl DaemonKind {
    fn program(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Containerd => "ctr",
        }
    }
}

#[derive(Debug)]
pub struct DaemonBackend {
    kind: DaemonKind,
    image: String,
    runtime: Option<String>,
    pkgs_dir: PathBuf,
    procs: u64,
    seccomp: bool,
}

impl DaemonBackend {
    pub fn new(config: &WorkerConfig, kind: DaemonKind) -> Result<Self, SandboxError> {
        let backend = Self {
            kind,
            image: config.docker.base_image.clone(),
            runtime: config.docker.runtime.clone(),
            pkgs_dir: config.pkgs_dir.clone(),
            procs: config.limits.procs,
            seccomp: config.features.enable_seccomp,
        };

        // fail at startup rather than on the first invocation
        run(kind.program(), &["version"])?;
        Ok(backend)
    }

    fn container_name(id: SandboxId) -> String {
        format!("ol-sb-{}", id.value())
    }

    fn docker_run_args(&self, name: &str, request: &CreateRequest, code: Option<&Path>) -> Vec<String> {
        let meta = &request.meta;
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--memory".to_string(),
            format!("{}m", meta.mem_mb),
            "--cpus".to_string(),
            format!("{:.2}", meta.cpu_percent as f64 / 100.0),
            "--pids-limit".to_string(),
            self.procs.to_string(),
            "-v".to_string(),
            format!("{}:/host", request.scratch_dir.display()),
            "-v".to_string(),
            format!("{}:/packages:ro", self.pkgs_dir.display()),
        ];
        if let Some(code) = code {
            args.push("-v".to_string());
            args.push(format!("{}:/handler:ro", code.display()));
        }
        if let Some(runtime) = &self.runtime {
            args.push("--runtime".to_string());
            args.push(runtime.clone());
        }
        args.push(self.image.clone());
        args.extend(runtime_entrypoint(request.runtime, self.seccomp));
        args
    }

    fn ctr_run_args(&self, name: &str, request: &CreateRequest, code: Option<&Path>) -> Vec<String> {
        let meta = &request.meta;
        let mount = |src: &Path, dst: &str, ro: bool| {
            format!(
                "type=bind,src={},dst={},options=rbind:{}",
                src.display(),
                dst,
                if ro { "ro" } else { "rw" }
            )
        };

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--memory-limit".to_string(),
            (meta.mem_mb * 1024 * 1024).to_string(),
            "--cpu-period".to_string(),
            "100000".to_string(),
            "--cpu-quota".to_string(),
            (1000 * meta.cpu_percent).to_string(),
            "--mount".to_string(),
            mount(&request.scratch_dir, "/host", false),
            "--mount".to_string(),
            mount(&self.pkgs_dir, "/packages", true),
        ];
        if let Some(code) = code {
            args.push("--mount".to_string());
            args.push(mount(code, "/handler", true));
        }
        if let Some(runtime) = &self.runtime {
            args.push("--runtime".to_string());
            args.push(runtime.clone());
        }
        args.push(self.image.clone());
        args.push(name.to_string());
        args.extend(runtime_entrypoint(request.runtime, self.seccomp));
        args
    }
}

impl SandboxBackend for DaemonBackend {
    fn kind(&self) -> &'static str {
        self.kind.program()
    }

    fn create(
        &self,
        id: SandboxId,
        request: &CreateRequest,
        parent: Option<&Sandbox>,
    ) -> Result<Box<dyn RawSandbox>, SandboxError> {
        if let Some(parent) = parent {
            return Err(SandboxError::ForkFailed {
                parent: parent.id(),
                reason: format!("{} sandboxes cannot fork", self.kind.program()),
            });
        }
        if request.is_leaf && request.code.is_none() {
            return Err(SandboxError::Backend {
                reason: "leaf sandboxes must have a code dir".to_string(),
            });
        }

        std::fs::create_dir_all(&request.scratch_dir).map_err(|e| SandboxError::Io {
            context: "creating scratch dir",
            source: e,
        })?;
        if request.runtime == RuntimeKind::Python {
            std::fs::write(
                request.scratch_dir.join("bootstrap.py"),
                python_bootstrap(request),
            )
            .map_err(|e| SandboxError::Io {
                context: "writing bootstrap.py",
                source: e,
            })?;
        }

        let sock_path = request.scratch_dir.join("ol.sock");
        let client = SandboxClient::new(&sock_path, Duration::from_secs(request.meta.runtime_sec))?;

        let name = Self::container_name(id);
        let code = request.code.as_ref().map(|c| c.path());
        let args = match self.kind {
            DaemonKind::Docker => self.docker_run_args(&name, request, code),
            DaemonKind::Containerd => self.ctr_run_args(&name, request, code),
        };

        let mut sb = DaemonSandbox {
            id,
            kind: self.kind,
            name,
            scratch_dir: request.scratch_dir.clone(),
            keep_scratch: request.keep_scratch,
            mem_mb: request.meta.mem_mb,
            client,
            started: false,
        };

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let started = run(self.kind.program(), &args).and_then(|_| {
            sb.started = true;
            wait_for_socket(&sock_path)
        });
        if let Err(e) = started {
            sb.destroy(&format!("create failed: {}", e));
            return Err(e);
        }

        tracing::debug!(sandbox = %id, container = %sb.name, "Started container");
        Ok(Box::new(sb))
    }

    fn cleanup(&self) {}
}

struct DaemonSandbox {
    id: SandboxId,
    kind: DaemonKind,
    name: String,
    scratch_dir: PathBuf,
    keep_scratch: bool,
    mem_mb: u64,
    client: SandboxClient,
    started: bool,
}

impl DaemonSandbox {
    fn ctl(&self, docker: &[&str], ctr: &[&str]) -> Result<String, SandboxError> {
        let args: Vec<&str> = match self.kind {
            DaemonKind::Docker => docker.iter().copied().chain([self.name.as_str()]).collect(),
            DaemonKind::Containerd => ctr.iter().copied().chain([self.name.as_str()]).collect(),
        };
        run(self.kind.program(), &args)
    }
}

impl RawSandbox for DaemonSandbox {
    fn pause(&mut self) -> Result<(), SandboxError> {
        self.ctl(&["pause"], &["task", "pause"])?;
        Ok(())
    }

    fn unpause(&mut self) -> Result<(), SandboxError> {
        self.ctl(&["unpause"], &["task", "resume"])?;
        Ok(())
    }

    fn destroy(&mut self, reason: &str) {
        tracing::debug!(sandbox = %self.id, reason, "Destroying container");

        if self.started {
            let steps: [(&[&str], &[&str]); 2] = [
                (&["kill"], &["task", "kill", "-s", "SIGKILL"]),
                (&["rm", "-f"], &["container", "delete"]),
            ];
            for (docker, ctr) in steps {
                if let Err(e) = self.ctl(docker, ctr) {
                    tracing::debug!(sandbox = %self.id, error = %e, "Container teardown step failed");
                }
            }
            if self.kind == DaemonKind::Containerd {
                let _ = self.ctl(&[], &["task", "delete", "-f"]);
            }
        }

        if !self.keep_scratch {
            if let Err(e) = std::fs::remove_dir_all(&self.scratch_dir) {
                tracing::debug!(sandbox = %self.id, error = %e, "Remove scratch failed");
            }
        }
    }

    fn fork_into(&mut self, _target: &ForkTarget) -> Result<(), SandboxError> {
        Err(SandboxError::ForkFailed {
            parent: self.id,
            reason: format!("{} sandboxes cannot fork", self.kind.program()),
        })
    }

    fn client(&self) -> &SandboxClient {
        &self.client
    }

    fn mem_limit_mb(&self) -> u64 {
        self.mem_mb
    }

    fn mem_usage_mb(&self) -> Result<u64, SandboxError> {
        match self.kind {
            DaemonKind::Docker => {
                let out = run(
                    "docker",
                    &["stats", "--no-stream", "--format", "{{.MemUsage}}", &self.name],
                )?;
                parse_docker_mem(&out).ok_or_else(|| SandboxError::Backend {
                    reason: format!("unexpected docker stats output: {}", out.trim()),
                })
            }
            DaemonKind::Containerd => Err(SandboxError::Backend {
                reason: "memory usage is not reported by ctr".to_string(),
            }),
        }
    }

    fn debug_string(&self) -> String {
        format!(
            "{} {}\nCONTAINER: {}\nHOST DIR: {}\nMEMORY LIMIT: {} MB\n",
            self.kind.program().to_uppercase(),
            self.id,
            self.name,
            self.scratch_dir.display(),
            self.mem_mb
        )
    }

    fn runtime_log(&self) -> String {
        match self.kind {
            DaemonKind::Docker => run("docker", &["logs", &self.name]).unwrap_or_default(),
            DaemonKind::Containerd => String::new(),
        }
    }
}

fn run(program: &str, args: &[&str]) -> Result<String, SandboxError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| SandboxError::Backend {
            reason: format!("running {}: {}", program, e),
        })?;

    if !output.status.success() {
        return Err(SandboxError::Backend {
            reason: format!(
                "{} {} failed: {}",
                program,
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn wait_for_socket(path: &Path) -> Result<(), SandboxError> {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() > SOCKET_WAIT {
            return Err(SandboxError::Timeout {
                operation: "container server start",
                after_ms: SOCKET_WAIT.as_millis() as u64,
            });
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

/// `"12.5MiB / 50MiB"` -> 13
fn parse_docker_mem(out: &str) -> Option<u64> {
    let used = out.split('/').next()?.trim();
    let split = used.find(|c: char| c.is_ascii_alphabetic())?;
    let (num, unit) = used.split_at(split);
    let value: f64 = num.trim().parse().ok()?;
    let mb = match unit {
        "B" => value / (1024.0 * 1024.0),
        "KiB" | "kB" => value / 1024.0,
        "MiB" | "MB" => value,
        "GiB" | "GB" => value * 1024.0,
        _ => return None,
    };
    Some(mb.ceil() as u64)
}
