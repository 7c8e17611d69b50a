// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Fork requests to a zygote's fork server.
//!
//! The child's root directory and `cgroup.procs` are passed as open file
//! descriptors (SCM_RIGHTS) over the zygote's `ol.sock`; the server forks,
//! moves the new process into them and replies with an `i32` status.

use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Read};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

use crate::error::SandboxError;
use crate::types::SandboxId;

use super::ForkTarget;

const FORK_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) fn fork_request(
    parent: SandboxId,
    sock_path: &Path,
    target: &ForkTarget,
) -> Result<(), SandboxError> {
    let failed = |reason: String| SandboxError::ForkFailed { parent, reason };

    let Some(procs_path) = &target.cgroup_procs else {
        return Err(failed("child has no cgroup".to_string()));
    };

    let root = File::open(&target.root_dir)
        .map_err(|e| failed(format!("open {}: {}", target.root_dir.display(), e)))?;
    let procs = OpenOptions::new()
        .write(true)
        .open(procs_path)
        .map_err(|e| failed(format!("open {}: {}", procs_path.display(), e)))?;

    let mut stream = UnixStream::connect(sock_path)
        .map_err(|e| failed(format!("connect {}: {}", sock_path.display(), e)))?;
    stream
        .set_read_timeout(Some(FORK_TIMEOUT))
        .map_err(|e| failed(e.to_string()))?;

    let fds = [root.as_raw_fd(), procs.as_raw_fd()];
    let payload = [0u8; 1];
    let iov = [IoSlice::new(&payload)];
    let cmsg = [ControlMessage::ScmRights(&fds)];

    let sent = sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| failed(format!("sendmsg: {}", e)))?;
    if sent != payload.len() {
        return Err(failed(format!("short sendmsg ({} bytes)", sent)));
    }

    let mut status = [0u8; 4];
    stream
        .read_exact(&mut status)
        .map_err(|e| failed(format!("reading fork status: {}", e)))?;

    let status = i32::from_ne_bytes(status);
    if status < 0 {
        return Err(failed(format!("fork server returned {}", status)));
    }

    tracing::debug!(parent = %parent, child = %target.id, pid = status, "Forked into child");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{recvmsg, ControlMessageOwned};
    use std::io::{IoSliceMut, Write};
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    fn target(dir: &TempDir) -> ForkTarget {
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "").unwrap();
        ForkTarget {
            id: SandboxId::new(2),
            root_dir: root,
            cgroup_procs: Some(procs),
        }
    }

    fn fork_server(dir: &TempDir, reply: i32) -> (std::path::PathBuf, std::thread::JoinHandle<usize>) {
        let sock = dir.path().join("ol.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let handle = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1];
            let mut iov = [IoSliceMut::new(&mut buf)];
            let mut space = nix::cmsg_space!([std::os::fd::RawFd; 2]);
            let msg =
                recvmsg::<()>(conn.as_raw_fd(), &mut iov, Some(&mut space), MsgFlags::empty())
                    .unwrap();
            let mut received = 0;
            for cmsg in msg.cmsgs().unwrap() {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    received += fds.len();
                    for fd in fds {
                        nix::unistd::close(fd).unwrap();
                    }
                }
            }
            conn.write_all(&reply.to_ne_bytes()).unwrap();
            received
        });
        (sock, handle)
    }

    #[test]
    fn test_sends_two_fds() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);
        let (sock, server) = fork_server(&dir, 4242);

        fork_request(SandboxId::new(1), &sock, &target).unwrap();
        assert_eq!(server.join().unwrap(), 2);
    }

    #[test]
    fn test_negative_status_fails() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);
        let (sock, server) = fork_server(&dir, -1);

        let err = fork_request(SandboxId::new(1), &sock, &target).unwrap_err();
        assert!(matches!(err, SandboxError::ForkFailed { .. }));
        server.join().unwrap();
    }

    #[test]
    fn test_missing_socket_fails() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);

        let err = fork_request(SandboxId::new(1), &dir.path().join("nope.sock"), &target)
            .unwrap_err();
        assert!(matches!(err, SandboxError::ForkFailed { .. }));
    }
}
