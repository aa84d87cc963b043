// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::{
    fs, io,
    os::unix::{
        net::{UnixListener, UnixStream},
        prelude::{AsRawFd, OsStrExt},
    },
    path::Path,
};

use nix::sys::socket::{
    bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};

/// Whether something currently accepts connections on `path`.
pub fn is_listening<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    if !path.as_ref().exists() {
        return Ok(false);
    }
    Ok(UnixStream::connect(path).is_ok())
}

pub(crate) fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> io::Result<()> {
    if path.as_ref().exists() {
        return Ok(());
    }
    fs::create_dir_all(&path)
}

/// Binds a Unix stream listener with an explicit accept backlog. The std
/// binding hardcodes a large backlog; the fd-exchange rendezvous wants
/// exactly one pending connection.
pub fn bind_with_backlog<P: AsRef<Path>>(path: P, backlog: i32) -> io::Result<UnixListener> {
    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path.as_ref().as_os_str().as_bytes())?;
    bind(sock.as_raw_fd(), &addr)?;
    listen(&sock, Backlog::new(backlog)?)?;
    Ok(sock.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listening_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.sock");
        assert!(!is_listening(&path).unwrap());

        let _listener = bind_with_backlog(&path, 1).unwrap();
        assert!(is_listening(&path).unwrap());
    }
}
