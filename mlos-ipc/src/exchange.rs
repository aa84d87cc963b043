// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unix-domain-socket rendezvous for anonymous shared memory.
//!
//! In anonymous mode the target creates its regions without names and only
//! descriptors remain. It connects to the agent's exchange socket and sends
//! one [`RegionEnvelope`] per region with the descriptor attached via
//! `SCM_RIGHTS`; the agent stores them by `(region_type, region_index)`.
//! Either side can later query a previously sent descriptor by sending the
//! same envelope with `contains_fd` unset; the server replies with the
//! stored descriptor, or echoes `contains_fd = false` when it has none.
//!
//! The server accepts a single connection and runs one handler thread per
//! accepted connection; the handler exits on EOF, socket error or the
//! server's disposed flag.

use crate::platform::{bind_with_backlog, ensure_dir_exists, is_listening, RegionHandle};
use sendfd::{RecvWithFd, SendWithFd};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::prelude::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Default rendezvous directory.
pub const DEFAULT_SOCKET_DIR: &str = "/var/tmp/mlos";

/// Socket file name inside the rendezvous directory.
pub const SOCKET_FILE_NAME: &str = "mlos.sock";

/// Size of the wire envelope.
pub const ENVELOPE_SIZE: usize = 32;

/// How often a parked handler re-checks the disposed flag.
const HANDLER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One rendezvous message: 32 bytes, little-endian, optionally accompanied
/// by one descriptor in an `SCM_RIGHTS` control message.
///
/// ```text
/// offset  0: u32 memory_region_type
/// offset  4: u32 memory_region_index
/// offset  8: u64 memory_region_size
/// offset 16: u8  contains_fd
/// offset 17: reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionEnvelope {
    pub region_type: u32,
    pub region_index: u32,
    pub region_size: u64,
    pub contains_fd: bool,
}

impl RegionEnvelope {
    pub fn to_bytes(&self) -> [u8; ENVELOPE_SIZE] {
        let mut bytes = [0u8; ENVELOPE_SIZE];
        bytes[0..4].copy_from_slice(&self.region_type.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.region_index.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.region_size.to_le_bytes());
        bytes[16] = self.contains_fd as u8;
        bytes
    }

    pub fn from_bytes(bytes: &[u8; ENVELOPE_SIZE]) -> RegionEnvelope {
        RegionEnvelope {
            region_type: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            region_index: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            region_size: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            contains_fd: bytes[16] != 0,
        }
    }
}

/// A region descriptor the exchange has collected.
#[derive(Clone, Debug)]
pub struct StoredRegion {
    pub handle: RegionHandle,
    pub size: u64,
}

/// Regions received so far, shared between handler threads and the
/// embedding context.
#[derive(Default, Debug)]
pub struct RegionStore {
    inner: Mutex<HashMap<(u32, u32), StoredRegion>>,
    arrived: Condvar,
}

impl RegionStore {
    pub fn get(&self, region_type: u32, region_index: u32) -> Option<StoredRegion> {
        self.inner
            .lock()
            .unwrap()
            .get(&(region_type, region_index))
            .cloned()
    }

    /// Blocks until the region arrives, or until `timeout` elapses when one
    /// is given.
    pub fn wait_for(
        &self,
        region_type: u32,
        region_index: u32,
        timeout: Option<Duration>,
    ) -> Option<StoredRegion> {
        let key = (region_type, region_index);
        let mut regions = self.inner.lock().unwrap();
        loop {
            if let Some(stored) = regions.get(&key) {
                return Some(stored.clone());
            }
            match timeout {
                Some(timeout) => {
                    let (guard, wait) = self.arrived.wait_timeout(regions, timeout).unwrap();
                    regions = guard;
                    if wait.timed_out() {
                        return regions.get(&key).cloned();
                    }
                }
                None => regions = self.arrived.wait(regions).unwrap(),
            }
        }
    }

    fn insert(&self, key: (u32, u32), stored: StoredRegion) {
        self.inner.lock().unwrap().insert(key, stored);
        self.arrived.notify_all();
    }
}

/// The agent-side exchange server.
#[derive(Debug)]
pub struct FdExchangeServer {
    listener: UnixListener,
    socket_path: PathBuf,
    marker_path: PathBuf,
    disposed: Arc<AtomicBool>,
    regions: Arc<RegionStore>,
    handlers: Mutex<Vec<JoinHandle<()>>>,
}

impl FdExchangeServer {
    /// Creates the socket directory, replaces a stale socket file, binds
    /// with a backlog of one and drops the `.opened` readiness marker.
    pub fn bind(socket_dir: &Path) -> io::Result<FdExchangeServer> {
        ensure_dir_exists(socket_dir)?;
        let socket_path = socket_dir.join(SOCKET_FILE_NAME);
        if socket_path.exists() {
            if is_listening(&socket_path)? {
                return Err(io::Error::new(
                    ErrorKind::AddrInUse,
                    format!("exchange socket {} is already served", socket_path.display()),
                ));
            }
            std::fs::remove_file(&socket_path)?;
        }
        let listener = bind_with_backlog(&socket_path, 1)?;

        let marker_path = socket_path.with_extension("sock.opened");
        std::fs::write(&marker_path, b"")?;
        debug!(socket = %socket_path.display(), "fd exchange listening");

        Ok(FdExchangeServer {
            listener,
            socket_path,
            marker_path,
            disposed: Arc::new(AtomicBool::new(false)),
            regions: Arc::new(RegionStore::default()),
            handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn regions(&self) -> Arc<RegionStore> {
        self.regions.clone()
    }

    /// Accepts one connection and spawns its handler thread.
    pub fn accept_one(&self) -> io::Result<()> {
        let (stream, _) = self.listener.accept()?;
        let disposed = self.disposed.clone();
        let regions = self.regions.clone();
        let handler = std::thread::Builder::new()
            .name("mlos-fd-exchange".into())
            .spawn(move || {
                if let Err(err) = handle_connection(&stream, &regions, &disposed) {
                    warn!(%err, "fd exchange handler failed");
                }
            })?;
        self.handlers.lock().unwrap().push(handler);
        Ok(())
    }

    /// Stops the server: wakes a blocked `accept_one`, tells handlers to
    /// exit and joins them.
    pub fn shutdown(&self) {
        self.disposed.store(true, Ordering::Release);
        _ = nix::sys::socket::shutdown(
            self.listener.as_raw_fd(),
            nix::sys::socket::Shutdown::Both,
        );
        let handlers = std::mem::take(&mut *self.handlers.lock().unwrap());
        for handler in handlers {
            _ = handler.join();
        }
    }
}

impl Drop for FdExchangeServer {
    fn drop(&mut self) {
        self.shutdown();
        _ = std::fs::remove_file(&self.marker_path);
        _ = std::fs::remove_file(&self.socket_path);
    }
}

fn handle_connection(
    stream: &UnixStream,
    regions: &RegionStore,
    disposed: &AtomicBool,
) -> io::Result<()> {
    stream.set_read_timeout(Some(HANDLER_POLL_INTERVAL))?;
    loop {
        let (envelope, fd) = match recv_envelope(stream, Some(disposed))? {
            Some(message) => message,
            None => return Ok(()),
        };
        match (envelope.contains_fd, fd) {
            (true, Some(fd)) => {
                debug!(
                    region_type = envelope.region_type,
                    region_index = envelope.region_index,
                    size = envelope.region_size,
                    "received region descriptor"
                );
                regions.insert(
                    (envelope.region_type, envelope.region_index),
                    StoredRegion {
                        handle: unsafe { RegionHandle::from_raw_fd(fd) },
                        size: envelope.region_size,
                    },
                );
            }
            (false, _) => {
                let reply = regions.get(envelope.region_type, envelope.region_index);
                match reply {
                    Some(stored) => {
                        let reply_envelope = RegionEnvelope {
                            region_size: stored.size,
                            contains_fd: true,
                            ..envelope
                        };
                        send_envelope(
                            stream,
                            &reply_envelope,
                            Some(stored.handle.as_raw_fd()),
                        )?;
                    }
                    None => {
                        let reply_envelope = RegionEnvelope {
                            contains_fd: false,
                            ..envelope
                        };
                        send_envelope(stream, &reply_envelope, None)?;
                    }
                }
            }
            // An envelope promising a descriptor without one attached is a
            // protocol violation; drop the message.
            (true, None) => warn!(
                region_type = envelope.region_type,
                "envelope claimed a descriptor but carried none"
            ),
        }
    }
}

/// Reads exactly one envelope, collecting at most one attached descriptor.
/// Returns `None` on clean EOF or when `disposed` flips while polling.
fn recv_envelope(
    stream: &UnixStream,
    disposed: Option<&AtomicBool>,
) -> io::Result<Option<(RegionEnvelope, Option<RawFd>)>> {
    let mut bytes = [0u8; ENVELOPE_SIZE];
    let mut filled = 0usize;
    let mut received_fd: Option<RawFd> = None;
    while filled < ENVELOPE_SIZE {
        if disposed.is_some_and(|flag| flag.load(Ordering::Acquire)) {
            close_stray_fd(received_fd);
            return Ok(None);
        }
        let mut fds = [0 as RawFd; 1];
        match stream.recv_with_fd(&mut bytes[filled..], &mut fds) {
            Ok((0, 0)) => {
                if filled == 0 {
                    return Ok(None);
                }
                close_stray_fd(received_fd);
                return Err(ErrorKind::UnexpectedEof.into());
            }
            Ok((read, fd_count)) => {
                if fd_count > 0 {
                    close_stray_fd(received_fd.replace(fds[0]));
                }
                filled += read;
            }
            Err(ref err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
            Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                close_stray_fd(received_fd);
                return Err(err);
            }
        }
    }
    Ok(Some((RegionEnvelope::from_bytes(&bytes), received_fd)))
}

/// Writes one envelope, attaching `fd` to the first chunk.
fn send_envelope(stream: &UnixStream, envelope: &RegionEnvelope, fd: Option<RawFd>) -> io::Result<()> {
    let bytes = envelope.to_bytes();
    let mut sent = 0usize;
    let mut fd_pending = fd;
    while sent < ENVELOPE_SIZE {
        let fds: &[RawFd] = match fd_pending.as_ref() {
            Some(fd) => std::slice::from_ref(fd),
            None => &[],
        };
        match stream.send_with_fd(&bytes[sent..], fds) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "failed to write whole envelope",
                ))
            }
            Ok(written) => {
                sent += written;
                fd_pending = None;
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn close_stray_fd(fd: Option<RawFd>) {
    if let Some(fd) = fd {
        // Take ownership so the descriptor is closed.
        drop(unsafe { io_lifetimes::OwnedFd::from_raw_fd(fd) });
    }
}

/// The target-side exchange client.
pub struct FdExchangeClient {
    stream: UnixStream,
}

impl FdExchangeClient {
    pub fn connect(socket_dir: &Path) -> io::Result<FdExchangeClient> {
        let stream = UnixStream::connect(socket_dir.join(SOCKET_FILE_NAME))?;
        Ok(FdExchangeClient { stream })
    }

    /// Announces one region, moving a duplicate of its descriptor to the
    /// server.
    pub fn send_region(
        &mut self,
        region_type: u32,
        region_index: u32,
        region_size: u64,
        fd: RawFd,
    ) -> io::Result<()> {
        let envelope = RegionEnvelope {
            region_type,
            region_index,
            region_size,
            contains_fd: true,
        };
        send_envelope(&self.stream, &envelope, Some(fd))
    }

    /// Asks the server for a previously announced region. `None` when the
    /// server does not know the region.
    pub fn request_region(
        &mut self,
        region_type: u32,
        region_index: u32,
    ) -> io::Result<Option<StoredRegion>> {
        let request = RegionEnvelope {
            region_type,
            region_index,
            region_size: 0,
            contains_fd: false,
        };
        send_envelope(&self.stream, &request, None)?;

        let (reply, fd) = recv_envelope(&self.stream, None)?
            .ok_or_else(|| io::Error::from(ErrorKind::UnexpectedEof))?;
        match (reply.contains_fd, fd) {
            (true, Some(fd)) => Ok(Some(StoredRegion {
                handle: unsafe { RegionHandle::from_raw_fd(fd) },
                size: reply.region_size,
            })),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{FileBackedHandle, ShmHandle};

    #[test]
    fn envelope_wire_roundtrip() {
        let envelope = RegionEnvelope {
            region_type: 2,
            region_index: 7,
            region_size: 65536,
            contains_fd: true,
        };
        let bytes = envelope.to_bytes();
        assert_eq!(bytes.len(), ENVELOPE_SIZE);
        assert_eq!(RegionEnvelope::from_bytes(&bytes), envelope);

        let plain = RegionEnvelope {
            contains_fd: false,
            ..envelope
        };
        assert_eq!(RegionEnvelope::from_bytes(&plain.to_bytes()), plain);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn descriptors_survive_the_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(FdExchangeServer::bind(dir.path()).unwrap());
        assert!(dir.path().join("mlos.sock.opened").exists());

        let acceptor = {
            let server = server.clone();
            std::thread::spawn(move || server.accept_one().unwrap())
        };

        // Target side: create an anonymous region, scribble into it, send
        // the descriptor.
        let shm = ShmHandle::new(4096).unwrap();
        let mut mapped = shm.clone().map().unwrap();
        mapped.as_slice_mut()[..4].copy_from_slice(b"mlos");

        let mut client = FdExchangeClient::connect(dir.path()).unwrap();
        client
            .send_region(2, 0, 4096, mapped.mem.get_shm().handle.as_raw_fd())
            .unwrap();
        acceptor.join().unwrap();

        // Agent side: the stored descriptor maps to the same memory.
        let stored = server
            .regions()
            .wait_for(2, 0, Some(Duration::from_secs(5)))
            .expect("region should arrive");
        assert_eq!(stored.size, 4096);
        let agent_view = ShmHandle::from_handle(stored.handle, stored.size as usize)
            .map()
            .unwrap();
        assert_eq!(&agent_view.as_slice()[..4], b"mlos");

        // Reverse query for the same region returns a live descriptor.
        let stored = client.request_region(2, 0).unwrap().expect("known region");
        assert_eq!(stored.size, 4096);

        // And unknown regions are reported as absent.
        assert!(client.request_region(3, 9).unwrap().is_none());

        server.shutdown();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join(SOCKET_FILE_NAME);
        std::fs::write(&socket_path, b"stale").unwrap();

        let server = FdExchangeServer::bind(dir.path()).unwrap();
        assert!(is_listening(server.socket_path()).unwrap());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn second_server_is_rejected_while_live() {
        let dir = tempfile::tempdir().unwrap();
        let _server = FdExchangeServer::bind(dir.path()).unwrap();
        let err = FdExchangeServer::bind(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
    }
}
