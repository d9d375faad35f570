//! Platform seam: the virtual device and the permission facility.
//!
//! The engine never talks to the OS tunnel facility directly; everything
//! goes through [`Platform`], which the embedding application implements.
//! Permission prompts resolve asynchronously through a [`PermissionTicket`]
//! the platform completes from its own UI flow.

use crate::config::EngineConfig;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::debug;

/// Owned virtual-device descriptor; closed on drop.
#[derive(Debug)]
pub struct DeviceHandle {
    fd: RawFd,
}

impl DeviceHandle {
    /// Take ownership of an open device descriptor.
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        debug!(fd = self.fd, "closing device descriptor");
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Completes a pending permission request.
pub struct PermissionResolver {
    tx: Sender<bool>,
}

impl PermissionResolver {
    /// Deliver the user's decision.
    pub fn resolve(self, granted: bool) {
        let _ = self.tx.send(granted);
    }
}

/// A pending permission request, resolved externally.
pub struct PermissionTicket {
    rx: Receiver<bool>,
}

impl PermissionTicket {
    /// Block until the request resolves. Timeout or a torn-down resolver
    /// counts as denied.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).unwrap_or(false)
    }

    /// A ticket that is already resolved.
    pub fn resolved(granted: bool) -> Self {
        let (resolver, ticket) = permission_ticket();
        resolver.resolve(granted);
        ticket
    }
}

/// Create a permission request pair.
pub fn permission_ticket() -> (PermissionResolver, PermissionTicket) {
    let (tx, rx) = bounded(1);
    (PermissionResolver { tx }, PermissionTicket { rx })
}

/// The platform tunnel facility.
pub trait Platform: Send + Sync {
    /// Synchronous query: is the VPN permission currently granted?
    fn has_permission(&self) -> bool;

    /// Ask the user for the VPN permission. The returned ticket resolves
    /// when the (external) dialog completes.
    fn request_permission(&self) -> PermissionTicket;

    /// Establish the virtual network device for this configuration and
    /// return its descriptor.
    fn open_device(&self, config: &EngineConfig) -> io::Result<DeviceHandle>;

    /// Tear down whatever `open_device` established. Must be safe to call
    /// when nothing is open.
    fn shutdown_device(&self);
}

/// In-process platform used by tests and the local dev daemon: the "device"
/// is one end of a pipe, permission is a pair of flags.
pub struct StubPlatform {
    granted: AtomicBool,
    grant_on_ask: bool,
    fail_open: AtomicBool,
    open_calls: AtomicUsize,
    write_ends: Mutex<Vec<RawFd>>,
}

impl StubPlatform {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            grant_on_ask: true,
            fail_open: AtomicBool::new(false),
            open_calls: AtomicUsize::new(0),
            write_ends: Mutex::new(Vec::new()),
        }
    }

    /// Deny the permission request instead of granting it.
    pub fn denying() -> Self {
        let mut p = Self::new(false);
        p.grant_on_ask = false;
        p
    }

    /// Make every `open_device` fail.
    pub fn failing() -> Self {
        let p = Self::new(true);
        p.fail_open.store(true, Ordering::SeqCst);
        p
    }

    /// Stop failing `open_device`.
    pub fn recover(&self) {
        self.fail_open.store(false, Ordering::SeqCst);
    }

    /// How many times the device was opened (i.e. native starts attempted).
    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }
}

impl Platform for StubPlatform {
    fn has_permission(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    fn request_permission(&self) -> PermissionTicket {
        if self.grant_on_ask {
            self.granted.store(true, Ordering::SeqCst);
        }
        PermissionTicket::resolved(self.grant_on_ask)
    }

    fn open_device(&self, config: &EngineConfig) -> io::Result<DeviceHandle> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::other(format!("no tunnel facility for {}", config.device_tag)));
        }

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // Keep the write end alive so the read end stays quiet instead of
        // reporting EOF.
        self.write_ends.lock().unwrap().push(fds[1]);
        Ok(DeviceHandle::new(fds[0]))
    }

    fn shutdown_device(&self) {
        let mut ends = self.write_ends.lock().unwrap();
        for fd in ends.drain(..) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
