//! Accepts the single host connection Firecracker's vsock device forwards
//! into the guest (§4.C's guest-side shim). The accepted socket is wrapped in
//! a `UnixStream` — the same trick `vsock-guest`'s `connect_vsock` uses for
//! the outbound direction, since `UnixStream` only ever calls `read`/`write`
//! on the underlying fd and doesn't care which socket family it came from.

use std::io;
use std::os::unix::net::UnixStream;

/// Matches the host's own length-prefixed JSON framing port (§4.C).
pub const GUEST_PORT: u32 = 9999;

/// Any guest CID is acceptable; there's exactly one guest per VM.
const CID_ANY: u32 = 0xFFFF_FFFF;

#[cfg(target_os = "linux")]
pub fn accept_vsock(port: u32) -> io::Result<UnixStream> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: creates a vsock socket with valid constants; the returned fd is
    // checked for errors immediately below.
    let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let addr = libc::sockaddr_vm {
        svm_family: libc::AF_VSOCK as u16,
        svm_reserved1: 0,
        svm_port: port,
        svm_cid: CID_ANY,
        svm_zero: [0; 4],
    };

    // SAFETY: fd is a valid socket and addr is a correctly sized sockaddr_vm;
    // bind errors are checked below.
    let bind_ret = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_vm as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_vm>() as u32,
        )
    };
    if bind_ret < 0 {
        let e = io::Error::last_os_error();
        // SAFETY: fd was just opened above and hasn't been handed off yet.
        unsafe { libc::close(fd) };
        return Err(e);
    }

    // SAFETY: fd is bound; a backlog of 1 matches "one connection per boot".
    if unsafe { libc::listen(fd, 1) } < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    // SAFETY: fd is listening; accept blocks until the host dials in.
    let client_fd = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    // SAFETY: the listening socket is no longer needed once the single
    // expected connection has been accepted (or has failed to be).
    unsafe { libc::close(fd) };
    if client_fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: client_fd is a valid, connected socket descriptor; ownership of
    // the fd transfers to the returned `UnixStream`.
    Ok(unsafe { UnixStream::from_raw_fd(client_fd) })
}

#[cfg(not(target_os = "linux"))]
pub fn accept_vsock(_port: u32) -> io::Result<UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "vsock is only supported on Linux",
    ))
}

/// Test/dev substitute for [`accept_vsock`]: accept one connection on a Unix
/// domain socket instead, mirroring `vsock-guest`'s `connect_unix` escape
/// hatch for environments without a real vsock device.
pub fn accept_unix(path: &std::path::Path) -> io::Result<UnixStream> {
    let _ = std::fs::remove_file(path);
    let listener = std::os::unix::net::UnixListener::bind(path)?;
    let (stream, _) = listener.accept()?;
    Ok(stream)
}
