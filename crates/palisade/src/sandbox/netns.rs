//! Empty network namespaces for sandboxed processes (Linux).
//!
//! The child unshares a user namespace together with the network namespace,
//! so no privileges are needed. Inside, only loopback exists. For proxied
//! egress the child also opens the proxy's listening socket on its own
//! loopback and passes the descriptor back over a socketpair; the parent
//! accepts on it from the host namespace.
//!
//! Everything that runs between fork and exec sticks to raw syscalls on
//! buffers prepared before the fork.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;
use std::sync::OnceLock;

use super::egress::PROXY_PORT;

const CONTROL_LEN: usize = 64;

/// Ancillary data buffer aligned for `cmsghdr`.
#[repr(C)]
union ControlBuf {
    _align: libc::cmsghdr,
    bytes: [u8; CONTROL_LEN],
}

/// uid and gid maps written from inside the new user namespace, so files in
/// the volume keep their real owner.
#[derive(Debug, Clone)]
pub(crate) struct IdMaps {
    uid: Vec<u8>,
    gid: Vec<u8>,
}

impl IdMaps {
    /// Map the current uid and gid onto themselves.
    pub(crate) fn current() -> Self {
        // SAFETY: getuid and getgid always succeed.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            uid: format!("{uid} {uid} 1\n").into_bytes(),
            gid: format!("{gid} {gid} 1\n").into_bytes(),
        }
    }
}

/// Whether unprivileged user and network namespaces work on this host.
/// Checked once per process.
pub(crate) fn supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(try_in_child)
}

fn try_in_child() -> bool {
    let maps = IdMaps::current();
    // SAFETY: the forked child only makes raw syscalls before _exit.
    unsafe {
        let pid = libc::fork();
        if pid < 0 {
            return false;
        }
        if pid == 0 {
            let code = if enter(&maps).is_ok() { 0 } else { 1 };
            libc::_exit(code);
        }
        let mut status = 0;
        if libc::waitpid(pid, &mut status, 0) != pid {
            return false;
        }
        libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
    }
}

/// Move the calling process into fresh user and network namespaces and
/// bring loopback up.
pub(crate) fn enter(maps: &IdMaps) -> io::Result<()> {
    // SAFETY: unshare only affects the calling process.
    if unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) } != 0 {
        return Err(io::Error::last_os_error());
    }
    match write_proc(c"/proc/self/setgroups", b"deny") {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    write_proc(c"/proc/self/uid_map", &maps.uid)?;
    write_proc(c"/proc/self/gid_map", &maps.gid)?;
    loopback_up()
}

fn write_proc(path: &CStr, contents: &[u8]) -> io::Result<()> {
    // SAFETY: path is NUL-terminated and contents outlives the write.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, contents.as_ptr().cast(), contents.len());
        let err = io::Error::last_os_error();
        libc::close(fd);
        if written < 0 {
            return Err(err);
        }
    }
    Ok(())
}

fn loopback_up() -> io::Result<()> {
    // SAFETY: ifreq is plain data and the socket is closed on every path.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut req: libc::ifreq = mem::zeroed();
        req.ifr_name[0] = b'l' as libc::c_char;
        req.ifr_name[1] = b'o' as libc::c_char;
        let mut rc = libc::ioctl(fd, libc::SIOCGIFFLAGS as _, &mut req);
        if rc == 0 {
            req.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
            rc = libc::ioctl(fd, libc::SIOCSIFFLAGS as _, &req);
        }
        let err = io::Error::last_os_error();
        libc::close(fd);
        if rc != 0 {
            return Err(err);
        }
    }
    Ok(())
}

/// Open the proxy listener on the namespace's loopback and send it to the
/// parent over `channel`.
pub(crate) fn export_listener(channel: RawFd) -> io::Result<()> {
    // SAFETY: the address and message buffers live on this stack frame; the
    // listener is closed here after its descriptor has been sent.
    unsafe {
        let sock = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = PROXY_PORT.to_be();
        addr.sin_addr = libc::in_addr {
            s_addr: u32::from(Ipv4Addr::LOCALHOST).to_be(),
        };
        let mut rc = libc::bind(
            sock,
            ptr::addr_of!(addr).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if rc == 0 {
            rc = libc::listen(sock, 64);
        }
        if rc == 0 {
            rc = send_fd(channel, sock);
        }
        let err = io::Error::last_os_error();
        libc::close(sock);
        if rc != 0 {
            return Err(err);
        }
    }
    Ok(())
}

fn send_fd(channel: RawFd, fd: RawFd) -> libc::c_int {
    let mut byte = [0u8; 1];
    let mut control = ControlBuf {
        bytes: [0; CONTROL_LEN],
    };
    // SAFETY: every pointer in the message refers to a live local buffer and
    // the control buffer is large enough for one descriptor.
    unsafe {
        let mut iov = libc::iovec {
            iov_base: byte.as_mut_ptr().cast(),
            iov_len: byte.len(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.bytes.as_mut_ptr().cast();
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
        if libc::sendmsg(channel, &msg, 0) == 1 { 0 } else { -1 }
    }
}

/// Take the listener a child exported. The child has already exec'd by the
/// time this runs, so the descriptor is either queued or was never sent.
pub(crate) fn receive_listener(channel: &UnixStream) -> io::Result<std::net::TcpListener> {
    let mut byte = [0u8; 1];
    let mut control = ControlBuf {
        bytes: [0; CONTROL_LEN],
    };
    // SAFETY: as in send_fd; the received descriptor is checked before use.
    let fd = unsafe {
        let mut iov = libc::iovec {
            iov_base: byte.as_mut_ptr().cast(),
            iov_len: byte.len(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.bytes.as_mut_ptr().cast();
        msg.msg_controllen = CONTROL_LEN as _;
        let received = libc::recvmsg(
            channel.as_raw_fd(),
            &mut msg,
            libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC,
        );
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "sandbox did not pass a proxy listener",
            ));
        }
        ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>())
    };
    // SAFETY: the descriptor was just received and nothing else owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(std::net::TcpListener::from(owned))
}
