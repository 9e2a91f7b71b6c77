//! Thin syscall layer.
//!
//! Every wrapper returns `io::Result` with the raw OS error preserved so
//! callers can distinguish `WouldBlock` / `Interrupted` from terminal
//! failures. Nothing here retries except `readv`/`writev` on `EINTR`.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

pub fn epoll_create() -> io::Result<RawFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub fn epoll_add(epfd: RawFd, fd: RawFd, events: u32, key: u32) -> io::Result<()> {
    epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, events, key)
}

pub fn epoll_mod(epfd: RawFd, fd: RawFd, events: u32, key: u32) -> io::Result<()> {
    epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, events, key)
}

fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32, key: u32) -> io::Result<()> {
    let mut ev = libc::epoll_event {
        events,
        u64: u64::from(key),
    };
    let ret = unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Blocks until at least one event is ready. `EINTR` surfaces as
/// `ErrorKind::Interrupted` for the caller to retry.
pub fn epoll_wait(epfd: RawFd, events: &mut [libc::epoll_event]) -> io::Result<usize> {
    let ret = unsafe {
        libc::epoll_wait(
            epfd,
            events.as_mut_ptr(),
            events.len() as libc::c_int,
            -1,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Duplicate a descriptor with `CLOEXEC` set on the copy.
pub fn dup(fd: RawFd) -> io::Result<RawFd> {
    let ret = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

pub fn shutdown(fd: RawFd, how: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::shutdown(fd, how) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accept one connection. `Ok(None)` when the queue is empty or the
/// pending connection was aborted before we got to it.
pub fn accept(fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::ECONNABORTED) => Ok(None),
            _ => Err(err),
        };
    }
    let peer = sockaddr_to_addr(&storage)
        .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    Ok(Some((ret, peer)))
}

pub fn readv(fd: RawFd, iovs: &[libc::iovec]) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::readv(fd, iovs.as_ptr(), iovs.len() as libc::c_int) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ret as usize);
    }
}

pub fn writev(fd: RawFd, iovs: &[libc::iovec]) -> io::Result<usize> {
    loop {
        let ret = unsafe { libc::writev(fd, iovs.as_ptr(), iovs.len() as libc::c_int) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ret as usize);
    }
}

/// Write exactly one control byte. The pipe is sized far beyond the
/// handful of in-flight control messages, so a short write means the
/// loop is gone and the byte is moot.
pub fn write_byte(fd: RawFd, byte: u8) {
    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
}

pub fn read_byte(fd: RawFd) -> io::Result<Option<u8>> {
    let mut byte = 0u8;
    let ret = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err),
        };
    }
    if ret == 0 {
        return Ok(None);
    }
    Ok(Some(byte))
}

pub fn set_nodelay(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Options applied while building a listener socket.
pub struct ListenOptions {
    pub backlog: i32,
    pub reuse_port: bool,
    pub defer_accept: bool,
    pub ipv6_only: bool,
    pub incoming_cpu: Option<usize>,
}

/// Create, configure, bind and listen. Returns the listening descriptor.
pub fn tcp_listener(addr: SocketAddr, opts: &ListenOptions) -> io::Result<RawFd> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = (|| {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        if opts.reuse_port {
            set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }
        if addr.is_ipv6() {
            set_opt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                i32::from(opts.ipv6_only),
            )?;
        }
        if let Some(cpu) = opts.incoming_cpu {
            // Best effort; older kernels reject it.
            let _ = set_opt(fd, libc::SOL_SOCKET, libc::SO_INCOMING_CPU, cpu as libc::c_int);
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = fill_sockaddr(&mut storage, &addr);
        let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let ret = unsafe { libc::listen(fd, opts.backlog) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        if opts.defer_accept {
            set_opt(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, 1)?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family"))
}

/// Pin the current thread to one CPU.
pub fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let ret = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Number of online CPUs.
pub fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

fn fill_sockaddr(storage: &mut libc::sockaddr_storage, addr: &SocketAddr) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sa.sin_port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sa.sin6_port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        fill_sockaddr(&mut storage, &addr);
        assert_eq!(sockaddr_to_addr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:443".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        fill_sockaddr(&mut storage, &addr);
        assert_eq!(sockaddr_to_addr(&storage), Some(addr));
    }

    #[test]
    fn self_pipe_round_trip() {
        let (r, w) = pipe().unwrap();
        assert_eq!(read_byte(r).unwrap(), None);
        write_byte(w, 0x01);
        assert_eq!(read_byte(r).unwrap(), Some(0x01));
        close(r);
        close(w);
    }
}
