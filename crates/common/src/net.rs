//! Api socket binding shared by both daemons.
//!
//! Produces blocking std listeners; the daemons flip them to non-blocking
//! and hand them to their runtime.

use crate::error::Result;
use crate::settings::ApiAddress;

/// A bound api listener of either flavor.
pub enum StdApiListener {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
    Tcp(std::net::TcpListener),
}

/// Bind the configured api address. A leading `@` on a local address binds
/// a Linux abstract socket.
pub fn bind_api_listener(address: &ApiAddress) -> Result<StdApiListener> {
    match address {
        #[cfg(unix)]
        ApiAddress::Local { address } => {
            let listener = if let Some(name) = address.strip_prefix('@') {
                bind_abstract_socket(name)?
            } else {
                let path = std::path::Path::new(address);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                std::os::unix::net::UnixListener::bind(path)?
            };
            Ok(StdApiListener::Unix(listener))
        }
        #[cfg(not(unix))]
        ApiAddress::Local { address } => Err(crate::error::Error::Unavailable(format!(
            "local socket {address} requires a unix platform"
        ))),
        ApiAddress::Inet4 { address, port } => {
            let listener = std::net::TcpListener::bind((address.as_str(), *port))?;
            Ok(StdApiListener::Tcp(listener))
        }
    }
}

/// Abstract sockets have no filesystem name; bind through `sockaddr_un`
/// with a leading NUL byte.
#[cfg(target_os = "linux")]
fn bind_abstract_socket(name: &str) -> Result<std::os::unix::net::UnixListener> {
    use std::os::fd::FromRawFd;

    use crate::error::Error;

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let name_bytes = name.as_bytes();
    if name_bytes.len() + 1 > addr.sun_path.len() {
        unsafe { libc::close(fd) };
        return Err(Error::invalid_argument(format!(
            "abstract socket name too long: {name}"
        )));
    }
    // sun_path[0] stays NUL; the name follows it.
    for (i, byte) in name_bytes.iter().enumerate() {
        addr.sun_path[i + 1] = *byte as libc::c_char;
    }
    let len =
        (std::mem::size_of::<libc::sa_family_t>() + 1 + name_bytes.len()) as libc::socklen_t;

    if unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) } != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err.into());
    }
    if unsafe { libc::listen(fd, 64) } != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err.into());
    }
    Ok(unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) })
}

#[cfg(all(unix, not(target_os = "linux")))]
fn bind_abstract_socket(name: &str) -> Result<std::os::unix::net::UnixListener> {
    Err(crate::error::Error::Unavailable(format!(
        "abstract socket @{name} requires Linux"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn binds_and_replaces_a_filesystem_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("api.sock");
        let address = ApiAddress::Local {
            address: path.to_string_lossy().into_owned(),
        };
        let _first = bind_api_listener(&address).unwrap();
        // A stale socket file from a previous run is replaced.
        drop(_first);
        let _second = bind_api_listener(&address).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn binds_loopback_tcp() {
        let address = ApiAddress::Inet4 {
            address: "127.0.0.1".to_string(),
            port: 0,
        };
        let listener = bind_api_listener(&address).unwrap();
        match listener {
            StdApiListener::Tcp(listener) => {
                assert!(listener.local_addr().unwrap().port() > 0);
            }
            #[cfg(unix)]
            StdApiListener::Unix(_) => panic!("expected tcp"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn binds_abstract_sockets() {
        let address = ApiAddress::Local {
            address: format!("@/chef/test/{}", std::process::id()),
        };
        let listener = bind_api_listener(&address).unwrap();
        assert!(matches!(listener, StdApiListener::Unix(_)));
    }
}
