//! Local host identity helpers.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};

/// This machine's hostname, or `"unknown"` when it cannot be read.
pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Guess the address peers should use to reach this host.
///
/// Tries the source address the kernel would route an outbound UDP
/// datagram from (no packet is sent), then hostname resolution, then
/// loopback.
pub fn guess_host_ip() -> IpAddr {
    let routed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| {
            s.connect(("8.8.8.8", 80))?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .ok()
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified());
    if let Some(ip) = routed {
        return ip;
    }

    let resolved = (hostname().as_str(), 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()))
        .map(|a| a.ip());
    resolved.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

mod hostname {
    use std::ffi::OsString;

    pub fn get() -> std::io::Result<OsString> {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStringExt;
            let mut buf = vec![0u8; 256];
            // SAFETY: gethostname writes a null-terminated string into buf
            let ret = unsafe {
                ::libc::gethostname(buf.as_mut_ptr() as *mut ::libc::c_char, buf.len())
            };
            if ret != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            buf.truncate(len);
            Ok(OsString::from_vec(buf))
        }

        #[cfg(not(unix))]
        {
            Ok(std::env::var_os("COMPUTERNAME").unwrap_or_else(|| OsString::from("unknown")))
        }
    }
}
