//! Linux TAP device access.
//!
//! The device is opened through `/dev/net/tun` with `IFF_TAP | IFF_NO_PI`,
//! optionally renamed and given a MAC address, and brought up. Reads and
//! writes move one whole Ethernet frame per call.

#[cfg(target_os = "linux")]
pub use linux::TapDevice;

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;

    use tokio::io::unix::AsyncFd;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;
    const IFF_UP: libc::c_short = 0x0001;
    const IFF_RUNNING: libc::c_short = 0x0040;
    const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
    const SIOCSIFFLAGS: libc::c_ulong = 0x8914;
    const SIOCSIFHWADDR: libc::c_ulong = 0x8924;
    const ARPHRD_ETHER: libc::sa_family_t = 1;

    pub struct TapDevice {
        fd: AsyncFd<File>,
        name: String,
    }

    impl TapDevice {
        /// Create (or attach to) a TAP device. `name` may contain a `%d`
        /// pattern for kernel-side numbering; `None` uses `cove%d`.
        pub fn open(name: Option<&str>, mac: Option<[u8; 6]>) -> io::Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open("/dev/net/tun")?;

            let mut ifr = ifreq_named(name.unwrap_or("cove%d"));
            ifr.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI;
            if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) } < 0 {
                return Err(io::Error::last_os_error());
            }
            let name = name_of(&ifr);

            if let Some(mac) = mac {
                set_hardware_address(&name, mac)?;
            }
            bring_up(&name)?;

            Ok(Self {
                fd: AsyncFd::new(file)?,
                name,
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        /// Read one frame. Returns its length.
        pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                let attempt = guard.try_io(|inner| {
                    let n = unsafe {
                        libc::read(
                            inner.get_ref().as_raw_fd(),
                            buf.as_mut_ptr().cast(),
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match attempt {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        /// Write one frame.
        pub async fn send(&self, frame: &[u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.writable().await?;
                let attempt = guard.try_io(|inner| {
                    let n = unsafe {
                        libc::write(
                            inner.get_ref().as_raw_fd(),
                            frame.as_ptr().cast(),
                            frame.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match attempt {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }
    }

    fn ifreq_named(name: &str) -> libc::ifreq {
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (slot, byte) in ifr
            .ifr_name
            .iter_mut()
            .zip(name.as_bytes().iter().take(libc::IFNAMSIZ - 1))
        {
            *slot = *byte as libc::c_char;
        }
        ifr
    }

    fn name_of(ifr: &libc::ifreq) -> String {
        ifr.ifr_name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8 as char)
            .collect()
    }

    /// Run one interface ioctl through a throwaway control socket.
    fn interface_ioctl(request: libc::c_ulong, ifr: &mut libc::ifreq) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::ioctl(sock, request, ifr) };
        let result = if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        };
        unsafe { libc::close(sock) };
        result
    }

    fn set_hardware_address(name: &str, mac: [u8; 6]) -> io::Result<()> {
        let mut ifr = ifreq_named(name);
        let mut addr: libc::sockaddr = unsafe { std::mem::zeroed() };
        addr.sa_family = ARPHRD_ETHER;
        for (slot, byte) in addr.sa_data.iter_mut().zip(mac.iter()) {
            *slot = *byte as libc::c_char;
        }
        ifr.ifr_ifru.ifru_hwaddr = addr;
        interface_ioctl(SIOCSIFHWADDR, &mut ifr)
    }

    fn bring_up(name: &str) -> io::Result<()> {
        let mut ifr = ifreq_named(name);
        interface_ioctl(SIOCGIFFLAGS, &mut ifr)?;
        unsafe {
            ifr.ifr_ifru.ifru_flags |= IFF_UP | IFF_RUNNING;
        }
        interface_ioctl(SIOCSIFFLAGS, &mut ifr)
    }
}

#[cfg(not(target_os = "linux"))]
pub use fallback::TapDevice;

#[cfg(not(target_os = "linux"))]
mod fallback {
    use std::io;

    pub struct TapDevice;

    impl TapDevice {
        pub fn open(_name: Option<&str>, _mac: Option<[u8; 6]>) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TAP devices are only supported on Linux",
            ))
        }

        pub fn name(&self) -> &str {
            ""
        }

        pub async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::Unsupported.into())
        }

        pub async fn send(&self, _frame: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::Unsupported.into())
        }
    }
}
