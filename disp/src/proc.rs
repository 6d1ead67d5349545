//! DHCP supervisor sub-process handling.
//!
//! For every P2P group interface one `miracle-dhcp` helper runs, client or
//! server depending on which side owns the group. It reports addresses and
//! leases over a datagram socketpair; the messages are single packets of
//! ASCII, `L:`/`S:`/`D:`/`G:` for the local configuration and `R:` for
//! remote leases.

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::{Child, Command};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::Pid;

use miracle_shared::{CoreError, ErrorKind};

/// One comm-socket message from the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Local interface address.
    Local(Ipv4Addr),
    /// Subnet mask (dotted quad, or a prefix length when the lease had no
    /// mask option).
    Subnet(String),
    /// Primary DNS server.
    Dns(Ipv4Addr),
    /// Primary gateway.
    Gateway(Ipv4Addr),
    /// Address handed to the remote peer (server mode).
    RemoteLease { mac: String, address: Ipv4Addr },
}

/// Parse one comm datagram.
pub fn parse_comm(msg: &str) -> Result<LinkEvent, CoreError> {
    let (tag, rest) = msg
        .split_once(':')
        .ok_or_else(|| CoreError::protocol(format!("untagged comm message: {msg}")))?;
    let bad_addr = |what: &str| CoreError::protocol(format!("bad {what} in comm message: {msg}"));
    match tag {
        "L" => Ok(LinkEvent::Local(
            rest.parse().map_err(|_| bad_addr("address"))?,
        )),
        "S" => Ok(LinkEvent::Subnet(rest.to_string())),
        "D" => Ok(LinkEvent::Dns(rest.parse().map_err(|_| bad_addr("dns"))?)),
        "G" => Ok(LinkEvent::Gateway(
            rest.parse().map_err(|_| bad_addr("gateway"))?,
        )),
        "R" => {
            let (mac, addr) = rest
                .split_once(' ')
                .ok_or_else(|| CoreError::protocol(format!("malformed lease message: {msg}")))?;
            Ok(LinkEvent::RemoteLease {
                mac: mac.to_string(),
                address: addr.parse().map_err(|_| bad_addr("lease address"))?,
            })
        }
        _ => Err(CoreError::protocol(format!(
            "unknown comm message tag: {tag}"
        ))),
    }
}

/// Addressing plan for a server-mode helper; unset fields use the helper's
/// defaults (192.168.77.0/24, range .100-.199).
#[derive(Debug, Clone, Default)]
pub struct ServerParams {
    pub prefix: Option<String>,
    pub local: Option<String>,
    pub gateway: Option<String>,
    pub dns: Option<String>,
    pub subnet: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Role {
    Client,
    Server(ServerParams),
}

/// A running `miracle-dhcp` helper bound to one interface.
pub struct DhcpProcess {
    child: Child,
    comm: OwnedFd,
}

fn set_cloexec(fd: RawFd) -> Result<(), CoreError> {
    let r = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if r < 0 {
        return Err(CoreError::last_os("fcntl(F_SETFD)"));
    }
    Ok(())
}

fn set_nonblock(fd: RawFd) -> Result<(), CoreError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(CoreError::last_os("fcntl(F_GETFL)"));
    }
    let r = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if r < 0 {
        return Err(CoreError::last_os("fcntl(F_SETFL)"));
    }
    Ok(())
}

impl DhcpProcess {
    /// Fork off a helper for `netdev`. The child side of the comm pair is
    /// left inheritable and its number passed as `--comm-fd`.
    pub fn spawn(binary: &Path, netdev: &str, role: &Role) -> Result<Self, CoreError> {
        let (parent, child_fd) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| CoreError::io(format!("socketpair: {e}")))?;
        set_cloexec(parent.as_raw_fd())?;
        set_nonblock(parent.as_raw_fd())?;

        let mut cmd = Command::new(binary);
        cmd.arg("--netdev")
            .arg(netdev)
            .arg("--comm-fd")
            .arg(child_fd.as_raw_fd().to_string());
        if let Role::Server(params) = role {
            cmd.arg("--server");
            for (flag, value) in [
                ("--prefix", &params.prefix),
                ("--local", &params.local),
                ("--gateway", &params.gateway),
                ("--dns", &params.dns),
                ("--subnet", &params.subnet),
                ("--from", &params.from),
                ("--to", &params.to),
            ] {
                if let Some(value) = value {
                    cmd.arg(flag).arg(value);
                }
            }
        }

        log::info!("spawning DHCP helper for {netdev}: {cmd:?}");
        let child = cmd
            .spawn()
            .map_err(|e| CoreError::io(format!("cannot spawn {}: {e}", binary.display())))?;
        drop(child_fd);

        Ok(Self {
            child,
            comm: parent,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Register this with the event loop to learn about leases.
    pub fn comm_fd(&self) -> RawFd {
        self.comm.as_raw_fd()
    }

    /// Drain the comm socket. Unparseable datagrams are logged and
    /// skipped.
    pub fn read_events(&mut self) -> Result<Vec<LinkEvent>, CoreError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = unsafe {
                libc::recv(
                    self.comm.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    return Ok(out);
                }
                return Err(CoreError::from(err));
            }
            if n == 0 {
                return Err(CoreError::new(ErrorKind::Terminated, "comm socket closed"));
            }
            let msg = String::from_utf8_lossy(&buf[..n as usize]).into_owned();
            match parse_comm(&msg) {
                Ok(ev) => out.push(ev),
                Err(e) => log::warn!("{e}"),
            }
        }
    }

    /// Reap a child that exited on its own (call on SIGCHLD).
    pub fn try_reap(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                log::warn!("waitpid failed: {e}");
                None
            }
        }
    }

    /// Terminate the helper: SIGTERM, a short grace period, then SIGKILL.
    /// This is the only place the parent waits synchronously.
    pub fn stop(&mut self) {
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            log::debug!("SIGTERM failed: {e}");
        }
        for _ in 0..20 {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
        log::warn!("DHCP helper ignored SIGTERM, killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DhcpProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_messages_parse() {
        assert_eq!(
            parse_comm("L:192.168.77.100").unwrap(),
            LinkEvent::Local(Ipv4Addr::new(192, 168, 77, 100))
        );
        assert_eq!(
            parse_comm("S:255.255.255.0").unwrap(),
            LinkEvent::Subnet("255.255.255.0".to_string())
        );
        assert_eq!(
            parse_comm("S:24").unwrap(),
            LinkEvent::Subnet("24".to_string())
        );
        assert_eq!(
            parse_comm("D:192.168.77.1").unwrap(),
            LinkEvent::Dns(Ipv4Addr::new(192, 168, 77, 1))
        );
        assert_eq!(
            parse_comm("G:192.168.77.1").unwrap(),
            LinkEvent::Gateway(Ipv4Addr::new(192, 168, 77, 1))
        );
        assert_eq!(
            parse_comm("R:02:11:22:33:44:55 192.168.77.101").unwrap(),
            LinkEvent::RemoteLease {
                mac: "02:11:22:33:44:55".to_string(),
                address: Ipv4Addr::new(192, 168, 77, 101)
            }
        );
    }

    #[test]
    fn malformed_comm_messages_are_rejected() {
        assert!(parse_comm("").is_err());
        assert!(parse_comm("L").is_err());
        assert!(parse_comm("L:not-an-ip").is_err());
        assert!(parse_comm("X:1.2.3.4").is_err());
        assert!(parse_comm("R:02:11:22:33:44:55").is_err());
    }
}
