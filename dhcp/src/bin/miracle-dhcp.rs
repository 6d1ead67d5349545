//! Ad-hoc IPv4 DHCP server/client for Wi-Fi P2P links.
//!
//! Wi-Fi P2P requires DHCP to bring up the private network between the two
//! peers, and the common DHCP daemons have no usable interface for such
//! one-shot setups. This helper binds one of the state machines from
//! `miracle-dhcp` to a single interface, applies addresses by invoking the
//! `ip` binary, and reports leases to its parent over a datagram socket
//! passed via `--comm-fd`:
//!
//! ```text
//! sent on local lease:
//!   L:<addr>   local iface addr
//!   S:<mask>   subnet mask
//!   D:<addr>   primary DNS server
//!   G:<addr>   primary gateway
//! sent on remote lease:
//!   R:<mac> <addr>   addr given to remote device
//! ```

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Command, ExitCode, Stdio};
use std::time::{Duration, SystemTime};

use clap::Parser;

use miracle_dhcp::io::{self, LinuxLink};
use miracle_dhcp::proto::v4::opt;
use miracle_dhcp::v4::{ClientKind, DhcpEvent, DhcpV4Client, DhcpV4Server, ServerEvent};
use miracle_shared::{parse, CoreError, ErrorKind, EventPool, SignalWatch};

#[derive(Parser)]
#[command(name = "miracle-dhcp", version, about = "Ad-hoc IPv4 DHCP Server/Client.")]
struct Args {
    /// Network device to run on.
    #[arg(long)]
    netdev: String,

    /// Path to the 'ip' binary.
    #[arg(long, default_value = "/bin/ip")]
    ip_binary: PathBuf,

    /// Comm-socket FD passed through exec.
    #[arg(long)]
    comm_fd: Option<RawFd>,

    /// Maximum level for log messages.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Prefix log messages with a timestamp.
    #[arg(long)]
    log_time: bool,

    /// Run as DHCP server instead of client.
    #[arg(long)]
    server: bool,

    /// Network prefix (server only).
    #[arg(long)]
    prefix: Option<String>,

    /// Local address suffix (server only).
    #[arg(long)]
    local: Option<String>,

    /// Gateway suffix (server only).
    #[arg(long)]
    gateway: Option<String>,

    /// DNS suffix (server only).
    #[arg(long)]
    dns: Option<String>,

    /// Subnet mask (server only).
    #[arg(long)]
    subnet: Option<String>,

    /// Start address suffix (server only).
    #[arg(long)]
    from: Option<String>,

    /// End address suffix (server only).
    #[arg(long)]
    to: Option<String>,
}

/// Server-mode addresses synthesized from the CLI.
struct ServerConfig {
    local: String,
    gateway: String,
    dns: String,
    subnet: String,
    from: String,
    to: String,
}

fn make_address(prefix: Option<&str>, suffix: &str, name: &str) -> Result<String, CoreError> {
    let prefix = prefix.unwrap_or("192.168.77");
    let suffix = parse::atoi_u8(suffix, 10)
        .map_err(|_| CoreError::invalid_arg(format!("invalid --{name} suffix: {suffix}")))?;
    let addr = format!("{prefix}.{suffix}");
    addr.parse::<Ipv4Addr>()
        .map_err(|_| CoreError::invalid_arg(format!("invalid --{name} address: {addr}")))?;
    Ok(addr)
}

fn make_subnet(subnet: &str) -> Result<String, CoreError> {
    subnet
        .parse::<Ipv4Addr>()
        .map_err(|_| CoreError::invalid_arg(format!("invalid --subnet: {subnet}")))?;
    Ok(subnet.to_string())
}

fn server_config(args: &Args) -> Result<ServerConfig, CoreError> {
    let prefix = args.prefix.as_deref();
    Ok(ServerConfig {
        local: make_address(prefix, args.local.as_deref().unwrap_or("1"), "local")?,
        gateway: make_address(prefix, args.gateway.as_deref().unwrap_or("1"), "gateway")?,
        dns: make_address(prefix, args.dns.as_deref().unwrap_or("1"), "dns")?,
        subnet: make_subnet(args.subnet.as_deref().unwrap_or("255.255.255.0"))?,
        from: make_address(prefix, args.from.as_deref().unwrap_or("100"), "from")?,
        to: make_address(prefix, args.to.as_deref().unwrap_or("199"), "to")?,
    })
}

/// Datagram messages to the parent. Disabled after the first send failure.
struct Comm {
    fd: Option<RawFd>,
}

impl Comm {
    fn new(fd: Option<RawFd>) -> Self {
        Self { fd }
    }

    fn send(&mut self, msg: String) {
        let Some(fd) = self.fd else {
            return;
        };
        let r = unsafe { libc::send(fd, msg.as_ptr().cast(), msg.len(), libc::MSG_NOSIGNAL) };
        if r < 0 {
            self.fd = None;
            log::error!(
                "cannot write to comm-socket, disabling it: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

fn run_ip(binary: &PathBuf, args: &[&str]) -> Result<(), CoreError> {
    // child stdout joins our stderr so `ip` noise never lands on the
    // comm channel
    let stderr_copy = unsafe {
        use std::os::fd::FromRawFd;
        let fd = libc::dup(libc::STDERR_FILENO);
        if fd < 0 {
            return Err(CoreError::last_os("dup"));
        }
        Stdio::from_raw_fd(fd)
    };
    let status = Command::new(binary)
        .args(args)
        .stdout(stderr_copy)
        .status()
        .map_err(|e| CoreError::io(format!("cannot run {}: {e}", binary.display())))?;
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(CoreError::io(format!(
            "'{}' {:?} failed with: {code}",
            binary.display(),
            args
        ))),
        None => Err(CoreError::io(format!(
            "'{}' {:?} terminated by signal",
            binary.display(),
            args
        ))),
    }
}

fn flush_if_addr(binary: &PathBuf, netdev: &str) -> Result<(), CoreError> {
    log::info!("flushing local if-addr");
    run_ip(binary, &["addr", "flush", "dev", netdev])
}

fn add_if_addr(binary: &PathBuf, netdev: &str, addr: &str) -> Result<(), CoreError> {
    log::info!("adding local if-addr {addr}");
    run_ip(binary, &["addr", "add", addr, "dev", netdev])
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let r = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len() - 1) };
    if r != 0 {
        return "localhost".to_string();
    }
    buf.iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as char)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MgrEvent {
    Signal,
    Net,
}

const EXIT_SIGNALS: [libc::c_int; 5] = [
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGQUIT,
    libc::SIGHUP,
    libc::SIGPIPE,
];

fn drain_signal(signals: &SignalWatch) -> Option<u32> {
    match signals.read() {
        Ok(sig) => sig,
        Err(e) => {
            log::error!("signalfd read failed: {e}");
            None
        }
    }
}

fn run_client(args: &Args, comm: &mut Comm) -> Result<(), CoreError> {
    let ifindex = io::if_index(&args.netdev)?;
    let mac = io::if_mac(ifindex)?;
    let link = LinuxLink::open(ifindex)?;

    let signals = SignalWatch::block(&EXIT_SIGNALS)?;

    let mut client = DhcpV4Client::new(ClientKind::Dhcp, ifindex, mac, link, rand::random())?;
    client.set_hostname(&hostname());
    client.set_client_id();
    client.set_request(opt::SUBNET);
    client.set_request(opt::DNS_SERVER);
    client.set_request(opt::ROUTER);

    let mut pool: EventPool<MgrEvent> = EventPool::new()?;
    pool.add_fd(signals.as_raw_fd(), MgrEvent::Signal)?;
    pool.add_fd(client.as_raw_fd(), MgrEvent::Net)?;

    log::info!(
        "running dhcp client on {} via '{}'",
        args.netdev,
        args.ip_binary.display()
    );
    client.start(None)?;

    let mut applied: Option<String> = None;
    let result = 'outer: loop {
        for ev in pool.poll(None)? {
            match ev {
                MgrEvent::Signal => {
                    if let Some(sig) = drain_signal(&signals) {
                        log::info!("received signal {sig}, exiting");
                    }
                    break 'outer Ok(());
                }
                MgrEvent::Net => {
                    for cev in client.poll(Some(Duration::ZERO))? {
                        for dev in client.process(cev)? {
                            match dev {
                                DhcpEvent::LeaseAvailable(lease) => {
                                    log::info!("lease available: {}", lease.address);
                                    let subnet = lease
                                        .subnet
                                        .map(|s| s.to_string())
                                        .unwrap_or_else(|| {
                                            log::warn!("lease without subnet mask, using 24");
                                            "24".to_string()
                                        });
                                    let a = format!("{}/{subnet}", lease.address);
                                    if applied.as_deref() == Some(a.as_str()) {
                                        log::info!("given address already set");
                                        continue;
                                    }
                                    flush_if_addr(&args.ip_binary, &args.netdev)?;
                                    add_if_addr(&args.ip_binary, &args.netdev, &a)?;
                                    applied = Some(a);
                                    comm.send(format!("L:{}", lease.address));
                                    comm.send(format!("S:{subnet}"));
                                    if let Some(dns) = lease.dns.first() {
                                        comm.send(format!("D:{dns}"));
                                    }
                                    if let Some(gw) = lease.routers.first() {
                                        comm.send(format!("G:{gw}"));
                                    }
                                }
                                DhcpEvent::NoLease => {
                                    log::error!("no lease available");
                                    break 'outer Err(CoreError::new(
                                        ErrorKind::NoLease,
                                        "no lease available",
                                    ));
                                }
                                DhcpEvent::LeaseLost => {
                                    log::warn!("lease lost, reacquiring");
                                }
                                other => log::debug!("ignoring client event {other:?}"),
                            }
                        }
                    }
                }
            }
        }
    };

    client.stop();
    if applied.is_some() {
        let _ = flush_if_addr(&args.ip_binary, &args.netdev);
    }
    result
}

fn run_server(args: &Args, comm: &mut Comm) -> Result<(), CoreError> {
    let cfg = server_config(args)?;
    let ifindex = io::if_index(&args.netdev)?;

    let signals = SignalWatch::block(&EXIT_SIGNALS)?;

    let server_addr = format!("{}/{}", cfg.local, cfg.subnet);
    flush_if_addr(&args.ip_binary, &args.netdev)?;
    add_if_addr(&args.ip_binary, &args.netdev, &server_addr)?;

    let link = LinuxLink::open(ifindex)?;
    let local: Ipv4Addr = cfg
        .local
        .parse()
        .map_err(|_| CoreError::invalid_arg("bad local address"))?;
    let mut server = DhcpV4Server::new(ifindex, local, link)?;
    server.set_lease_time(60 * 60);
    server.set_option(opt::SUBNET, &cfg.subnet)?;
    server.set_option(opt::ROUTER, &cfg.gateway)?;
    server.set_option(opt::DNS_SERVER, &cfg.dns)?;
    server.set_ip_range(&cfg.from, &cfg.to)?;

    log::info!(
        "running dhcp server on {} via '{}'",
        args.netdev,
        args.ip_binary.display()
    );
    server.start()?;

    let mut pool: EventPool<MgrEvent> = EventPool::new()?;
    pool.add_fd(signals.as_raw_fd(), MgrEvent::Signal)?;
    let listener = server
        .listener_fd()
        .ok_or_else(|| CoreError::io("server has no listener"))?;
    pool.add_fd(listener, MgrEvent::Net)?;

    comm.send(format!("L:{}", cfg.local));

    let result = 'outer: loop {
        for ev in pool.poll(None)? {
            match ev {
                MgrEvent::Signal => {
                    if let Some(sig) = drain_signal(&signals) {
                        log::info!("received signal {sig}, exiting");
                    }
                    break 'outer Ok(());
                }
                MgrEvent::Net => {
                    for sev in server.process_io(unix_now())? {
                        match sev {
                            ServerEvent::RemoteLease { mac, address } => {
                                let mac = mac
                                    .iter()
                                    .map(|b| format!("{b:02x}"))
                                    .collect::<Vec<_>>()
                                    .join(":");
                                log::debug!("remote lease: {mac} {address}");
                                comm.send(format!("R:{mac} {address}"));
                            }
                        }
                    }
                }
            }
        }
    };

    server.stop();
    let _ = flush_if_addr(&args.ip_binary, &args.netdev);
    result
}

fn run(args: &Args, comm: &mut Comm) -> Result<(), CoreError> {
    if !args.server {
        let server_only = args.prefix.is_some()
            || args.local.is_some()
            || args.gateway.is_some()
            || args.dns.is_some()
            || args.subnet.is_some()
            || args.from.is_some()
            || args.to.is_some();
        if server_only {
            return Err(CoreError::invalid_arg(
                "server option given, but running as client",
            ));
        }
        run_client(args, comm)
    } else {
        run_server(args, comm)
    }
}

/// Exit code: the errno matching the final error, like the callers expect.
fn exit_code(kind: ErrorKind) -> u8 {
    (match kind {
        ErrorKind::InvalidArgument | ErrorKind::InvalidIndex => libc::EINVAL,
        ErrorKind::NoMemory => libc::ENOMEM,
        ErrorKind::InterfaceUnavailable => libc::ENODEV,
        ErrorKind::InterfaceDown => libc::ENETDOWN,
        ErrorKind::AddressInUse | ErrorKind::Conflict => libc::EADDRINUSE,
        ErrorKind::Io => libc::EIO,
        ErrorKind::Protocol => libc::EPROTO,
        ErrorKind::Timeout => libc::ETIMEDOUT,
        ErrorKind::NoLease => libc::ENODATA,
        ErrorKind::Terminated => libc::EPIPE,
        ErrorKind::NotConnected => libc::ENOTCONN,
        _ => libc::EIO,
    }) as u8
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&args.log_level);
    if args.log_time {
        builder.format_timestamp_millis();
    } else {
        builder.format_timestamp(None);
    }
    builder.init();

    if unsafe { libc::geteuid() } != 0 {
        log::warn!("not running as uid=0, dhcp might not work");
    }

    let mut comm = Comm::new(args.comm_fd);
    match run(&args, &mut comm) {
        Ok(()) => {
            log::debug!("exiting..");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(exit_code(e.kind()))
        }
    }
}
