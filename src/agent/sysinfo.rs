//! Handlers for the system-introspection commands.
//!
//! Everything here is Linux-flavored: `/proc` tables, `klogctl`, `uname(2)`
//! and `getifaddrs`. Handlers degrade gracefully on sparse embedded systems;
//! a process that vanished mid-listing or an unreadable fd table is skipped,
//! not an error.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Read};
use std::net::{Ipv4Addr, Ipv6Addr};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

use crate::protocol::wire::{Map, Value};
use crate::protocol::{
    ContentReply, LogReply, ProcessInfo, PsReply, ReplyBody, SocketInfo, SsReply, UnameReply,
    WhoamiReply, CHUNK_SIZE,
};

use super::fs::CAT_MAX;
use super::{required, AgentState, CmdResult, CommandError};

pub(crate) fn uname() -> CmdResult {
    let uts = nix::sys::utsname::uname().map_err(CommandError::from)?;
    Ok(UnameReply {
        sysname: uts.sysname().to_string_lossy().into_owned(),
        nodename: uts.nodename().to_string_lossy().into_owned(),
        release: uts.release().to_string_lossy().into_owned(),
        version: uts.version().to_string_lossy().into_owned(),
        machine: uts.machine().to_string_lossy().into_owned(),
    }
    .to_map())
}

pub(crate) fn whoami() -> CmdResult {
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();
    // Tiny systems often have no passwd database; fall back to the number.
    let user = match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    };
    Ok(WhoamiReply {
        user,
        uid: u64::from(uid.as_raw()),
        gid: u64::from(gid.as_raw()),
    }
    .to_map())
}

pub(crate) fn ps() -> CmdResult {
    let mut processes = Vec::new();
    for entry in fs::read_dir("/proc").map_err(CommandError::from)?.flatten() {
        let pid: u64 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        let stat = match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat,
            Err(_) => continue,
        };
        let (name, state, ppid) = match parse_stat(&stat) {
            Some(parsed) => parsed,
            None => continue,
        };
        let cmdline = fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
        processes.push(ProcessInfo {
            pid,
            ppid,
            name,
            state,
            cmdline: cmdline_to_string(&cmdline),
        });
    }
    processes.sort_by_key(|p| p.pid);
    Ok(PsReply { processes }.to_map())
}

/// Parses a `/proc/N/stat` line into `(comm, state, ppid)`.
///
/// The comm field is parenthesized and may itself contain parentheses and
/// spaces, so the state field is located from the *last* closing paren.
fn parse_stat(stat: &str) -> Option<(String, String, u64)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_owned();
    let mut rest = stat.get(close + 1..)?.split_whitespace();
    let state = rest.next()?.to_owned();
    let ppid = rest.next()?.parse().ok()?;
    Some((comm, state, ppid))
}

fn cmdline_to_string(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches('\0')
        .replace('\0', " ")
}

const TCP_STATES: [&str; 13] = [
    "UNKNOWN",
    "ESTABLISHED",
    "SYN_SENT",
    "SYN_RECV",
    "FIN_WAIT1",
    "FIN_WAIT2",
    "TIME_WAIT",
    "CLOSE",
    "CLOSE_WAIT",
    "LAST_ACK",
    "LISTEN",
    "CLOSING",
    "NEW_SYN_RECV",
];

pub(crate) fn ss() -> CmdResult {
    let owners = socket_owners();
    let mut connections = Vec::new();
    for (proto, path) in [
        ("tcp", "/proc/net/tcp"),
        ("tcp6", "/proc/net/tcp6"),
        ("udp", "/proc/net/udp"),
        ("udp6", "/proc/net/udp6"),
    ] {
        let table = match fs::read_to_string(path) {
            Ok(table) => table,
            Err(_) => continue,
        };
        for line in table.lines().skip(1) {
            if let Some(info) = parse_socket_line(proto, line, &owners) {
                connections.push(info);
            }
        }
    }
    Ok(SsReply { connections }.to_map())
}

fn parse_socket_line(
    proto: &str,
    line: &str,
    owners: &HashMap<u64, (u64, String)>,
) -> Option<SocketInfo> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let (local_addr, local_port) = parse_hex_endpoint(fields.next()?)?;
    let (remote_addr, remote_port) = parse_hex_endpoint(fields.next()?)?;
    let state_code = usize::from_str_radix(fields.next()?, 16).ok()?;
    let _tx_rx = fields.next()?;
    let _tr_tm = fields.next()?;
    let _retrnsmt = fields.next()?;
    let _uid = fields.next()?;
    let _timeout = fields.next()?;
    let inode: u64 = fields.next()?.parse().ok()?;

    let state = TCP_STATES.get(state_code).copied().unwrap_or("UNKNOWN");
    let (pid, process) = owners.get(&inode).cloned().unwrap_or((0, String::new()));
    Some(SocketInfo {
        proto: proto.to_owned(),
        local_addr,
        local_port: u64::from(local_port),
        remote_addr,
        remote_port: u64::from(remote_port),
        state: state.to_owned(),
        pid,
        process,
    })
}

/// Decodes a `/proc/net/*` endpoint such as `0100007F:0539`.
///
/// IPv4 addresses are one hex u32 in kernel byte order; IPv6 addresses are
/// four of them. Ports are plain big-endian hex.
fn parse_hex_endpoint(s: &str) -> Option<(String, u16)> {
    let (addr, port) = s.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let addr = match addr.len() {
        8 => Ipv4Addr::from(u32::from_str_radix(addr, 16).ok()?.swap_bytes()).to_string(),
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(addr.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            Ipv6Addr::from(bytes).to_string()
        }
        _ => return None,
    };
    Some((addr, port))
}

/// Maps socket inodes to their owning `(pid, comm)` by walking `/proc/N/fd`.
/// Unreadable processes are skipped.
fn socket_owners() -> HashMap<u64, (u64, String)> {
    let mut owners = HashMap::new();
    let proc_entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return owners,
    };
    for entry in proc_entries.flatten() {
        let pid: u64 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        let fds = match fs::read_dir(format!("/proc/{pid}/fd")) {
            Ok(fds) => fds,
            Err(_) => continue,
        };
        let comm = fs::read_to_string(format!("/proc/{pid}/comm"))
            .map(|s| s.trim().to_owned())
            .unwrap_or_default();
        for fd in fds.flatten() {
            let target = match fs::read_link(fd.path()) {
                Ok(target) => target,
                Err(_) => continue,
            };
            let target = target.to_string_lossy();
            if let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|t| t.strip_suffix(']'))
                .and_then(|t| t.parse().ok())
            {
                owners.entry(inode).or_insert_with(|| (pid, comm.clone()));
            }
        }
    }
    owners
}

pub(crate) fn dmesg() -> CmdResult {
    const SYSLOG_ACTION_READ_ALL: i32 = 3;
    let mut buf = vec![0u8; 1 << 20];
    let n = unsafe {
        nix::libc::klogctl(SYSLOG_ACTION_READ_ALL, buf.as_mut_ptr().cast(), buf.len() as i32)
    };
    if n < 0 {
        return Err(CommandError::from(io::Error::last_os_error()));
    }
    buf.truncate(n as usize);
    Ok(LogReply { log: buf }.to_map())
}

pub(crate) fn cpuinfo() -> CmdResult {
    let content = fs::read("/proc/cpuinfo").map_err(CommandError::from)?;
    Ok(ContentReply { content }.to_map())
}

pub(crate) fn mtd_table() -> CmdResult {
    let content = fs::read("/proc/mtd").map_err(CommandError::from)?;
    Ok(ContentReply { content }.to_map())
}

pub(crate) fn strings(state: &AgentState, args: &Map) -> CmdResult {
    let path = state.resolve(required(args, "path")?);
    let min_len = match args.get("min_len") {
        Some(Value::Uint(n)) => (*n as usize).max(1),
        _ => 4,
    };

    let mut file = File::open(&path).map_err(|e| CommandError::at(&path, e))?;
    let mut scanner = RunScanner::new(min_len, CAT_MAX as usize);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| CommandError::at(&path, e))?;
        if n == 0 || !scanner.feed(&buf[..n]) {
            break;
        }
    }
    Ok(ContentReply {
        content: scanner.finish(),
    }
    .to_map())
}

/// Accumulates printable runs across chunk boundaries, newline-separating
/// every run of at least `min_len` bytes.
struct RunScanner {
    out: Vec<u8>,
    run: Vec<u8>,
    min_len: usize,
    cap: usize,
}

impl RunScanner {
    fn new(min_len: usize, cap: usize) -> Self {
        RunScanner {
            out: Vec::new(),
            run: Vec::new(),
            min_len,
            cap,
        }
    }

    /// Consumes one chunk; false once the output cap has been reached.
    fn feed(&mut self, chunk: &[u8]) -> bool {
        for &b in chunk {
            if (0x20..=0x7e).contains(&b) || b == b'\t' {
                self.run.push(b);
            } else {
                self.flush();
                if self.out.len() >= self.cap {
                    return false;
                }
            }
        }
        true
    }

    fn flush(&mut self) {
        if self.run.len() >= self.min_len {
            self.out.extend_from_slice(&self.run);
            self.out.push(b'\n');
        }
        self.run.clear();
    }

    fn finish(mut self) -> Vec<u8> {
        self.flush();
        self.out.truncate(self.cap);
        self.out
    }
}

pub(crate) fn ip_addr() -> CmdResult {
    let addrs = getifaddrs().map_err(CommandError::from)?;

    let mut interfaces: BTreeMap<String, (InterfaceFlags, Vec<String>)> = BTreeMap::new();
    for ifaddr in addrs {
        let entry = interfaces
            .entry(ifaddr.interface_name.clone())
            .or_insert_with(|| (ifaddr.flags, Vec::new()));
        entry.0 = ifaddr.flags;

        let addr = match ifaddr.address {
            Some(addr) => addr,
            None => continue,
        };
        if let Some(link) = addr.as_link_addr() {
            if let Some(mac) = link.addr() {
                let mac = mac
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":");
                entry.1.push(format!("link/ether {mac}"));
            }
        } else if let Some(sin) = addr.as_sockaddr_in() {
            let ip = Ipv4Addr::from(sin.ip());
            let prefix = ifaddr
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|m| u32::from(Ipv4Addr::from(m.ip())).count_ones())
                .unwrap_or(0);
            entry.1.push(format!("inet {ip}/{prefix}"));
        } else if let Some(sin6) = addr.as_sockaddr_in6() {
            let ip = Ipv6Addr::from(sin6.ip());
            let prefix = ifaddr
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in6())
                .map(|m| u128::from(Ipv6Addr::from(m.ip())).count_ones())
                .unwrap_or(0);
            entry.1.push(format!("inet6 {ip}/{prefix}"));
        }
    }

    let mut out = String::new();
    for (name, (flags, lines)) in interfaces {
        out.push_str(&name);
        out.push_str(if flags.contains(InterfaceFlags::IFF_UP) {
            ": UP"
        } else {
            ": DOWN"
        });
        if flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            out.push_str(" LOOPBACK");
        }
        if flags.contains(InterfaceFlags::IFF_RUNNING) {
            out.push_str(" RUNNING");
        }
        out.push('\n');
        for line in lines {
            out.push_str("    ");
            out.push_str(&line);
            out.push('\n');
        }
    }
    Ok(ContentReply {
        content: out.into_bytes(),
    }
    .to_map())
}

pub(crate) fn ip_route() -> CmdResult {
    let table = fs::read_to_string("/proc/net/route").map_err(CommandError::from)?;
    Ok(ContentReply {
        content: format_routes(&table).into_bytes(),
    }
    .to_map())
}

/// Renders `/proc/net/route` as `ip route`-style lines.
fn format_routes(table: &str) -> String {
    let mut out = String::new();
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let (iface, dest, gateway, mask) = (fields[0], fields[1], fields[2], fields[7]);
        let (dest, gateway, mask) = match (
            hex_le_ipv4(dest),
            hex_le_ipv4(gateway),
            hex_le_ipv4(mask),
        ) {
            (Some(d), Some(g), Some(m)) => (d, g, m),
            _ => continue,
        };
        let prefix = u32::from(mask).count_ones();

        if dest.is_unspecified() && prefix == 0 {
            out.push_str(&format!("default via {gateway} dev {iface}\n"));
        } else {
            out.push_str(&format!("{dest}/{prefix} dev {iface}"));
            if !gateway.is_unspecified() {
                out.push_str(&format!(" via {gateway}"));
            }
            out.push('\n');
        }
    }
    out
}

fn hex_le_ipv4(s: &str) -> Option<Ipv4Addr> {
    Some(Ipv4Addr::from(u32::from_str_radix(s, 16).ok()?.swap_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stat_lines_parse_including_weird_comms() {
        let (name, state, ppid) =
            parse_stat("1234 (edb-agent) S 1 1234 1234 0 -1 4194560 176 0").unwrap();
        assert_eq!(name, "edb-agent");
        assert_eq!(state, "S");
        assert_eq!(ppid, 1);

        // A comm containing spaces and a closing paren.
        let (name, state, ppid) =
            parse_stat("77 (tmux: server (x)) R 76 77 77 0 -1 0 0").unwrap();
        assert_eq!(name, "tmux: server (x)");
        assert_eq!(state, "R");
        assert_eq!(ppid, 76);

        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn cmdlines_join_nul_separated_arguments() {
        assert_eq!(cmdline_to_string(b"/sbin/init\0splash\0"), "/sbin/init splash");
        assert_eq!(cmdline_to_string(b""), "");
        assert_eq!(cmdline_to_string(b"kthreadd\0"), "kthreadd");
    }

    #[test]
    fn hex_endpoints_decode() {
        let (addr, port) = parse_hex_endpoint("0100007F:0539").unwrap();
        assert_eq!(addr, "127.0.0.1");
        assert_eq!(port, 1337);

        let (addr, port) = parse_hex_endpoint("00000000:0000").unwrap();
        assert_eq!(addr, "0.0.0.0");
        assert_eq!(port, 0);

        let (addr, port) =
            parse_hex_endpoint("00000000000000000000000001000000:0016").unwrap();
        assert_eq!(addr, "::1");
        assert_eq!(port, 22);

        assert!(parse_hex_endpoint("nonsense").is_none());
    }

    #[test]
    fn socket_lines_parse_with_and_without_owners() {
        let mut owners = HashMap::new();
        owners.insert(9999u64, (42u64, "edb-agent".to_owned()));

        let line = "   0: 00000000:0539 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 9999 1 0000000000000000 100 0 0 10 0";
        let info = parse_socket_line("tcp", line, &owners).unwrap();
        assert_eq!(info.proto, "tcp");
        assert_eq!(info.local_port, 1337);
        assert_eq!(info.state, "LISTEN");
        assert_eq!(info.pid, 42);
        assert_eq!(info.process, "edb-agent");

        let line = "   1: 0100007F:1538 0200007F:0050 01 00000000:00000000 00:00000000 00000000  1000        0 1234 1";
        let info = parse_socket_line("tcp", line, &HashMap::new()).unwrap();
        assert_eq!(info.local_addr, "127.0.0.1");
        assert_eq!(info.remote_addr, "127.0.0.2");
        assert_eq!(info.remote_port, 80);
        assert_eq!(info.state, "ESTABLISHED");
        assert_eq!(info.pid, 0);

        assert!(parse_socket_line("tcp", "sl local rem", &HashMap::new()).is_none());
    }

    #[test]
    fn run_scanner_finds_runs_across_chunk_boundaries() {
        let mut scanner = RunScanner::new(4, 1 << 20);
        assert!(scanner.feed(b"\x00\x01hel"));
        assert!(scanner.feed(b"lo world\xff\x02hi\x00four"));
        assert_eq!(scanner.finish(), b"hello world\nfour\n".to_vec());
    }

    #[test]
    fn run_scanner_respects_min_len_and_cap() {
        let mut scanner = RunScanner::new(3, 1 << 20);
        scanner.feed(b"ab\x00abc\x00ab\x00abcd\x00");
        assert_eq!(scanner.finish(), b"abc\nabcd\n".to_vec());

        let mut scanner = RunScanner::new(1, 4);
        scanner.feed(b"aaaa\x00bbbb\x00cccc\x00");
        let out = scanner.finish();
        assert!(out.len() <= 4, "cap exceeded: {}", out.len());
    }

    #[test]
    fn routes_format_like_ip_route() {
        let table = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
                     eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0\n\
                     eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0\n\
                     bad line\n";
        let out = format_routes(table);
        assert_eq!(
            out,
            "default via 192.168.1.1 dev eth0\n192.168.1.0/24 dev eth0\n"
        );
    }
}
