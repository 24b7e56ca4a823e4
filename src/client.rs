//! The workstation-side client facade.
//!
//! [`Client`] exposes one strongly-typed method per opcode and owns the
//! session discipline: a single request in flight, responses correlated by
//! id, and streaming transfers fully consumed before the next request.
//! Remote command failures are values ([`ClientError::Command`]), not
//! session errors; the session stays usable after them.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::protocol::wire::Map;
use crate::protocol::{
    CatReply, ContentReply, DirEntry, EmptyReply, ExecReply, KillAgentReply, LogReply, LsReply,
    Opcode, PathReply, ProcessInfo, ProtocolError, PsReply, PullHeader, RebootReply, ReplyBody,
    Response, SocketInfo, SsReply, UnameReply, WhoamiReply,
};
use crate::session::{Role, Session, SessionState};

/// TCP connect timeout applied by [`Client::connect`].
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle interval after which a liveness probe is due.
///
/// Multi-device front-ends call [`Client::heartbeat`] when
/// [`Client::heartbeat_due`] reports true; a heartbeat failure means the
/// device should be marked disconnected and the session torn down.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// An error encountered by a [`Client`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A protocol-level failure; the session is closed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The agent answered `ok=false`. The session remains usable; the
    /// message is the agent's `error` field, verbatim.
    #[error("{0}")]
    Command(String),
    /// A response arrived with an id other than the outstanding request's.
    #[error("response correlation id mismatch: sent {sent}, got {got}")]
    IdMismatch {
        /// Id of the request that was in flight.
        sent: u32,
        /// Id the response carried.
        got: u32,
    },
    /// A connect-phase I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The result of a [`Client`] operation.
pub type Result<T> = std::result::Result<T, ClientError>;

/// A connected client for one target device.
#[derive(Debug)]
pub struct Client<S: Read + Write> {
    session: Session<S>,
    last_activity: Instant,
}

impl Client<TcpStream> {
    /// Dials a bind-mode agent at `host:port` and performs the handshake as
    /// the connection initiator. Each resolved address is tried with a 10 s
    /// timeout.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let addrs: Vec<_> = (host, port).to_socket_addrs()?.collect();
        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no addresses for {host}"),
        );
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    info!("connected to {addr}");
                    stream.set_nodelay(true)?;
                    return Client::from_stream(stream, true);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err.into())
    }

    /// Adopts a connection accepted from a reverse-mode agent. The agent
    /// initiated, so the handshake runs as acceptor.
    pub fn from_reverse(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Client::from_stream(stream, false)
    }

    /// Listens on `port` and adopts the first reverse-mode agent that dials
    /// in. Blocks until a connection arrives.
    pub fn listen_reverse(port: u16) -> Result<Self> {
        let listener = std::net::TcpListener::bind((std::net::Ipv6Addr::UNSPECIFIED, port))
            .or_else(|_| std::net::TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)))?;
        info!("waiting for an agent on port {port}");
        let (stream, peer) = listener.accept()?;
        info!("agent connected from {peer}");
        Client::from_reverse(stream)
    }
}

impl<S: Read + Write> Client<S> {
    /// Builds a client over an arbitrary connected stream.
    pub fn from_stream(stream: S, is_initiator: bool) -> Result<Self> {
        let session = Session::establish(stream, Role::Client, is_initiator)?;
        Ok(Client {
            session,
            last_activity: Instant::now(),
        })
    }

    /// The protocol version the agent advertised.
    pub fn peer_version(&self) -> u64 {
        self.session.peer_version()
    }

    /// True once the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.session.state() == SessionState::Closed
    }

    /// Closes the session. Idempotent.
    pub fn close(&mut self) {
        self.session.close();
    }

    /// Time since the last completed exchange.
    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// True when the session has been idle long enough to warrant a
    /// liveness probe.
    pub fn heartbeat_due(&self) -> bool {
        self.idle() >= HEARTBEAT_INTERVAL
    }

    /// Issues a `pwd` as a liveness probe, discarding the result.
    pub fn heartbeat(&mut self) -> Result<()> {
        debug!("heartbeat");
        self.pwd().map(drop)
    }

    fn roundtrip(&mut self, op: Opcode, args: Map) -> Result<Response> {
        let sent = self.session.send_request(op.as_str(), args)?;
        let resp = self.session.recv_response()?;
        if resp.id != sent {
            self.session.close();
            return Err(ClientError::IdMismatch { sent, got: resp.id });
        }
        self.last_activity = Instant::now();
        Ok(resp)
    }

    fn unary<T: ReplyBody>(&mut self, op: Opcode, args: Map) -> Result<T> {
        let resp = self.roundtrip(op, args)?;
        if !resp.ok {
            return Err(ClientError::Command(resp.error));
        }
        Ok(T::from_map(&resp.data)?)
    }

    fn ack(&mut self, op: Opcode, args: Map) -> Result<()> {
        self.unary::<EmptyReply>(op, args).map(drop)
    }

    /// Lists a directory; `None` lists the session working directory.
    pub fn ls(&mut self, path: Option<&str>) -> Result<Vec<DirEntry>> {
        let mut args = Map::new();
        if let Some(path) = path {
            args.insert("path", path);
        }
        Ok(self.unary::<LsReply>(Opcode::Ls, args)?.entries)
    }

    /// Reports the agent's session working directory.
    pub fn pwd(&mut self) -> Result<String> {
        Ok(self.unary::<PathReply>(Opcode::Pwd, Map::new())?.path)
    }

    /// Changes the agent's session working directory, returning the
    /// canonicalized result.
    pub fn cd(&mut self, path: &str) -> Result<String> {
        let mut args = Map::new();
        args.insert("path", path);
        Ok(self.unary::<PathReply>(Opcode::Cd, args)?.path)
    }

    /// Canonicalizes a path on the agent.
    pub fn realpath(&mut self, path: &str) -> Result<String> {
        let mut args = Map::new();
        args.insert("path", path);
        Ok(self.unary::<PathReply>(Opcode::Realpath, args)?.path)
    }

    /// Reads a small file in one response.
    pub fn cat(&mut self, path: &str) -> Result<CatReply> {
        let mut args = Map::new();
        args.insert("path", path);
        self.unary(Opcode::Cat, args)
    }

    /// Streams a file from the agent, returning its bytes and mode.
    ///
    /// `on_progress` is invoked as `(received, total)` while chunks arrive.
    pub fn pull(
        &mut self,
        path: &str,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<(Vec<u8>, u32)> {
        let mut args = Map::new();
        args.insert("path", path);
        let resp = self.roundtrip(Opcode::Pull, args)?;
        if !resp.ok {
            return Err(ClientError::Command(resp.error));
        }
        // A data stream is already on its way; an unusable header leaves no
        // way back into lockstep.
        let header = match PullHeader::from_map(&resp.data) {
            Ok(header) => header,
            Err(e) => {
                self.session.close();
                return Err(e.into());
            }
        };
        let bytes = self
            .session
            .recv_data_stream(resp.id, header.size, &mut on_progress)?;
        self.last_activity = Instant::now();
        Ok((bytes, header.mode))
    }

    /// Streams `bytes` to a file on the agent, created with `mode`.
    ///
    /// `on_progress` is invoked as `(sent, total)` while chunks go out.
    pub fn push(
        &mut self,
        path: &str,
        bytes: &[u8],
        mode: u32,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<()> {
        let mut args = Map::new();
        args.insert("path", path);
        args.insert("size", bytes.len() as u64);
        args.insert("mode", mode);
        let resp = self.roundtrip(Opcode::Push, args)?;
        if !resp.ok {
            return Err(ClientError::Command(resp.error));
        }
        self.session
            .send_data_stream(resp.id, bytes, &mut on_progress)?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Removes a file, or an empty directory.
    pub fn rm(&mut self, path: &str) -> Result<()> {
        let mut args = Map::new();
        args.insert("path", path);
        self.ack(Opcode::Rm, args)
    }

    /// Renames `src` to `dst` within one filesystem.
    pub fn mv(&mut self, src: &str, dst: &str) -> Result<()> {
        let mut args = Map::new();
        args.insert("src", src);
        args.insert("dst", dst);
        self.ack(Opcode::Mv, args)
    }

    /// Copies `src` to `dst` on the agent, preserving permission bits.
    pub fn cp(&mut self, src: &str, dst: &str) -> Result<()> {
        let mut args = Map::new();
        args.insert("src", src);
        args.insert("dst", dst);
        self.ack(Opcode::Cp, args)
    }

    /// Creates a directory; mode defaults to `0o755`.
    pub fn mkdir(&mut self, path: &str, mode: Option<u32>) -> Result<()> {
        let mut args = Map::new();
        args.insert("path", path);
        if let Some(mode) = mode {
            args.insert("mode", mode);
        }
        self.ack(Opcode::Mkdir, args)
    }

    /// Sets the low permission bits of a path.
    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        let mut args = Map::new();
        args.insert("path", path);
        args.insert("mode", mode);
        self.ack(Opcode::Chmod, args)
    }

    /// Fetches kernel and machine identification.
    pub fn uname(&mut self) -> Result<UnameReply> {
        self.unary(Opcode::Uname, Map::new())
    }

    /// Fetches the agent's user identity.
    pub fn whoami(&mut self) -> Result<WhoamiReply> {
        self.unary(Opcode::Whoami, Map::new())
    }

    /// Fetches the process listing.
    pub fn ps(&mut self) -> Result<Vec<ProcessInfo>> {
        Ok(self.unary::<PsReply>(Opcode::Ps, Map::new())?.processes)
    }

    /// Fetches socket statistics.
    pub fn ss(&mut self) -> Result<Vec<SocketInfo>> {
        Ok(self.unary::<SsReply>(Opcode::Ss, Map::new())?.connections)
    }

    /// Fetches the kernel ring buffer.
    pub fn dmesg(&mut self) -> Result<Vec<u8>> {
        Ok(self.unary::<LogReply>(Opcode::Dmesg, Map::new())?.log)
    }

    /// Fetches `/proc/cpuinfo`.
    pub fn cpuinfo(&mut self) -> Result<Vec<u8>> {
        Ok(self
            .unary::<ContentReply>(Opcode::Cpuinfo, Map::new())?
            .content)
    }

    /// Fetches the MTD partition table.
    pub fn mtd(&mut self) -> Result<Vec<u8>> {
        Ok(self.unary::<ContentReply>(Opcode::Mtd, Map::new())?.content)
    }

    /// Extracts printable runs of at least `min_len` (default 4) bytes from
    /// a file on the agent, newline-separated.
    pub fn strings(&mut self, path: &str, min_len: Option<u64>) -> Result<Vec<u8>> {
        let mut args = Map::new();
        args.insert("path", path);
        if let Some(min_len) = min_len {
            args.insert("min_len", min_len);
        }
        Ok(self.unary::<ContentReply>(Opcode::Strings, args)?.content)
    }

    /// Fetches the interface address listing, pre-formatted.
    pub fn ip_addr(&mut self) -> Result<Vec<u8>> {
        Ok(self
            .unary::<ContentReply>(Opcode::IpAddr, Map::new())?
            .content)
    }

    /// Fetches the routing table, pre-formatted.
    pub fn ip_route(&mut self) -> Result<Vec<u8>> {
        Ok(self
            .unary::<ContentReply>(Opcode::IpRoute, Map::new())?
            .content)
    }

    /// Runs a program on the agent. `command` is split on whitespace into an
    /// argv; no shell is involved.
    pub fn exec(&mut self, command: &str) -> Result<ExecReply> {
        let mut args = Map::new();
        args.insert("command", command);
        self.unary(Opcode::Exec, args)
    }

    /// Asks the target to reboot. On success the returned status is
    /// `"rebooting"` and the connection will drop shortly after.
    pub fn reboot(&mut self) -> Result<String> {
        Ok(self
            .unary::<RebootReply>(Opcode::Reboot, Map::new())?
            .status)
    }

    /// Signals the agent's supervisor process to terminate, returning the
    /// pid that was signalled.
    pub fn kill_agent(&mut self) -> Result<u64> {
        Ok(self
            .unary::<KillAgentReply>(Opcode::KillAgent, Map::new())?
            .killed_pid)
    }
}
