//! The on-target agent: connection handling and command dispatch.
//!
//! In bind mode the agent listens and forks one child per accepted
//! connection; the parent keeps accepting and reaps children from a SIGCHLD
//! handler. In reverse mode the agent dials out and serves exactly one
//! session in the foreground. Either way, a connection is served by
//! [`run_connection`]: handshake, then a strict read-request /
//! write-response loop with no pipelining.
//!
//! Handler failures never tear down the session; they become `ok=false`
//! responses. Only I/O and codec errors are fatal.

mod exec;
mod fs;
mod mtd;
mod sysinfo;
mod transfer;

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use fork::Fork;
use log::{debug, error, info, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::protocol::wire::{Map, Value};
use crate::protocol::{Opcode, ProtocolError, Request, Response};
use crate::session::{Role, Session};

/// A command handler failure, surfaced to the peer as an `ok=false`
/// response. Never fatal to the session.
#[derive(Debug)]
pub(crate) struct CommandError(String);

impl CommandError {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        CommandError(msg.into())
    }

    /// A failure attributed to a path, `"<path>: <cause>"`.
    pub(crate) fn at(path: &Path, cause: impl std::fmt::Display) -> Self {
        CommandError(format!("{}: {cause}", path.display()))
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<io::Error> for CommandError {
    fn from(e: io::Error) -> Self {
        CommandError(e.to_string())
    }
}

impl From<nix::Error> for CommandError {
    fn from(e: nix::Error) -> Self {
        CommandError(e.to_string())
    }
}

impl From<String> for CommandError {
    fn from(msg: String) -> Self {
        CommandError(msg)
    }
}

impl From<&str> for CommandError {
    fn from(msg: &str) -> Self {
        CommandError(msg.to_owned())
    }
}

pub(crate) type CmdResult = std::result::Result<Map, CommandError>;

/// Per-session agent state.
pub(crate) struct AgentState {
    /// The session working directory; always canonical and absolute.
    pub(crate) cwd: PathBuf,
    /// A failure latched during a push stream, reported on the next
    /// request exchange.
    pub(crate) deferred_error: Option<String>,
}

impl AgentState {
    fn new() -> io::Result<Self> {
        Ok(AgentState {
            cwd: std::env::current_dir()?,
            deferred_error: None,
        })
    }

    /// Resolves a request path against the session working directory.
    pub(crate) fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.join(p)
        }
    }
}

/// Extracts a mandatory string argument.
pub(crate) fn required<'a>(args: &'a Map, key: &str) -> Result<&'a str, CommandError> {
    match args.get(key) {
        Some(Value::Str(s)) if !s.is_empty() => Ok(s),
        _ => Err(CommandError::new(format!("missing argument: {key}"))),
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_terminate(_: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn handle_sigchld(_: i32) {
    // Reap everything that has exited; never block.
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}

fn install_signal_handlers() -> io::Result<()> {
    let chld = SigAction::new(
        SigHandler::Handler(handle_sigchld),
        SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    let term = SigAction::new(
        SigHandler::Handler(handle_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGCHLD, &chld).map_err(io::Error::from)?;
        sigaction(Signal::SIGTERM, &term).map_err(io::Error::from)?;
        sigaction(Signal::SIGINT, &term).map_err(io::Error::from)?;
        sigaction(Signal::SIGPIPE, &ignore).map_err(io::Error::from)?;
    }
    Ok(())
}

fn bind_listener(port: u16) -> io::Result<TcpListener> {
    // Dual-stack where the OS permits it; plain IPv4 otherwise.
    match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)) {
        Ok(listener) => Ok(listener),
        Err(e) => {
            debug!("IPv6 bind failed ({e}), falling back to IPv4");
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        }
    }
}

/// Runs the agent in bind mode: listen on `port`, fork one child per
/// accepted connection, until SIGTERM or SIGINT.
pub fn serve(port: u16) -> io::Result<()> {
    install_signal_handlers()?;
    let listener = bind_listener(port)?;
    info!("listening on port {port}");

    while !SHUTDOWN.load(Ordering::SeqCst) {
        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        info!("connection from {peer}");
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {e}");
        }

        match fork::fork() {
            Ok(Fork::Child) => {
                // The child never touches the listener again; release its
                // copy of the fd. No destructors run past process::exit.
                let _ = nix::unistd::close(listener.as_raw_fd());
                let code = match run_connection(stream, false) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("session with {peer} failed: {e}");
                        1
                    }
                };
                std::process::exit(code);
            }
            Ok(Fork::Parent(pid)) => {
                debug!("forked child {pid} for {peer}");
                drop(stream);
            }
            Err(errno) => {
                error!("fork failed (errno {errno}); dropping connection from {peer}");
                drop(stream);
            }
        }
    }

    info!("shutting down");
    Ok(())
}

/// Runs the agent in reverse mode: dial `host:port` and serve one session.
pub fn serve_reverse(host: &str, port: u16) -> io::Result<()> {
    install_signal_handlers()?;
    let stream = TcpStream::connect((host, port))?;
    info!("connected to {host}:{port}");
    stream.set_nodelay(true)?;
    run_connection(stream, true).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// Serves one connection to completion: handshake, then the dispatch loop.
///
/// `is_initiator` is true in reverse mode (the agent dialed and sends the
/// hello) and false in bind mode.
pub fn run_connection<S: Read + Write>(stream: S, is_initiator: bool) -> Result<(), ProtocolError> {
    let mut session = Session::establish(stream, Role::Agent, is_initiator)?;
    let mut state = AgentState::new()?;
    while let Some(req) = session.recv_request()? {
        dispatch(&mut session, &mut state, req)?;
    }
    Ok(())
}

fn dispatch<S: Read + Write>(
    session: &mut Session<S>,
    state: &mut AgentState,
    req: Request,
) -> Result<(), ProtocolError> {
    debug!("request {}: {}", req.id, req.cmd);

    if let Some(error) = state.deferred_error.take() {
        return session.send_response(Response::failure(req.id, error));
    }

    let op = match Opcode::parse(&req.cmd) {
        Some(op) => op,
        None => {
            warn!("unknown command {:?}", req.cmd);
            return session.send_response(Response::failure(req.id, "unknown command"));
        }
    };

    let result = match op {
        Opcode::Pull => return transfer::pull(session, state, &req),
        Opcode::Push => return transfer::push(session, state, &req),
        Opcode::Reboot => return exec::reboot(session, req.id),
        Opcode::Ls => fs::ls(state, &req.args),
        Opcode::Pwd => fs::pwd(state),
        Opcode::Cd => fs::cd(state, &req.args),
        Opcode::Realpath => fs::realpath(state, &req.args),
        Opcode::Cat => fs::cat(state, &req.args),
        Opcode::Rm => fs::rm(state, &req.args),
        Opcode::Mv => fs::mv(state, &req.args),
        Opcode::Cp => fs::cp(state, &req.args),
        Opcode::Mkdir => fs::mkdir(state, &req.args),
        Opcode::Chmod => fs::chmod(state, &req.args),
        Opcode::Uname => sysinfo::uname(),
        Opcode::Whoami => sysinfo::whoami(),
        Opcode::Ps => sysinfo::ps(),
        Opcode::Ss => sysinfo::ss(),
        Opcode::Dmesg => sysinfo::dmesg(),
        Opcode::Cpuinfo => sysinfo::cpuinfo(),
        Opcode::Mtd => sysinfo::mtd_table(),
        Opcode::Strings => sysinfo::strings(state, &req.args),
        Opcode::IpAddr => sysinfo::ip_addr(),
        Opcode::IpRoute => sysinfo::ip_route(),
        Opcode::Exec => exec::exec(&req.args),
        Opcode::KillAgent => exec::kill_agent(),
    };

    let resp = match result {
        Ok(data) => Response::success(req.id, data),
        Err(e) => {
            debug!("{op} failed: {e}");
            Response::failure(req.id, e.to_string())
        }
    };
    session.send_response(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_joins_relative_paths_against_cwd() {
        let state = AgentState {
            cwd: PathBuf::from("/opt/fw"),
            deferred_error: None,
        };
        assert_eq!(state.resolve("boot.bin"), PathBuf::from("/opt/fw/boot.bin"));
        assert_eq!(state.resolve("../etc"), PathBuf::from("/opt/fw/../etc"));
        assert_eq!(state.resolve("/etc/fstab"), PathBuf::from("/etc/fstab"));
    }

    #[test]
    fn required_rejects_missing_and_mistyped_arguments() {
        let mut args = Map::new();
        args.insert("path", "/tmp");
        args.insert("count", 3u64);
        assert_eq!(required(&args, "path").unwrap(), "/tmp");
        assert!(required(&args, "missing").is_err());
        assert!(required(&args, "count").is_err());
    }
}
