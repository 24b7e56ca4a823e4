//! The command contract: the closed opcode set and the typed argument and
//! reply payloads for each command.
//!
//! On the wire, arguments and reply data are generic maps (see
//! [`wire::Map`](super::wire::Map)); this module owns the strongly-typed
//! projections used on both sides. Reply types implement [`ReplyBody`] in
//! both directions: the agent serializes with `to_map`, the client parses
//! with `from_map`. Unknown keys are ignored and missing keys read as zero
//! values, so payloads may grow without breaking older peers.

mod exec;
mod fs;
mod sysinfo;
mod transfer;

pub use exec::{ExecReply, KillAgentReply, RebootReply};
pub use fs::{CatReply, DirEntry, EntryKind, LsReply, PathReply};
pub use sysinfo::{
    ContentReply, LogReply, ProcessInfo, PsReply, SocketInfo, SsReply, UnameReply, WhoamiReply,
};
pub use transfer::{PullHeader, CHUNK_SIZE};

use super::wire::Map;
use super::ProtocolError;

/// The closed set of command opcodes.
///
/// Opcode strings are stable wire identifiers; parsing is a case-sensitive
/// exact match.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Opcode {
    /// List a directory.
    Ls,
    /// Report the session working directory.
    Pwd,
    /// Change the session working directory.
    Cd,
    /// Canonicalize a path.
    Realpath,
    /// Read a (small) file into the response.
    Cat,
    /// Stream a file from the agent.
    Pull,
    /// Stream a file to the agent.
    Push,
    /// Remove a file or empty directory.
    Rm,
    /// Rename within one filesystem.
    Mv,
    /// Copy a file.
    Cp,
    /// Create a directory.
    Mkdir,
    /// Change permission bits.
    Chmod,
    /// Kernel and machine identification.
    Uname,
    /// Current user and ids.
    Whoami,
    /// Process listing.
    Ps,
    /// Socket statistics.
    Ss,
    /// Kernel ring buffer.
    Dmesg,
    /// `/proc/cpuinfo` contents.
    Cpuinfo,
    /// `/proc/mtd` contents.
    Mtd,
    /// Printable runs from a file.
    Strings,
    /// Interface addresses, pre-formatted.
    IpAddr,
    /// Routing table, pre-formatted.
    IpRoute,
    /// Run a program and capture its output.
    Exec,
    /// Reboot the target.
    Reboot,
    /// Terminate the agent's supervisor process.
    KillAgent,
}

impl Opcode {
    /// Every opcode, in wire-name order of the registry.
    pub const ALL: &'static [Opcode] = &[
        Opcode::Ls,
        Opcode::Pwd,
        Opcode::Cd,
        Opcode::Realpath,
        Opcode::Cat,
        Opcode::Pull,
        Opcode::Push,
        Opcode::Rm,
        Opcode::Mv,
        Opcode::Cp,
        Opcode::Mkdir,
        Opcode::Chmod,
        Opcode::Uname,
        Opcode::Whoami,
        Opcode::Ps,
        Opcode::Ss,
        Opcode::Dmesg,
        Opcode::Cpuinfo,
        Opcode::Mtd,
        Opcode::Strings,
        Opcode::IpAddr,
        Opcode::IpRoute,
        Opcode::Exec,
        Opcode::Reboot,
        Opcode::KillAgent,
    ];

    /// The opcode's wire identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::Ls => "ls",
            Opcode::Pwd => "pwd",
            Opcode::Cd => "cd",
            Opcode::Realpath => "realpath",
            Opcode::Cat => "cat",
            Opcode::Pull => "pull",
            Opcode::Push => "push",
            Opcode::Rm => "rm",
            Opcode::Mv => "mv",
            Opcode::Cp => "cp",
            Opcode::Mkdir => "mkdir",
            Opcode::Chmod => "chmod",
            Opcode::Uname => "uname",
            Opcode::Whoami => "whoami",
            Opcode::Ps => "ps",
            Opcode::Ss => "ss",
            Opcode::Dmesg => "dmesg",
            Opcode::Cpuinfo => "cpuinfo",
            Opcode::Mtd => "mtd",
            Opcode::Strings => "strings",
            Opcode::IpAddr => "ip_addr",
            Opcode::IpRoute => "ip_route",
            Opcode::Exec => "exec",
            Opcode::Reboot => "reboot",
            Opcode::KillAgent => "kill-agent",
        }
    }

    /// Parses a wire identifier; `None` for anything outside the closed set.
    pub fn parse(s: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.as_str() == s)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed reply payload, serializable to and from the generic map.
pub trait ReplyBody: Sized {
    /// Serializes into a response data map.
    fn to_map(&self) -> Map;

    /// Parses from a response data map. Unknown keys are ignored; missing
    /// keys read as zero values; only narrowing failures error.
    fn from_map(map: &Map) -> Result<Self, ProtocolError>;
}

/// The empty reply used by side-effect-only commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmptyReply;

impl ReplyBody for EmptyReply {
    fn to_map(&self) -> Map {
        Map::new()
    }

    fn from_map(_map: &Map) -> Result<Self, ProtocolError> {
        Ok(EmptyReply)
    }
}
