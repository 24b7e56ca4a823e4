//! Payload types for the control commands.

use crate::protocol::wire::Map;
use crate::protocol::ProtocolError;

use super::ReplyBody;

/// Reply to `exec`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecReply {
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// Exit status, or `128 + signal` when the process was killed.
    pub exit_code: u64,
}

impl ReplyBody for ExecReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert("stdout", self.stdout.clone());
        m.insert("stderr", self.stderr.clone());
        m.insert("exit_code", self.exit_code);
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        Ok(ExecReply {
            stdout: map.bin("stdout").to_vec(),
            stderr: map.bin("stderr").to_vec(),
            exit_code: map.uint("exit_code"),
        })
    }
}

/// Reply to `reboot`, sent before the reboot syscall.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebootReply {
    /// Always `"rebooting"`.
    pub status: String,
}

impl ReplyBody for RebootReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert("status", self.status.as_str());
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        Ok(RebootReply {
            status: map.text("status").to_owned(),
        })
    }
}

/// Reply to `kill-agent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillAgentReply {
    /// Pid of the supervisor process that was signalled.
    pub killed_pid: u64,
}

impl ReplyBody for KillAgentReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert("killed_pid", self.killed_pid);
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        Ok(KillAgentReply {
            killed_pid: map.uint("killed_pid"),
        })
    }
}
