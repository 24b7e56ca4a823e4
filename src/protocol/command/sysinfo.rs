//! Payload types for the system-introspection commands.

use crate::protocol::wire::{Map, Value};
use crate::protocol::ProtocolError;

use super::ReplyBody;

/// Reply to `uname`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnameReply {
    /// Kernel name.
    pub sysname: String,
    /// Network node name.
    pub nodename: String,
    /// Kernel release.
    pub release: String,
    /// Kernel version string.
    pub version: String,
    /// Hardware identifier.
    pub machine: String,
}

impl ReplyBody for UnameReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert("sysname", self.sysname.as_str());
        m.insert("nodename", self.nodename.as_str());
        m.insert("release", self.release.as_str());
        m.insert("version", self.version.as_str());
        m.insert("machine", self.machine.as_str());
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        Ok(UnameReply {
            sysname: map.text("sysname").to_owned(),
            nodename: map.text("nodename").to_owned(),
            release: map.text("release").to_owned(),
            version: map.text("version").to_owned(),
            machine: map.text("machine").to_owned(),
        })
    }
}

/// Reply to `whoami`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhoamiReply {
    /// User name, or the numeric uid when no name could be resolved.
    pub user: String,
    /// Real user id.
    pub uid: u64,
    /// Real group id.
    pub gid: u64,
}

impl ReplyBody for WhoamiReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert("user", self.user.as_str());
        m.insert("uid", self.uid);
        m.insert("gid", self.gid);
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        Ok(WhoamiReply {
            user: map.text("user").to_owned(),
            uid: map.uint("uid"),
            gid: map.uint("gid"),
        })
    }
}

/// One process of a `ps` listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process id.
    pub pid: u64,
    /// Parent process id.
    pub ppid: u64,
    /// Executable name (comm).
    pub name: String,
    /// Single-character state code from the kernel.
    pub state: String,
    /// Full command line, arguments separated by spaces.
    pub cmdline: String,
}

impl ProcessInfo {
    fn to_value(&self) -> Value {
        let mut m = Map::new();
        m.insert("pid", self.pid);
        m.insert("ppid", self.ppid);
        m.insert("name", self.name.as_str());
        m.insert("state", self.state.as_str());
        m.insert("cmdline", self.cmdline.as_str());
        Value::Map(m)
    }

    fn from_value(v: &Value) -> Result<ProcessInfo, ProtocolError> {
        let m = match v {
            Value::Map(m) => m,
            _ => {
                return Err(ProtocolError::MalformedMessage(
                    "process entry is not a map".into(),
                ))
            }
        };
        Ok(ProcessInfo {
            pid: m.uint("pid"),
            ppid: m.uint("ppid"),
            name: m.text("name").to_owned(),
            state: m.text("state").to_owned(),
            cmdline: m.text("cmdline").to_owned(),
        })
    }
}

/// Reply to `ps`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PsReply {
    /// Every visible process.
    pub processes: Vec<ProcessInfo>,
}

impl ReplyBody for PsReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert(
            "processes",
            self.processes
                .iter()
                .map(ProcessInfo::to_value)
                .collect::<Vec<_>>(),
        );
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        let processes = map
            .array("processes")
            .iter()
            .map(ProcessInfo::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PsReply { processes })
    }
}

/// One connection of an `ss` listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketInfo {
    /// Protocol: `tcp`, `tcp6`, `udp` or `udp6`.
    pub proto: String,
    /// Local address, textual.
    pub local_addr: String,
    /// Local port.
    pub local_port: u64,
    /// Remote address, textual.
    pub remote_addr: String,
    /// Remote port.
    pub remote_port: u64,
    /// Connection state name.
    pub state: String,
    /// Owning process id, zero when unknown.
    pub pid: u64,
    /// Owning process name, empty when unknown.
    pub process: String,
}

impl SocketInfo {
    fn to_value(&self) -> Value {
        let mut m = Map::new();
        m.insert("proto", self.proto.as_str());
        m.insert("local_addr", self.local_addr.as_str());
        m.insert("local_port", self.local_port);
        m.insert("remote_addr", self.remote_addr.as_str());
        m.insert("remote_port", self.remote_port);
        m.insert("state", self.state.as_str());
        m.insert("pid", self.pid);
        m.insert("process", self.process.as_str());
        Value::Map(m)
    }

    fn from_value(v: &Value) -> Result<SocketInfo, ProtocolError> {
        let m = match v {
            Value::Map(m) => m,
            _ => {
                return Err(ProtocolError::MalformedMessage(
                    "connection entry is not a map".into(),
                ))
            }
        };
        Ok(SocketInfo {
            proto: m.text("proto").to_owned(),
            local_addr: m.text("local_addr").to_owned(),
            local_port: m.uint("local_port"),
            remote_addr: m.text("remote_addr").to_owned(),
            remote_port: m.uint("remote_port"),
            state: m.text("state").to_owned(),
            pid: m.uint("pid"),
            process: m.text("process").to_owned(),
        })
    }
}

/// Reply to `ss`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SsReply {
    /// Every known socket.
    pub connections: Vec<SocketInfo>,
}

impl ReplyBody for SsReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert(
            "connections",
            self.connections
                .iter()
                .map(SocketInfo::to_value)
                .collect::<Vec<_>>(),
        );
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        let connections = map
            .array("connections")
            .iter()
            .map(SocketInfo::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SsReply { connections })
    }
}

/// Reply to `dmesg`: the kernel log as one blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogReply {
    /// Raw log bytes.
    pub log: Vec<u8>,
}

impl ReplyBody for LogReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert("log", self.log.clone());
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        Ok(LogReply {
            log: map.bin("log").to_vec(),
        })
    }
}

/// Reply to `cpuinfo`, `mtd`, `strings`, `ip_addr` and `ip_route`: a single
/// pre-formatted text blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentReply {
    /// Raw content bytes.
    pub content: Vec<u8>,
}

impl ReplyBody for ContentReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert("content", self.content.clone());
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        Ok(ContentReply {
            content: map.bin("content").to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ps_reply_roundtrip() {
        let reply = PsReply {
            processes: vec![ProcessInfo {
                pid: 1,
                ppid: 0,
                name: "init".into(),
                state: "S".into(),
                cmdline: "/sbin/init splash".into(),
            }],
        };
        assert_eq!(PsReply::from_map(&reply.to_map()).unwrap(), reply);
    }

    #[test]
    fn ss_reply_roundtrip() {
        let reply = SsReply {
            connections: vec![SocketInfo {
                proto: "tcp".into(),
                local_addr: "0.0.0.0".into(),
                local_port: 1337,
                remote_addr: "0.0.0.0".into(),
                remote_port: 0,
                state: "LISTEN".into(),
                pid: 42,
                process: "edb-agent".into(),
            }],
        };
        assert_eq!(SsReply::from_map(&reply.to_map()).unwrap(), reply);
    }
}
