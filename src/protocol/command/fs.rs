//! Payload types for the filesystem commands.

use crate::protocol::wire::{Map, Value};
use crate::protocol::ProtocolError;

use super::ReplyBody;

/// The kind of a directory entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Dir,
    /// A symbolic link.
    Link,
    /// Anything else, including entries that failed to stat.
    Other,
}

impl EntryKind {
    /// The wire identifier of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Dir => "dir",
            EntryKind::Link => "link",
            EntryKind::Other => "other",
        }
    }

    fn parse(s: &str) -> EntryKind {
        match s {
            "file" => EntryKind::File,
            "dir" => EntryKind::Dir,
            "link" => EntryKind::Link,
            _ => EntryKind::Other,
        }
    }
}

/// One entry of an `ls` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name, without any directory components.
    pub name: String,
    /// Entry kind; `Other` when the entry could not be stat'ed.
    pub kind: EntryKind,
    /// Size in bytes; zero when stat failed.
    pub size: u64,
    /// Low 9 permission bits; zero when stat failed.
    pub mode: u32,
    /// Modification time, seconds since the epoch; zero when stat failed.
    pub mtime: u64,
}

impl DirEntry {
    fn to_value(&self) -> Value {
        let mut m = Map::new();
        m.insert("name", self.name.as_str());
        m.insert("type", self.kind.as_str());
        m.insert("size", self.size);
        m.insert("mode", self.mode);
        m.insert("mtime", self.mtime);
        Value::Map(m)
    }

    fn from_value(v: &Value) -> Result<DirEntry, ProtocolError> {
        let m = match v {
            Value::Map(m) => m,
            _ => {
                return Err(ProtocolError::MalformedMessage(
                    "directory entry is not a map".into(),
                ))
            }
        };
        Ok(DirEntry {
            name: m.text("name").to_owned(),
            kind: EntryKind::parse(m.text("type")),
            size: m.uint("size"),
            mode: m.uint32("mode")?,
            mtime: m.uint("mtime"),
        })
    }
}

/// Reply to `ls`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LsReply {
    /// The directory's entries, `.` and `..` excluded.
    pub entries: Vec<DirEntry>,
}

impl ReplyBody for LsReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert(
            "entries",
            self.entries.iter().map(DirEntry::to_value).collect::<Vec<_>>(),
        );
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        let entries = map
            .array("entries")
            .iter()
            .map(DirEntry::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LsReply { entries })
    }
}

/// Reply to `pwd`, `cd` and `realpath`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathReply {
    /// A canonical absolute path.
    pub path: String,
}

impl ReplyBody for PathReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert("path", self.path.as_str());
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        Ok(PathReply {
            path: map.text("path").to_owned(),
        })
    }
}

/// Reply to `cat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatReply {
    /// The complete file contents.
    pub content: Vec<u8>,
    /// Number of content bytes.
    pub size: u64,
}

impl ReplyBody for CatReply {
    fn to_map(&self) -> Map {
        let mut m = Map::new();
        m.insert("content", self.content.clone());
        m.insert("size", self.size);
        m
    }

    fn from_map(map: &Map) -> Result<Self, ProtocolError> {
        Ok(CatReply {
            content: map.bin("content").to_vec(),
            size: map.uint("size"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ls_reply_roundtrip() {
        let reply = LsReply {
            entries: vec![
                DirEntry {
                    name: "bin".into(),
                    kind: EntryKind::Dir,
                    size: 4096,
                    mode: 0o755,
                    mtime: 1_700_000_000,
                },
                DirEntry {
                    name: "broken".into(),
                    kind: EntryKind::Other,
                    size: 0,
                    mode: 0,
                    mtime: 0,
                },
            ],
        };
        assert_eq!(LsReply::from_map(&reply.to_map()).unwrap(), reply);
    }

    #[test]
    fn unknown_entry_kind_reads_as_other() {
        let mut m = Map::new();
        m.insert("name", "x");
        m.insert("type", "socket");
        let entry = DirEntry::from_value(&Value::Map(m)).unwrap();
        assert_eq!(entry.kind, EntryKind::Other);
    }
}
