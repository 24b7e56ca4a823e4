//! Handlers for the filesystem commands.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use crate::protocol::wire::{Map, Value};
use crate::protocol::{CatReply, DirEntry, EntryKind, LsReply, PathReply, ReplyBody, CHUNK_SIZE};

use super::{required, AgentState, CmdResult, CommandError};

/// Upper bound for `cat` and `strings` payloads, leaving headroom for the
/// rest of the response inside one frame.
pub(crate) const CAT_MAX: u64 = (crate::protocol::MAX_FRAME_LEN - 1024) as u64;

fn entry_kind(file_type: fs::FileType) -> EntryKind {
    if file_type.is_symlink() {
        EntryKind::Link
    } else if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

pub(crate) fn ls(state: &AgentState, args: &Map) -> CmdResult {
    let path = args.text("path");
    let dir = if path.is_empty() {
        state.cwd.clone()
    } else {
        state.resolve(path)
    };

    let mut entries = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|e| CommandError::at(&dir, e))? {
        let entry = entry.map_err(|e| CommandError::at(&dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // Entries that fail to stat still get listed, with zeroed fields.
        let item = match entry.path().symlink_metadata() {
            Ok(meta) => DirEntry {
                name,
                kind: entry_kind(meta.file_type()),
                size: meta.len(),
                mode: meta.permissions().mode() & 0o777,
                mtime: meta.mtime().max(0) as u64,
            },
            Err(_) => DirEntry {
                name,
                kind: EntryKind::Other,
                size: 0,
                mode: 0,
                mtime: 0,
            },
        };
        entries.push(item);
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(LsReply { entries }.to_map())
}

pub(crate) fn pwd(state: &AgentState) -> CmdResult {
    Ok(PathReply {
        path: state.cwd.display().to_string(),
    }
    .to_map())
}

pub(crate) fn cd(state: &mut AgentState, args: &Map) -> CmdResult {
    let path = state.resolve(required(args, "path")?);
    let canonical = fs::canonicalize(&path).map_err(|e| CommandError::at(&path, e))?;
    let meta = fs::metadata(&canonical).map_err(|e| CommandError::at(&canonical, e))?;
    if !meta.is_dir() {
        return Err(CommandError::at(&canonical, "not a directory"));
    }
    state.cwd = canonical;
    Ok(PathReply {
        path: state.cwd.display().to_string(),
    }
    .to_map())
}

pub(crate) fn realpath(state: &AgentState, args: &Map) -> CmdResult {
    let path = state.resolve(required(args, "path")?);
    let canonical = fs::canonicalize(&path).map_err(|e| CommandError::at(&path, e))?;
    Ok(PathReply {
        path: canonical.display().to_string(),
    }
    .to_map())
}

pub(crate) fn cat(state: &AgentState, args: &Map) -> CmdResult {
    let path = state.resolve(required(args, "path")?);
    let mut file = File::open(&path).map_err(|e| CommandError::at(&path, e))?;
    let meta = file.metadata().map_err(|e| CommandError::at(&path, e))?;
    if meta.is_dir() {
        return Err(CommandError::at(&path, "is a directory"));
    }

    let size = meta.len();
    let content = if size > 0 {
        // Size known from stat; read it in one go.
        if size > CAT_MAX {
            return Err(CommandError::new("file too large"));
        }
        let mut buf = Vec::with_capacity(size as usize);
        file.read_to_end(&mut buf)
            .map_err(|e| CommandError::at(&path, e))?;
        buf
    } else {
        // Virtual files stat as empty; read to EOF with the cap enforced.
        let mut buf = Vec::new();
        std::io::Read::by_ref(&mut file)
            .take(CAT_MAX + 1)
            .read_to_end(&mut buf)
            .map_err(|e| CommandError::at(&path, e))?;
        if buf.len() as u64 > CAT_MAX {
            return Err(CommandError::new("file too large"));
        }
        buf
    };

    Ok(CatReply {
        size: content.len() as u64,
        content,
    }
    .to_map())
}

pub(crate) fn rm(state: &AgentState, args: &Map) -> CmdResult {
    let path = state.resolve(required(args, "path")?);
    let meta = fs::symlink_metadata(&path).map_err(|e| CommandError::at(&path, e))?;
    if meta.is_dir() {
        fs::remove_dir(&path).map_err(|e| CommandError::at(&path, e))?;
    } else {
        fs::remove_file(&path).map_err(|e| CommandError::at(&path, e))?;
    }
    Ok(Map::new())
}

pub(crate) fn mv(state: &AgentState, args: &Map) -> CmdResult {
    let src = state.resolve(required(args, "src")?);
    let dst = state.resolve(required(args, "dst")?);
    fs::rename(&src, &dst).map_err(|e| CommandError::at(&src, e))?;
    Ok(Map::new())
}

pub(crate) fn cp(state: &AgentState, args: &Map) -> CmdResult {
    let src = state.resolve(required(args, "src")?);
    let dst = state.resolve(required(args, "dst")?);

    let mut from = File::open(&src).map_err(|e| CommandError::at(&src, e))?;
    let meta = from.metadata().map_err(|e| CommandError::at(&src, e))?;
    if meta.is_dir() {
        return Err(CommandError::at(&src, "is a directory"));
    }
    let mode = meta.permissions().mode() & 0o777;

    let mut to = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&dst)
        .map_err(|e| CommandError::at(&dst, e))?;

    if let Err(e) = copy_chunks(&mut from, &mut to) {
        drop(to);
        let _ = fs::remove_file(&dst);
        return Err(CommandError::at(&dst, e));
    }

    // The open-time mode is subject to the umask; make it exact.
    fs::set_permissions(&dst, fs::Permissions::from_mode(mode))
        .map_err(|e| CommandError::at(&dst, e))?;
    Ok(Map::new())
}

fn copy_chunks(from: &mut File, to: &mut File) -> io::Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = from.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        to.write_all(&buf[..n])?;
    }
}

pub(crate) fn mkdir(state: &AgentState, args: &Map) -> CmdResult {
    let path = state.resolve(required(args, "path")?);
    let mode = match args.get("mode") {
        Some(Value::Uint(m)) => (*m as u32) & 0o7777,
        _ => 0o755,
    };
    fs::DirBuilder::new()
        .mode(mode)
        .create(&path)
        .map_err(|e| CommandError::at(&path, e))?;
    set_mode(&path, mode)?;
    Ok(Map::new())
}

pub(crate) fn chmod(state: &AgentState, args: &Map) -> CmdResult {
    let path = state.resolve(required(args, "path")?);
    let mode = match args.get("mode") {
        Some(Value::Uint(m)) => (*m as u32) & 0o7777,
        _ => return Err(CommandError::new("missing argument: mode")),
    };
    set_mode(&path, mode)?;
    Ok(Map::new())
}

pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<(), CommandError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| CommandError::at(path, e))
}
