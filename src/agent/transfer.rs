//! Handlers for the streaming transfer commands.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use log::{debug, warn};

use crate::protocol::{
    Data, ProtocolError, PullHeader, ReplyBody, Request, Response, CHUNK_SIZE,
};
use crate::session::Session;

use super::{fs::set_mode, mtd, required, AgentState, CommandError};

/// How far an incoming stream may run past its advertised size before the
/// agent declares a protocol failure.
const OVERRUN_SLACK: u64 = CHUNK_SIZE as u64;

/// `pull`: answer with `{size, mode}`, then stream the file.
///
/// A preparation failure is an ordinary error response. Once the stream has
/// started there is no in-band recovery; a read failure tears the session
/// down and the client sees a truncated transfer.
pub(crate) fn pull<S: Read + Write>(
    session: &mut Session<S>,
    state: &AgentState,
    req: &Request,
) -> Result<(), ProtocolError> {
    let (mut file, size, mode) = match prepare_pull(state, req) {
        Ok(prepared) => prepared,
        Err(e) => return session.send_response(Response::failure(req.id, e.to_string())),
    };

    session.send_response(Response::success(req.id, PullHeader { size, mode }.to_map()))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    let mut seq: u32 = 0;
    loop {
        let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
        let n = if want == 0 {
            0
        } else {
            file.read(&mut buf[..want]).map_err(ProtocolError::Io)?
        };
        // EOF before the advertised size still terminates the stream; the
        // receiver detects the truncation from the byte count.
        let done = sent + n as u64 >= size || n == 0;
        session.send_data(Data {
            id: req.id,
            seq,
            chunk: buf[..n].to_vec(),
            done,
        })?;
        sent += n as u64;
        seq += 1;
        if done {
            debug!("pull {}: streamed {sent} of {size} bytes", req.id);
            return Ok(());
        }
    }
}

fn prepare_pull(state: &AgentState, req: &Request) -> Result<(File, u64, u32), CommandError> {
    let path = state.resolve(required(&req.args, "path")?);
    let meta = fs::metadata(&path).map_err(|e| CommandError::at(&path, e))?;
    if meta.is_dir() {
        return Err(CommandError::at(&path, "is a directory"));
    }
    let file = File::open(&path).map_err(|e| CommandError::at(&path, e))?;

    let mut size = meta.len();
    if size == 0 && mtd::is_mtd_path(&path) {
        // MTD character devices stat as empty; ask the device itself.
        size = mtd::device_size(&file, &path)?;
    }

    Ok((file, size, meta.permissions().mode() & 0o7777))
}

/// `push`: open and truncate the target, answer `{}`, then consume the
/// stream.
///
/// A write failure mid-stream cannot be reported in-band: the remaining
/// frames are drained to keep the protocol in sync, and the error is
/// latched so the next request exchange answers with it.
pub(crate) fn push<S: Read + Write>(
    session: &mut Session<S>,
    state: &mut AgentState,
    req: &Request,
) -> Result<(), ProtocolError> {
    let (mut file, size) = match prepare_push(state, req) {
        Ok(prepared) => prepared,
        Err(e) => return session.send_response(Response::failure(req.id, e.to_string())),
    };

    session.send_response(Response::success(req.id, crate::protocol::wire::Map::new()))?;

    let mut received: u64 = 0;
    let mut seq: u32 = 0;
    let mut write_error: Option<String> = None;
    loop {
        let data = session.recv_stream_data(req.id, seq)?;
        received += data.chunk.len() as u64;
        if received > size + OVERRUN_SLACK {
            return Err(ProtocolError::Stream(format!(
                "push stream delivered {received} bytes, advertised {size}"
            )));
        }
        if write_error.is_none() {
            if let Err(e) = file.write_all(&data.chunk) {
                warn!("push {}: write failed: {e}", req.id);
                write_error = Some(e.to_string());
            }
        }
        if data.done {
            break;
        }
        seq += 1;
    }

    if received < size && write_error.is_none() {
        return Err(ProtocolError::Stream(format!(
            "push stream truncated at {received} of {size} bytes"
        )));
    }

    if let Some(e) = write_error {
        state.deferred_error = Some(format!("push: {e}"));
    } else {
        debug!("push {}: received {received} bytes", req.id);
    }
    Ok(())
}

fn prepare_push(state: &AgentState, req: &Request) -> Result<(File, u64), CommandError> {
    let path = state.resolve(required(&req.args, "path")?);
    let size = req.args.uint("size");
    let mode = req
        .args
        .uint32("mode")
        .map_err(|_| CommandError::new("mode exceeds 32 bits"))?
        & 0o7777;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&path)
        .map_err(|e| CommandError::at(&path, e))?;
    // The open-time mode is subject to the umask; make it exact.
    set_mode(&path, mode)?;

    Ok((file, size))
}
