//! Handlers for the control commands: exec, reboot, kill-agent.

use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::getppid;

use crate::protocol::wire::Map;
use crate::protocol::{
    ExecReply, KillAgentReply, ProtocolError, RebootReply, ReplyBody, Response,
};
use crate::session::Session;

use super::{required, CmdResult, CommandError};

/// `exec`: split on whitespace into an argv and run it directly, no shell.
pub(crate) fn exec(args: &Map) -> CmdResult {
    let command = required(args, "command")?;
    let mut argv = command.split_whitespace();
    let program = argv.next().ok_or_else(|| CommandError::new("empty command"))?;

    let output = Command::new(program)
        .args(argv)
        .output()
        .map_err(|e| CommandError::new(format!("{program}: {e}")))?;

    let exit_code = match output.status.code() {
        Some(code) => code as u64,
        // Terminated by a signal; report it shell-style.
        None => 128 + output.status.signal().unwrap_or(0) as u64,
    };

    Ok(ExecReply {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code,
    }
    .to_map())
}

/// `reboot`: acknowledge first, then sync and invoke the syscall. The
/// response must go out before the machine goes away; if the syscall
/// returns at all, a second, failed response reports why.
pub(crate) fn reboot<S: Read + Write>(
    session: &mut Session<S>,
    id: u32,
) -> Result<(), ProtocolError> {
    session.send_response(Response::success(
        id,
        RebootReply {
            status: "rebooting".to_owned(),
        }
        .to_map(),
    ))?;

    info!("reboot requested");
    nix::unistd::sync();
    if let Err(e) = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT) {
        warn!("reboot syscall failed: {e}");
        session.send_response(Response::failure(id, format!("reboot: {e}")))?;
    }
    Ok(())
}

/// `kill-agent`: SIGTERM the supervisor. In bind mode the handling process
/// is a forked child, so the parent is the accept loop.
pub(crate) fn kill_agent() -> CmdResult {
    let ppid = getppid();
    if ppid.as_raw() <= 1 {
        return Err(CommandError::new("no parent process to kill"));
    }
    kill(ppid, Signal::SIGTERM).map_err(CommandError::from)?;
    info!("sent SIGTERM to parent {ppid}");
    Ok(KillAgentReply {
        killed_pid: ppid.as_raw() as u64,
    }
    .to_map())
}
