//! `edb`: a one-shot command runner against a bind-mode agent.
//!
//! ```text
//! edb 192.168.1.20 ls /etc
//! edb -p 9000 device pull /dev/mtd0 firmware.bin
//! edb device exec "cat /proc/uptime"
//! ```
//!
//! Failed commands print the agent's error verbatim, prefixed `Error:`.

use std::io::Write;

use anyhow::{bail, Context};
use clap::error::ErrorKind;
use clap::Parser;

use edb::Client;

#[derive(Parser, Debug)]
#[command(name = "edb", version, about = "Workstation client for the edb debug bridge")]
struct Args {
    /// Agent port.
    #[arg(short, long, default_value_t = edb::DEFAULT_PORT)]
    port: u16,

    /// Agent host.
    host: String,

    /// Command to run on the target.
    command: String,

    /// Command arguments.
    args: Vec<String>,
}

fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            std::process::exit(0);
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    }
}

fn main() {
    env_logger::init();
    let args = parse_args();
    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn arg(args: &Args, n: usize, name: &str) -> anyhow::Result<String> {
    args.args
        .get(n)
        .cloned()
        .with_context(|| format!("{} needs {name}", args.command))
}

fn parse_mode(s: &str) -> anyhow::Result<u32> {
    u32::from_str_radix(s, 8).with_context(|| format!("invalid octal mode {s:?}"))
}

fn dump(bytes: &[u8]) -> anyhow::Result<()> {
    std::io::stdout().write_all(bytes)?;
    Ok(())
}

fn progress(done: u64, total: u64) {
    if total > 0 {
        eprint!("\r{done}/{total} bytes");
        if done >= total {
            eprintln!();
        }
    }
}

fn run(args: &Args) -> anyhow::Result<i32> {
    let mut client = Client::connect(&args.host, args.port)?;

    match args.command.as_str() {
        "ls" => {
            let path = args.args.first().map(String::as_str);
            for entry in client.ls(path)? {
                println!(
                    "{:>5} {:04o} {:>10} {}",
                    entry.kind.as_str(),
                    entry.mode,
                    entry.size,
                    entry.name
                );
            }
        }
        "pwd" => println!("{}", client.pwd()?),
        "cd" => println!("{}", client.cd(&arg(args, 0, "a path")?)?),
        "realpath" => println!("{}", client.realpath(&arg(args, 0, "a path")?)?),
        "cat" => {
            let reply = client.cat(&arg(args, 0, "a path")?)?;
            dump(&reply.content)?;
        }
        "pull" => {
            let remote = arg(args, 0, "a remote path")?;
            let local = args.args.get(1).cloned().unwrap_or_else(|| {
                remote.rsplit('/').next().unwrap_or(&remote).to_owned()
            });
            let (bytes, mode) = client.pull(&remote, progress)?;
            std::fs::write(&local, &bytes).with_context(|| format!("writing {local}"))?;
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &local,
                std::fs::Permissions::from_mode(mode & 0o777),
            );
            eprintln!("pulled {} bytes to {local}", bytes.len());
        }
        "push" => {
            let local = arg(args, 0, "a local path")?;
            let remote = arg(args, 1, "a remote path")?;
            let mode = match args.args.get(2) {
                Some(mode) => parse_mode(mode)?,
                None => 0o644,
            };
            let bytes = std::fs::read(&local).with_context(|| format!("reading {local}"))?;
            client.push(&remote, &bytes, mode, progress)?;
            eprintln!("pushed {} bytes to {remote}", bytes.len());
        }
        "rm" => client.rm(&arg(args, 0, "a path")?)?,
        "mv" => client.mv(&arg(args, 0, "a source")?, &arg(args, 1, "a destination")?)?,
        "cp" => client.cp(&arg(args, 0, "a source")?, &arg(args, 1, "a destination")?)?,
        "mkdir" => {
            let path = arg(args, 0, "a path")?;
            let mode = args.args.get(1).map(|m| parse_mode(m)).transpose()?;
            client.mkdir(&path, mode)?;
        }
        "chmod" => {
            let mode = parse_mode(&arg(args, 0, "an octal mode")?)?;
            client.chmod(&arg(args, 1, "a path")?, mode)?;
        }
        "uname" => {
            let u = client.uname()?;
            println!(
                "{} {} {} {} {}",
                u.sysname, u.nodename, u.release, u.version, u.machine
            );
        }
        "whoami" => {
            let w = client.whoami()?;
            println!("{} (uid={}, gid={})", w.user, w.uid, w.gid);
        }
        "ps" => {
            println!("{:>7} {:>7} {:<2} {:<16} CMDLINE", "PID", "PPID", "ST", "NAME");
            for p in client.ps()? {
                println!(
                    "{:>7} {:>7} {:<2} {:<16} {}",
                    p.pid, p.ppid, p.state, p.name, p.cmdline
                );
            }
        }
        "ss" => {
            println!(
                "{:<5} {:<24} {:<24} {:<12} {:>7} PROCESS",
                "PROTO", "LOCAL", "REMOTE", "STATE", "PID"
            );
            for c in client.ss()? {
                println!(
                    "{:<5} {:<24} {:<24} {:<12} {:>7} {}",
                    c.proto,
                    format!("{}:{}", c.local_addr, c.local_port),
                    format!("{}:{}", c.remote_addr, c.remote_port),
                    c.state,
                    c.pid,
                    c.process
                );
            }
        }
        "dmesg" => dump(&client.dmesg()?)?,
        "cpuinfo" => dump(&client.cpuinfo()?)?,
        "mtd" => dump(&client.mtd()?)?,
        "strings" => {
            let path = arg(args, 0, "a path")?;
            let min_len = args
                .args
                .get(1)
                .map(|n| n.parse::<u64>().context("invalid minimum length"))
                .transpose()?;
            dump(&client.strings(&path, min_len)?)?;
        }
        "ip_addr" => dump(&client.ip_addr()?)?,
        "ip_route" => dump(&client.ip_route()?)?,
        "exec" => {
            if args.args.is_empty() {
                bail!("exec needs a command");
            }
            let reply = client.exec(&args.args.join(" "))?;
            std::io::stdout().write_all(&reply.stdout)?;
            std::io::stderr().write_all(&reply.stderr)?;
            return Ok(reply.exit_code.min(255) as i32);
        }
        "reboot" => println!("{}", client.reboot()?),
        "kill-agent" => println!("killed pid {}", client.kill_agent()?),
        other => bail!("unknown command {other:?}"),
    }

    Ok(0)
}
