//! `edb-agent`: the on-target half of the bridge.
//!
//! Bind mode (`-l PORT`) listens and forks a child per connection; reverse
//! mode (`-c HOST:PORT`) dials out to a waiting workstation. With no
//! arguments the agent listens on the default port.

use clap::error::ErrorKind;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "edb-agent", version, about = "On-target agent for the edb debug bridge")]
struct Args {
    /// Connect out to a workstation (reverse mode).
    #[arg(short = 'c', long = "connect", value_name = "HOST:PORT", conflicts_with = "listen")]
    connect: Option<String>,

    /// Listen for workstation connections (bind mode).
    #[arg(short = 'l', long = "listen", value_name = "PORT")]
    listen: Option<u16>,
}

fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            std::process::exit(0);
        }
        Err(e) => {
            // Usage goes to stderr; bad invocations exit 1.
            let _ = e.print();
            std::process::exit(1);
        }
    }
}

/// Splits `HOST[:PORT]`, accepting bracketed IPv6 literals.
fn split_target(target: &str) -> Result<(String, u16), String> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| format!("invalid target {target:?}"))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map_err(|_| format!("invalid port in {target:?}"))?,
            None if rest.is_empty() => edb::DEFAULT_PORT,
            None => return Err(format!("invalid target {target:?}")),
        };
        return Ok((host.to_owned(), port));
    }
    match target.matches(':').count() {
        0 => Ok((target.to_owned(), edb::DEFAULT_PORT)),
        1 => {
            let (host, port) = target.split_once(':').unwrap_or((target, ""));
            let port = port
                .parse()
                .map_err(|_| format!("invalid port in {target:?}"))?;
            Ok((host.to_owned(), port))
        }
        // A bare IPv6 literal; the whole thing is the host.
        _ => Ok((target.to_owned(), edb::DEFAULT_PORT)),
    }
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let result = match (&args.connect, args.listen) {
        (Some(target), None) => match split_target(target) {
            Ok((host, port)) => edb::agent::serve_reverse(&host, port),
            Err(msg) => {
                eprintln!("edb-agent: {msg}");
                std::process::exit(1);
            }
        },
        (None, Some(port)) => edb::agent::serve(port),
        _ => edb::agent::serve(edb::DEFAULT_PORT),
    };

    if let Err(e) = result {
        eprintln!("edb-agent: {e}");
        std::process::exit(1);
    }
}
