//! End-to-end tests: a real dispatcher on a loopback TCP socket, driven
//! through the client facade. Covers the concrete protocol scenarios and the
//! full filesystem command surface.

use std::fs;
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;

use pretty_assertions::assert_eq;
use rand::RngCore;

use edb::protocol::wire::Map;
use edb::session::{Role, Session};
use edb::{Client, ClientError};

/// Spawns a dispatcher thread for exactly one connection and connects a
/// client to it.
fn connect() -> (Client<TcpStream>, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding loopback listener");
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accepting test connection");
        stream.set_nodelay(true).ok();
        // Bind mode without the fork: serve this one session to completion.
        let _ = edb::agent::run_connection(stream, false);
    });
    let client = Client::connect("127.0.0.1", port).expect("connecting to test agent");
    (client, handle)
}

/// A scratch directory removed on drop.
struct TempDir(PathBuf);

impl TempDir {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!(
            "edb-test-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::create_dir(&path).expect("creating temp dir");
        TempDir(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }

    fn file(&self, name: &str) -> String {
        self.0.join(name).display().to_string()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

fn mode_of(path: &str) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[test_log::test]
fn scenario_pwd_after_handshake() {
    let (mut client, _agent) = connect();
    let path = client.pwd().unwrap();
    assert!(path.starts_with('/'), "pwd not absolute: {path:?}");
}

#[test_log::test]
fn reverse_mode_serves_a_dialing_agent() {
    // The workstation listens; the agent dials out and initiates the
    // handshake.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let _agent = thread::spawn(move || {
        let stream = TcpStream::connect(("127.0.0.1", port)).expect("agent dialing out");
        let _ = edb::agent::run_connection(stream, true);
    });

    let (stream, _) = listener.accept().unwrap();
    let mut client = Client::from_reverse(stream).unwrap();
    assert_eq!(client.peer_version(), 1);
    let path = client.pwd().unwrap();
    assert!(path.starts_with('/'));
}

#[test_log::test]
fn scenario_cd_to_nonexistent_path() {
    let (mut client, _agent) = connect();
    let before = client.pwd().unwrap();

    let err = client.cd("/does/not/exist").unwrap_err();
    match err {
        ClientError::Command(msg) => {
            assert!(
                msg.to_lowercase().contains("no such"),
                "unexpected error text: {msg:?}"
            );
        }
        other => panic!("expected a command failure, got {other:?}"),
    }

    // The failure left the session usable and the cwd untouched.
    assert_eq!(client.pwd().unwrap(), before);
}

#[test_log::test]
fn scenario_pull_a_known_file() {
    let tmp = TempDir::new();
    let path = tmp.file("payload.bin");
    fs::write(&path, vec![0x41u8; 100_000]).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

    let (mut client, _agent) = connect();
    let mut progress = Vec::new();
    let (bytes, mode) = client
        .pull(&path, |done, total| progress.push((done, total)))
        .unwrap();

    assert_eq!(bytes.len(), 100_000);
    assert!(bytes.iter().all(|&b| b == 0x41));
    assert_eq!(mode & 0o777, 0o644);

    // Progress forms a non-decreasing prefix ending exactly at the total.
    assert!(!progress.is_empty());
    assert!(progress.iter().all(|&(_, total)| total == 100_000));
    assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(progress.last().unwrap().0, 100_000);
}

#[test_log::test]
fn scenario_push_then_pull_roundtrip() {
    let tmp = TempDir::new();
    let path = tmp.file("pushed.bin");

    let mut payload = vec![0u8; 200_000];
    rand::thread_rng().fill_bytes(&mut payload);

    let (mut client, _agent) = connect();
    let mut progress = Vec::new();
    client
        .push(&path, &payload, 0o640, |done, total| {
            progress.push((done, total))
        })
        .unwrap();
    assert_eq!(progress.last().unwrap(), &(200_000, 200_000));

    assert_eq!(mode_of(&path), 0o640);
    let (bytes, mode) = client.pull(&path, |_, _| {}).unwrap();
    assert_eq!(bytes, payload);
    assert_eq!(mode & 0o777, 0o640);
}

#[test_log::test]
fn scenario_unknown_command() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let _agent = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let _ = edb::agent::run_connection(stream, false);
    });

    // Raw session access: the typed facade cannot emit unknown opcodes.
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut session = Session::establish(stream, Role::Client, true).unwrap();

    let id = session.send_request("flarp", Map::new()).unwrap();
    let resp = session.recv_response().unwrap();
    assert_eq!(resp.id, id);
    assert!(!resp.ok);
    assert_eq!(resp.error, "unknown command");

    // The session survived; a well-known command still works.
    let id = session.send_request("pwd", Map::new()).unwrap();
    let resp = session.recv_response().unwrap();
    assert_eq!(resp.id, id);
    assert!(resp.ok);
    assert!(resp.data.text("path").starts_with('/'));
}

#[test_log::test]
fn cd_canonicalizes_and_resolves_relative_paths() {
    let tmp = TempDir::new();
    fs::create_dir(tmp.path().join("sub")).unwrap();

    let (mut client, _agent) = connect();
    let canonical = client.cd(&tmp.path().display().to_string()).unwrap();
    assert!(canonical.starts_with('/'));
    assert_eq!(client.pwd().unwrap(), canonical);

    // Relative paths resolve against the session cwd.
    let sub = client.cd("sub").unwrap();
    assert_eq!(sub, format!("{canonical}/sub"));

    // cd to a plain file is refused.
    fs::write(tmp.file("plain"), b"x").unwrap();
    let err = client.cd(&tmp.file("plain")).unwrap_err();
    match err {
        ClientError::Command(msg) => assert!(msg.contains("not a directory"), "{msg:?}"),
        other => panic!("expected a command failure, got {other:?}"),
    }
}

#[test_log::test]
fn empty_files_transfer_in_both_directions() {
    let tmp = TempDir::new();
    let path = tmp.file("empty");

    let (mut client, _agent) = connect();
    client.push(&path, &[], 0o644, |_, _| {}).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), 0);

    let (bytes, _) = client.pull(&path, |_, _| {}).unwrap();
    assert!(bytes.is_empty());
}

#[test_log::test]
fn push_truncates_existing_content() {
    let tmp = TempDir::new();
    let path = tmp.file("truncate.me");
    fs::write(&path, vec![0xffu8; 10_000]).unwrap();

    let (mut client, _agent) = connect();
    client.push(&path, b"short", 0o644, |_, _| {}).unwrap();
    // The next exchange is the barrier: once it completes, the agent has
    // fully drained and written the push stream.
    client.pwd().unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"short");
}

#[test_log::test]
fn push_to_an_unwritable_path_fails_before_streaming() {
    let (mut client, _agent) = connect();
    let err = client
        .push("/no/such/directory/file.bin", b"data", 0o644, |_, _| {})
        .unwrap_err();
    match err {
        ClientError::Command(msg) => {
            assert!(msg.to_lowercase().contains("no such"), "{msg:?}")
        }
        other => panic!("expected a command failure, got {other:?}"),
    }
    // No stream was started; the session is still in lockstep.
    client.pwd().unwrap();
}

#[test_log::test]
fn pull_of_a_directory_fails_cleanly() {
    let tmp = TempDir::new();
    let (mut client, _agent) = connect();

    let err = client
        .pull(&tmp.path().display().to_string(), |_, _| {})
        .unwrap_err();
    match err {
        ClientError::Command(msg) => assert!(msg.contains("is a directory"), "{msg:?}"),
        other => panic!("expected a command failure, got {other:?}"),
    }
    client.pwd().unwrap();
}

#[test_log::test]
fn ls_reports_kinds_sizes_and_modes() {
    let tmp = TempDir::new();
    fs::write(tmp.file("alpha"), b"12345").unwrap();
    fs::set_permissions(tmp.file("alpha"), fs::Permissions::from_mode(0o600)).unwrap();
    fs::create_dir(tmp.path().join("beta")).unwrap();
    std::os::unix::fs::symlink("alpha", tmp.path().join("gamma")).unwrap();

    let (mut client, _agent) = connect();
    let entries = client.ls(Some(&tmp.path().display().to_string())).unwrap();

    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["alpha", "beta", "gamma"]);

    assert_eq!(entries[0].kind.as_str(), "file");
    assert_eq!(entries[0].size, 5);
    assert_eq!(entries[0].mode, 0o600);
    assert!(entries[0].mtime > 0);
    assert_eq!(entries[1].kind.as_str(), "dir");
    assert_eq!(entries[2].kind.as_str(), "link");
}

#[test_log::test]
fn ls_defaults_to_the_session_cwd() {
    let tmp = TempDir::new();
    fs::write(tmp.file("only-file"), b"x").unwrap();

    let (mut client, _agent) = connect();
    client.cd(&tmp.path().display().to_string()).unwrap();
    let entries = client.ls(None).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "only-file");
}

#[test_log::test]
fn cat_returns_content_and_rejects_directories() {
    let tmp = TempDir::new();
    let path = tmp.file("notes.txt");
    fs::write(&path, b"hello from the target\n").unwrap();

    let (mut client, _agent) = connect();
    let reply = client.cat(&path).unwrap();
    assert_eq!(reply.content, b"hello from the target\n");
    assert_eq!(reply.size, reply.content.len() as u64);

    let err = client
        .cat(&tmp.path().display().to_string())
        .unwrap_err();
    match err {
        ClientError::Command(msg) => assert!(msg.contains("is a directory"), "{msg:?}"),
        other => panic!("expected a command failure, got {other:?}"),
    }

    let err = client.cat(&tmp.file("missing")).unwrap_err();
    match err {
        ClientError::Command(msg) => {
            assert!(msg.to_lowercase().contains("no such"), "{msg:?}")
        }
        other => panic!("expected a command failure, got {other:?}"),
    }
}

#[test_log::test]
fn file_mutation_commands() {
    let tmp = TempDir::new();
    let (mut client, _agent) = connect();

    // mkdir honors the explicit mode, and the default.
    let dir = tmp.file("newdir");
    client.mkdir(&dir, Some(0o700)).unwrap();
    assert!(fs::metadata(&dir).unwrap().is_dir());
    assert_eq!(mode_of(&dir), 0o700);

    let default_dir = tmp.file("defaults");
    client.mkdir(&default_dir, None).unwrap();
    assert_eq!(mode_of(&default_dir), 0o755);

    // cp preserves content and permission bits.
    let src = tmp.file("src.bin");
    fs::write(&src, b"copy me").unwrap();
    fs::set_permissions(&src, fs::Permissions::from_mode(0o640)).unwrap();
    let dst = tmp.file("dst.bin");
    client.cp(&src, &dst).unwrap();
    assert_eq!(fs::read(&dst).unwrap(), b"copy me");
    assert_eq!(mode_of(&dst), 0o640);

    // mv renames.
    let moved = tmp.file("moved.bin");
    client.mv(&dst, &moved).unwrap();
    assert!(!Path::new(&dst).exists());
    assert_eq!(fs::read(&moved).unwrap(), b"copy me");

    // chmod applies the low bits.
    client.chmod(&moved, 0o444).unwrap();
    assert_eq!(mode_of(&moved), 0o444);

    // rm removes files and empty directories, and reports failures.
    client.rm(&moved).unwrap();
    assert!(!Path::new(&moved).exists());
    client.rm(&default_dir).unwrap();
    assert!(!Path::new(&default_dir).exists());
    assert!(matches!(
        client.rm(&tmp.file("never-existed")),
        Err(ClientError::Command(_))
    ));

    // rm of a non-empty directory fails; the directory survives.
    fs::write(Path::new(&dir).join("occupant"), b"x").unwrap();
    assert!(matches!(client.rm(&dir), Err(ClientError::Command(_))));
    assert!(Path::new(&dir).exists());
}

#[test_log::test]
fn realpath_canonicalizes() {
    let tmp = TempDir::new();
    fs::write(tmp.file("target"), b"x").unwrap();

    let (mut client, _agent) = connect();
    client.cd(&tmp.path().display().to_string()).unwrap();
    let real = client.realpath("./target").unwrap();
    assert!(real.starts_with('/'));
    assert!(real.ends_with("/target"));

    assert!(matches!(
        client.realpath("missing-entirely"),
        Err(ClientError::Command(_))
    ));
}

#[test_log::test]
fn exec_captures_output_and_exit_codes() {
    let (mut client, _agent) = connect();

    let reply = client.exec("echo hello world").unwrap();
    assert_eq!(reply.stdout, b"hello world\n");
    assert!(reply.stderr.is_empty());
    assert_eq!(reply.exit_code, 0);

    let reply = client.exec("false").unwrap();
    assert_eq!(reply.exit_code, 1);

    // A spawn failure is a command failure, not a session error.
    assert!(matches!(
        client.exec("surely-not-a-real-binary-zzz"),
        Err(ClientError::Command(_))
    ));
    client.pwd().unwrap();
}

#[test_log::test]
fn strings_extracts_printable_runs() {
    let tmp = TempDir::new();
    let path = tmp.file("blob.bin");
    let mut blob = Vec::new();
    blob.extend_from_slice(&[0x00, 0x01, 0x02]);
    blob.extend_from_slice(b"bootloader-v2.1");
    blob.push(0xff);
    blob.extend_from_slice(b"ok");
    blob.push(0x00);
    blob.extend_from_slice(b"serial-console");
    fs::write(&path, &blob).unwrap();

    let (mut client, _agent) = connect();
    let out = client.strings(&path, None).unwrap();
    assert_eq!(out, b"bootloader-v2.1\nserial-console\n");

    // A higher minimum drops the shorter run.
    let out = client.strings(&path, Some(15)).unwrap();
    assert_eq!(out, b"bootloader-v2.1\n");
}

#[test_log::test]
fn introspection_commands_return_plausible_data() {
    let (mut client, _agent) = connect();

    let uname = client.uname().unwrap();
    assert!(!uname.sysname.is_empty());
    assert!(!uname.release.is_empty());
    assert!(!uname.machine.is_empty());

    let whoami = client.whoami().unwrap();
    assert!(!whoami.user.is_empty());

    let processes = client.ps().unwrap();
    assert!(!processes.is_empty());
    assert!(processes.iter().any(|p| p.pid == std::process::id() as u64));

    // The test itself holds a TCP connection, so ss sees at least one socket.
    let connections = client.ss().unwrap();
    assert!(!connections.is_empty());

    let cpuinfo = client.cpuinfo().unwrap();
    assert!(!cpuinfo.is_empty());
}

#[test_log::test]
fn heartbeat_probes_the_session() {
    let (mut client, _agent) = connect();
    assert!(!client.heartbeat_due());
    client.heartbeat().unwrap();
    assert!(client.idle() < edb::client::HEARTBEAT_INTERVAL);
}

#[test_log::test]
fn sessions_survive_many_sequential_commands() {
    let tmp = TempDir::new();
    let (mut client, _agent) = connect();

    for i in 0..50 {
        let path = tmp.file(&format!("file-{i}"));
        let body = vec![i as u8; 1000 + i];
        client.push(&path, &body, 0o644, |_, _| {}).unwrap();
        let (bytes, _) = client.pull(&path, |_, _| {}).unwrap();
        assert_eq!(bytes, body);
        client.rm(&path).unwrap();
    }
}
