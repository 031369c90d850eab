// Runs the `bytevalve` binary and checks exit statuses and user-facing output.

use std::fs;
use std::net::{TcpListener, UdpSocket};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn free_tcp_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Command for the binary with ports pinned and no stray `.env` or log filter
fn bytevalve(workdir: &Path, transfer_port: u16, discovery_port: u16) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_bytevalve"));
    cmd.current_dir(workdir)
        .env_remove("RUST_LOG")
        .env("BYTEVALVE_TRANSFER_PORT", transfer_port.to_string())
        .env("BYTEVALVE_DISCOVERY_PORT", discovery_port.to_string());
    cmd
}

/// Wait for `child` to exit, killing it if it outlives `limit`
fn wait_or_kill(mut child: Child, limit: Duration) -> Output {
    let deadline = Instant::now() + limit;
    while child.try_wait().unwrap().is_none() {
        if Instant::now() > deadline {
            let _ = child.kill();
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    child.wait_with_output().unwrap()
}

#[test]
fn test_receive_and_send_exit_zero() {
    let workdir = tempdir().unwrap();
    let src_dir = tempdir().unwrap();
    let dst_dir = tempdir().unwrap();
    let source = src_dir.path().join("report.txt");
    fs::write(&source, b"hello world").unwrap();

    let (tcp, udp) = (free_tcp_port(), free_udp_port());
    let server = bytevalve(workdir.path(), tcp, udp)
        .arg("-r")
        .arg(dst_dir.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    // The receiver needs a moment to bind; refused attempts exit non-zero
    let mut sent = None;
    for _ in 0..50 {
        let output = bytevalve(workdir.path(), tcp, udp)
            .arg("-s")
            .arg("127.0.0.1")
            .arg(&source)
            .output()
            .unwrap();
        if output.status.success() {
            sent = Some(output);
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let received = wait_or_kill(server, Duration::from_secs(10));
    let sent = sent.expect("sender never succeeded");

    assert!(
        received.status.success(),
        "receiver failed: {}",
        String::from_utf8_lossy(&received.stderr)
    );
    assert!(String::from_utf8_lossy(&sent.stdout).contains("report.txt successfully sent"));
    assert!(String::from_utf8_lossy(&received.stdout).contains("report.txt successfully received"));
    assert_eq!(fs::read(dst_dir.path().join("report.txt")).unwrap(), b"hello world");
}

#[test]
fn test_send_without_listener_exits_nonzero() {
    let workdir = tempdir().unwrap();
    let source = workdir.path().join("report.txt");
    fs::write(&source, b"hello world").unwrap();

    let output = bytevalve(workdir.path(), free_tcp_port(), free_udp_port())
        .arg("-s")
        .arg("127.0.0.1")
        .arg(&source)
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("ConnectionError"));
}

#[test]
fn test_no_arguments_exits_nonzero() {
    let workdir = tempdir().unwrap();
    let output = bytevalve(workdir.path(), free_tcp_port(), free_udp_port())
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(!output.stderr.is_empty());
}

#[test]
fn test_send_with_missing_path_exits_nonzero() {
    let workdir = tempdir().unwrap();
    let output = bytevalve(workdir.path(), free_tcp_port(), free_udp_port())
        .args(["-s", "127.0.0.1"])
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn test_conflicting_modes_exit_nonzero() {
    let workdir = tempdir().unwrap();
    let output = bytevalve(workdir.path(), free_tcp_port(), free_udp_port())
        .args(["-w", "-l"])
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn test_whoami_and_version_exit_zero() {
    let workdir = tempdir().unwrap();

    let whoami = bytevalve(workdir.path(), free_tcp_port(), free_udp_port())
        .arg("-w")
        .output()
        .unwrap();
    assert!(whoami.status.success());
    assert!(!String::from_utf8_lossy(&whoami.stdout).trim().is_empty());

    let version = bytevalve(workdir.path(), free_tcp_port(), free_udp_port())
        .arg("-v")
        .output()
        .unwrap();
    assert!(version.status.success());
    assert!(String::from_utf8_lossy(&version.stdout).contains(env!("CARGO_PKG_VERSION")));
}
