//! Process-level tests: handshake on stdout, exit codes, KV round trip.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use plugrt::plugin::proto::grpc_controller_client::GrpcControllerClient;
use plugrt::plugin::proto::grpc_stdio_client::GrpcStdioClient;
use plugrt::plugin::proto::Empty as PluginEmpty;
use plugrt::plugin::{Handshake, LogRecord, Network, Protocol};
use plugrt_kv::proto::kv_client::KvClient;
use plugrt_kv::proto::{GetRequest, PutRequest};
use plugrt_kv::{MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};
use tonic::transport::Channel;

fn plugin(data_dir: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_kv-plugin"));
    cmd.env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
        .env_remove("PLUGIN_MIN_PORT")
        .env_remove("PLUGIN_MAX_PORT")
        .env_remove("PLUGIN_ADDRESS")
        .env_remove("PLUGIN_PROTOCOL_VERSIONS")
        .env_remove("RUST_LOG")
        .arg("--data-dir")
        .arg(data_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn read_handshake(child: &mut Child) -> Handshake {
    let stdout = child.stdout.take().unwrap();
    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).unwrap();
    line.parse().unwrap()
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::process::ExitStatus {
    let start = std::time::Instant::now();
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            panic!("plugin did not exit within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[tokio::test]
async fn test_serves_kv_and_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = plugin(dir.path()).spawn().unwrap();

    let handshake = read_handshake(&mut child);
    assert_eq!(handshake.core_version, 1);
    assert_eq!(handshake.app_version, 1);
    assert_eq!(handshake.network, Network::Tcp);
    assert_eq!(handshake.protocol, Protocol::Grpc);

    let channel = Channel::from_shared(format!("http://{}", handshake.address))
        .unwrap()
        .connect()
        .await
        .unwrap();

    let mut kv = KvClient::new(channel.clone());
    kv.put(PutRequest {
        key: "greeting".to_string(),
        value: b"hi".to_vec(),
    })
    .await
    .unwrap();
    let value = kv
        .get(GetRequest {
            key: "greeting".to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .value;
    assert!(value.starts_with(b"hi\n\nWritten from plugin-rust"));

    // The put was logged and is waiting on the stdio stream
    let mut stdio = GrpcStdioClient::new(channel.clone());
    let mut stream = stdio.stream_stdio(PluginEmpty {}).await.unwrap().into_inner();
    let mut found = false;
    while !found {
        let frame = tokio::time::timeout(Duration::from_secs(2), stream.message())
            .await
            .expect("log frame should arrive")
            .unwrap()
            .unwrap();
        let record: LogRecord = serde_json::from_slice(&frame.data).unwrap();
        found = record.message == "Stored value";
    }
    drop(stream);

    let mut controller = GrpcControllerClient::new(channel);
    controller.shutdown(PluginEmpty {}).await.unwrap();

    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert!(status.success());
}

#[test]
fn test_bind_failure_exits_nonzero_without_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    let output = plugin(dir.path())
        .arg("--address")
        .arg(addr.to_string())
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty(), "no handshake on bind failure");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to bind"));
}

#[test]
fn test_refuses_to_run_without_cookie() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = plugin(dir.path())
        .env_remove(MAGIC_COOKIE_KEY)
        .spawn()
        .unwrap();

    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert_eq!(status.code(), Some(1));

    let mut stdout = String::new();
    child
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut stdout)
        .unwrap();
    assert!(stdout.is_empty());

    let mut stderr = String::new();
    child
        .stderr
        .take()
        .unwrap()
        .read_to_string(&mut stderr)
        .unwrap();
    assert!(stderr.contains("This binary is a plugin"));
}

#[test]
fn test_announces_own_version_when_host_offers_more() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = plugin(dir.path())
        .env("PLUGIN_PROTOCOL_VERSIONS", "1,2")
        .spawn()
        .unwrap();

    let handshake = read_handshake(&mut child);
    // The kv plugin only speaks version 1
    assert_eq!(handshake.app_version, 1);

    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn test_min_port_without_max_port_fails_before_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let output = plugin(dir.path())
        .env("PLUGIN_MIN_PORT", "9000")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("PLUGIN_MIN_PORT value of 9000"));
}

#[cfg(unix)]
#[test]
fn test_sigterm_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = plugin(dir.path()).spawn().unwrap();
    let handshake = read_handshake(&mut child);
    assert_eq!(handshake.protocol, Protocol::Grpc);

    let killed = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .status()
        .unwrap();
    assert!(killed.success());

    let status = wait_with_timeout(&mut child, Duration::from_secs(10));
    assert!(status.success(), "graceful shutdown should exit 0: {:?}", status);
}
