// Integration tests against a real snapshotd started in a temp directory

mod helpers;

use helpers::daemon_guard::DaemonGuard;
use helpers::polling::wait_for_exec;
use snapshotter_lib::snapshot::{
    capture::CaptureAgent,
    config::CaptureSettings,
    control::RegistryError,
    daemon_client::{DaemonClient, RegistryChannel},
    procinfo,
    protocol::{
        deserialize_message, serialize_message, DaemonErrorCode, DaemonRequest, DaemonResponse,
        Pid, MAX_REQUEST_FRAME_SIZE, PROTOCOL_VERSION, RELEASE_SENTINEL,
    },
    saved::SavedStore,
};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command};
use std::time::Duration;
use tempfile::TempDir;

fn spawn_sleeper() -> (Child, Pid) {
    let child = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id() as Pid;
    wait_for_exec(pid, "sleep", Duration::from_secs(5)).unwrap();
    (child, pid)
}

fn exchange(
    writer: &mut UnixStream,
    reader: &mut BufReader<UnixStream>,
    frame: &[u8],
) -> DaemonResponse {
    writer.write_all(frame).unwrap();
    writer.flush().unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    deserialize_message(line.as_bytes()).unwrap()
}

#[test]
fn test_capture_list_and_release_through_daemon() {
    let temp_dir = TempDir::new().unwrap();
    let daemon = DaemonGuard::start(temp_dir.path()).unwrap();
    let client = DaemonClient::new(daemon.config().clone());
    let (mut child, pid) = spawn_sleeper();

    client.ping().unwrap();

    let entry = client.capture(pid).unwrap();
    assert_eq!(entry.slot_id, pid);
    assert_eq!(entry.display_name, "sleep");

    let err = client.capture(pid).unwrap_err();
    assert_eq!(err.registry_error(), Some(&RegistryError::AlreadyTracked(pid)));

    let entries = client.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].slot_id, pid);

    assert_eq!(client.release_or_rebind(pid, RELEASE_SENTINEL).unwrap(), None);
    assert!(client.list().unwrap().is_empty());

    let err = client.release_or_rebind(pid, RELEASE_SENTINEL).unwrap_err();
    assert_eq!(err.registry_error(), Some(&RegistryError::NoSuchSlot(pid)));

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn test_oversized_request_is_rejected_and_connection_stays_usable() {
    let temp_dir = TempDir::new().unwrap();
    let daemon = DaemonGuard::start(temp_dir.path()).unwrap();

    let mut writer = UnixStream::connect(&daemon.config().socket_path).unwrap();
    writer
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reader = BufReader::new(writer.try_clone().unwrap());

    let handshake = serialize_message(&DaemonRequest::Handshake {
        client_version: PROTOCOL_VERSION,
    })
    .unwrap();
    assert_eq!(
        exchange(&mut writer, &mut reader, &handshake),
        DaemonResponse::Handshake {
            protocol_version: PROTOCOL_VERSION
        }
    );

    let mut oversized = vec![b'x'; MAX_REQUEST_FRAME_SIZE + 16];
    oversized.push(b'\n');
    match exchange(&mut writer, &mut reader, &oversized) {
        DaemonResponse::Error { code, message } => {
            assert_eq!(code, DaemonErrorCode::InvalidRequest);
            assert!(message.contains("too large"), "unexpected message: {}", message);
        }
        other => panic!("expected error response, got {:?}", other),
    }

    let ping = serialize_message(&DaemonRequest::Ping).unwrap();
    assert_eq!(exchange(&mut writer, &mut reader, &ping), DaemonResponse::Pong);
}

#[test]
fn test_capture_agent_terminates_process_after_persisting() {
    let temp_dir = TempDir::new().unwrap();
    let daemon = DaemonGuard::start(temp_dir.path()).unwrap();
    let client = DaemonClient::new(daemon.config().clone());
    let saved = SavedStore::new(daemon.config());
    let (mut child, pid) = spawn_sleeper();

    let settings = CaptureSettings {
        term_grace: Duration::from_millis(500),
    };
    let report = CaptureAgent::new(&client, &saved, settings)
        .capture(pid)
        .unwrap();
    child.wait().unwrap();

    assert!(report.termination.confirmed);
    assert!(!procinfo::is_alive(pid));
    assert_eq!(saved.get(pid).unwrap().unwrap().display_name, "sleep");
    // the daemon still holds the slot for the dead process
    assert_eq!(client.list().unwrap()[0].slot_id, pid);
}

#[test]
fn test_shutdown_request_stops_daemon_and_removes_socket() {
    let temp_dir = TempDir::new().unwrap();
    let mut daemon = DaemonGuard::start(temp_dir.path()).unwrap();
    let client = DaemonClient::new(daemon.config().clone());

    client.shutdown().unwrap();

    assert!(daemon.wait_for_exit(Duration::from_secs(3)));
    assert!(!daemon.config().socket_path.exists());
    assert!(client.ping().is_err());
}
