//! Session Protocol Tests
//!
//! Drives a real server over loopback TCP, through the client library where
//! the exchange is well formed and through a raw socket where it is not.

use remote_device::client::{ClientError, RemoteClient};
use remote_device::config::ServerConfig;
use remote_device::device::{Device, DeviceRegistry, HostDevice};
use remote_device::protocol::{Opcode, RunRequest, RunStatus};
use remote_device::server::Server;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ADD: &str = "\
.kernel add
gid r0
ld  r1, b1, r0
ld  r2, b2, r0
add r3, r1, r2
st  b0, r0, r3
";

const SUB: &str = "\
.kernel sub
gid r0
ld  r1, b1, r0
ld  r2, b2, r0
sub r3, r1, r2
st  b0, r0, r3
";

/// Start a concurrent server on an ephemeral port
fn start(registry: DeviceRegistry) -> SocketAddr {
    serve_on_ephemeral(registry, true)
}

fn serve_on_ephemeral(registry: DeviceRegistry, concurrent: bool) -> SocketAddr {
    let mut config = ServerConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.concurrent = concurrent;

    let server = Server::bind(&config, Arc::new(registry)).expect("bind");
    let addr = server.local_addr().expect("local addr");
    thread::spawn(move || {
        let _ = server.serve();
    });
    addr
}

/// Server whose CPU device is shared with the test
fn start_with_host() -> (SocketAddr, Arc<HostDevice>) {
    let host = Arc::new(HostDevice::new("CPU"));
    let shared = Arc::clone(&host);
    let mut registry = DeviceRegistry::with_builtin();
    registry.register("CPU", move |_| Ok(Arc::clone(&shared) as Arc<dyn Device>));
    (start(registry), host)
}

fn ints(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn from_ints(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn launch(name: &str, buffers: Vec<u64>, n: u64, program: u64) -> RunRequest {
    RunRequest {
        name: name.to_string(),
        buffers,
        global_size: vec![n],
        local_size: Some(vec![1]),
        vals: vec![],
        wait: true,
        program,
    }
}

/// Read until the server drops the connection
fn assert_closed(stream: &mut TcpStream) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut received = Vec::new();
    match stream.read_to_end(&mut received) {
        Ok(_) => received,
        Err(e) => {
            assert!(
                matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
                ),
                "expected close, got {}",
                e
            );
            received
        }
    }
}

fn block(body: &[u8]) -> Vec<u8> {
    let mut out = (body.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ============================================================================
// Buffers
// ============================================================================

#[test]
fn test_copy_roundtrip_1024() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut client = RemoteClient::connect(addr).unwrap();

    let id = client.alloc(1024).unwrap();
    client.copy_in(id, &[0xAB; 1024]).unwrap();
    let data = client.copy_out(id).unwrap();
    assert_eq!(data.len(), 1024);
    assert!(data.iter().all(|&b| b == 0xAB));
    client.exit().unwrap();
}

#[test]
fn test_ids_unique_and_per_session() {
    let addr = start(DeviceRegistry::with_builtin());

    let mut first = RemoteClient::connect(addr).unwrap();
    let ids: Vec<u64> = (0..4).map(|_| first.alloc(8).unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    first.free(2).unwrap();
    assert_eq!(first.alloc(8).unwrap(), 5);

    let mut second = RemoteClient::connect(addr).unwrap();
    assert_eq!(second.alloc(8).unwrap(), 1);

    // Same id, different sessions, different storage
    first.copy_in(1, &[1; 8]).unwrap();
    second.copy_in(1, &[2; 8]).unwrap();
    assert_eq!(first.copy_out(1).unwrap(), vec![1; 8]);
    assert_eq!(second.copy_out(1).unwrap(), vec![2; 8]);
}

#[test]
fn test_zero_size_buffer() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut client = RemoteClient::connect(addr).unwrap();
    let id = client.alloc(0).unwrap();
    client.copy_in(id, &[]).unwrap();
    assert!(client.copy_out(id).unwrap().is_empty());
    client.free(id).unwrap();
}

#[test]
fn test_client_rejects_wrong_length() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut client = RemoteClient::connect(addr).unwrap();
    let id = client.alloc(16).unwrap();
    assert!(matches!(
        client.copy_in(id, &[0; 15]),
        Err(ClientError::SizeMismatch { .. })
    ));
    // Stream is still in sync
    client.synchronize().unwrap();
}

#[test]
fn test_free_unknown_buffer_closes_session() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut stream = TcpStream::connect(addr).unwrap();
    let mut request = vec![Opcode::Free.as_u8()];
    request.extend(block(b"[42, {}]"));
    stream.write_all(&request).unwrap();
    assert!(assert_closed(&mut stream).is_empty());
}

#[test]
fn test_copy_out_after_free_closes_session() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut stream = TcpStream::connect(addr).unwrap();

    let mut request = vec![Opcode::Allocate.as_u8()];
    request.extend(block(b"[4, {}]"));
    request.push(Opcode::Free.as_u8());
    request.extend(block(b"[1, {}]"));
    request.push(Opcode::CopyOut.as_u8());
    request.extend_from_slice(&1u64.to_le_bytes());
    stream.write_all(&request).unwrap();

    // Allocate reply and Free ack, then nothing
    let received = assert_closed(&mut stream);
    assert_eq!(received, vec![1, 0, 0, 0, b'1', 0x00]);
}

#[test]
fn test_copy_in_after_free_closes_session() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut stream = TcpStream::connect(addr).unwrap();

    let mut request = vec![Opcode::Allocate.as_u8()];
    request.extend(block(b"[8, {}]"));
    request.push(Opcode::Free.as_u8());
    request.extend(block(b"[1, {}]"));
    request.push(Opcode::CopyIn.as_u8());
    request.extend_from_slice(&1u64.to_le_bytes());
    stream.write_all(&request).unwrap();

    // Allocate reply and Free ack; the id is rejected before any payload
    let received = assert_closed(&mut stream);
    assert_eq!(received, vec![1, 0, 0, 0, b'1', 0x00]);
}

#[test]
fn test_session_state_released_on_disconnect() {
    let (addr, host) = start_with_host();
    {
        let mut client = RemoteClient::connect(addr).unwrap();
        client.alloc(64).unwrap();
        client.alloc(32).unwrap();
        client.synchronize().unwrap();
        assert_eq!(host.memory_in_use().allocations, 2);
    }
    assert!(wait_for(|| host.memory_in_use().allocations == 0));
}

#[test]
fn test_free_releases_backend_memory() {
    let (addr, host) = start_with_host();
    let mut client = RemoteClient::connect(addr).unwrap();
    let id = client.alloc(128).unwrap();
    assert_eq!(host.memory_in_use().bytes, 128);
    client.free(id).unwrap();
    assert_eq!(host.memory_in_use().bytes, 0);
    client.exit().unwrap();
}

// ============================================================================
// Programs
// ============================================================================

#[test]
fn test_compile_load_run() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut client = RemoteClient::connect(addr).unwrap();

    let lib = client.compile(ADD).unwrap();
    client.load("add", &lib, 1).unwrap();

    let out = client.alloc(16).unwrap();
    let a = client.alloc(16).unwrap();
    let b = client.alloc(16).unwrap();
    client.copy_in(a, &ints(&[1, 2, 3, 4])).unwrap();
    client.copy_in(b, &ints(&[10, 20, 30, 40])).unwrap();

    let status = client.run(&launch("add", vec![out, a, b], 4, 1)).unwrap();
    assert_eq!(status, RunStatus::Success);
    assert_eq!(from_ints(&client.copy_out(out).unwrap()), vec![11, 22, 33, 44]);
    client.exit().unwrap();
}

#[test]
fn test_compile_is_deterministic() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut client = RemoteClient::connect(addr).unwrap();
    let first = client.compile(ADD).unwrap();
    let second = client.compile(ADD).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_load_overwrites_program() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut client = RemoteClient::connect(addr).unwrap();

    let add = client.compile(ADD).unwrap();
    let sub = client.compile(SUB).unwrap();
    client.load("add", &add, 3).unwrap();
    client.load("sub", &sub, 3).unwrap();

    let out = client.alloc(4).unwrap();
    let a = client.alloc(4).unwrap();
    let b = client.alloc(4).unwrap();
    client.copy_in(a, &ints(&[10])).unwrap();
    client.copy_in(b, &ints(&[3])).unwrap();

    // Name is informational; program 3 is now sub
    let status = client.run(&launch("add", vec![out, a, b], 1, 3)).unwrap();
    assert_eq!(status, RunStatus::Success);
    assert_eq!(from_ints(&client.copy_out(out).unwrap()), vec![7]);
}

#[test]
fn test_failed_run_reports_status_and_continues() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut client = RemoteClient::connect(addr).unwrap();

    let lib = client.compile(ADD).unwrap();
    client.load("add", &lib, 1).unwrap();
    let small = client.alloc(4).unwrap();

    // Grid of 4 over one-element buffers runs off the end
    let status = client
        .run(&launch("add", vec![small, small, small], 4, 1))
        .unwrap();
    assert_eq!(status, RunStatus::Failure);

    client.synchronize().unwrap();
    let status = client
        .run(&launch("add", vec![small, small, small], 1, 1))
        .unwrap();
    assert_eq!(status, RunStatus::Success);
}

#[test]
fn test_run_unknown_program_closes_session() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut stream = TcpStream::connect(addr).unwrap();
    let request = serde_json::to_vec(&launch("k", vec![], 1, 99)).unwrap();
    let mut frame = vec![Opcode::Run.as_u8()];
    frame.extend(block(&request));
    stream.write_all(&frame).unwrap();
    assert!(assert_closed(&mut stream).is_empty());
}

#[test]
fn test_compile_error_closes_session() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut client = RemoteClient::connect(addr).unwrap();
    match client.compile(".kernel k\nbogus r1\n") {
        Err(ClientError::Frame(e)) => assert!(e.is_disconnect(), "{}", e),
        other => panic!("expected disconnect, got {:?}", other.map(|b| b.len())),
    }
}

// ============================================================================
// Devices and framing
// ============================================================================

#[test]
fn test_select_device() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut client = RemoteClient::connect(addr).unwrap();

    client.select_device("null").unwrap();
    // NULL compiles by echoing the source
    assert_eq!(client.compile("anything").unwrap(), b"anything".to_vec());

    client.select_device("CPU:1").unwrap();
    let lib = client.compile(ADD).unwrap();
    assert_eq!(&lib[..4], b"HKRN");
}

#[test]
fn test_buffers_follow_owning_device() {
    let (addr, host) = start_with_host();
    let mut client = RemoteClient::connect(addr).unwrap();

    let id = client.alloc(8).unwrap();
    client.copy_in(id, &[5; 8]).unwrap();
    client.select_device("NULL").unwrap();
    assert_eq!(client.copy_out(id).unwrap(), vec![5; 8]);
    client.free(id).unwrap();
    assert_eq!(host.memory_in_use().allocations, 0);
}

#[test]
fn test_unknown_device_closes_session() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut client = RemoteClient::connect(addr).unwrap();
    assert!(client.select_device("TPU").is_err());
}

#[test]
fn test_unknown_opcode_closes_session() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&[0x42, Opcode::Synchronize.as_u8()]).ok();
    assert!(assert_closed(&mut stream).is_empty());
}

#[test]
fn test_oversized_block_closes_session() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut stream = TcpStream::connect(addr).unwrap();
    let mut frame = vec![Opcode::Allocate.as_u8()];
    frame.extend_from_slice(&4096u32.to_le_bytes());
    stream.write_all(&frame).unwrap();
    assert!(assert_closed(&mut stream).is_empty());
}

#[test]
fn test_byte_at_a_time_delivery() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_nodelay(true).unwrap();

    let mut frame = vec![Opcode::Allocate.as_u8()];
    frame.extend(block(b"{\"size\": 4, \"options\": {}}"));
    frame.push(Opcode::CopyIn.as_u8());
    frame.extend_from_slice(&1u64.to_le_bytes());
    frame.extend_from_slice(&[9, 8, 7, 6]);
    frame.push(Opcode::CopyOut.as_u8());
    frame.extend_from_slice(&1u64.to_le_bytes());
    for byte in frame {
        stream.write_all(&[byte]).unwrap();
    }

    let mut reply = [0u8; 9];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [1, 0, 0, 0, b'1', 9, 8, 7, 6]);
}

#[test]
fn test_exit_ends_session() {
    let addr = start(DeviceRegistry::with_builtin());
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .write_all(&[Opcode::Synchronize.as_u8(), Opcode::Exit.as_u8()])
        .unwrap();
    assert_eq!(assert_closed(&mut stream), vec![0x00]);
}

#[test]
fn test_sequential_server_serves_connections_in_turn() {
    let addr = serve_on_ephemeral(DeviceRegistry::with_builtin(), false);

    let mut first = RemoteClient::connect(addr).unwrap();
    assert_eq!(first.alloc(16).unwrap(), 1);

    // Queued behind the first session: no reply until it exits
    let mut second = TcpStream::connect(addr).unwrap();
    let mut request = vec![Opcode::Allocate.as_u8()];
    request.extend(block(b"[8, {}]"));
    request.push(Opcode::Exit.as_u8());
    second.write_all(&request).unwrap();
    second
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut byte = [0u8; 1];
    let pending = second.read(&mut byte).unwrap_err();
    assert!(matches!(
        pending.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    ));

    assert_eq!(first.alloc(16).unwrap(), 2);
    first.exit().unwrap();

    // Fresh session, so identifiers restart at 1
    assert_eq!(assert_closed(&mut second), vec![1, 0, 0, 0, b'1']);

    let mut third = RemoteClient::connect(addr).unwrap();
    assert_eq!(third.alloc(4).unwrap(), 1);
    third.exit().unwrap();
}
