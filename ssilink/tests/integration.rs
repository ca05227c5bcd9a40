use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ssilink::sim::SimulatedMcu;
use ssilink::{
    Device, DeviceBuilder, Duplex, Interest, LengthWidth, LinkConfig, NoDelay, Session, Signals,
    StatusByte,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Harness {
    device: Device,
    mcu: SimulatedMcu,
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
    recoveries: Arc<AtomicUsize>,
}

fn harness(config: LinkConfig) -> Harness {
    init_logger();

    let mcu = SimulatedMcu::new();
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let recoveries = Arc::new(AtomicUsize::new(0));

    let sink = {
        let chunks = chunks.clone();
        move |p: &[u8]| chunks.lock().unwrap().push(p.to_vec())
    };
    let recovery = {
        let recoveries = recoveries.clone();
        move || {
            recoveries.fetch_add(1, Ordering::SeqCst);
        }
    };

    let device = DeviceBuilder::new(config)
        .consumer(sink)
        .recovery(recovery)
        .build(mcu.clone(), mcu.clone(), NoDelay)
        .unwrap();
    mcu.attach_irq(device.irq_handle());

    Harness {
        device,
        mcu,
        chunks,
        recoveries,
    }
}

/// Reads until `len` bytes arrived.
fn read_exact(session: &Session, len: usize) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 4096];

    while out.len() < len {
        assert!(Instant::now() < deadline, "timed out after {} bytes", out.len());
        session
            .wait(Interest::READABLE, Duration::from_millis(100))
            .unwrap();
        let n = session.read(&mut buf).unwrap();
        out.extend_from_slice(&buf[..n]);
    }
    out
}

fn payload_lengths(mcu: &SimulatedMcu) -> Vec<usize> {
    mcu.exchanges()
        .iter()
        .filter(|r| r.ok && !r.is_read())
        .map(|r| r.tx.len())
        .collect()
}

#[test]
fn test_single_write_is_one_frame() {
    let h = harness(LinkConfig::new());
    let session = h.device.open().unwrap();

    let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
    assert_eq!(session.write(&data), Ok(200));
    h.device.flush().unwrap();

    let exchanges = h.mcu.exchanges();
    assert_eq!(exchanges.len(), 1);
    assert_eq!(exchanges[0].tx.len(), 200 + 3);
    assert_eq!(exchanges[0].tx[0], 0x50);
    assert_eq!(h.mcu.received(), data);

    let stats = h.device.stats();
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.bytes_sent, 200);
}

#[test]
fn test_data_ready_delivers_advertised_payload() {
    let h = harness(LinkConfig::new());
    let session = h.device.open().unwrap();

    let data: Vec<u8> = (100..150).collect();
    h.mcu.push_inbound(&data);
    h.device.flush().unwrap();

    assert_eq!(*h.chunks.lock().unwrap(), vec![data.clone()]);
    assert_eq!(read_exact(&session, 50), data);

    let exchanges = h.mcu.exchanges();
    assert_eq!(exchanges.len(), 2);
    assert_eq!(exchanges[0].tx.len(), 3);
    assert_eq!(exchanges[1].tx.len(), 50 + 3);
}

#[test]
fn test_unresponsive_remote_triggers_recovery_once() {
    let h = harness(LinkConfig::new());
    let session = h.device.open().unwrap();
    h.mcu.set_unresponsive(true);

    session.write(b"never sent").unwrap();
    h.device.flush().unwrap();

    assert_eq!(h.recoveries.load(Ordering::SeqCst), 1);
    assert!(h.mcu.exchanges().is_empty());
    assert_eq!(h.device.stats().handshake_timeouts, 1);

    // The remote came back; the next write carries the parked bytes too.
    h.mcu.set_unresponsive(false);
    session.write(b"!").unwrap();
    h.device.flush().unwrap();
    assert_eq!(h.mcu.received(), b"never sent!");
    assert_eq!(h.recoveries.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failed_exchange_is_retried_next_cycle() {
    let h = harness(LinkConfig::new());
    let session = h.device.open().unwrap();
    h.mcu.fail_next_exchanges(1);

    session.write(&[0xA5; 100]).unwrap();
    h.device.flush().unwrap();

    let stats = h.device.stats();
    assert_eq!(stats.tx_failures, 1);
    assert_eq!(stats.frames_sent, 0);
    assert!(h.mcu.received().is_empty());
    assert!(h.chunks.lock().unwrap().is_empty());
    assert!(!session.poll().readable);

    session.write(&[0x5A]).unwrap();
    h.device.flush().unwrap();

    let mut expected = vec![0xA5; 100];
    expected.push(0x5A);
    assert_eq!(h.mcu.received(), expected);
}

#[test]
fn test_zero_credit_holds_transmit_until_refreshed() {
    let h = harness(LinkConfig::new());
    let session = h.device.open().unwrap();

    // First frame drains the credit to zero.
    h.mcu.set_status(StatusByte::new(0, 0, false));
    session.write(&[1u8; 10]).unwrap();
    h.device.flush().unwrap();

    // The probe still sees no room: the bytes stay queued.
    h.mcu.clear_exchanges();
    h.mcu.script_status([StatusByte::new(0, 0, false)]);
    h.mcu.set_status(StatusByte::new(0, 1, false));
    session.write(&[2u8; 40]).unwrap();
    h.device.flush().unwrap();

    assert_eq!(h.mcu.exchanges().len(), 1);
    assert_eq!(h.mcu.received().len(), 10);
    assert!(!h.mcu.request());

    // The next write probes again, finds 32 bytes of room and sends the lot
    // in a follow-up cycle.
    session.write(&[3u8; 2]).unwrap();
    h.device.flush().unwrap();
    h.device.flush().unwrap();

    let exchanges = h.mcu.exchanges();
    let first_write = exchanges.iter().position(|r| !r.is_read()).unwrap();
    assert_eq!(first_write, 2);
    assert_eq!(payload_lengths(&h.mcu), vec![32 + 3, 10 + 3]);
    assert_eq!(h.device.stats().credit_delays, 2);
    assert_eq!(h.mcu.received().len(), 52);
}

#[test]
fn test_write_ring_wraps() {
    let config = LinkConfig::new().with_buffer_sizes(8192, 8192);
    let h = harness(config);
    let session = h.device.open().unwrap();

    let first: Vec<u8> = (0..6000).map(|i| (i % 251) as u8).collect();
    let second: Vec<u8> = (0..6000).map(|i| (i % 13) as u8).collect();

    assert_eq!(session.write(&first), Ok(6000));
    h.device.flush().unwrap();
    assert_eq!(session.write(&second), Ok(6000));
    h.device.flush().unwrap();

    let mut expected = first;
    expected.extend_from_slice(&second);
    assert_eq!(h.mcu.received(), expected);
    assert_eq!(payload_lengths(&h.mcu), vec![6003, 6003]);
}

#[test]
fn test_half_duplex_one_byte_frames() {
    let config = LinkConfig::new()
        .with_duplex(Duplex::Half)
        .with_length_width(LengthWidth::One);
    let h = harness(config);
    let session = h.device.open().unwrap();

    let data = vec![0x42; 600];
    session.write(&data).unwrap();
    h.device.flush().unwrap();

    // 253 payload bytes fit behind the single control byte.
    assert_eq!(payload_lengths(&h.mcu), vec![254, 254, 95]);
    assert_eq!(h.mcu.received(), data);

    let inbound: Vec<u8> = (0..=255).collect();
    h.mcu.push_inbound(&inbound);
    let got = read_exact(&session, 256);
    assert_eq!(got, inbound);
    assert_eq!(h.chunks.lock().unwrap().iter().map(Vec::len).collect::<Vec<_>>(), vec![252, 4]);
}

#[test]
fn test_echo_round_trip() {
    let h = harness(LinkConfig::new());
    let session = h.device.open().unwrap();
    h.mcu.set_echo(true);

    let data: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut echoed = Vec::with_capacity(data.len());

    for chunk in data.chunks(3000) {
        let mut sent = 0;
        while sent < chunk.len() {
            sent += session.write(&chunk[sent..]).unwrap();
        }
        echoed.extend(read_exact(&session, chunk.len()));
    }

    assert_eq!(echoed, data);
    let stats = h.device.stats();
    assert_eq!(stats.bytes_sent, 100_000);
    assert_eq!(stats.read_overruns, 0);
}

#[test]
fn test_session_shared_between_threads() {
    let h = harness(LinkConfig::new());
    let session = h.device.open().unwrap();
    h.mcu.set_echo(true);

    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();

    let echoed = std::thread::scope(|s| {
        let reader = s.spawn(|| read_exact(&session, data.len()));
        for chunk in data.chunks(1000) {
            assert_eq!(session.write(chunk), Ok(chunk.len()));
        }
        reader.join().unwrap()
    });

    assert_eq!(echoed, data);
}

#[test]
fn test_busy_and_reopen() {
    let h = harness(LinkConfig::new());
    let session = h.device.open().unwrap();
    assert!(h.device.open().is_err());

    drop(session);
    let session = h.device.open().unwrap();
    session.write(b"again").unwrap();
    h.device.flush().unwrap();
    assert_eq!(h.mcu.received(), b"again");
}
