// End-to-end stream engine tests over scripted links: no raw sockets, no
// elevated privileges, real threads and timing.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use svlink_core::iec61850::ethernet::MacAddr;
use svlink_core::link::RawLink;
use svlink_core::replay::{StreamConfig, SvReplay, SvSource};

/// Scripted link: records sent frames, serves queued inbound frames.
#[derive(Clone)]
struct MockLink {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    inbox: Arc<Mutex<VecDeque<Vec<u8>>>>,
    fail_sends: Arc<AtomicBool>,
}

impl MockLink {
    fn new() -> MockLink {
        MockLink {
            sent: Arc::new(Mutex::new(Vec::new())),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            fail_sends: Arc::new(AtomicBool::new(false)),
        }
    }

    fn push_inbound(&self, frame: Vec<u8>) {
        self.inbox.lock().unwrap().push_back(frame);
    }

    fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

impl RawLink for MockLink {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated send failure"));
        }
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(frame.len())
    }

    fn recv_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.inbox.lock().unwrap().pop_front())
    }

    fn mac_address(&self) -> Option<MacAddr> {
        Some(MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]))
    }
}

/// Walk the ASDU of a built SV frame and return its smpCnt.
fn smp_cnt_of(frame: &[u8]) -> u16 {
    // eth(12) + vlan(4) + ethertype(2) + appid(2) + len(2) + reserved(4)
    let mut pos = 26;
    assert_eq!(frame[pos], 0x60);
    pos += 1;
    pos += ber_len(frame, pos).1;
    assert_eq!(&frame[pos..pos + 3], &[0x80, 0x01, 0x01]); // noASDU = 1
    pos += 3;
    assert_eq!(frame[pos], 0xA2);
    pos += 1;
    pos += ber_len(frame, pos).1;
    assert_eq!(frame[pos], 0x30);
    pos += 1;
    pos += ber_len(frame, pos).1;
    assert_eq!(frame[pos], 0x80); // svID
    let sv_id_len = frame[pos + 1] as usize;
    pos += 2 + sv_id_len;
    assert_eq!(&frame[pos..pos + 2], &[0x82, 0x02]);
    u16::from_be_bytes([frame[pos + 2], frame[pos + 3]])
}

/// First channel INT32 value of the seqData field.
fn first_sample_of(frame: &[u8]) -> i32 {
    // seqData is the final 2 + 64 bytes of the frame
    let at = frame.len() - 64;
    assert_eq!(&frame[at - 2..at], &[0x87, 64]);
    i32::from_be_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]])
}

fn ber_len(frame: &[u8], pos: usize) -> (usize, usize) {
    let first = frame[pos];
    if first & 0x80 == 0 {
        (first as usize, 1)
    } else if first == 0x81 {
        (frame[pos + 1] as usize, 2)
    } else {
        (
            u16::from_be_bytes([frame[pos + 1], frame[pos + 2]]) as usize,
            3,
        )
    }
}

fn goose_stop_frame(gocb_ref: &str) -> Vec<u8> {
    let mut pdu = Vec::new();
    pdu.push(0x80);
    pdu.push(gocb_ref.len() as u8);
    pdu.extend_from_slice(gocb_ref.as_bytes());
    pdu.extend_from_slice(&[0x85, 0x04, 0x00, 0x00, 0x00, 0x01]); // stNum
    pdu.extend_from_slice(&[0x86, 0x04, 0x00, 0x00, 0x00, 0x00]); // sqNum

    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x01, 0x0C, 0xCD, 0x01, 0x00, 0x01]);
    frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    frame.extend_from_slice(&[0x88, 0xB8]);
    frame.extend_from_slice(&0x0001u16.to_be_bytes());
    frame.extend_from_slice(&((10 + pdu.len()) as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.push(0x61);
    frame.push(pdu.len() as u8);
    frame.extend_from_slice(&pdu);
    frame
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("svlink-it-{}-{}", std::process::id(), name))
}

fn write_recording(tag: &str, rate_hz: u32, rows: &[(u32, f64, f64, f64)]) -> (PathBuf, PathBuf) {
    let cfg_path = temp_path(&format!("{}.cfg", tag));
    let dat_path = temp_path(&format!("{}.dat", tag));

    let total = rows.len();
    let cfg = format!(
        "STATION,DEV1,1999\n2,2A,0D\n\
         1,IA,A,,A,1.0,0.0,0.0,-100000,100000,1,1,P\n\
         2,VA,A,,V,1.0,0.0,0.0,-100000,100000,1,1,P\n\
         60\n1\n{rate_hz},{total}\n\
         01/01/2024,00:00:00.000000\n01/01/2024,00:00:00.000000\nASCII\n1.0\n"
    );
    fs::write(&cfg_path, cfg).unwrap();

    let mut dat = String::new();
    for (num, t, ia, va) in rows {
        dat.push_str(&format!("{},{},{},{}\n", num, t, ia, va));
    }
    fs::write(&dat_path, dat).unwrap();
    (cfg_path, dat_path)
}

fn base_config(sample_rate: u16) -> StreamConfig {
    StreamConfig {
        src_mac: "AA:BB:CC:DD:EE:FF".to_string(),
        sample_rate,
        verbose: false,
        align_to_second: false,
        progress_interval: 0,
        goose_monitoring: false,
        ..StreamConfig::default()
    }
}

#[test]
fn test_comtrade_replay_end_to_end() {
    let (cfg_path, dat_path) = write_recording(
        "e2e",
        1000,
        &[
            (1, 0.000, 0.0, 40.0),
            (2, 0.001, 1.0, 41.0),
            (3, 0.002, 2.0, 42.0),
            (4, 0.003, 3.0, 43.0),
        ],
    );

    let mut replay = SvReplay::new(StreamConfig {
        source: SvSource::Comtrade {
            cfg_path: cfg_path.clone(),
            dat_path: Some(dat_path.clone()),
            channel_map: vec![("IA".to_string(), 0), ("VA".to_string(), 4)],
        },
        ..base_config(2000)
    });
    replay.configure().expect("configure failed");

    let tx = MockLink::new();
    let stats = replay
        .run_with_links(Box::new(tx.clone()), None)
        .expect("run failed");

    // 4 source samples at 1000 Hz resampled to 2000 Hz: 8 output frames
    assert_eq!(stats.packets_sent, 8);
    assert_eq!(stats.packets_failed, 0);
    assert_eq!(stats.total_source_samples, 4);
    assert_eq!(stats.samples_interpolated, 8);
    assert_eq!(stats.source_sample_rate, 1000);
    assert_eq!(stats.output_sample_rate, 2000);
    assert!(!stats.stopped_by_goose);

    let frames = tx.sent_frames();
    assert_eq!(frames.len(), 8);

    // smpCnt counts up monotonically from zero
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(smp_cnt_of(frame), i as u16);
    }

    // Channel 0 carries the interpolated IA ramp, clamped at the tail
    let expected = [0, 0, 1, 1, 2, 2, 3, 3];
    for (frame, want) in frames.iter().zip(expected) {
        assert_eq!(first_sample_of(frame), want);
    }

    fs::remove_file(&cfg_path).ok();
    fs::remove_file(&dat_path).ok();
}

#[test]
fn test_loop_playback_wraps_sample_index() {
    let (cfg_path, dat_path) = write_recording(
        "loop",
        1000,
        &[(1, 0.000, 10.0, 0.0), (2, 0.001, 20.0, 0.0)],
    );

    let mut replay = SvReplay::new(StreamConfig {
        source: SvSource::Comtrade {
            cfg_path: cfg_path.clone(),
            dat_path: Some(dat_path.clone()),
            channel_map: vec![("IA".to_string(), 0)],
        },
        loop_playback: true,
        ..base_config(1000)
    });
    replay.configure().unwrap();

    // Stop externally after ~40 ms of looping
    let stop = replay.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(40));
        stop.store(false, Ordering::SeqCst);
    });

    let tx = MockLink::new();
    let stats = replay.run_with_links(Box::new(tx.clone()), None).unwrap();
    stopper.join().unwrap();

    // Looped well past the 2-sample recording
    assert!(stats.packets_sent > 2, "sent {}", stats.packets_sent);
    let frames = tx.sent_frames();
    assert_eq!(first_sample_of(&frames[0]), 10);
    assert_eq!(first_sample_of(&frames[1]), 20);
    assert_eq!(first_sample_of(&frames[2]), 10, "index wraps to the start");

    fs::remove_file(&cfg_path).ok();
    fs::remove_file(&dat_path).ok();
}

#[test]
fn test_goose_stop_cancels_stream() {
    let mut config = base_config(1000);
    config.goose_monitoring = true;
    config.stop_goose_ref = "STOP".to_string();
    let mut replay = SvReplay::new(config);
    replay.configure().unwrap();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let observed_in_cb = Arc::clone(&observed);
    replay.set_goose_observer(move |msg| {
        observed_in_cb.lock().unwrap().push(msg.gocb_ref.clone());
    });

    let tx = MockLink::new();
    let rx = MockLink::new();
    rx.push_inbound(goose_stop_frame("SUBSTATION/LLN0$GO$STOP"));

    let started = Instant::now();
    let stats = replay
        .run_with_links(Box::new(tx), Some(Box::new(rx) as Box<dyn RawLink>))
        .expect("run failed");
    let elapsed = started.elapsed();

    assert!(stats.stopped_by_goose);
    assert!(stats
        .goose_stop_reason
        .as_deref()
        .unwrap()
        .contains("STOP"));
    assert!(
        elapsed < Duration::from_millis(500),
        "stop took {:?}",
        elapsed
    );
    assert_eq!(
        observed.lock().unwrap().as_slice(),
        &["SUBSTATION/LLN0$GO$STOP".to_string()]
    );
}

#[test]
fn test_goose_listener_ignores_non_matching_refs() {
    let mut config = base_config(2000);
    config.goose_monitoring = true;
    config.stop_goose_ref = "HALT".to_string();
    let mut replay = SvReplay::new(config);
    replay.configure().unwrap();

    let tx = MockLink::new();
    let rx = MockLink::new();
    rx.push_inbound(goose_stop_frame("SUBSTATION/LLN0$GO$STOP"));

    // Nothing matches, so stop externally after 50 ms
    let stop = replay.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stop.store(false, Ordering::SeqCst);
    });

    let stats = replay
        .run_with_links(Box::new(tx), Some(Box::new(rx) as Box<dyn RawLink>))
        .unwrap();
    stopper.join().unwrap();

    assert!(!stats.stopped_by_goose);
    assert!(stats.goose_stop_reason.is_none());
    assert!(stats.packets_sent > 10);
}

#[test]
fn test_goose_stop_observed_promptly_after_arrival() {
    let mut config = base_config(1000);
    config.goose_monitoring = true;
    config.stop_goose_ref = "STOP".to_string();
    let mut replay = SvReplay::new(config);
    replay.configure().unwrap();

    let tx = MockLink::new();
    let rx = MockLink::new();

    // Deliver the stop frame mid-run
    let injector_rx = rx.clone();
    let injector = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        injector_rx.push_inbound(goose_stop_frame("IED7/LLN0$GO$STOP"));
        Instant::now()
    });

    let stats = replay
        .run_with_links(Box::new(tx), Some(Box::new(rx) as Box<dyn RawLink>))
        .unwrap();
    let delivered_at = injector.join().unwrap();
    let observed_within = delivered_at.elapsed();

    assert!(stats.stopped_by_goose);
    assert_eq!(stats.goose_stop_reason.as_deref(), Some("IED7/LLN0$GO$STOP"));
    // One poll interval plus one send period, with scheduling headroom
    assert!(
        observed_within < Duration::from_millis(100),
        "cancellation observed after {:?}",
        observed_within
    );
}

#[test]
fn test_send_failures_are_counted_not_fatal() {
    let (cfg_path, dat_path) = write_recording(
        "fail",
        1000,
        &[
            (1, 0.000, 1.0, 0.0),
            (2, 0.001, 2.0, 0.0),
            (3, 0.002, 3.0, 0.0),
        ],
    );

    let mut replay = SvReplay::new(StreamConfig {
        source: SvSource::Comtrade {
            cfg_path: cfg_path.clone(),
            dat_path: Some(dat_path.clone()),
            channel_map: vec![("IA".to_string(), 0)],
        },
        ..base_config(1000)
    });
    replay.configure().unwrap();

    let tx = MockLink::new();
    tx.fail_sends.store(true, Ordering::SeqCst);
    let stats = replay.run_with_links(Box::new(tx.clone()), None).unwrap();

    assert_eq!(stats.packets_sent, 0);
    assert_eq!(stats.packets_failed, 3);
    assert!(tx.sent_frames().is_empty());

    fs::remove_file(&cfg_path).ok();
    fs::remove_file(&dat_path).ok();
}

#[test]
fn test_unknown_channel_fails_configure() {
    let (cfg_path, dat_path) = write_recording("unknown", 1000, &[(1, 0.0, 1.0, 2.0)]);

    let mut replay = SvReplay::new(StreamConfig {
        source: SvSource::Comtrade {
            cfg_path: cfg_path.clone(),
            dat_path: Some(dat_path.clone()),
            channel_map: vec![("IB".to_string(), 0)],
        },
        ..base_config(1000)
    });
    let err = replay.configure().unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("IB"), "error was: {}", msg);
    assert!(msg.contains("IA"), "error lists available channels: {}", msg);
    assert_eq!(replay.last_error(), msg);

    fs::remove_file(&cfg_path).ok();
    fs::remove_file(&dat_path).ok();
}

#[test]
fn test_bad_sv_index_fails_configure() {
    let (cfg_path, dat_path) = write_recording("badidx", 1000, &[(1, 0.0, 1.0, 2.0)]);

    let mut replay = SvReplay::new(StreamConfig {
        source: SvSource::Comtrade {
            cfg_path: cfg_path.clone(),
            dat_path: Some(dat_path.clone()),
            channel_map: vec![("IA".to_string(), 8)],
        },
        ..base_config(1000)
    });
    assert!(replay.configure().is_err());
    assert!(replay.last_error().contains("8"));

    fs::remove_file(&cfg_path).ok();
    fs::remove_file(&dat_path).ok();
}
