//! End-to-end measurements over the in-memory loopback test bed: complete
//! runs through the coordinator, with link fixtures that drop, corrupt or
//! stall traffic to force every failure mode the engine must handle.

use natperf::config::{Cli, Config, FileConfig};
use natperf::eval::Outcome;
use natperf::frame::V4_COUNTER_OFFSET;
use natperf::loopback::{loopback_link, LoopbackTx};
use natperf::measure::{Measurement, TestBed};
use natperf::nic::PacketTx;
use natperf::tsc::{rdtsc, tsc_hz};
use natperf::{TestError, PORT_TX_QUEUE_SIZE};

use clap::Parser;
use std::sync::Mutex;

/// Measurements are timing sensitive and every worker busy-spins; running
/// two test beds at once on a small machine starves them both. One bed at
/// a time.
static BED_LOCK: Mutex<()> = Mutex::new(());

fn bed_guard() -> std::sync::MutexGuard<'static, ()> {
    BED_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A config as the binary would assemble it, with a tolerance loose enough
/// to survive a loaded test machine.
fn config(frame_rate: u32, rest: &[u64]) -> Config {
    let mut args = vec![
        "natperf-pdv".to_string(),
        "84".into(),
        "64".into(),
        frame_rate.to_string(),
        "1".into(), // duration: 1 s
        "500".into(), // global timeout: 500 ms
        "1/1".into(),
    ];
    args.extend(rest.iter().map(|v| v.to_string()));
    let cli = Cli::parse_from(args);

    let mut file = FileConfig::loopback();
    file.timing.tolerance = 3.0;
    Config::assemble(&cli, &file).unwrap()
}

#[test]
fn stateless_loopback_run_is_clean() {
    let _bed = bed_guard();
    let cfg = config(2000, &[0]);
    let measurement = Measurement::new(cfg, tsc_hz());

    let evaluations = measurement.run(TestBed::loopback()).unwrap();
    assert_eq!(evaluations.len(), 2);

    let penalty_ms = 1500.0;
    for (side, eval) in evaluations {
        assert_eq!(eval.frames_lost, 0, "{side} lost frames on loopback");
        match eval.outcome {
            Outcome::Pdv { pdv_ms, dmin_ms, dmax_ms, d99_9_ms } => {
                assert!(pdv_ms >= 0.0);
                assert!(dmin_ms <= d99_9_ms && d99_9_ms <= dmax_ms);
                // no frame took the lost-frame penalty
                assert!(dmax_ms < penalty_ms / 2.0, "{side} Dmax {dmax_ms} ms");
            }
            _ => panic!("{side}: expected a PDV outcome"),
        }
    }
}

#[test]
fn frame_timeout_mode_reports_counts() {
    let _bed = bed_guard();
    // frame_timeout 400 ms: loopback delivery is far faster than that
    let cfg = config(1000, &[400]);
    let measurement = Measurement::new(cfg, tsc_hz());

    let evaluations = measurement.run(TestBed::loopback()).unwrap();
    for (side, eval) in evaluations {
        assert_eq!(eval.frames_lost, 0);
        assert_eq!(
            eval.outcome,
            Outcome::TimedCount {
                frames_received: 1000
            },
            "{side}"
        );
    }
}

/// Accepts every frame but silently discards every 100th, counting from
/// the first.
struct DroppingTx {
    inner: LoopbackTx,
    accepted: u64,
}

impl PacketTx for DroppingTx {
    fn tx_burst(&mut self, frames: &[&[u8]]) -> usize {
        let mut accepted = 0;
        for frame in frames {
            if self.accepted % 100 == 0 {
                // the NIC "takes" the frame, the wire never sees it
                self.accepted += 1;
                accepted += 1;
                continue;
            }
            if self.inner.tx_burst(&[frame]) == 0 {
                break;
            }
            self.accepted += 1;
            accepted += 1;
        }
        accepted
    }
}

#[test]
fn lost_frames_are_penalized() {
    let _bed = bed_guard();
    let mut cfg = config(2000, &[0]);
    cfg.reverse = false;
    let penalty_ms = 1000.0 * cfg.duration as f64 + cfg.global_timeout as f64;

    let (left_tx, right_rx) = loopback_link(PORT_TX_QUEUE_SIZE);
    let (right_tx, left_rx) = loopback_link(PORT_TX_QUEUE_SIZE);
    let bed = TestBed {
        left_tx: Box::new(DroppingTx {
            inner: left_tx,
            accepted: 0,
        }),
        left_rx: Box::new(left_rx),
        right_tx: Box::new(right_tx),
        right_rx: Box::new(right_rx),
    };

    let evaluations = Measurement::new(cfg, tsc_hz()).run(bed).unwrap();
    assert_eq!(evaluations.len(), 1);
    let (_, eval) = evaluations[0];

    // 2000 frames, every 100th dropped
    assert_eq!(eval.frames_lost, 20);
    match eval.outcome {
        Outcome::Pdv {
            dmin_ms,
            dmax_ms,
            d99_9_ms,
            pdv_ms,
        } => {
            assert!((dmax_ms - penalty_ms).abs() < 1e-3);
            // 1% loss exceeds 0.1%: the percentile sits on the penalty too
            assert!((d99_9_ms - penalty_ms).abs() < 1e-3);
            assert!((pdv_ms - (d99_9_ms - dmin_ms)).abs() < 1e-9);
        }
        _ => panic!("expected a PDV outcome"),
    }
}

/// Forwards traffic faithfully, then injects one frame whose counter is
/// out of range.
struct CorruptingTx {
    inner: LoopbackTx,
    forwarded: u64,
    poison_counter: u64,
}

impl PacketTx for CorruptingTx {
    fn tx_burst(&mut self, frames: &[&[u8]]) -> usize {
        let mut accepted = 0;
        for frame in frames {
            if self.inner.tx_burst(&[frame]) == 0 {
                break;
            }
            self.forwarded += 1;
            accepted += 1;
            if self.forwarded == 10 {
                let mut poison = frame.to_vec();
                poison[V4_COUNTER_OFFSET..V4_COUNTER_OFFSET + 8]
                    .copy_from_slice(&self.poison_counter.to_le_bytes());
                self.inner.tx_burst(&[&poison]);
            }
        }
        accepted
    }
}

#[test]
fn corrupt_counter_aborts_the_test() {
    let _bed = bed_guard();
    let mut cfg = config(2000, &[0]);
    cfg.reverse = false;
    let num_frames = cfg.duration as u64 * cfg.frame_rate as u64;

    let (left_tx, right_rx) = loopback_link(PORT_TX_QUEUE_SIZE);
    let (right_tx, left_rx) = loopback_link(PORT_TX_QUEUE_SIZE);
    let bed = TestBed {
        left_tx: Box::new(CorruptingTx {
            inner: left_tx,
            forwarded: 0,
            poison_counter: num_frames,
        }),
        left_rx: Box::new(left_rx),
        right_tx: Box::new(right_tx),
        right_rx: Box::new(right_rx),
    };

    let err = Measurement::new(cfg, tsc_hz()).run(bed).unwrap_err();
    match err {
        TestError::InvalidCounter { counter, .. } => assert_eq!(counter, num_frames),
        other => panic!("expected InvalidCounter, got {other}"),
    }
}

/// Rejects every frame until the cycle counter passes the stall deadline.
struct StallingTx {
    inner: LoopbackTx,
    until: u64,
}

impl PacketTx for StallingTx {
    fn tx_burst(&mut self, frames: &[&[u8]]) -> usize {
        if rdtsc() < self.until {
            return 0;
        }
        self.inner.tx_burst(frames)
    }
}

#[test]
fn schedule_miss_aborts_the_test() {
    let _bed = bed_guard();
    let mut cfg = config(500, &[0]);
    cfg.reverse = false;
    cfg.tolerance = 1.2; // a 1 s test may take 1.2 s at most

    let hz = tsc_hz();
    let (left_tx, right_rx) = loopback_link(PORT_TX_QUEUE_SIZE);
    let (right_tx, left_rx) = loopback_link(PORT_TX_QUEUE_SIZE);
    let bed = TestBed {
        // wedged for 1.6 s from now: past duration * tolerance
        left_tx: Box::new(StallingTx {
            inner: left_tx,
            until: rdtsc() + hz + 6 * hz / 10,
        }),
        left_rx: Box::new(left_rx),
        right_tx: Box::new(right_tx),
        right_rx: Box::new(right_rx),
    };

    let err = Measurement::new(cfg, hz).run(bed).unwrap_err();
    assert!(matches!(err, TestError::ScheduleMiss { side: "Forward", .. }));
}

#[test]
fn stateful_run_learns_and_replays() {
    let _bed = bed_guard();
    // stateful=1, preliminary 400 frames at 2000 fps into a table of 200,
    // responder walks it in learned order
    let mut cfg = config(1000, &[1, 2000, 400, 200, 1, 0]);
    cfg.var_sport = natperf::variator::VarMode::Random;
    cfg.var_dport = natperf::variator::VarMode::Random;

    let evaluations = Measurement::new(cfg, tsc_hz())
        .run(TestBed::loopback())
        .unwrap();
    assert_eq!(evaluations.len(), 2);
    for (side, eval) in evaluations {
        assert_eq!(eval.frames_lost, 0, "{side} lost frames on loopback");
    }
}

#[test]
fn underfilled_state_table_is_fatal() {
    let _bed = bed_guard();
    // only 100 preliminary frames for a table of 200
    let cfg = config(1000, &[1, 2000, 100, 200, 1, 0]);

    let err = Measurement::new(cfg, tsc_hz())
        .run(TestBed::loopback())
        .unwrap_err();
    match err {
        TestError::StateTableUnderfill { valid, size } => {
            assert_eq!(valid, 100);
            assert_eq!(size, 200);
        }
        other => panic!("expected StateTableUnderfill, got {other}"),
    }
}
