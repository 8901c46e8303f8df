//! Turning paired timestamp vectors into delay metrics.
//!
//! A zero receive timestamp marks a lost frame; loss is not an error but a
//! configured penalty latency, large enough (test duration plus the global
//! timeout) to dominate every real delay, so the statistics stay defined
//! under loss. Negative deltas can occur when send and receive run on
//! cores whose counters disagree by less than the wire latency; they are
//! clamped to zero and counted.
//!
//! With a non-zero `frame_timeout` the same machinery runs as a
//! special-purpose throughput test instead: frames slower than the timeout
//! count as lost, and only the counts are reported.

/// Delay metrics of one direction, in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    /// True PDV measurement
    Pdv {
        dmin_ms: f64,
        dmax_ms: f64,
        d99_9_ms: f64,
        pdv_ms: f64,
    },
    /// Frame-timeout mode: how many frames arrived within the timeout
    TimedCount { frames_received: u64 },
}

/// Everything the evaluator derives from one direction's timestamps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    /// Frames that never arrived (zero receive timestamp)
    pub frames_lost: u64,
    /// Negative delays clamped to zero
    pub num_corrected: u64,
    pub outcome: Outcome,
}

/// Evaluate one direction. `send_ts` and `receive_ts` are parallel vectors
/// indexed by the frame counter; `penalty` is in milliseconds. Pure: the
/// same inputs always produce the same metrics.
pub fn evaluate_pdv(
    send_ts: &[u64],
    receive_ts: &[u64],
    hz: u64,
    frame_timeout: u16,
    penalty: u64,
) -> Evaluation {
    assert_eq!(send_ts.len(), receive_ts.len());
    let num_timestamps = send_ts.len();
    let frame_to = frame_timeout as i64 * hz as i64 / 1000;
    let penalty_tsc = penalty as i64 * hz as i64 / 1000;

    // negative delay may occur, so the working vector is signed
    let mut latency = vec![0_i64; num_timestamps];
    let mut num_corrected = 0_u64;
    let mut frames_lost = 0_u64;

    for i in 0..num_timestamps {
        if receive_ts[i] != 0 {
            latency[i] = receive_ts[i] as i64 - send_ts[i] as i64;
            if latency[i] < 0 {
                latency[i] = 0; // correct negative delay to 0
                num_corrected += 1;
            }
        } else {
            frames_lost += 1; // frame physically lost
            latency[i] = penalty_tsc;
        }
    }

    let outcome = if frame_timeout != 0 {
        // count the frames arrived in time
        let frames_received = latency.iter().filter(|&&d| d <= frame_to).count() as u64;
        Outcome::TimedCount { frames_received }
    } else {
        let mut dmin = latency[0];
        let mut dmax = latency[0];
        for &d in &latency[1..] {
            if d < dmin {
                dmin = d;
            }
            if d > dmax {
                dmax = d;
            }
        }
        latency.sort_unstable();
        let d99_9 = latency[(0.999 * num_timestamps as f64).ceil() as usize - 1];
        let pdv = d99_9 - dmin;

        let to_ms = |tsc: i64| 1000.0 * tsc as f64 / hz as f64;
        Outcome::Pdv {
            dmin_ms: to_ms(dmin),
            dmax_ms: to_ms(dmax),
            d99_9_ms: to_ms(d99_9),
            pdv_ms: to_ms(pdv),
        }
    };

    Evaluation {
        frames_lost,
        num_corrected,
        outcome,
    }
}

/// Report one direction's evaluation on stdout.
pub fn print_evaluation(side: &str, eval: &Evaluation) {
    if eval.num_corrected > 0 {
        println!(
            "Debug: {side} number of negative delay values corrected to 0: {}",
            eval.num_corrected
        );
    }
    match eval.outcome {
        Outcome::TimedCount { frames_received } => {
            println!("{side} frames received: {frames_received}");
            println!("Info: {side} frames completely missing: {}", eval.frames_lost);
        }
        Outcome::Pdv {
            dmin_ms,
            dmax_ms,
            d99_9_ms,
            pdv_ms,
        } => {
            println!("Info: {side} D99_9th_perc: {d99_9_ms:.6}");
            println!("Info: {side} Dmin: {dmin_ms:.6}");
            println!("Info: {side} Dmax: {dmax_ms:.6}");
            println!("{side} PDV: {pdv_ms:.6}");
        }
    }
}
