//! The measurement coordinator: spawns and joins the pinned worker
//! threads, runs the stateful preliminary phase, retains the timestamp
//! vectors the workers produce, and feeds them to the evaluator.
//!
//! Three shapes keyed by `stateful`: a stateless test runs a plain sender
//! and a plain receiver per active direction; a stateful test first fills
//! the state table through a preliminary initiator/learner pair, then runs
//! the initiator side's sender statelessly against a learning receiver
//! (mappings keep refreshing during the test) while the responder side
//! replays learned tuples against a plain receiver.

use crate::config::Config;
use crate::eval::{evaluate_pdv, print_evaluation, Evaluation};
use crate::nic::{sender_pool_size, Mempool, PacketRx, PacketTx};
use crate::receiver::{learn_preliminary, learning_receive_pdv, receive_pdv, ReceiverParams};
use crate::sender::{
    preliminary_send, replay_send_pdv, send_pdv, PreliminaryParams, ReplayParams, SenderCommon,
    SenderParams,
};
use crate::state::StateTable;
use crate::tsc::rdtsc;
use crate::TestError;

use log::{info, warn};
use std::sync::Arc;
use std::thread::JoinHandle;

pub type BoxTx = Box<dyn PacketTx>;
pub type BoxRx = Box<dyn PacketRx>;

type SenderJoin = JoinHandle<(BoxTx, Result<Vec<u64>, TestError>)>;
type ReceiverJoin = JoinHandle<(BoxRx, Result<(Vec<u64>, u64), TestError>)>;

/// The queues the driver layer bound for us: one transmit and one receive
/// queue per side.
pub struct TestBed {
    pub left_tx: BoxTx,
    pub left_rx: BoxRx,
    pub right_tx: BoxTx,
    pub right_rx: BoxRx,
}

impl TestBed {
    /// Two crossed in-memory links: whatever the left side transmits, the
    /// right side receives, and vice versa. Used by self tests; a real run
    /// binds driver queues instead.
    pub fn loopback() -> TestBed {
        let (left_tx, right_rx) = crate::loopback::loopback_link(crate::PORT_TX_QUEUE_SIZE);
        let (right_tx, left_rx) = crate::loopback::loopback_link(crate::PORT_TX_QUEUE_SIZE);
        TestBed {
            left_tx: Box::new(left_tx),
            left_rx: Box::new(left_rx),
            right_tx: Box::new(right_tx),
            right_rx: Box::new(right_rx),
        }
    }
}

/// Which send loop a direction runs.
#[derive(Clone, Copy, PartialEq)]
enum SenderKind {
    Plain,
    Replay,
}

/// Which receive loop a direction runs.
#[derive(Clone, Copy, PartialEq)]
enum ReceiverKind {
    Plain,
    Learning,
}

fn spawn_worker<T, F>(
    role: &'static str,
    core: Option<usize>,
    f: F,
) -> Result<JoinHandle<T>, TestError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    std::thread::Builder::new()
        .name(role.to_string())
        .spawn(move || {
            if let Some(id) = core {
                // pin first: template and timestamp allocations below are
                // first-touched on the right NUMA node
                if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                    warn!("could not pin {role} to core {id}");
                }
            }
            f()
        })
        .map_err(|source| TestError::WorkerSpawn { role, source })
}

fn join_worker<T>(role: &'static str, handle: JoinHandle<T>) -> Result<T, TestError> {
    handle
        .join()
        .map_err(|_| TestError::WorkerPanicked { role })
}

/// One full PDV measurement over a bound test bed.
pub struct Measurement {
    pub cfg: Config,
    pub hz: u64,
}

impl Measurement {
    pub fn new(cfg: Config, hz: u64) -> Measurement {
        Measurement { cfg, hz }
    }

    fn sender_common(&self, start_tsc: u64, frame_rate: u32, duration: u16) -> SenderCommon {
        SenderCommon {
            ipv6_frame_size: self.cfg.ipv6_frame_size,
            ipv4_frame_size: self.cfg.ipv4_frame_size,
            frame_rate,
            duration,
            n: self.cfg.n,
            m: self.cfg.m,
            hz: self.hz,
            start_tsc,
            tolerance: self.cfg.tolerance,
        }
    }

    fn forward_sender_params(&self, side: &'static str) -> SenderParams {
        let cfg = &self.cfg;
        SenderParams {
            side,
            ip_version: cfg.left.ip_version,
            dst_mac: cfg.left.mac_dut,
            src_mac: cfg.left.mac_tester,
            src_ipv4: cfg.left.ipv4,
            dst_ipv4: cfg.right.ipv4,
            src_ipv6: cfg.left.ipv6,
            dst_ipv6: cfg.right.ipv6,
            src_bg: cfg.left.ipv6_background,
            dst_bg: cfg.right.ipv6_background,
            num_dest_nets: cfg.right.num_nets,
            var_sport: cfg.var_sport,
            var_dport: cfg.var_dport,
            sport_min: cfg.sport_min,
            sport_max: cfg.sport_max,
            dport_min: cfg.dport_min,
            dport_max: cfg.dport_max,
        }
    }

    fn reverse_sender_params(&self, side: &'static str) -> SenderParams {
        let cfg = &self.cfg;
        SenderParams {
            side,
            ip_version: cfg.right.ip_version,
            dst_mac: cfg.right.mac_dut,
            src_mac: cfg.right.mac_tester,
            src_ipv4: cfg.right.ipv4,
            dst_ipv4: cfg.left.ipv4,
            src_ipv6: cfg.right.ipv6,
            dst_ipv6: cfg.left.ipv6,
            src_bg: cfg.right.ipv6_background,
            dst_bg: cfg.left.ipv6_background,
            num_dest_nets: cfg.left.num_nets,
            var_sport: cfg.var_sport,
            var_dport: cfg.var_dport,
            sport_min: cfg.sport_min,
            sport_max: cfg.sport_max,
            dport_min: cfg.dport_min,
            dport_max: cfg.dport_max,
        }
    }

    fn spawn_sender(
        &self,
        role: &'static str,
        core: Option<usize>,
        mut tx: BoxTx,
        kind: SenderKind,
        common: SenderCommon,
        params: SenderParams,
        replay: Option<ReplayParams>,
    ) -> Result<SenderJoin, TestError> {
        spawn_worker(role, core, move || {
            let mut pool = Mempool::new(sender_pool_size(params.num_dest_nets as usize));
            let result = match kind {
                SenderKind::Plain => send_pdv(&mut *tx, &mut pool, &common, &params),
                SenderKind::Replay => match replay.as_ref() {
                    Some(r) => replay_send_pdv(&mut *tx, &mut pool, &common, &params, r),
                    // only reachable through a coordinator bug
                    None => Err(TestError::WorkerPanicked { role }),
                },
            };
            (tx, result)
        })
    }

    fn spawn_receiver(
        &self,
        role: &'static str,
        core: Option<usize>,
        mut rx: BoxRx,
        kind: ReceiverKind,
        params: ReceiverParams,
        table: Option<Arc<StateTable>>,
    ) -> Result<ReceiverJoin, TestError> {
        spawn_worker(role, core, move || {
            let result = match (kind, table) {
                (ReceiverKind::Learning, Some(table)) => {
                    learning_receive_pdv(&mut *rx, &params, &table)
                }
                _ => receive_pdv(&mut *rx, &params),
            };
            (rx, result)
        })
    }

    /// Run the preliminary phase: the initiator's sender pushes
    /// `pre_frames` foreground frames through the gateway while the
    /// responder's learner fills the state table. Fatal unless the table
    /// ends up full.
    fn preliminary_phase(
        &self,
        tx: BoxTx,
        rx: BoxRx,
        sender_core: Option<usize>,
        receiver_core: Option<usize>,
        table: &Arc<StateTable>,
    ) -> Result<(BoxTx, BoxRx), TestError> {
        let cfg = &self.cfg;
        let start_tsc = rdtsc() + cfg.start_delay_ms * self.hz / 1000;
        let pre_duration_ms = cfg.pre_frames * 1000 / cfg.pre_rate as u64;
        let finish_receiving =
            start_tsc + (pre_duration_ms + cfg.global_timeout as u64) * self.hz / 1000;

        let common = self.sender_common(start_tsc, cfg.pre_rate, 0);
        let params = if cfg.stateful == 1 {
            self.forward_sender_params("Preliminary")
        } else {
            self.reverse_sender_params("Preliminary")
        };
        let pre = PreliminaryParams {
            pre_rate: cfg.pre_rate,
            pre_frames: cfg.pre_frames,
            enumerate_ports: cfg.enumerate_ports,
        };

        let sender = spawn_worker("Initiator's Sender", sender_core, {
            let mut tx = tx;
            move || {
                let mut pool = Mempool::new(sender_pool_size(params.num_dest_nets as usize));
                let result = preliminary_send(&mut *tx, &mut pool, &common, &params, &pre);
                (tx, result)
            }
        })?;
        let learner = spawn_worker("Responder's Receiver", receiver_core, {
            let table = Arc::clone(table);
            let mut rx = rx;
            move || {
                let fg = learn_preliminary(&mut *rx, finish_receiving, &table);
                (rx, fg)
            }
        })?;

        info!("Preliminary frame sending started.");
        let (tx, send_result) = join_worker("Initiator's Sender", sender)?;
        let (rx, fg_received) = join_worker("Responder's Receiver", learner)?;
        send_result?;

        let valid_entries = fg_received.min(table.capacity() as u64);
        if valid_entries < table.capacity() as u64 {
            return Err(TestError::StateTableUnderfill {
                valid: valid_entries,
                size: table.capacity() as u64,
            });
        }
        info!("Preliminary phase finished.");
        Ok((tx, rx))
    }

    /// Run the test phase with the given worker shapes and evaluate both
    /// directions.
    #[allow(clippy::too_many_arguments)]
    fn test_phase(
        &self,
        bed: TestBed,
        forward_kinds: (SenderKind, ReceiverKind),
        reverse_kinds: (SenderKind, ReceiverKind),
        table: Option<&Arc<StateTable>>,
    ) -> Result<Vec<(&'static str, Evaluation)>, TestError> {
        let cfg = &self.cfg;
        let num_frames = cfg.duration as u64 * cfg.frame_rate as u64;
        let start_tsc = rdtsc() + cfg.start_delay_ms * self.hz / 1000;
        let finish_receiving = start_tsc
            + (cfg.duration as u64 * 1000 + cfg.global_timeout as u64) * self.hz / 1000;
        let common = self.sender_common(start_tsc, cfg.frame_rate, cfg.duration);

        let replay = table.map(|t| ReplayParams {
            table: Arc::clone(t),
            responder_ports: cfg.responder_ports,
        });

        let mut forward_workers: Option<(SenderJoin, ReceiverJoin)> = None;
        if cfg.forward {
            let sender = self.spawn_sender(
                "Left Sender",
                cfg.left.cpu_sender,
                bed.left_tx,
                forward_kinds.0,
                common,
                self.forward_sender_params("Forward"),
                replay.clone(),
            )?;
            let receiver = self.spawn_receiver(
                "Right Receiver",
                cfg.right.cpu_receiver,
                bed.right_rx,
                forward_kinds.1,
                ReceiverParams {
                    side: "Forward",
                    finish_receiving,
                    num_frames,
                    frame_timeout: cfg.frame_timeout,
                },
                table.map(Arc::clone),
            )?;
            forward_workers = Some((sender, receiver));
        }

        let mut reverse_workers: Option<(SenderJoin, ReceiverJoin)> = None;
        if cfg.reverse {
            let sender = self.spawn_sender(
                "Right Sender",
                cfg.right.cpu_sender,
                bed.right_tx,
                reverse_kinds.0,
                common,
                self.reverse_sender_params("Reverse"),
                replay,
            )?;
            let receiver = self.spawn_receiver(
                "Left Receiver",
                cfg.left.cpu_receiver,
                bed.left_rx,
                reverse_kinds.1,
                ReceiverParams {
                    side: "Reverse",
                    finish_receiving,
                    num_frames,
                    frame_timeout: cfg.frame_timeout,
                },
                table.map(Arc::clone),
            )?;
            reverse_workers = Some((sender, receiver));
        }

        info!("Testing started.");

        // Join the receiver first and drop its queue before joining the
        // sender: a receiver that aborted early leaves the sender wedged
        // against a full ring, and tearing the link down lets it drain.
        let forward_ts = match forward_workers {
            Some((sender, receiver)) => {
                let (rx, recv_result) = join_worker("Right Receiver", receiver)?;
                drop(rx);
                let (_tx, send_result) = join_worker("Left Sender", sender)?;
                let (recv_ts, _received) = recv_result?;
                Some((send_result?, recv_ts))
            }
            None => None,
        };
        let reverse_ts = match reverse_workers {
            Some((sender, receiver)) => {
                let (rx, recv_result) = join_worker("Left Receiver", receiver)?;
                drop(rx);
                let (_tx, send_result) = join_worker("Right Sender", sender)?;
                let (recv_ts, _received) = recv_result?;
                Some((send_result?, recv_ts))
            }
            None => None,
        };

        info!("Test finished.");

        // latency to be reported for lost timestamps, in milliseconds
        let penalty = 1000 * cfg.duration as u64 + cfg.global_timeout as u64;
        let mut evaluations = Vec::new();
        if let Some((send_ts, receive_ts)) = forward_ts {
            let eval = evaluate_pdv(&send_ts, &receive_ts, self.hz, cfg.frame_timeout, penalty);
            print_evaluation("Forward", &eval);
            evaluations.push(("Forward", eval));
        }
        if let Some((send_ts, receive_ts)) = reverse_ts {
            let eval = evaluate_pdv(&send_ts, &receive_ts, self.hz, cfg.frame_timeout, penalty);
            print_evaluation("Reverse", &eval);
            evaluations.push(("Reverse", eval));
        }
        Ok(evaluations)
    }

    /// Perform the measurement. Returns the per-direction evaluations
    /// (also printed on stdout) or the first fatal error.
    pub fn run(&self, bed: TestBed) -> Result<Vec<(&'static str, Evaluation)>, TestError> {
        match self.cfg.stateful {
            0 => self.test_phase(
                bed,
                (SenderKind::Plain, ReceiverKind::Plain),
                (SenderKind::Plain, ReceiverKind::Plain),
                None,
            ),
            1 => {
                // Initiator on the left: preliminary traffic flows forward,
                // the responder's learner sits on the right
                let table = Arc::new(StateTable::new(self.cfg.state_table_size));
                let TestBed {
                    left_tx,
                    left_rx,
                    right_tx,
                    right_rx,
                } = bed;
                let (left_tx, right_rx) = self.preliminary_phase(
                    left_tx,
                    right_rx,
                    self.cfg.left.cpu_sender,
                    self.cfg.right.cpu_receiver,
                    &table,
                )?;
                if self.cfg.enumerate_ports {
                    warn!(
                        "port number enumeration is supported only in the preliminary \
                         phase of PDV measurements"
                    );
                }
                self.test_phase(
                    TestBed {
                        left_tx,
                        left_rx,
                        right_tx,
                        right_rx,
                    },
                    (SenderKind::Plain, ReceiverKind::Learning),
                    (SenderKind::Replay, ReceiverKind::Plain),
                    Some(&table),
                )
            }
            _ => {
                // Initiator on the right: the mirror image of case 1
                let table = Arc::new(StateTable::new(self.cfg.state_table_size));
                let TestBed {
                    left_tx,
                    left_rx,
                    right_tx,
                    right_rx,
                } = bed;
                let (right_tx, left_rx) = self.preliminary_phase(
                    right_tx,
                    left_rx,
                    self.cfg.right.cpu_sender,
                    self.cfg.left.cpu_receiver,
                    &table,
                )?;
                if self.cfg.enumerate_ports {
                    warn!(
                        "port number enumeration is supported only in the preliminary \
                         phase of PDV measurements"
                    );
                }
                self.test_phase(
                    TestBed {
                        left_tx,
                        left_rx,
                        right_tx,
                        right_rx,
                    },
                    (SenderKind::Replay, ReceiverKind::Plain),
                    (SenderKind::Plain, ReceiverKind::Learning),
                    Some(&table),
                )
            }
        }
    }
}
