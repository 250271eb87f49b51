#[cfg(test)]
mod scheduler_test;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::pair::{CandidatePairState, CheckPair, PairId, StreamId};
use crate::stream::Stream;
use crate::transaction::{compute_rto, TransactionOutcome};

/// The triggered-check queue, RFC 8445 §7.3.1.4: a FIFO of pairs that
/// must be checked ahead of the ordinary Waiting-pair sweep because an
/// inbound request or a role-conflict retry named them directly.
/// Shared across every stream of the agent, not one per stream, since
/// RFC 8445 describes a single queue per agent.
#[derive(Default)]
pub struct TriggeredQueue {
    queue: Mutex<VecDeque<(StreamId, PairId)>>,
}

impl TriggeredQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, stream_id: StreamId, pair_id: PairId) {
        self.queue.lock().await.push_back((stream_id, pair_id));
    }

    pub async fn pop(&self) -> Option<(StreamId, PairId)> {
        self.queue.lock().await.pop_front()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

/// The subset of `AgentConfig` the scheduler needs to pace checks and
/// decide when a stalled pair should be abandoned.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Ta in RFC 8445 terms: the base pacing interval between starting
    /// new ordinary checks, scaled by the number of active pairs via
    /// `compute_rto`.
    pub timer_ta: Duration,
    /// A pair whose binding-request count exceeds this is abandoned as
    /// Failed rather than retransmitted again, independent of the STUN
    /// retransmission timer's own `max_retransmissions`.
    pub max_conn_checks: u16,
    /// How long the scheduler can find nothing to do (no triggered
    /// check, no waiting pair, no due transaction) before it considers
    /// the session idle and runs the failure-propagation sweep.
    pub idle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timer_ta: Duration::from_millis(50),
            max_conn_checks: 100,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Drives the per-tick pacing and bookkeeping around which pair
/// should be checked next. Holds no pair or stream state itself --
/// `Stream` owns that -- only the pacing/idle clocks.
pub struct Scheduler {
    config: SchedulerConfig,
    last_activity: Mutex<Instant>,
}

impl Scheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig, now: Instant) -> Self {
        Self {
            config,
            last_activity: Mutex::new(now),
        }
    }

    pub async fn touch(&self, now: Instant) {
        *self.last_activity.lock().await = now;
    }

    pub async fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock().await)
    }

    pub async fn is_idle(&self, now: Instant) -> bool {
        self.config.idle_timeout != Duration::from_secs(0)
            && self.idle_for(now).await >= self.config.idle_timeout
    }

    #[must_use]
    pub fn rto(&self, active_pair_count: usize) -> Duration {
        compute_rto(self.config.timer_ta, active_pair_count)
    }

    #[must_use]
    pub const fn max_conn_checks(&self) -> u16 {
        self.config.max_conn_checks
    }

    /// Picks the next pair to start (or re-drive) a check on: the
    /// triggered queue is drained first (RFC 8445 §7.3.1.4 gives it
    /// priority over the ordinary sweep), filtering out pairs that
    /// have already terminated since being queued. Failing that, the
    /// highest-priority `Waiting` pair across every stream is picked.
    /// If nothing is `Waiting` anywhere and nothing is `InProgress`
    /// either, every stream's `Frozen` pairs are unfrozen once (RFC
    /// 8445 §6.1.2.6) and the sweep is retried.
    pub async fn next_pair(
        &self,
        streams: &[Arc<Stream>],
        triggered: &TriggeredQueue,
    ) -> Option<Arc<CheckPair>> {
        while let Some((stream_id, pair_id)) = triggered.pop().await {
            if let Some(stream) = streams.iter().find(|s| s.id == stream_id) {
                if let Some(pair) = stream.pair(pair_id).await {
                    if !matches!(
                        pair.state(),
                        CandidatePairState::Failed | CandidatePairState::Succeeded
                    ) {
                        return Some(pair);
                    }
                }
            }
        }

        if let Some(pair) = highest_priority_across(streams).await {
            return Some(pair);
        }

        let mut any_active = false;
        for s in streams {
            if s.has_active_pairs().await {
                any_active = true;
            }
        }
        if !any_active {
            for s in streams {
                s.unfreeze_all().await;
            }
            return highest_priority_across(streams).await;
        }

        None
    }
}

async fn highest_priority_across(streams: &[Arc<Stream>]) -> Option<Arc<CheckPair>> {
    let mut best: Option<Arc<CheckPair>> = None;
    for s in streams {
        if let Some(p) = s.highest_priority_waiting().await {
            let replace = best.as_ref().map_or(true, |b| p.priority() > b.priority());
            if replace {
                best = Some(p);
            }
        }
    }
    best
}

/// What the caller should do after `advance_transactions` finds a
/// due STUN transaction.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// The same request body must be resent to `dest`.
    Retransmit {
        stream_id: StreamId,
        pair_id: PairId,
        dest: SocketAddr,
        raw: Vec<u8>,
    },
    /// Every retransmission has been exhausted; the pair has been
    /// moved to `Failed` already.
    TimedOut { stream_id: StreamId, pair_id: PairId },
}

/// Sweeps every `InProgress` pair across every stream for a due STUN
/// retransmission timer, advancing or failing each as appropriate.
/// Grounded in libnice's `priv_conn_check_tick_stream`, generalized
/// across streams. Pairs whose `retransmit` flag is false (discovered
/// pairs, or pairs already pruned) are excluded from retransmission:
/// once they time out, they stay `Failed`.
///
/// Mirrors libnice's early `return TRUE` out of
/// `priv_conn_check_tick_stream`: at most one due transaction is
/// actually advanced (and so retransmitted) per call, because only one
/// outbound STUN request may leave the wire per tick (§4.3). Once a
/// `Retransmit` is produced, the sweep stops without touching any
/// further pair's transaction state, so pairs that merely happened to
/// come due in the same tick are left untouched rather than having
/// their retransmit counter/backoff advanced for a packet that never
/// went out. Timeouts carry no such budget -- a pair whose retries are
/// exhausted fails regardless of how many other pairs are due -- so the
/// sweep keeps scanning after a `TimedOut`.
pub async fn advance_transactions(streams: &[Arc<Stream>], now: Instant) -> Vec<TransactionEvent> {
    let mut events = Vec::new();

    for stream in streams {
        for pair in stream.pairs().await {
            if pair.state() != CandidatePairState::InProgress {
                continue;
            }

            let is_due = {
                let guard = pair.transaction.lock().expect("transaction lock poisoned");
                matches!(guard.as_ref(), Some(txn) if txn.is_due(now))
            };
            if !is_due {
                continue;
            }

            if !pair.retransmit() {
                pair.set_state(CandidatePairState::Failed);
                *pair.transaction.lock().expect("transaction lock poisoned") = None;
                events.push(TransactionEvent::TimedOut {
                    stream_id: pair.stream_id,
                    pair_id: pair.id,
                });
                continue;
            }

            // A retransmission is due. Only now, having committed to
            // actually retransmitting this pair, do we mutate the
            // transaction's backoff state -- then stop scanning so no
            // other pair's state is advanced for a send that doesn't
            // happen this tick.
            let outcome = {
                let mut guard = pair.transaction.lock().expect("transaction lock poisoned");
                guard.as_mut().map(|txn| txn.advance(now))
            };

            match outcome {
                Some(TransactionOutcome::Retransmit) => {
                    let guard = pair.transaction.lock().expect("transaction lock poisoned");
                    if let Some(txn) = guard.as_ref() {
                        events.push(TransactionEvent::Retransmit {
                            stream_id: pair.stream_id,
                            pair_id: pair.id,
                            dest: txn.dest,
                            raw: txn.raw.clone(),
                        });
                    }
                    return events;
                }
                Some(TransactionOutcome::TimedOut) => {
                    pair.set_state(CandidatePairState::Failed);
                    *pair.transaction.lock().expect("transaction lock poisoned") = None;
                    events.push(TransactionEvent::TimedOut {
                        stream_id: pair.stream_id,
                        pair_id: pair.id,
                    });
                }
                None => {}
            }
        }
    }

    events
}
