//! This module contains all the capture-side buffering logic

// The hardware callback does one thing, as fast as possible: hand the block
// over and return. Blocks go through an rtrb ring buffer to the consumer in
// another thread. The producer never blocks; if the ring is full the block is
// dropped and the overflow flag is raised for the display.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::warn;

use crate::{
    complex::{Iq, SampleBlock},
    error::QueueError,
};

/// Default number of queued blocks the consumer waits for
pub const MIN_FILL: usize = 4;
/// Default time without data after which the stream is declared stalled
pub const STALL_TIMEOUT: Duration = Duration::from_secs(4);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Block decimation.
///
/// `N > 0` discards every `(N+1)`th block, `N < 0` keeps only every `(-N+1)`th
/// block, and `N = 0` keeps everything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SkipPolicy(pub i32);

#[derive(Debug, Default)]
struct SkipCounter {
    policy: SkipPolicy,
    count: u32,
}

impl SkipCounter {
    fn new(policy: SkipPolicy) -> Self {
        Self { policy, count: 0 }
    }

    /// Advance the rolling counter, returning whether this block is kept
    fn keep(&mut self) -> bool {
        let n = self.policy.0.unsigned_abs();
        match self.policy.0 {
            0 => true,
            p if p > 0 => {
                if self.count >= n {
                    self.count = 0;
                    false
                } else {
                    self.count += 1;
                    true
                }
            }
            _ => {
                if self.count >= n {
                    self.count = 0;
                    true
                } else {
                    self.count += 1;
                    false
                }
            }
        }
    }
}

/// Status shared between the producer and the display
#[derive(Debug, Default)]
pub struct QueueStatus {
    overflow: AtomicBool,
    hardware_overrun: AtomicBool,
    drops: AtomicU64,
    arrivals: AtomicU64,
}

impl QueueStatus {
    /// Read and clear the overflow flag
    pub fn take_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::AcqRel)
    }

    /// Read and clear the overrun reported by the source itself
    pub fn take_hardware_overrun(&self) -> bool {
        self.hardware_overrun.swap(false, Ordering::AcqRel)
    }

    /// Total blocks dropped because the queue was full
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Total blocks delivered by the source, kept or not
    pub fn arrivals(&self) -> u64 {
        self.arrivals.load(Ordering::Relaxed)
    }
}

/// Producer half, owned by the hardware callback context
pub struct QueueProducer {
    ring: rtrb::Producer<SampleBlock>,
    skip: SkipCounter,
    discard_first: usize,
    discard_left: usize,
    seq: u64,
    status: Arc<QueueStatus>,
}

/// Consumer half, owned by the processing loop
pub struct QueueConsumer {
    ring: rtrb::Consumer<SampleBlock>,
    status: Arc<QueueStatus>,
    capacity: usize,
    timeout: Duration,
    poll: Duration,
}

/// Build a bounded sample queue of `capacity` blocks
pub fn sample_queue(
    capacity: usize,
    skip: SkipPolicy,
    discard_first: usize,
) -> (QueueProducer, QueueConsumer) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    let status = Arc::new(QueueStatus::default());
    (
        QueueProducer {
            ring: producer,
            skip: SkipCounter::new(skip),
            discard_first,
            discard_left: discard_first,
            seq: 0,
            status: status.clone(),
        },
        QueueConsumer {
            ring: consumer,
            status,
            capacity,
            timeout: STALL_TIMEOUT,
            poll: POLL_INTERVAL,
        },
    )
}

impl QueueProducer {
    /// Offer one block from the source. Never blocks.
    ///
    /// Returns true if the block was enqueued. Startup discards and skip
    /// decimation return false without touching the ring; a full ring drops
    /// the block and raises the overflow flag.
    pub fn push(&mut self, samples: Vec<Iq>) -> bool {
        let seq = self.seq;
        self.seq += 1;
        self.status.arrivals.fetch_add(1, Ordering::Relaxed);
        if self.discard_left > 0 {
            self.discard_left -= 1;
            return false;
        }
        if !self.skip.keep() {
            return false;
        }
        match self.ring.push(SampleBlock::new(seq, samples)) {
            Ok(()) => true,
            Err(rtrb::PushError::Full(_)) => {
                self.status.drops.fetch_add(1, Ordering::Relaxed);
                self.status.overflow.store(true, Ordering::Release);
                false
            }
        }
    }

    /// The source itself reported lost data (e.g. an input overflow in the driver)
    pub fn report_overrun(&self) {
        self.status.hardware_overrun.store(true, Ordering::Release);
    }

    /// Reset startup discards and the skip counter for a (re)started stream
    pub fn restart(&mut self) {
        self.discard_left = self.discard_first;
        self.skip = SkipCounter::new(self.skip.policy);
    }

    pub fn status(&self) -> Arc<QueueStatus> {
        self.status.clone()
    }
}

impl QueueConsumer {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn status(&self) -> Arc<QueueStatus> {
        self.status.clone()
    }

    /// Number of blocks currently pending
    pub fn len(&self) -> usize {
        self.ring.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Wait (sleeping in bounded steps) until `min_fill` blocks are pending, then take the oldest.
    ///
    /// `min_fill` is clamped to `1..=capacity`. Once the producer has hung up,
    /// remaining blocks are handed out without waiting for the fill level.
    /// Waiting longer than the timeout is a stall.
    pub fn pop_when_ready(&mut self, min_fill: usize) -> Result<SampleBlock, QueueError> {
        let min_fill = min_fill.clamp(1, self.capacity);
        let start = Instant::now();
        loop {
            // Check for hang-up first so every block pushed before it is counted
            let abandoned = self.ring.is_abandoned();
            let pending = self.ring.slots();
            if pending >= min_fill || (abandoned && pending > 0) {
                if let Ok(block) = self.ring.pop() {
                    return Ok(block);
                }
            } else if abandoned {
                return Err(QueueError::Closed);
            }
            let waited = start.elapsed();
            if waited >= self.timeout {
                warn!(pending, "Timed out waiting for queue to fill");
                return Err(QueueError::Stalled { waited });
            }
            thread::sleep(self.poll.min(self.timeout - waited));
        }
    }

    /// Throw away everything pending, returning how many blocks were dropped
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.ring.pop().is_ok() {
            n += 1;
        }
        n
    }
}
