//! In this module, we implement all the monitoring logic for the display loop.
//! This includes the CPU load task, the one-shot LEDs for overflow and clipping,
//! and the small shared cells background tasks publish their latest readings through.
//!
//! Cells are replaced atomically as a whole. Readers may see a value that is
//! up to one polling interval old, which is fine for display purposes.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_utils::atomic::AtomicCell;
use nix::sys::resource::{getrusage, UsageWho};
use tracing::{debug, warn};

/// A value written by one task and read by others without blocking
pub type SharedCell<T> = Arc<AtomicCell<T>>;

const STOP_CHECK: Duration = Duration::from_millis(50);

/// Sleep for `interval`, waking early if `stop` is raised. Returns false once stopped.
pub(crate) fn sleep_unless_stopped(interval: Duration, stop: &AtomicBool) -> bool {
    let start = Instant::now();
    while !stop.load(Ordering::Acquire) {
        let elapsed = start.elapsed();
        if elapsed >= interval {
            return true;
        }
        thread::sleep(STOP_CHECK.min(interval - elapsed));
    }
    false
}

/// Process CPU usage as fractions of wall time, plus the 1-minute load average
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuLoad {
    pub user: f32,
    pub system: f32,
    pub load_avg: f32,
}

#[derive(Clone, Copy, Debug)]
struct CpuTimes {
    user: f64,
    system: f64,
    wall: Instant,
}

fn cpu_times() -> Option<CpuTimes> {
    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let secs = |tv: nix::sys::time::TimeVal| tv.tv_sec() as f64 + tv.tv_usec() as f64 * 1e-6;
    Some(CpuTimes {
        user: secs(usage.user_time()),
        system: secs(usage.system_time()),
        wall: Instant::now(),
    })
}

/// One minute load average, 0 where the platform has none
fn load_average() -> f32 {
    let mut avg = [0f64; 1];
    // SAFETY: the buffer holds the single element requested
    let got = unsafe { libc::getloadavg(avg.as_mut_ptr(), 1) };
    if got < 1 {
        return 0.0;
    }
    avg[0] as f32
}

fn load_between(before: &CpuTimes, after: &CpuTimes, load_avg: f32) -> CpuLoad {
    let wall = after.wall.duration_since(before.wall).as_secs_f64();
    if wall <= 0.0 {
        return CpuLoad {
            load_avg,
            ..Default::default()
        };
    }
    CpuLoad {
        user: ((after.user - before.user) / wall) as f32,
        system: ((after.system - before.system) / wall) as f32,
        load_avg,
    }
}

/// Start the CPU load task. It publishes a new reading every `interval` until `stop` is raised.
pub fn spawn_load_monitor(
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> std::io::Result<(SharedCell<CpuLoad>, JoinHandle<()>)> {
    let cell: SharedCell<CpuLoad> = Arc::new(AtomicCell::new(CpuLoad {
        load_avg: load_average(),
        ..Default::default()
    }));
    let publish = cell.clone();
    let handle = thread::Builder::new()
        .name("cpu-load".into())
        .spawn(move || {
            let mut last = match cpu_times() {
                Some(t) => t,
                None => {
                    warn!("getrusage unavailable, CPU load monitor disabled");
                    return;
                }
            };
            while sleep_unless_stopped(interval, &stop) {
                if let Some(now) = cpu_times() {
                    let load = load_between(&last, &now, load_average());
                    debug!(?load, "CPU load");
                    publish.store(load);
                    last = now;
                }
            }
        })?;
    Ok((cell, handle))
}

/// A one-shot indicator: lit for `hold` display cycles after each trip
#[derive(Debug, Clone, Copy)]
pub struct Led {
    hold: u32,
    remaining: u32,
}

impl Default for Led {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Led {
    pub fn new(hold: u32) -> Self {
        Self {
            hold: hold.max(1),
            remaining: 0,
        }
    }

    pub fn trip(&mut self) {
        self.remaining = self.hold;
    }

    /// Called once per display cycle, returns whether the LED is lit this cycle
    pub fn poll(&mut self) -> bool {
        if self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            false
        }
    }
}
