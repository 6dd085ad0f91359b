//! Frequency control
//!
//! All rig I/O happens on one background task. The display loop only sees a
//! [`RigHandle`]: the last frequency read, a slot for a pending change request,
//! and an availability flag that drops (for good) once the link has failed
//! past its retry budget.

use std::{
    io::{BufRead, BufReader, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_utils::atomic::AtomicCell;
use tracing::{debug, info, warn};

use crate::{
    error::RigError,
    monitoring::{sleep_unless_stopped, SharedCell},
};

/// Default rigctld endpoint
pub const RIGCTLD_ADDRESS: &str = "127.0.0.1:4532";
const IO_TIMEOUT: Duration = Duration::from_secs(2);

pub trait FrequencyControl: Send {
    /// Current receive frequency in Hz
    fn get_frequency(&mut self) -> Result<u64, RigError>;
    fn set_frequency(&mut self, hz: u64) -> Result<(), RigError>;
}

/// Client for Hamlib's rigctld network daemon
pub struct Rigctld {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Rigctld {
    pub fn connect(address: &str) -> Result<Self, RigError> {
        let addr = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RigError::Protocol(format!("no address for {address}")))?;
        let stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        info!(%addr, "Connected to rigctld");
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn command(&mut self, cmd: &str) -> Result<String, RigError> {
        self.writer.write_all(cmd.as_bytes())?;
        self.writer.write_all(b"\n")?;
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(RigError::Disconnected);
        }
        Ok(line.trim().to_owned())
    }
}

/// Parse an `RPRT n` status line, if that is what `line` is
fn report_code(line: &str) -> Option<Result<i32, RigError>> {
    let code = line.strip_prefix("RPRT")?.trim();
    Some(
        code.parse()
            .map_err(|_| RigError::Protocol(line.to_owned())),
    )
}

fn parse_frequency(line: &str) -> Result<u64, RigError> {
    if let Some(code) = report_code(line) {
        return Err(RigError::Report(code?));
    }
    // Some rigctld builds answer with a decimal point
    line.parse::<f64>()
        .ok()
        .filter(|hz| hz.is_finite() && *hz >= 0.0)
        .map(|hz| hz.round() as u64)
        .ok_or_else(|| RigError::Protocol(line.to_owned()))
}

impl FrequencyControl for Rigctld {
    fn get_frequency(&mut self) -> Result<u64, RigError> {
        let line = self.command("f")?;
        parse_frequency(&line)
    }

    fn set_frequency(&mut self, hz: u64) -> Result<(), RigError> {
        let line = self.command(&format!("F {hz}"))?;
        match report_code(&line) {
            Some(Ok(0)) => Ok(()),
            Some(Ok(code)) => Err(RigError::Report(code)),
            Some(Err(e)) => Err(e),
            None => Err(RigError::Protocol(line)),
        }
    }
}

/// A tuner that only remembers what it was told, for sources without a real front end
#[derive(Debug, Clone, Copy)]
pub struct MemoryTuner {
    hz: u64,
}

impl MemoryTuner {
    pub fn new(hz: u64) -> Self {
        Self { hz }
    }
}

impl FrequencyControl for MemoryTuner {
    fn get_frequency(&mut self) -> Result<u64, RigError> {
        Ok(self.hz)
    }

    fn set_frequency(&mut self, hz: u64) -> Result<(), RigError> {
        self.hz = hz;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ControlKind {
    /// No frequency control
    None,
    /// Remember the last tuned frequency without any hardware
    Memory,
    /// Hamlib rigctld over TCP
    Hamlib,
}

/// The frequency control chosen at startup
pub enum Control {
    None,
    Memory(MemoryTuner),
    Hamlib(Rigctld),
}

impl FrequencyControl for Control {
    fn get_frequency(&mut self) -> Result<u64, RigError> {
        match self {
            Control::None => Err(RigError::Disconnected),
            Control::Memory(t) => t.get_frequency(),
            Control::Hamlib(r) => r.get_frequency(),
        }
    }

    fn set_frequency(&mut self, hz: u64) -> Result<(), RigError> {
        match self {
            Control::None => Err(RigError::Disconnected),
            Control::Memory(t) => t.set_frequency(hz),
            Control::Hamlib(r) => r.set_frequency(hz),
        }
    }
}

/// Bounded retries with exponential backoff for one rig operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn run<T>(
        &self,
        stop: &AtomicBool,
        mut op: impl FnMut() -> Result<T, RigError>,
    ) -> Result<T, RigError> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= self.attempts.max(1) => return Err(e),
                Err(e) => {
                    debug!(attempt, error = %e, "Rig operation failed, retrying");
                    if !sleep_unless_stopped(delay, stop) {
                        return Err(e);
                    }
                    delay = (delay * 2).min(self.max_backoff);
                    attempt += 1;
                }
            }
        }
    }
}

/// The display loop's view of the rig task
#[derive(Clone)]
pub struct RigHandle {
    frequency: SharedCell<Option<u64>>,
    request: SharedCell<Option<u64>>,
    available: Arc<AtomicBool>,
}

impl RigHandle {
    fn new(available: bool) -> Self {
        Self {
            frequency: Arc::new(AtomicCell::new(None)),
            request: Arc::new(AtomicCell::new(None)),
            available: Arc::new(AtomicBool::new(available)),
        }
    }

    /// A handle for running without frequency control
    pub fn unavailable() -> Self {
        Self::new(false)
    }

    /// Last frequency read from the rig, in Hz
    pub fn frequency(&self) -> Option<u64> {
        self.frequency.load()
    }

    /// Ask the rig task to retune; a newer request replaces an unserved one
    pub fn request_frequency(&self, hz: u64) {
        self.request.store(Some(hz));
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn give_up(&self, error: &RigError) {
        warn!(%error, "Rig control unavailable, continuing without it");
        self.available.store(false, Ordering::Release);
    }
}

/// Start the task that owns `rig`, polling it every `interval`
pub fn spawn_rig_task<R: FrequencyControl + 'static>(
    mut rig: R,
    interval: Duration,
    retry: RetryPolicy,
    stop: Arc<AtomicBool>,
) -> std::io::Result<(RigHandle, JoinHandle<()>)> {
    let handle = RigHandle::new(true);
    let task = handle.clone();
    let join = thread::Builder::new()
        .name("rig-control".into())
        .spawn(move || loop {
            if let Some(hz) = task.request.take() {
                if task.frequency.load() != Some(hz) {
                    if let Err(e) = retry.run(&stop, || rig.set_frequency(hz)) {
                        task.give_up(&e);
                        return;
                    }
                    debug!(hz, "Rig retuned");
                }
            }
            match retry.run(&stop, || rig.get_frequency()) {
                Ok(hz) => task.frequency.store(Some(hz)),
                Err(e) => {
                    task.give_up(&e);
                    return;
                }
            }
            if !sleep_unless_stopped(interval, &stop) {
                return;
            }
        })?;
    Ok((handle, join))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpListener, time::Instant};

    struct FlakyRig {
        hz: u64,
        failures_left: u32,
        calls: Arc<AtomicCell<u32>>,
    }

    impl FrequencyControl for FlakyRig {
        fn get_frequency(&mut self) -> Result<u64, RigError> {
            self.calls.fetch_add(1);
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(RigError::Disconnected);
            }
            Ok(self.hz)
        }

        fn set_frequency(&mut self, hz: u64) -> Result<(), RigError> {
            self.hz = hz;
            Ok(())
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn parses_replies() {
        assert_eq!(parse_frequency("14074000").unwrap(), 14_074_000);
        assert_eq!(parse_frequency("7074000.000000").unwrap(), 7_074_000);
        assert!(matches!(parse_frequency("RPRT -11"), Err(RigError::Report(-11))));
        assert!(matches!(parse_frequency("bogus"), Err(RigError::Protocol(_))));
    }

    #[test]
    fn transient_failures_are_retried() {
        let stop = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicCell::new(0));
        let rig = FlakyRig {
            hz: 7_000_000,
            failures_left: 2,
            calls: calls.clone(),
        };
        let (handle, join) =
            spawn_rig_task(rig, Duration::from_millis(5), quick_retry(), stop.clone()).unwrap();
        assert!(wait_for(|| handle.frequency() == Some(7_000_000)));
        assert!(handle.is_available());
        handle.request_frequency(14_000_000);
        assert!(wait_for(|| handle.frequency() == Some(14_000_000)));
        stop.store(true, Ordering::Release);
        join.join().unwrap();
        assert!(calls.load() >= 3);
    }

    #[test]
    fn persistent_failure_goes_unavailable() {
        let stop = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicCell::new(0));
        let rig = FlakyRig {
            hz: 0,
            failures_left: u32::MAX,
            calls: calls.clone(),
        };
        let (handle, join) =
            spawn_rig_task(rig, Duration::from_millis(5), quick_retry(), stop).unwrap();
        // The task ends on its own, it does not retry forever
        join.join().unwrap();
        assert!(!handle.is_available());
        assert_eq!(handle.frequency(), None);
        assert_eq!(calls.load(), 3);
    }

    #[test]
    fn rigctld_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut hz = 3_500_000u64;
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                let cmd = line.trim().to_owned();
                line.clear();
                if cmd == "f" {
                    writeln!(writer, "{hz}").unwrap();
                } else if let Some(arg) = cmd.strip_prefix("F ") {
                    match arg.parse() {
                        Ok(v) if v > 0 => {
                            hz = v;
                            writeln!(writer, "RPRT 0").unwrap();
                        }
                        _ => writeln!(writer, "RPRT -1").unwrap(),
                    }
                }
            }
        });

        let mut rig = Rigctld::connect(&addr).unwrap();
        assert_eq!(rig.get_frequency().unwrap(), 3_500_000);
        rig.set_frequency(7_100_000).unwrap();
        assert_eq!(rig.get_frequency().unwrap(), 7_100_000);
        assert!(matches!(rig.set_frequency(0), Err(RigError::Report(-1))));
        drop(rig);
        server.join().unwrap();
    }

    #[test]
    fn no_control_is_an_error_not_a_panic() {
        let mut c = Control::None;
        assert!(c.get_frequency().is_err());
        let mut c = Control::Memory(MemoryTuner::new(10));
        c.set_frequency(20).unwrap();
        assert_eq!(c.get_frequency().unwrap(), 20);
        assert!(!RigHandle::unavailable().is_available());
    }
}
