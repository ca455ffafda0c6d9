use log::trace;
use std::time::Instant;

use super::transport::ByteSource;
use crate::utils::error::ModbusError;

/// Bits on the wire per character: start, eight data, stop.
pub const BITS_PER_CHAR: u64 = 10;

/// Timer preload for a 3.5 character gap: `round(3.5 * 10 * clock / baud)`.
pub fn silence_ticks(clock_frequency_hz: u32, baud_rate: u32) -> Result<u32, ModbusError> {
    if baud_rate == 0 {
        return Err(ModbusError::ConfigError("baud rate must be non-zero".to_string()));
    }
    if clock_frequency_hz == 0 {
        return Err(ModbusError::ConfigError("clock frequency must be non-zero".to_string()));
    }

    // 3.5 chars expressed as 7 / 2 so the rounding stays in integers
    let numerator = 7 * BITS_PER_CHAR * clock_frequency_hz as u64;
    let denominator = 2 * baud_rate as u64;
    let ticks = (numerator + denominator / 2) / denominator;

    u32::try_from(ticks).map_err(|_| {
        ModbusError::ConfigError(format!(
            "silence preload {} ticks does not fit the 32-bit timer",
            ticks
        ))
    })
}

/// Countdown timer with a latched "done" flag, shaped after the device's
/// memory-mapped timer (preload, clear, enable).
pub trait SilenceTimer {
    fn load(&mut self, ticks: u32);
    fn clear(&mut self);
    fn enable(&mut self);
    fn disable(&mut self);
    fn is_done(&mut self) -> bool;
}

impl<T: SilenceTimer + ?Sized> SilenceTimer for &mut T {
    fn load(&mut self, ticks: u32) {
        (**self).load(ticks)
    }

    fn clear(&mut self) {
        (**self).clear()
    }

    fn enable(&mut self) {
        (**self).enable()
    }

    fn disable(&mut self) {
        (**self).disable()
    }

    fn is_done(&mut self) -> bool {
        (**self).is_done()
    }
}

/// Monotonic tick source for `HostTimer`.
pub trait Clock {
    fn ticks(&self) -> u64;
}

/// Wall clock scaled to the configured timer frequency.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
    frequency_hz: u32,
}

impl SystemClock {
    pub fn new(frequency_hz: u32) -> Self {
        Self {
            origin: Instant::now(),
            frequency_hz,
        }
    }
}

impl Clock for SystemClock {
    fn ticks(&self) -> u64 {
        let nanos = self.origin.elapsed().as_nanos();
        (nanos * self.frequency_hz as u128 / 1_000_000_000) as u64
    }
}

/// Software rendition of the hardware countdown on top of a `Clock`.
///
/// Counting starts at `enable`. Once the preload has elapsed the done flag
/// latches and stays set until `clear`, even if the timer is disabled.
#[derive(Debug)]
pub struct HostTimer<C: Clock> {
    clock: C,
    preload: u32,
    started_at: Option<u64>,
    done: bool,
}

impl<C: Clock> HostTimer<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            preload: 0,
            started_at: None,
            done: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }
}

impl<C: Clock> SilenceTimer for HostTimer<C> {
    fn load(&mut self, ticks: u32) {
        self.preload = ticks;
    }

    fn clear(&mut self) {
        self.done = false;
        if self.started_at.is_some() {
            self.started_at = Some(self.clock.ticks());
        }
    }

    fn enable(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(self.clock.ticks());
        }
    }

    fn disable(&mut self) {
        self.started_at = None;
    }

    fn is_done(&mut self) -> bool {
        if let Some(start) = self.started_at {
            if self.clock.ticks().saturating_sub(start) >= self.preload as u64 {
                self.done = true;
            }
        }
        self.done
    }
}

/// Blocks until the line has been idle for 3.5 character times.
pub struct SilenceDetector<T: SilenceTimer> {
    timer: T,
    ticks: u32,
}

impl<T: SilenceTimer> SilenceDetector<T> {
    /// Computes and loads the preload once; every later `wait` reuses it.
    pub fn new(mut timer: T, clock_frequency_hz: u32, baud_rate: u32) -> Result<Self, ModbusError> {
        let ticks = silence_ticks(clock_frequency_hz, baud_rate)?;
        timer.disable();
        timer.clear();
        timer.load(ticks);
        Ok(Self { timer, ticks })
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Arms the timer and polls it until the line has stayed quiet for the
    /// whole preload, then disarms it again, so the timer is never left
    /// running into frame reception.
    ///
    /// Any byte seen while armed belongs to a frame already in progress: it is
    /// thrown away and the countdown restarts. Returns the number of bytes
    /// discarded.
    pub fn wait<R: ByteSource + ?Sized>(&mut self, line: &mut R) -> Result<usize, ModbusError> {
        self.timer.clear();
        self.timer.enable();

        let mut discarded = 0;
        let mut polls: u64 = 0;
        loop {
            if line.try_receive()?.is_some() {
                discarded += 1;
                self.timer.clear();
                continue;
            }
            if self.timer.is_done() {
                break;
            }
            polls += 1;
            std::hint::spin_loop();
        }

        self.timer.disable();
        self.timer.clear();
        trace!(
            "Line silent after {} polls ({} ticks), {} stray bytes discarded",
            polls,
            self.ticks,
            discarded
        );
        Ok(discarded)
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn into_timer(self) -> T {
        self.timer
    }
}
