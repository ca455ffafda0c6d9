use log::{debug, error, info};
use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::settings::ParityConfig;
use crate::utils::error::ModbusError;

/// Pull side of the serial line. `receive` blocks until a byte is available.
pub trait ByteSource {
    fn receive(&mut self) -> Result<u8, ModbusError>;

    /// Returns a byte only if one is already on the line, without waiting.
    fn try_receive(&mut self) -> Result<Option<u8>, ModbusError>;
}

/// Push side of the serial line.
pub trait ByteSink {
    fn send(&mut self, byte: u8) -> Result<(), ModbusError>;

    fn flush(&mut self) -> Result<(), ModbusError> {
        Ok(())
    }
}

impl<T: ByteSource + ?Sized> ByteSource for &mut T {
    fn receive(&mut self) -> Result<u8, ModbusError> {
        (**self).receive()
    }

    fn try_receive(&mut self) -> Result<Option<u8>, ModbusError> {
        (**self).try_receive()
    }
}

impl<T: ByteSink + ?Sized> ByteSink for &mut T {
    fn send(&mut self, byte: u8) -> Result<(), ModbusError> {
        (**self).send(byte)
    }

    fn flush(&mut self) -> Result<(), ModbusError> {
        (**self).flush()
    }
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    stop: Arc<AtomicBool>,
    receive_timeout: Option<Duration>,
}

impl SerialTransport {
    /// Opens the port with 8 data bits and 1 stop bit.
    ///
    /// `poll_interval` is the read timeout of the underlying port. A timed out
    /// read is retried, so `receive` still blocks; the interval only bounds how
    /// long a raised `stop` flag takes to be noticed.
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        parity: &ParityConfig,
        poll_interval: Duration,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, ModbusError> {
        info!("🔌 Opening Modbus RTU port: {}", port_name);
        info!("⚙️  Configuration: {} baud, 8 data bits, {:?} parity, 1 stop bit", baud_rate, parity);

        let serial_parity = match parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(port_name, baud_rate)
            .timeout(poll_interval)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serial_parity)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", port_name, e);
                ModbusError::ConnectionError(format!("Failed to open port: {}", e))
            })?;

        info!("Serial port {} ready", port_name);
        Ok(Self {
            port,
            stop,
            receive_timeout: None,
        })
    }

    /// Makes `receive` give up with `ModbusError::Timeout` after waiting
    /// `timeout` for a single byte. Slaves leave this unset.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }
}

impl ByteSource for SerialTransport {
    fn receive(&mut self) -> Result<u8, ModbusError> {
        let started = Instant::now();
        let mut byte = [0u8; 1];
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(ModbusError::Shutdown);
            }
            if let Some(limit) = self.receive_timeout {
                if started.elapsed() >= limit {
                    return Err(ModbusError::Timeout);
                }
            }
            match self.port.read(&mut byte) {
                Ok(1) => return Ok(byte[0]),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ModbusError::CommunicationError(format!("Read failed: {}", e)));
                }
            }
        }
    }

    fn try_receive(&mut self) -> Result<Option<u8>, ModbusError> {
        if self.port.bytes_to_read()? == 0 {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(1) => Ok(Some(byte[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(ModbusError::CommunicationError(format!("Read failed: {}", e))),
        }
    }
}

impl ByteSink for SerialTransport {
    fn send(&mut self, byte: u8) -> Result<(), ModbusError> {
        self.port
            .write_all(&[byte])
            .map_err(|e| ModbusError::CommunicationError(format!("Write failed: {}", e)))
    }

    fn flush(&mut self) -> Result<(), ModbusError> {
        self.port
            .flush()
            .map_err(|e| ModbusError::CommunicationError(format!("Flush failed: {}", e)))
    }
}

/// In-memory line. Every `feed` queues one burst of back-to-back bytes;
/// bursts are separated by idle line time.
///
/// `try_receive` only hands out what is left of the burst currently on the
/// line, so a silence wait drains it and then sees an idle line. `receive`
/// moves on to the next burst once the current one is used up. Running out
/// of input yields `ModbusError::TransportClosed` instead of blocking.
#[derive(Debug, Default)]
pub struct BufferTransport {
    current: VecDeque<u8>,
    queued: VecDeque<VecDeque<u8>>,
    tx: Vec<u8>,
    flushed: usize,
}

impl BufferTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(bytes: &[u8]) -> Self {
        let mut transport = Self::new();
        transport.feed(bytes);
        transport
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.queued.push_back(bytes.iter().copied().collect());
        }
    }

    pub fn pending(&self) -> usize {
        self.current.len() + self.queued.iter().map(VecDeque::len).sum::<usize>()
    }

    pub fn sent(&self) -> &[u8] {
        &self.tx
    }

    pub fn take_sent(&mut self) -> Vec<u8> {
        self.flushed = 0;
        std::mem::take(&mut self.tx)
    }
}

impl ByteSource for BufferTransport {
    fn receive(&mut self) -> Result<u8, ModbusError> {
        while self.current.is_empty() {
            self.current = self.queued.pop_front().ok_or(ModbusError::TransportClosed)?;
        }
        self.current.pop_front().ok_or(ModbusError::TransportClosed)
    }

    fn try_receive(&mut self) -> Result<Option<u8>, ModbusError> {
        Ok(self.current.pop_front())
    }
}

impl ByteSink for BufferTransport {
    fn send(&mut self, byte: u8) -> Result<(), ModbusError> {
        self.tx.push(byte);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ModbusError> {
        let frame = &self.tx[self.flushed..];
        debug!("📤 Buffered {} bytes: {}", frame.len(), hex::encode_upper(frame));
        self.flushed = self.tx.len();
        Ok(())
    }
}
