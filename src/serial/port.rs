//! The device handle: a thin adapter between [`DeviceConfig`] and the `serialport` driver.

use serialport::{ClearBuffer, SerialPort};
use tracing::debug;

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DeviceConfig, PortSettings};
use crate::error::Error;
use super::Data;

/// A function for opening serial ports given validated settings.
pub type OpenPortFn =
    Arc<dyn Fn(&PortSettings) -> serialport::Result<Box<dyn SerialPort>> + Send + Sync>;

/// How long a read waits for data. Bounds the time the worker spends away from its requests.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// The size of the buffer used for each read.
const READ_BUF_SIZE: usize = 256;

/// How [`DeviceHandle::poll`] waits for incoming data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Wait up to the port's read timeout. Only for a thread dedicated to the device.
    #[default]
    Wait,
    /// Only read data that has already arrived.
    NoWait,
}

/// What the driver reported alongside a failed I/O call.
#[derive(Debug, PartialEq, Eq)]
enum DriverStatus {
    /// Nothing went wrong; the call simply could not complete yet.
    NoError,
    /// A real fault with a non-empty description.
    Fault(String),
}

impl From<io::Error> for DriverStatus {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock
                | io::ErrorKind::Interrupted
                | io::ErrorKind::TimedOut => DriverStatus::NoError,
            kind => {
                let description = e.to_string();

                if description.is_empty() {
                    DriverStatus::Fault(format!("{:?}", kind))
                } else {
                    DriverStatus::Fault(description)
                }
            }
        }
    }
}

/// Owns the OS-level serial device resource.
///
/// A `DeviceHandle` is only ever touched by the thread that owns it. Writes are queued and flushed
/// by [`poll`][Self::poll], so [`write`][Self::write] never blocks.
pub struct DeviceHandle {
    /// The function to use when opening the serial port.
    open: OpenPortFn,
    /// The internal serial port, if it is opened.
    port: Option<Box<dyn SerialPort>>,
    /// A buffer for reading data from the serial port.
    read_buf: Vec<u8>,
    /// Data waiting to be written. The front entry holds what is left of a partial write.
    to_write: VecDeque<Data>,
    read_mode: ReadMode,
}

impl DeviceHandle {
    /// Creates a new, closed `DeviceHandle` that opens ports by calling `open`.
    pub fn new(open: OpenPortFn) -> Self {
        DeviceHandle {
            open,
            port: None,
            read_buf: vec![0; READ_BUF_SIZE],
            to_write: VecDeque::new(),
            read_mode: ReadMode::default(),
        }
    }

    /// Sets how [`poll`][Self::poll] waits for incoming data.
    pub fn with_read_mode(mut self, read_mode: ReadMode) -> Self {
        self.read_mode = read_mode;
        self
    }

    /// Applies `config` and opens the device.
    ///
    /// Nothing is applied if any field of `config` is rejected, and the handle stays closed if
    /// opening fails.
    pub fn open(&mut self, config: &DeviceConfig) -> Result<(), Error> {
        if self.port.is_some() {
            return Err(Error::Configuration("Device is already open".into()));
        }

        let settings = config.port_settings()?;
        let port = (self.open)(&settings)?;

        debug!(path = %settings.path, "Device opened");
        self.port = Some(port);

        Ok(())
    }

    /// Returns whether the device is open.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Queues `data` to be written and returns immediately. Data written to a closed handle is
    /// dropped.
    pub fn write(&mut self, data: Data) {
        if self.port.is_none() {
            debug!(bytes = data.len(), "Dropping write to closed device");
            return;
        }

        if !data.is_empty() {
            self.to_write.push_back(data);
        }
    }

    /// Closes the device and discards any queued writes. Does nothing if the device is not open.
    pub fn close(&mut self) {
        if let Some(port) = self.port.take() {
            drop(port);
            debug!("Device closed");
        }

        self.to_write.clear();
    }

    /// Writes queued data and reads any data that arrived since the last call.
    ///
    /// Returns `Ok(Some)` with the bytes read, `Ok(None)` if nothing arrived, or `Err` with a
    /// [`DeviceFault`][Error::DeviceFault] if the driver reported an error. Transient conditions
    /// are never reported as errors.
    pub fn poll(&mut self) -> Result<Option<Data>, Error> {
        let port = match self.port {
            Some(ref mut p) => p,
            None => return Ok(None),
        };

        // Write queued data to the port, stopping at the first partial write
        while let Some(data) = self.to_write.front_mut() {
            match write(port.as_mut(), &data[..]) {
                Ok(None) => {
                    self.to_write.pop_front();
                }
                Ok(Some(remaining)) => {
                    *data = remaining;
                    break;
                }
                Err(e) => {
                    check(e)?;
                    break;
                }
            }
        }

        if self.read_mode == ReadMode::NoWait {
            match port.bytes_to_read() {
                Ok(0) => return Ok(None),
                Ok(_) => (),
                Err(e) => return check(e.into()).map(|_| None),
            }
        }

        // Read data from the port as it's received
        match port.read(&mut self.read_buf) {
            Ok(0) => Ok(None),
            Ok(bytes) => Ok(Some(self.read_buf[..bytes].to_vec())),
            Err(e) => check(e).map(|_| None),
        }
    }
}

/// Opens the serial port described by `settings`.
pub fn open_serial_port(settings: &PortSettings) -> serialport::Result<Box<dyn SerialPort>> {
    serialport::new(&settings.path, settings.baud_rate)
        .data_bits(settings.data_bits)
        .parity(settings.parity)
        .stop_bits(settings.stop_bits)
        .flow_control(settings.flow_control)
        .timeout(READ_TIMEOUT)
        .open()
        .and_then(|p| {
            // Clear the serial port buffers to avoid reading garbage data
            p.clear(ClearBuffer::All).map(|_| p)
        })
}

/// Converts an I/O error into `Err` if it is a real fault, filtering out the "no error" case.
fn check(e: io::Error) -> Result<(), Error> {
    match DriverStatus::from(e) {
        DriverStatus::NoError => Ok(()),
        DriverStatus::Fault(description) => Err(Error::DeviceFault(description)),
    }
}

/// Writes `data` to `out`. Returns `Ok(None)` if all the data was successfully written, or
/// `Ok(Some)` with the remaining data otherwise.
fn write<F: Write>(mut out: F, data: &[u8]) -> Result<Option<Vec<u8>>, io::Error> {
    let bytes = out.write(data)?;

    if bytes < data.len() {
        Ok(Some(data[bytes..].to_vec()))
    } else {
        Ok(None)
    }
}
