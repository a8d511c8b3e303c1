//! A mock serial device implementation.

use serialport::{ClearBuffer, DataBits, ErrorKind, FlowControl, Parity, SerialPort, StopBits};

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// How long a read waits for data before timing out, like a real port with a short timeout.
const READ_TIMEOUT: Duration = Duration::from_millis(2);

/// The shared state of a [`TestDevice`].
#[derive(Default)]
struct DeviceState {
    /// Data waiting to be read from the device. Anything written is echoed back into it.
    buf: Vec<u8>,
    /// Every byte ever written to the device, in order.
    written: Vec<u8>,
    /// If set, opening the device fails with this description.
    open_error: Option<String>,
    /// If set, every I/O call on an open port fails with this description.
    fault: Option<String>,
    /// The number of ports opened on the device.
    opens: usize,
    /// The number of opened ports that have since been released.
    releases: usize,
    /// The number of `write` calls that reached the device.
    writes: usize,
    /// The number of `read` calls that reached the device.
    reads: usize,
    /// The number of I/O calls made while no port was open on the device.
    calls_after_release: usize,
}

/// A simple serial device that echoes any data written to it. This type is a handle that can be
/// cloned to control the device from tests while the code under test owns a [`TestPort`] opened
/// on it.
#[derive(Clone, Default)]
pub struct TestDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl TestDevice {
    /// Returns a new `TestDevice` that opens successfully and has no errors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new `TestDevice` whose ports always fail to open with `description`.
    pub fn failing(description: &str) -> Self {
        let device = Self::new();
        device.state().open_error = Some(description.to_string());
        device
    }

    /// Opens a port on this device, as a driver would.
    pub fn open_port(&self) -> serialport::Result<Box<dyn SerialPort>> {
        let mut state = self.state();

        if let Some(ref description) = state.open_error {
            return Err(serialport::Error::new(ErrorKind::NoDevice, description.as_str()));
        }

        state.opens += 1;

        Ok(Box::new(TestPort {
            device: self.clone(),
        }))
    }

    /// Makes all I/O on open ports fail with `description`. Simulates a physical disconnect.
    pub fn set_fault(&self, description: &str) {
        self.state().fault = Some(description.to_string());
    }

    /// Removes a fault set by [`set_fault`][Self::set_fault]. Simulates reconnecting the device.
    pub fn clear_fault(&self) {
        self.state().fault = None;
    }

    /// Queues `data` to be read, as if the device had sent it unprompted.
    pub fn push_incoming(&self, data: &[u8]) {
        self.state().buf.extend_from_slice(data);
    }

    /// Returns whether a port opened on this device has not been released yet.
    pub fn is_open(&self) -> bool {
        let state = self.state();
        state.opens > state.releases
    }

    /// Returns the number of ports opened on this device.
    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    /// Returns the number of opened ports that have since been released.
    pub fn release_count(&self) -> usize {
        self.state().releases
    }

    /// Returns the number of `write` calls that reached the device.
    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    /// Returns the number of `read` calls that reached the device.
    pub fn read_count(&self) -> usize {
        self.state().reads
    }

    /// Returns the number of I/O calls made on a port while every port on the device had already
    /// been released. Anything other than zero means a released handle was still in use.
    pub fn calls_after_release(&self) -> usize {
        self.state().calls_after_release
    }

    /// Returns every byte written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    fn state(&self) -> MutexGuard<DeviceState> {
        self.state.lock().unwrap()
    }
}

/// A port opened on a [`TestDevice`]. Dropping it releases the port.
pub struct TestPort {
    device: TestDevice,
}

impl TestPort {
    // Records an I/O call. Returns `Err` if a fault was injected into the device, or `Ok`
    // otherwise.
    fn try_access(&self) -> io::Result<()> {
        let mut state = self.device.state();

        if state.opens <= state.releases {
            state.calls_after_release += 1;
        }

        match state.fault {
            Some(ref description) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, description.as_str()))
            }
            None => Ok(()),
        }
    }
}

impl Drop for TestPort {
    fn drop(&mut self) {
        self.device.state().releases += 1;
    }
}

impl Write for TestPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_access()?;

        let mut state = self.device.state();
        state.writes += 1;
        state.written.extend_from_slice(buf);
        state.buf.extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.try_access()
    }
}

impl Read for TestPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_access()?;

        let bytes = {
            let mut state = self.device.state();
            state.reads += 1;

            // Read bytes equal to the smaller of the lengths of the target buffer and the internal
            // buffer
            let bytes = buf.len().min(state.buf.len());
            buf[..bytes].copy_from_slice(&state.buf[..bytes]);
            state.buf.drain(..bytes);

            bytes
        };

        if bytes == 0 && !buf.is_empty() {
            // Nothing arrived within the timeout
            thread::sleep(READ_TIMEOUT);
            return Err(io::ErrorKind::TimedOut.into());
        }

        Ok(bytes)
    }
}

impl SerialPort for TestPort {
    fn name(&self) -> Option<String> {
        None
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        self.try_access().map(|_| 115_200).map_err(Into::into)
    }

    fn data_bits(&self) -> serialport::Result<DataBits> {
        self.try_access().map(|_| DataBits::Eight).map_err(Into::into)
    }

    fn flow_control(&self) -> serialport::Result<FlowControl> {
        self.try_access().map(|_| FlowControl::None).map_err(Into::into)
    }

    fn parity(&self) -> serialport::Result<Parity> {
        self.try_access().map(|_| Parity::None).map_err(Into::into)
    }

    fn timeout(&self) -> Duration {
        READ_TIMEOUT
    }

    fn set_baud_rate(&mut self, _baud_rate: u32) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn stop_bits(&self) -> serialport::Result<StopBits> {
        self.try_access().map(|_| StopBits::One).map_err(Into::into)
    }

    fn set_data_bits(&mut self, _data_bits: DataBits) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn set_flow_control(&mut self, _flow_control: FlowControl) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn set_parity(&mut self, _parity: Parity) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn set_stop_bits(&mut self, _stop_bits: StopBits) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn set_timeout(&mut self, _timeout: Duration) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn write_request_to_send(&mut self, _level: bool) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn write_data_terminal_ready(&mut self, _level: bool) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
        self.try_access().map(|_| true).map_err(Into::into)
    }

    fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
        self.try_access().map(|_| false).map_err(Into::into)
    }

    fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
        self.try_access().map(|_| true).map_err(Into::into)
    }

    fn bytes_to_read(&self) -> serialport::Result<u32> {
        self.try_access().map_err(serialport::Error::from)?;
        Ok(self.device.state().buf.len() as u32)
    }

    fn bytes_to_write(&self) -> serialport::Result<u32> {
        self.try_access().map(|_| 0).map_err(Into::into)
    }

    fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
        self.try_access().map(|_| true).map_err(Into::into)
    }

    fn clear(&self, buffer_to_clear: ClearBuffer) -> serialport::Result<()> {
        self.try_access().map_err(serialport::Error::from)?;

        if let ClearBuffer::Input | ClearBuffer::All = buffer_to_clear {
            self.device.state().buf.clear();
        }

        Ok(())
    }

    fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
        Err(serialport::Error::new(ErrorKind::Unknown, "Test ports cannot be cloned"))
    }

    fn set_break(&self) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }

    fn clear_break(&self) -> serialport::Result<()> {
        self.try_access().map_err(Into::into)
    }
}
