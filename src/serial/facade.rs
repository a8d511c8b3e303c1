//! The device facade: a small state machine over one [`DeviceHandle`] that reports everything it
//! does as [`Event`]s.

use tracing::{debug, info, warn};

use std::mem;

use crate::config::DeviceConfig;
use super::{ConnectionState, Data, DeviceHandle, Event, EventSender, OpenPortFn, ReadMode};

/// Returned by the facade when the worker hosting it must shut down.
///
/// By the time one of these is returned, the facade has released its device handle. [`close`]
/// returns exactly one per call.
///
/// [`close`]: Facade::close
#[must_use = "the worker hosting the facade must shut down"]
#[derive(Debug, PartialEq, Eq)]
pub struct ShutdownRequest {
    _private: (),
}

impl ShutdownRequest {
    fn new() -> Self {
        ShutdownRequest {
            _private: (),
        }
    }
}

/// The connection to the device. Each open cycle gets a fresh handle.
enum Connection {
    Closed,
    Open(DeviceHandle),
}

/// Presents an open/write/close surface over a serial device and emits an [`Event`] for every
/// state change, data arrival and error.
///
/// A facade lives entirely inside one execution context; nothing in it is shared.
pub struct Facade {
    /// The function each new device handle uses to open the port.
    open: OpenPortFn,
    /// The connection state, owning the device handle while open.
    connection: Connection,
    /// A sender for events to the controller.
    events: EventSender,
    /// How each new device handle waits for incoming data.
    read_mode: ReadMode,
}

impl Facade {
    /// Creates a new, closed `Facade` that opens devices with `open` and emits events on `events`.
    ///
    /// [`poll`][Self::poll] waits briefly for incoming data, so the facade should have a thread to
    /// itself.
    pub fn new(open: OpenPortFn, events: EventSender) -> Self {
        Facade {
            open,
            connection: Connection::Closed,
            events,
            read_mode: ReadMode::Wait,
        }
    }

    /// Like [`new`][Self::new], but [`poll`][Self::poll] never waits for data. For running on a
    /// thread that has other work to do.
    pub fn non_blocking(open: OpenPortFn, events: EventSender) -> Self {
        Facade {
            read_mode: ReadMode::NoWait,
            ..Facade::new(open, events)
        }
    }

    /// Returns the state of the connection.
    pub fn state(&self) -> ConnectionState {
        match self.connection {
            Connection::Closed => ConnectionState::Closed,
            Connection::Open(_) => ConnectionState::Open,
        }
    }

    /// Configures and opens the device.
    ///
    /// Emits `ConnectionChanged(true)` on success. On failure the facade stays closed, emits a
    /// `Diagnostic` with the driver's description and requests shutdown.
    pub fn open(&mut self, config: &DeviceConfig) -> Option<ShutdownRequest> {
        if let Connection::Open(_) = self.connection {
            warn!(path = %config.path, "Ignoring open request for a device that is already open");
            self.emit(Event::Diagnostic("Device is already open".into()));
            return None;
        }

        let mut handle = DeviceHandle::new(self.open.clone()).with_read_mode(self.read_mode);

        match handle.open(config) {
            Ok(()) => {
                info!(device = %config.summary(), "Connected");
                self.connection = Connection::Open(handle);
                self.emit(Event::ConnectionChanged(true));
                None
            }
            Err(e) => {
                warn!(path = %config.path, error = %e, "Failed to open device");
                self.emit(Event::Diagnostic(e.to_string()));
                Some(ShutdownRequest::new())
            }
        }
    }

    /// Queues `data` to be written to the device without waiting for it to be sent. The data is
    /// dropped if the device is not open.
    pub fn write(&mut self, data: Data) {
        match self.connection {
            Connection::Open(ref mut handle) => handle.write(data),
            Connection::Closed => debug!(bytes = data.len(), "Dropping write while closed"),
        }
    }

    /// Closes the device if it is open, emitting `ConnectionChanged(false)`, and requests shutdown.
    ///
    /// Safe to call in any state. The device handle is fully released before this returns.
    pub fn close(&mut self) -> ShutdownRequest {
        let connection = mem::replace(&mut self.connection, Connection::Closed);

        if let Connection::Open(mut handle) = connection {
            handle.close();
            drop(handle);

            info!("Disconnected");
            self.emit(Event::ConnectionChanged(false));
        }

        ShutdownRequest::new()
    }

    /// Services the device: flushes queued writes and emits any data that arrived.
    ///
    /// A device error forces the device closed and requests shutdown.
    pub fn poll(&mut self) -> Option<ShutdownRequest> {
        let result = match self.connection {
            Connection::Open(ref mut handle) => handle.poll(),
            Connection::Closed => return None,
        };

        match result {
            Ok(Some(data)) => {
                self.emit(Event::DataReceived(data));
                None
            }
            Ok(None) => None,
            Err(e) => self.handle_error(e.to_string()),
        }
    }

    /// Reports a device error and closes the device.
    ///
    /// Observers see `Diagnostic`, then `ConnectionChanged(false)`, then `ErrorOccurred`.
    fn handle_error(&mut self, description: String) -> Option<ShutdownRequest> {
        if description.is_empty() {
            return None;
        }

        warn!(error = %description, "Device error");
        self.emit(Event::Diagnostic(description.clone()));

        let shutdown = self.close();
        self.emit(Event::ErrorOccurred(description));

        Some(shutdown)
    }

    fn emit(&self, event: Event) {
        if self.events.unbounded_send(event).is_err() {
            debug!("Event receiver dropped; discarding event");
        }
    }
}
