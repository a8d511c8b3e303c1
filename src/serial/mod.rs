//! Serial device communication and handling.

mod facade;
mod port;
mod server;
mod worker;

pub use facade::{Facade, ShutdownRequest};
pub use port::{open_serial_port, DeviceHandle, OpenPortFn, ReadMode};
pub use worker::Worker;

/// The message type used in channels related to the serial device.
pub type Data = Vec<u8>;

/// The state of the serial device connection, as seen by the facade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The device is open.
    Open,
    /// The device is not open. This is the initial state.
    Closed,
}

/// A notification sent from the facade or its worker to the controller.
///
/// Events from one facade are delivered in the order they were emitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The device was opened (`true`) or closed (`false`).
    ConnectionChanged(bool),
    /// Bytes arrived from the device, unmodified.
    DataReceived(Data),
    /// Human-readable text to show alongside the data stream, such as a driver error.
    Diagnostic(String),
    /// The device reported an error and has been closed.
    ErrorOccurred(String),
    /// The worker has released the device and will send no further events.
    WorkerShutdownComplete,
}

/// Sends [`Event`]s to the controller.
pub type EventSender = futures::channel::mpsc::UnboundedSender<Event>;
/// Receives [`Event`]s from a facade or worker.
pub type EventReceiver = futures::channel::mpsc::UnboundedReceiver<Event>;
