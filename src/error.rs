//! Errors produced while driving a serial device.
//!
//! None of these are ever raised to the host application. The facade and the worker convert them
//! into [`Event`][crate::serial::Event]s, so the `Display` text of each variant is exactly what
//! ends up in a `Diagnostic` or `ErrorOccurred` event.

use thiserror::Error;

/// An error reported while configuring, opening or using a serial device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The settings could not be applied or the device could not be acquired.
    #[error("{0}")]
    Configuration(String),
    /// The driver reported an error while the device was open.
    #[error("{0}")]
    DeviceFault(String),
    /// A worker was started while another one was still active for the same device slot.
    #[error("A worker is already active for this device")]
    ProtocolMisuse,
    /// The operating system refused to start a worker thread.
    #[error("Failed to start worker: {0}")]
    WorkerStart(String),
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Configuration(e.description)
    }
}

#[cfg(test)]
mod tests {
    use serialport::ErrorKind;

    use super::*;

    #[test]
    fn test_display_is_driver_text() {
        assert_eq!("port busy", Error::Configuration("port busy".into()).to_string());
        assert_eq!("Broken pipe", Error::DeviceFault("Broken pipe".into()).to_string());
        assert_eq!(
            "Failed to start worker: Resource temporarily unavailable",
            Error::WorkerStart("Resource temporarily unavailable".into()).to_string(),
        );
    }

    #[test]
    fn test_from_serialport_error() {
        let e = serialport::Error::new(ErrorKind::NoDevice, "No such file or directory");

        assert_eq!(
            Error::Configuration("No such file or directory".into()),
            Error::from(e),
        );
    }
}
