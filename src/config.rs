//! Device settings as produced by the settings collaborator.

use clap::ValueEnum;

use std::fmt;

use crate::error::Error;

/// The number of data bits per character.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum DataBits {
    #[value(name = "5")]
    Five,
    #[value(name = "6")]
    Six,
    #[value(name = "7")]
    Seven,
    #[default]
    #[value(name = "8")]
    Eight,
}

/// The parity checking mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// The number of stop bits per character.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StopBits {
    #[default]
    #[value(name = "1")]
    One,
    #[value(name = "1.5")]
    OnePointFive,
    #[value(name = "2")]
    Two,
}

/// The flow control mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum FlowControl {
    #[default]
    None,
    /// RTS/CTS.
    Hardware,
    /// XON/XOFF.
    Software,
}

impl fmt::Display for DataBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataBits::Five => "5",
            DataBits::Six => "6",
            DataBits::Seven => "7",
            DataBits::Eight => "8",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Parity::None => "None",
            Parity::Even => "Even",
            Parity::Odd => "Odd",
            Parity::Mark => "Mark",
            Parity::Space => "Space",
        };
        f.write_str(s)
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        };
        f.write_str(s)
    }
}

impl fmt::Display for FlowControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowControl::None => "None",
            FlowControl::Hardware => "RTS/CTS",
            FlowControl::Software => "XON/XOFF",
        };
        f.write_str(s)
    }
}

/// Everything needed to configure and open one serial device.
///
/// A `DeviceConfig` is an immutable snapshot: it is copied into an open request and never changed
/// afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// The path (or name, on Windows) of the serial device.
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            path: String::new(),
            baud_rate: 115_200,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
        }
    }
}

impl DeviceConfig {
    /// Returns the default configuration for the device at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        DeviceConfig {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Translates every field into the driver's vocabulary.
    ///
    /// Returns `Err` if any field has no driver equivalent, in which case nothing should be applied
    /// to the device.
    pub fn port_settings(&self) -> Result<PortSettings, Error> {
        if self.path.is_empty() {
            return Err(Error::Configuration("No port name specified".into()));
        }

        if self.baud_rate == 0 {
            return Err(Error::Configuration("Invalid baud rate: 0".into()));
        }

        let data_bits = match self.data_bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };

        let parity = match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Mark | Parity::Space => {
                return Err(Error::Configuration(format!("Unsupported parity: {}", self.parity)));
            }
        };

        let stop_bits = match self.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(Error::Configuration(
                    format!("Unsupported stop bits: {}", self.stop_bits),
                ));
            }
        };

        let flow_control = match self.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
            FlowControl::Software => serialport::FlowControl::Software,
        };

        Ok(PortSettings {
            path: self.path.clone(),
            baud_rate: self.baud_rate,
            data_bits,
            parity,
            stop_bits,
            flow_control,
        })
    }

    /// Returns a one-line description of the configuration for status messages.
    pub fn summary(&self) -> String {
        format!(
            "{} : {}, {}, {}, {}, {}",
            self.path,
            self.baud_rate,
            self.data_bits,
            self.parity,
            self.stop_bits,
            self.flow_control,
        )
    }
}

/// A [`DeviceConfig`] that has been checked and translated for the `serialport` driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSettings {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: serialport::DataBits,
    pub parity: serialport::Parity,
    pub stop_bits: serialport::StopBits,
    pub flow_control: serialport::FlowControl,
}

/// The settings record handed to the controller when the user connects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub device: DeviceConfig,
    /// Whether device I/O runs on a dedicated worker thread.
    pub multithreaded: bool,
    /// Whether the console should echo outbound bytes locally.
    pub local_echo: bool,
}

impl Settings {
    pub fn new(device: DeviceConfig) -> Self {
        Settings {
            device,
            multithreaded: true,
            local_echo: false,
        }
    }
}
