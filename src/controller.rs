//! The controller: issues open/write/close requests on behalf of a console and reacts to the
//! events that come back.

use futures::channel::mpsc;
use tracing::{debug, info, warn};

use std::mem;
use std::sync::Arc;

use crate::config::{DeviceConfig, Settings};
use crate::error::Error;
use crate::serial::{
    open_serial_port, Data, Event, EventReceiver, EventSender, Facade, OpenPortFn, Worker,
};

/// The console collaborator: renders received bytes and supplies user input.
pub trait Console {
    /// Renders bytes received from the device, or diagnostic text.
    fn put_data(&mut self, data: &[u8]);

    /// Enables or disables user input. Input is only enabled while the device is connected.
    fn set_enabled(&mut self, enabled: bool);
}

/// What the controller knows about the current connection.
#[derive(Debug, Default)]
struct Session {
    /// The settings of the last open request.
    settings: Option<Settings>,
    /// The last connection state reported by the facade.
    connected: bool,
    /// Whether an open request has been issued but the device has not connected yet.
    opening: bool,
    /// The status line shown to the user.
    status: String,
    /// The open cycle most recently started. Every started cycle ends with exactly one
    /// `WorkerShutdownComplete`, its last event.
    generation: u64,
    /// The last open cycle closed by [`Controller::close`]. Its remaining events are ignored.
    closed_generation: u64,
    /// The open cycle the events currently being handled belong to.
    event_generation: u64,
}

impl Session {
    /// Returns whether the events being handled come from the open cycle still in use.
    fn is_current(&self) -> bool {
        self.event_generation == self.generation && self.event_generation > self.closed_generation
    }
}

/// Drives one serial device on behalf of a [`Console`].
///
/// Depending on [`Settings::multithreaded`], the device is run by a [`Worker`] thread or by a
/// [`Facade`] on the caller's own thread. In the latter case [`poll`][Self::poll] must be called
/// regularly to service the device.
pub struct Controller<C> {
    console: C,
    open: OpenPortFn,
    /// A sender for events, shared with the facade.
    events: EventSender,
    worker: Worker,
    /// The facade when running on the caller's thread.
    inline: Option<Facade>,
    session: Session,
}

impl<C: Console> Controller<C> {
    /// Returns a new `Controller` that opens real serial ports, and a receiver for the events that
    /// must be fed back into [`handle_event`][Self::handle_event].
    pub fn new(console: C) -> (Self, EventReceiver) {
        Controller::with_port_open_fn(console, Arc::new(open_serial_port))
    }

    /// Like [`new`][Self::new], but uses a custom function for opening the serial port.
    pub fn with_port_open_fn(mut console: C, open: OpenPortFn) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded();
        console.set_enabled(false);

        let controller = Controller {
            console,
            open: open.clone(),
            events: tx.clone(),
            worker: Worker::with_port_open_fn(open, tx),
            inline: None,
            session: Session {
                event_generation: 1,
                ..Session::default()
            },
        };

        (controller, rx)
    }

    /// Returns whether the device is connected, as last reported by the facade.
    pub fn is_connected(&self) -> bool {
        self.session.connected
    }

    /// Returns the status line.
    pub fn status(&self) -> &str {
        &self.session.status
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    /// Opens the device described by `settings`. The outcome is reported through events.
    ///
    /// Opening while a device is already being driven is refused with a `Diagnostic`.
    pub fn open(&mut self, settings: Settings) {
        let result = if settings.multithreaded {
            self.set_status("Running multithreaded...");

            if self.inline.is_some() {
                self.report_misuse()
            } else {
                self.worker.start(settings.device.clone())
            }
        } else {
            self.set_status("Running single-threaded...");

            if self.inline.is_some() || self.worker.is_active() {
                self.report_misuse()
            } else {
                self.open_inline(&settings.device);
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                self.session.settings = Some(settings);
                self.session.opening = true;
                self.session.generation += 1;
            }
            Err(_) => self.set_status("Open error"),
        }
    }

    /// Opens the device with a facade on the caller's thread.
    fn open_inline(&mut self, config: &DeviceConfig) {
        let mut facade = Facade::non_blocking(self.open.clone(), self.events.clone());

        match facade.open(config) {
            None => self.inline = Some(facade),
            Some(_) => {
                drop(facade);
                self.emit(Event::WorkerShutdownComplete);
                self.set_status("Open error");
            }
        }
    }

    /// Sends `data` to the device. Data is dropped while not connected.
    pub fn write(&mut self, data: Data) {
        if !self.session.connected {
            debug!(bytes = data.len(), "Dropping input while disconnected");
            return;
        }

        if self.session.settings.as_ref().map_or(false, |s| s.local_echo) {
            self.console.put_data(&data);
        }

        match self.inline {
            Some(ref mut facade) => facade.write(data),
            None => self.worker.write(data),
        }
    }

    /// Closes the device, blocking until it has been released.
    ///
    /// Events still queued from the closed device are ignored, except diagnostics.
    pub fn close(&mut self) {
        self.session.closed_generation = self.session.generation;
        self.disconnect();
    }

    /// Releases the device and disables the console.
    fn disconnect(&mut self) {
        let was_connected = mem::replace(&mut self.session.connected, false);
        let was_opening = mem::replace(&mut self.session.opening, false);
        self.console.set_enabled(false);

        if let Some(mut facade) = self.inline.take() {
            let _ = facade.close();
            drop(facade);
            self.emit(Event::WorkerShutdownComplete);
        }

        self.worker.request_close();

        if was_connected || was_opening {
            self.set_status("Disconnected");
        }
    }

    /// Services the device when it runs on the caller's thread. Does nothing otherwise.
    pub fn poll(&mut self) {
        let shutdown = match self.inline {
            Some(ref mut facade) => facade.poll().is_some(),
            None => false,
        };

        if shutdown {
            self.inline = None;
            self.emit(Event::WorkerShutdownComplete);
        }
    }

    /// Updates the session and console in response to `event`.
    ///
    /// Events from an open cycle that was closed or replaced since are ignored, except
    /// diagnostics.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Diagnostic(text) => self.console.put_data(text.as_bytes()),
            Event::WorkerShutdownComplete => {
                let current = self.session.is_current();
                self.session.event_generation += 1;

                if !current {
                    debug!("Closed worker shut down");
                    return;
                }

                debug!("Worker shut down");

                // The device went away before it ever connected
                if mem::replace(&mut self.session.opening, false) {
                    self.set_status("Open error");
                }
            }
            e if !self.session.is_current() => {
                debug!(event = ?e, "Ignoring event from a closed device");
            }
            Event::ConnectionChanged(connected) => self.handle_connection_change(connected),
            Event::DataReceived(data) => self.console.put_data(&data),
            Event::ErrorOccurred(text) => {
                warn!(error = %text, "Device error");
                self.set_status(format!("Error: {}", text));
            }
        }
    }

    /// Acts on a connection change only if it differs from the last one seen.
    fn handle_connection_change(&mut self, connected: bool) {
        if connected == self.session.connected {
            return;
        }

        if connected {
            self.session.connected = true;
            self.session.opening = false;
            self.console.set_enabled(true);

            let summary = self.session.settings
                .as_ref()
                .map(|s| s.device.summary())
                .unwrap_or_default();
            self.set_status(format!("Connected to {}", summary));
        } else {
            // The device closed itself, so its remaining events still count
            self.disconnect();
        }
    }

    fn report_misuse(&mut self) -> Result<(), Error> {
        let e = Error::ProtocolMisuse;
        warn!("{}", e);
        self.emit(Event::Diagnostic(e.to_string()));
        Err(e)
    }

    fn emit(&self, event: Event) {
        let _ = self.events.unbounded_send(event);
    }

    fn set_status(&mut self, status: impl Into<String>) {
        self.session.status = status.into();
        info!("{}", self.session.status);
    }
}

#[cfg(test)]
mod tests {
    use mock::serial::TestDevice;

    use std::thread;
    use std::time::{Duration, Instant};

    use crate::config::PortSettings;

    use super::*;

    const FAKE_PORT: &str = "fakeport";

    /// A console that records everything put on it.
    #[derive(Default)]
    struct RecordingConsole {
        data: Vec<u8>,
        enabled: bool,
    }

    impl Console for RecordingConsole {
        fn put_data(&mut self, data: &[u8]) {
            self.data.extend_from_slice(data);
        }

        fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }
    }

    fn controller_for(device: &TestDevice) -> (Controller<RecordingConsole>, EventReceiver) {
        let device = device.clone();
        Controller::with_port_open_fn(
            RecordingConsole::default(),
            Arc::new(move |_: &PortSettings| device.open_port()),
        )
    }

    fn settings(multithreaded: bool) -> Settings {
        Settings {
            multithreaded,
            ..Settings::new(DeviceConfig::new(FAKE_PORT))
        }
    }

    /// Waits for the next event, services the device meanwhile, and hands the event to the
    /// controller. Returns a copy of the event.
    fn handle_next(
        controller: &mut Controller<RecordingConsole>,
        rx: &mut EventReceiver,
    ) -> Event {
        let deadline = Instant::now() + Duration::from_secs(2);

        loop {
            match rx.try_next() {
                Ok(Some(e)) => {
                    controller.handle_event(e.clone());
                    return e;
                }
                Ok(None) => panic!("Event channel closed"),
                Err(_) => {
                    assert!(Instant::now() < deadline, "Timed out waiting for an event");
                    controller.poll();
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn handle_pending(controller: &mut Controller<RecordingConsole>, rx: &mut EventReceiver) {
        while let Ok(Some(e)) = rx.try_next() {
            controller.handle_event(e);
        }
    }

    fn run_echo_session(multithreaded: bool) {
        let device = TestDevice::new();
        let (mut controller, mut rx) = controller_for(&device);
        assert!(!controller.console().enabled);

        controller.open(settings(multithreaded));
        assert_eq!(Event::ConnectionChanged(true), handle_next(&mut controller, &mut rx));
        assert!(controller.is_connected());
        assert!(controller.console().enabled);
        assert_eq!("Connected to fakeport : 115200, 8, None, 1, None", controller.status());

        controller.write(b"AB".to_vec());
        assert_eq!(Event::DataReceived(b"AB".to_vec()), handle_next(&mut controller, &mut rx));
        assert_eq!(b"AB", &controller.console().data[..]);

        controller.close();
        assert!(!controller.is_connected());
        assert!(!controller.console().enabled);
        assert_eq!("Disconnected", controller.status());
        assert!(!device.is_open());

        assert_eq!(Event::ConnectionChanged(false), handle_next(&mut controller, &mut rx));
        assert_eq!(Event::WorkerShutdownComplete, handle_next(&mut controller, &mut rx));
        assert_eq!("Disconnected", controller.status());
    }

    #[test]
    fn test_multithreaded_session() {
        run_echo_session(true);
    }

    #[test]
    fn test_single_threaded_session() {
        run_echo_session(false);
    }

    #[test]
    fn test_local_echo() {
        let device = TestDevice::new();
        let (mut controller, mut rx) = controller_for(&device);

        controller.open(Settings {
            local_echo: true,
            ..settings(true)
        });
        assert_eq!(Event::ConnectionChanged(true), handle_next(&mut controller, &mut rx));

        controller.write(b"hi".to_vec());
        // The input is echoed immediately, before the device echoes it back
        assert_eq!(b"hi", &controller.console().data[..]);

        handle_next(&mut controller, &mut rx);
        assert_eq!(b"hihi", &controller.console().data[..]);
    }

    #[test]
    fn test_write_while_disconnected() {
        let device = TestDevice::new();
        let (mut controller, mut rx) = controller_for(&device);

        controller.write(b"lost".to_vec());

        handle_pending(&mut controller, &mut rx);
        assert!(controller.console().data.is_empty());
        assert_eq!(0, device.write_count());
    }

    #[test]
    fn test_open_failure() {
        let device = TestDevice::failing("port busy");
        let (mut controller, mut rx) = controller_for(&device);

        controller.open(settings(true));

        assert_eq!(Event::Diagnostic("port busy".into()), handle_next(&mut controller, &mut rx));
        assert_eq!(Event::WorkerShutdownComplete, handle_next(&mut controller, &mut rx));
        assert!(!controller.is_connected());
        assert_eq!("Open error", controller.status());
        assert_eq!(b"port busy", &controller.console().data[..]);
    }

    #[test]
    fn test_open_failure_single_threaded() {
        let device = TestDevice::failing("port busy");
        let (mut controller, mut rx) = controller_for(&device);

        controller.open(settings(false));
        assert_eq!("Open error", controller.status());

        assert_eq!(Event::Diagnostic("port busy".into()), handle_next(&mut controller, &mut rx));
        assert_eq!(Event::WorkerShutdownComplete, handle_next(&mut controller, &mut rx));
    }

    #[test]
    fn test_open_twice() {
        let device = TestDevice::new();
        let (mut controller, mut rx) = controller_for(&device);

        controller.open(settings(true));
        assert_eq!(Event::ConnectionChanged(true), handle_next(&mut controller, &mut rx));

        controller.open(settings(false));
        assert_eq!("Open error", controller.status());
        assert_eq!(
            Event::Diagnostic("A worker is already active for this device".into()),
            handle_next(&mut controller, &mut rx),
        );

        controller.open(settings(true));
        assert_eq!("Open error", controller.status());
        handle_next(&mut controller, &mut rx);

        // The original connection is untouched
        assert!(controller.is_connected());
        assert_eq!(1, device.open_count());
    }

    fn run_reopen_session(multithreaded: bool) {
        let device = TestDevice::new();
        let (mut controller, mut rx) = controller_for(&device);

        controller.open(settings(multithreaded));
        assert_eq!(Event::ConnectionChanged(true), handle_next(&mut controller, &mut rx));

        // Reconnect before the first device's closing events are handled
        controller.close();
        controller.open(settings(multithreaded));
        let status = controller.status().to_string();

        assert_eq!(Event::ConnectionChanged(false), handle_next(&mut controller, &mut rx));
        assert_eq!(Event::WorkerShutdownComplete, handle_next(&mut controller, &mut rx));
        // The first device shutting down is not the second one failing to open
        assert_eq!(status, controller.status());
        assert!(!controller.console().enabled);

        assert_eq!(Event::ConnectionChanged(true), handle_next(&mut controller, &mut rx));
        assert!(controller.is_connected());
        assert!(controller.console().enabled);
        assert_eq!("Connected to fakeport : 115200, 8, None, 1, None", controller.status());
        assert_eq!(2, device.open_count());

        controller.close();
        assert_eq!(2, device.release_count());
    }

    #[test]
    fn test_reopen_ignores_closed_device() {
        run_reopen_session(true);
    }

    #[test]
    fn test_reopen_ignores_closed_device_single_threaded() {
        run_reopen_session(false);
    }

    fn run_close_before_connect(multithreaded: bool) {
        let device = TestDevice::new();
        let (mut controller, mut rx) = controller_for(&device);

        controller.open(settings(multithreaded));
        controller.close();
        assert_eq!("Disconnected", controller.status());

        // The device connected and closed before any of its events were handled
        let events = {
            let mut events = Vec::new();
            while let Ok(Some(e)) = rx.try_next() {
                controller.handle_event(e.clone());
                events.push(e);
            }
            events
        };

        assert_eq!(
            vec![
                Event::ConnectionChanged(true),
                Event::ConnectionChanged(false),
                Event::WorkerShutdownComplete,
            ],
            events,
        );
        assert!(!controller.is_connected());
        assert!(!controller.console().enabled);
        assert_eq!("Disconnected", controller.status());

        // Input stays dropped
        controller.write(b"lost".to_vec());
        assert_eq!(0, device.write_count());
    }

    #[test]
    fn test_close_before_connect() {
        run_close_before_connect(true);
    }

    #[test]
    fn test_close_before_connect_single_threaded() {
        run_close_before_connect(false);
    }

    fn run_fault_session(multithreaded: bool) {
        let device = TestDevice::new();
        let (mut controller, mut rx) = controller_for(&device);

        controller.open(settings(multithreaded));
        assert_eq!(Event::ConnectionChanged(true), handle_next(&mut controller, &mut rx));

        device.set_fault("device removed");

        assert_eq!(
            Event::Diagnostic("device removed".into()),
            handle_next(&mut controller, &mut rx),
        );
        assert_eq!(Event::ConnectionChanged(false), handle_next(&mut controller, &mut rx));
        assert!(!controller.is_connected());
        assert!(!controller.console().enabled);

        assert_eq!(
            Event::ErrorOccurred("device removed".into()),
            handle_next(&mut controller, &mut rx),
        );
        assert_eq!("Error: device removed", controller.status());

        assert_eq!(Event::WorkerShutdownComplete, handle_next(&mut controller, &mut rx));
        assert!(!device.is_open());
    }

    #[test]
    fn test_device_fault() {
        run_fault_session(true);
    }

    #[test]
    fn test_device_fault_single_threaded() {
        run_fault_session(false);
    }
}
