//! The worker lifecycle: starting the thread that hosts a facade and shutting it down
//! deterministically.

use futures::channel::{mpsc, oneshot};
use futures::executor::block_on;
use tracing::{debug, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::DeviceConfig;
use crate::error::Error;
use super::server::{Request, RequestSender, Server};
use super::{open_serial_port, Data, Event, EventSender, OpenPortFn};

/// A running worker thread.
struct Active {
    /// A sender for requests to the worker.
    tx: RequestSender,
    /// Set by the worker once its facade has been deallocated.
    finished: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Active {
    /// Waits for the worker thread to exit.
    fn join(self) {
        drop(self.tx);

        if self.thread.join().is_err() {
            warn!("Worker thread panicked");
        }
    }
}

/// Owns the thread that a [`Facade`][super::Facade] runs in.
///
/// At most one worker thread is active at a time. Dropping a `Worker` closes the device and waits
/// for the thread to exit, exactly like [`request_close`][Self::request_close].
pub struct Worker {
    /// The function used to open the device.
    open: OpenPortFn,
    /// A sender for events to the controller.
    events: EventSender,
    /// The active worker thread, if any.
    active: Option<Active>,
}

impl Worker {
    /// Returns a new `Worker` that opens real serial ports and emits events on `events`.
    pub fn new(events: EventSender) -> Self {
        Worker::with_port_open_fn(Arc::new(open_serial_port), events)
    }

    /// Like [`new`][Self::new], but uses a custom function for opening the serial port.
    pub fn with_port_open_fn(open: OpenPortFn, events: EventSender) -> Self {
        Worker {
            open,
            events,
            active: None,
        }
    }

    /// Returns whether a worker thread is running and has not shut down.
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |a| !a.finished.load(Ordering::SeqCst))
    }

    /// Starts a worker thread and asks it to open the device with `config`. Returns immediately;
    /// the outcome of the open is reported through events.
    ///
    /// Returns `Err` and emits a `Diagnostic` if a worker thread is already active.
    pub fn start(&mut self, config: DeviceConfig) -> Result<(), Error> {
        self.reap();

        if self.active.is_some() {
            let e = Error::ProtocolMisuse;
            warn!(path = %config.path, "{}", e);
            let _ = self.events.unbounded_send(Event::Diagnostic(e.to_string()));
            return Err(e);
        }

        let (tx, rx) = mpsc::unbounded();
        let finished = Arc::new(AtomicBool::new(false));
        let server = Server::new(self.open.clone(), rx, self.events.clone(), finished.clone());

        let thread = thread::Builder::new()
            .name("serial-worker".into())
            .spawn(move || server.run())
            .map_err(|e| {
                let e = Error::WorkerStart(e.to_string());
                let _ = self.events.unbounded_send(Event::Diagnostic(e.to_string()));
                e
            })?;

        debug!(path = %config.path, "Worker started");
        // The worker holds the receiver until it exits, which cannot happen before this is served
        let _ = tx.unbounded_send(Request::Open(config));

        self.active = Some(Active {
            tx,
            finished,
            thread,
        });

        Ok(())
    }

    /// Queues `data` to be written by the worker. Data is dropped if no worker is active.
    pub fn write(&self, data: Data) {
        match self.active {
            Some(ref a) => {
                if a.tx.unbounded_send(Request::Write(data)).is_err() {
                    debug!("Dropping write: worker already shut down");
                }
            }
            None => debug!(bytes = data.len(), "Dropping write: no active worker"),
        }
    }

    /// Closes the device and blocks until the worker has released it and exited.
    ///
    /// Once this returns, the device handle has been released, `WorkerShutdownComplete` has been
    /// emitted and no further events will arrive from this worker. Does nothing if no worker is
    /// active.
    pub fn request_close(&mut self) {
        let active = match self.active.take() {
            Some(a) => a,
            None => return,
        };

        let (ack_tx, ack_rx) = oneshot::channel();

        if active.tx.unbounded_send(Request::Close(ack_tx)).is_ok() {
            // `Canceled` means the worker shut itself down before serving the request
            if block_on(ack_rx).is_err() {
                debug!("Worker shut down before close was served");
            }
        }

        active.join();
        debug!("Worker closed");
    }

    /// Joins a worker thread that already shut itself down.
    fn reap(&mut self) {
        if self.active.as_ref().map_or(false, |a| a.finished.load(Ordering::SeqCst)) {
            if let Some(active) = self.active.take() {
                active.join();
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.request_close();
    }
}

#[cfg(test)]
mod tests {
    use mock::serial::TestDevice;

    use std::thread;
    use std::time::{Duration, Instant};

    use crate::config::PortSettings;
    use crate::serial::EventReceiver;

    use super::*;

    const FAKE_PORT: &str = "fakeport";

    fn worker_for(device: &TestDevice) -> (Worker, EventReceiver) {
        let device = device.clone();
        let (tx, rx) = mpsc::unbounded();
        let worker = Worker::with_port_open_fn(
            Arc::new(move |_: &PortSettings| device.open_port()),
            tx,
        );

        (worker, rx)
    }

    /// Waits for the next event, failing the test if none arrives in time.
    fn next_event(rx: &mut EventReceiver) -> Event {
        let deadline = Instant::now() + Duration::from_secs(2);

        loop {
            match rx.try_next() {
                Ok(Some(e)) => return e,
                Ok(None) => panic!("Event channel closed"),
                Err(_) => {
                    assert!(Instant::now() < deadline, "Timed out waiting for an event");
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn drain(rx: &mut EventReceiver) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(Some(e)) = rx.try_next() {
            events.push(e);
        }
        events
    }

    #[test]
    fn test_open_write_close() {
        let device = TestDevice::new();
        let (mut worker, mut rx) = worker_for(&device);

        worker.start(DeviceConfig::new(FAKE_PORT)).unwrap();
        assert_eq!(Event::ConnectionChanged(true), next_event(&mut rx));
        assert!(worker.is_active());

        worker.write(vec![0x41, 0x42]);
        assert_eq!(Event::DataReceived(vec![0x41, 0x42]), next_event(&mut rx));

        worker.request_close();
        assert_eq!(
            vec![Event::ConnectionChanged(false), Event::WorkerShutdownComplete],
            drain(&mut rx),
        );
        assert!(!worker.is_active());
    }

    #[test]
    fn test_request_close_releases_device() {
        let device = TestDevice::new();
        let (mut worker, mut rx) = worker_for(&device);

        worker.start(DeviceConfig::new(FAKE_PORT)).unwrap();
        assert_eq!(Event::ConnectionChanged(true), next_event(&mut rx));

        worker.request_close();

        // No waiting: the handle is released by the time `request_close` returns
        assert!(!device.is_open());
        assert_eq!(device.open_count(), device.release_count());

        // Writes after the close never reach the device
        worker.write(vec![1, 2, 3]);
        assert_eq!(0, device.write_count());
        assert_eq!(0, device.calls_after_release());
    }

    #[test]
    fn test_request_close_idle() {
        let device = TestDevice::new();
        let (mut worker, mut rx) = worker_for(&device);

        worker.request_close();

        assert!(drain(&mut rx).is_empty());
        assert!(!worker.is_active());
    }

    #[test]
    fn test_open_failure() {
        let device = TestDevice::failing("port busy");
        let (mut worker, mut rx) = worker_for(&device);

        worker.start(DeviceConfig::new(FAKE_PORT)).unwrap();

        assert_eq!(Event::Diagnostic("port busy".into()), next_event(&mut rx));
        assert_eq!(Event::WorkerShutdownComplete, next_event(&mut rx));
        // The worker marks itself finished before announcing it
        assert!(!worker.is_active());

        // Closing afterwards only reaps the thread
        worker.request_close();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_start_while_active() {
        let device = TestDevice::new();
        let (mut worker, mut rx) = worker_for(&device);

        worker.start(DeviceConfig::new(FAKE_PORT)).unwrap();
        assert_eq!(Event::ConnectionChanged(true), next_event(&mut rx));

        assert_eq!(Err(Error::ProtocolMisuse), worker.start(DeviceConfig::new(FAKE_PORT)));
        assert_eq!(
            Event::Diagnostic("A worker is already active for this device".into()),
            next_event(&mut rx),
        );

        // The running worker is unaffected
        assert!(worker.is_active());
        assert_eq!(1, device.open_count());
    }

    #[test]
    fn test_device_fault() {
        let device = TestDevice::new();
        let (mut worker, mut rx) = worker_for(&device);

        worker.start(DeviceConfig::new(FAKE_PORT)).unwrap();
        assert_eq!(Event::ConnectionChanged(true), next_event(&mut rx));

        device.set_fault("device removed");

        assert_eq!(Event::Diagnostic("device removed".into()), next_event(&mut rx));
        assert_eq!(Event::ConnectionChanged(false), next_event(&mut rx));
        assert_eq!(Event::ErrorOccurred("device removed".into()), next_event(&mut rx));
        assert_eq!(Event::WorkerShutdownComplete, next_event(&mut rx));
        assert!(!device.is_open());

        // Reconnecting is a fresh start
        device.clear_fault();
        worker.start(DeviceConfig::new(FAKE_PORT)).unwrap();
        assert_eq!(Event::ConnectionChanged(true), next_event(&mut rx));
        assert_eq!(2, device.open_count());
    }

    #[test]
    fn test_writes_keep_order() {
        let device = TestDevice::new();
        let (mut worker, mut rx) = worker_for(&device);

        worker.start(DeviceConfig::new(FAKE_PORT)).unwrap();
        assert_eq!(Event::ConnectionChanged(true), next_event(&mut rx));

        for x in 0..10 {
            worker.write(vec![x]);
        }

        let mut received = Vec::new();
        while received.len() < 10 {
            match next_event(&mut rx) {
                Event::DataReceived(data) => received.extend(data),
                e => panic!("Unexpected event: {:?}", e),
            }
        }

        assert_eq!((0..10).collect::<Vec<u8>>(), received);
        worker.request_close();
    }

    #[test]
    fn test_write_without_worker() {
        let device = TestDevice::new();
        let (worker, mut rx) = worker_for(&device);

        worker.write(vec![1, 2, 3]);

        assert!(drain(&mut rx).is_empty());
        assert_eq!(0, device.write_count());
    }

    #[test]
    fn test_drop_closes_device() {
        let device = TestDevice::new();
        let (mut worker, mut rx) = worker_for(&device);

        worker.start(DeviceConfig::new(FAKE_PORT)).unwrap();
        assert_eq!(Event::ConnectionChanged(true), next_event(&mut rx));

        drop(worker);

        assert!(!device.is_open());
        assert_eq!(
            vec![Event::ConnectionChanged(false), Event::WorkerShutdownComplete],
            drain(&mut rx),
        );
    }
}
