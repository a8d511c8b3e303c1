//! The worker-side loop that hosts a [`Facade`].

use futures::channel::{mpsc, oneshot};
use futures::executor::block_on;
use futures::StreamExt;
use tracing::debug;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::DeviceConfig;
use super::{ConnectionState, Data, Event, EventSender, Facade, OpenPortFn};

/// A request dispatched from the controller to the worker.
pub(super) enum Request {
    Open(DeviceConfig),
    Write(Data),
    /// Closes the device. The sender is completed once the device has been released.
    Close(oneshot::Sender<()>),
}

/// Sends [`Request`]s to a worker.
pub(super) type RequestSender = mpsc::UnboundedSender<Request>;
/// Receives [`Request`]s in a worker.
pub(super) type RequestReceiver = mpsc::UnboundedReceiver<Request>;

/// The reason the server loop stopped.
struct Stopped {
    /// The acknowledgement for the close request that stopped the loop, if that is what stopped it.
    ack: Option<oneshot::Sender<()>>,
}

/// A server that owns a [`Facade`] inside the worker thread, forwarding requests to it and
/// servicing the device while it is open.
pub(super) struct Server {
    /// The facade, and through it the device handle.
    facade: Facade,
    /// A receiver for requests from the controller.
    rx: RequestReceiver,
    /// A sender for events to the controller.
    events: EventSender,
    /// Set once the facade has been deallocated.
    finished: Arc<AtomicBool>,
}

impl Server {
    pub fn new(
        open: OpenPortFn,
        rx: RequestReceiver,
        events: EventSender,
        finished: Arc<AtomicBool>,
    ) -> Self {
        Server {
            facade: Facade::new(open, events.clone()),
            rx,
            events,
            finished,
        }
    }

    /// Runs the server loop until the facade requests shutdown, then tears the worker down.
    ///
    /// A separate thread must be used for this as it blocks until shutdown.
    pub fn run(mut self) {
        let stopped = self.serve();
        let Server { facade, rx, events, finished } = self;

        // Stop accepting requests before the facade goes away. Any request still queued is
        // dropped, which cancels its acknowledgement.
        drop(rx);
        drop(facade);
        finished.store(true, Ordering::SeqCst);

        debug!("Worker finished");
        let _ = events.unbounded_send(Event::WorkerShutdownComplete);

        if let Some(ack) = stopped.ack {
            let _ = ack.send(());
        }
    }

    /// Serves requests and the device until shutdown is requested.
    fn serve(&mut self) -> Stopped {
        loop {
            if self.facade.state() == ConnectionState::Closed {
                // There is no device to service, so just wait for the next request
                let request = block_on(self.rx.next());

                if let Some(stopped) = self.handle(request) {
                    return stopped;
                }

                continue;
            }

            // Handle all pending requests before servicing the device
            while let Ok(request) = self.rx.try_next() {
                if let Some(stopped) = self.handle(request) {
                    return stopped;
                }
            }

            if self.facade.poll().is_some() {
                return Stopped { ack: None };
            }
        }
    }

    /// Forwards `request` to the facade. Returns `Some` if the facade requested shutdown.
    ///
    /// `None` means the request channel was closed, which is treated as a close request.
    fn handle(&mut self, request: Option<Request>) -> Option<Stopped> {
        match request {
            Some(Request::Open(config)) => {
                debug!(path = %config.path, "Open requested");
                self.facade.open(&config).map(|_| Stopped { ack: None })
            }
            Some(Request::Write(data)) => {
                self.facade.write(data);
                None
            }
            Some(Request::Close(ack)) => {
                debug!("Close requested");
                let _ = self.facade.close();
                Some(Stopped { ack: Some(ack) })
            }
            None => {
                debug!("Request channel closed");
                let _ = self.facade.close();
                Some(Stopped { ack: None })
            }
        }
    }
}
