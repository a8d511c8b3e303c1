//! Exchange bytes with a serial device without ever blocking the caller on device I/O.
//!
//! A [`Facade`][serial::Facade] owns the device and reports everything as
//! [`Event`][serial::Event]s. A [`Worker`][serial::Worker] hosts the facade on a dedicated thread
//! and shuts it down deterministically. A [`Controller`] ties both to a [`Console`].

pub mod config;
pub mod controller;
pub mod error;
pub mod serial;

use futures::{pin_mut, select, FutureExt, Stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::signal;
use tokio::time;
use tracing::{debug, info, warn};

use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

pub use config::{DataBits, DeviceConfig, FlowControl, Parity, Settings, StopBits};
pub use controller::{Console, Controller};
pub use error::Error;
pub use serial::{ConnectionState, Data, Event, OpenPortFn};

/// How often a device running on the session's own thread is serviced.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A [`Console`] that writes received data to stdout.
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn put_data(&mut self, data: &[u8]) {
        let mut stdout = io::stdout().lock();

        if let Err(e) = stdout.write_all(data).and_then(|_| stdout.flush()) {
            warn!("Failed to write to stdout: {}", e);
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        debug!(enabled, "Console input");
    }
}

/// Launches a terminal session for the given settings: stdin is sent to the device and received
/// data is written to stdout until ctrl-c is pressed or the device goes away.
pub async fn launch(settings: Settings) {
    launch_with_port_open_fn(settings, Arc::new(serial::open_serial_port)).await
}

/// Like [`launch`], but uses a custom function for opening the serial port.
pub async fn launch_with_port_open_fn(settings: Settings, open: OpenPortFn) {
    let (stdin_tx, stdin_rx) = futures::channel::mpsc::unbounded();
    tokio::spawn(read_stdin(stdin_tx));

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to wait for ctrl-c signal: {}", e);
        }
    };

    let status = run_session(settings, StdoutConsole, open, stdin_rx, ctrl_c).await;
    info!("Session ended: {}", status);
}

/// Runs one session: opens the device, forwards `input` to it and its events to `console`.
///
/// The session ends when `input` ends, `terminate` completes or the worker shuts down (because
/// the device could not be opened or reported an error). The device is always closed and
/// released before this returns. Returns the final status line.
pub async fn run_session<C, I, T>(
    settings: Settings,
    console: C,
    open: OpenPortFn,
    input: I,
    terminate: T,
) -> String
where
    C: Console,
    I: Stream<Item = Data> + Unpin,
    T: Future<Output = ()>,
{
    let (mut controller, mut events) = Controller::with_port_open_fn(console, open);
    let mut input = input.fuse();
    let terminate = terminate.fuse();
    pin_mut!(terminate);

    let mut ticker = time::interval(POLL_INTERVAL);

    controller.open(settings);

    loop {
        select! {
            data = input.next() => match data {
                Some(d) => controller.write(d),
                None => break,
            },
            event = events.next() => match event {
                Some(Event::WorkerShutdownComplete) | None => break,
                Some(e) => controller.handle_event(e),
            },
            _ = ticker.tick().fuse() => controller.poll(),
            _ = terminate => break,
        }
    }

    controller.close();

    // Show whatever the shutdown produced
    while let Ok(Some(e)) = events.try_next() {
        controller.handle_event(e);
    }

    controller.status().to_string()
}

/// Reads stdin and sends it along `tx` as it arrives.
async fn read_stdin(tx: futures::channel::mpsc::UnboundedSender<Data>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0; 1024];

    loop {
        let bytes = match stdin.read(&mut buf).await {
            Err(_) | Ok(0) => break,
            Ok(n) => n,
        };

        if tx.unbounded_send(buf[..bytes].to_vec()).is_err() {
            break;
        }
    }
}
