use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;

use crate::error::IrqError;
use crate::gpio::GpioDriver;
use crate::registry::{CallbackId, InterruptCallback, PinRegistry};

/// Epoll token of the cancellation eventfd. Pin tokens are `u32` widened, so
/// this can never collide with a pin.
const CANCEL_TOKEN: u64 = u64::MAX;

pub(crate) fn pin_token(pin: u32) -> u64 {
    pin as u64
}

/// Owner of the background thread that turns value-descriptor wake-ups into
/// callback invocations.
pub(crate) struct DispatchLoop {
    cancel: Arc<EventFd>,
    handle: Option<JoinHandle<()>>,
}

struct Worker<D: GpioDriver> {
    epoll: Arc<Epoll>,
    registry: Arc<Mutex<PinRegistry>>,
    driver: Arc<D>,
    max_events: usize,
    // keeps the cancellation eventfd open for as long as epoll may report it
    _cancel: Arc<EventFd>,
}

impl DispatchLoop {
    pub(crate) fn spawn<D: GpioDriver + 'static>(
        epoll: Arc<Epoll>,
        registry: Arc<Mutex<PinRegistry>>,
        driver: Arc<D>,
        max_events: usize,
    ) -> Result<Self, IrqError> {
        let cancel = Arc::new(
            EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .map_err(|e| IrqError::Io(format!("create cancel eventfd: {e}")))?,
        );
        epoll
            .add(
                cancel.as_ref(),
                EpollEvent::new(EpollFlags::EPOLLIN, CANCEL_TOKEN),
            )
            .map_err(|e| IrqError::Io(format!("register cancel eventfd: {e}")))?;

        let worker = Worker {
            epoll,
            registry,
            driver,
            max_events: max_events.max(1),
            _cancel: cancel.clone(),
        };
        let handle = thread::Builder::new()
            .name("gpio-irq-dispatch".into())
            .spawn(move || worker.run())
            .map_err(|e| IrqError::Io(format!("spawn dispatch thread: {e}")))?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Wakes the dispatch thread through the cancellation eventfd and joins it.
    pub(crate) fn shutdown(&mut self) -> Result<(), IrqError> {
        if self.handle.is_none() {
            return Ok(());
        }
        self.cancel
            .write(1)
            .map_err(|e| IrqError::Io(format!("signal cancel eventfd: {e}")))?;
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            // released from inside a callback; the loop exits once it returns
            warn!("dispatch loop shut down from its own thread, not joining");
            return Ok(());
        }
        if handle.join().is_err() {
            error!("dispatch thread terminated abnormally");
        }
        Ok(())
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("dispatch loop shutdown failed: {e}");
        }
    }
}

impl<D: GpioDriver> Worker<D> {
    fn run(self) {
        debug!("dispatch thread started");
        let mut events = vec![EpollEvent::empty(); self.max_events];

        loop {
            let ready = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("epoll wait failed, stopping dispatch: {e}");
                    return;
                }
            };

            for event in &events[..ready] {
                if event.data() == CANCEL_TOKEN {
                    debug!("dispatch thread cancelled");
                    return;
                }
                // tokens are only ever produced by pin_token
                self.dispatch(event.data() as u32);
            }
        }
    }

    fn dispatch(&self, pin: u32) {
        let callbacks = self.collect(pin);
        for (id, action) in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| action())).is_err() {
                warn!("callback {id} on pin {pin} panicked, ignoring");
            }
        }
    }

    /// Drains the pin's pending edge and clones out the callbacks to run, all
    /// under the registry lock. Invocation happens after the lock is dropped.
    fn collect(&self, pin: u32) -> Vec<(CallbackId, InterruptCallback)> {
        let registry = self.registry.lock();
        let Some(conf) = registry.get(pin) else {
            trace!("wake-up for pin {pin} which is no longer registered");
            return Vec::new();
        };
        if let Err(e) = self.driver.clear_pending_event(conf.value_fd()) {
            debug!("drain pending edge on pin {pin} failed: {e}");
        }
        conf.armed_callbacks()
    }
}
