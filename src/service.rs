use std::sync::Arc;

use log::{debug, info, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent};
use parking_lot::Mutex;

use crate::backend::GpioSysfsDriver;
use crate::config::{Edge, InterruptConfig};
use crate::dispatch::{DispatchLoop, pin_token};
use crate::error::IrqError;
use crate::gpio::{self, GpioDriver};
use crate::registry::{
    Admission, CallbackId, InterruptCallback, PinConfig, PinRegistry, PinSnapshot,
};

/// Edge-triggered GPIO interrupts multiplexed over one dispatch thread.
///
/// Every attached pin keeps its value descriptor registered with a shared
/// epoll instance; the dispatch thread drains each wake-up and runs the pin's
/// enabled callbacks in registration order, with the registry lock released.
///
/// Callbacks may call back into the service. Mutating the pin a callback is
/// running under affects only the next edge. Calling
/// [`InterruptService::close`] from a callback tears everything down but
/// cannot join the dispatch thread it runs on; that thread exits on its own
/// once the callback returns.
pub struct InterruptService<D: GpioDriver + 'static = GpioSysfsDriver> {
    config: InterruptConfig,
    driver: Arc<D>,
    registry: Arc<Mutex<PinRegistry>>,
    epoll: Arc<Epoll>,
    // serializes sysfs export/teardown so the registry lock never spans retries
    setup: Mutex<()>,
    dispatcher: Mutex<Option<DispatchLoop>>,
}

impl InterruptService<GpioSysfsDriver> {
    /// Opens the sysfs control nodes under `config.sysfs_root` and starts the
    /// dispatch thread.
    pub fn init(config: InterruptConfig) -> Result<Self, IrqError> {
        let driver = Arc::new(GpioSysfsDriver::open(&config.sysfs_root)?);
        Self::with_driver(config, driver)
    }
}

impl<D: GpioDriver + 'static> InterruptService<D> {
    pub fn with_driver(config: InterruptConfig, driver: Arc<D>) -> Result<Self, IrqError> {
        let epoll = Arc::new(
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
                .map_err(|e| IrqError::Io(format!("create epoll: {e}")))?,
        );
        let registry = Arc::new(Mutex::new(PinRegistry::default()));
        let dispatcher = DispatchLoop::spawn(
            epoll.clone(),
            registry.clone(),
            driver.clone(),
            config.max_events,
        )?;

        info!("interrupt service started");

        Ok(Self {
            config,
            driver,
            registry,
            epoll,
            setup: Mutex::new(()),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn config(&self) -> &InterruptConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.dispatcher.lock().is_none()
    }

    /// Registers `callback` for `edge` transitions on `pin`.
    ///
    /// The first attach on a pin exports and arms it; later attaches with the
    /// same edge fan out to the existing entry. A different edge is a
    /// [`IrqError::Conflict`] and leaves the pin untouched.
    pub fn attach<F>(&self, pin: u32, edge: Edge, callback: F) -> Result<CallbackId, IrqError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let action: InterruptCallback = Arc::new(callback);
        let _setup = self.setup.lock();
        if self.is_closed() {
            return Err(IrqError::Closed);
        }

        if let Admission::Added(id) = self.registry.lock().admit(pin, edge, &action)? {
            debug!("callback {id} added to pin {pin}");
            return Ok(id);
        }

        let value_fd = gpio::prepare_pin(self.driver.as_ref(), &self.config, pin, edge)?;

        let mut registry = self.registry.lock();
        let interest = EpollEvent::new(self.driver.readiness(), pin_token(pin));
        if let Err(e) = self.epoll.add(&value_fd, interest) {
            drop(registry);
            drop(value_fd);
            if let Err(release_err) = gpio::release_pin(self.driver.as_ref(), pin) {
                warn!("release pin {pin} after failed setup: {release_err}");
            }
            return Err(IrqError::Io(format!("register pin {pin} with epoll: {e}")));
        }
        let id = registry.insert(PinConfig::new(pin, edge, value_fd), action);

        info!("watching pin {pin} for {edge:?} edges, callback {id}");
        Ok(id)
    }

    pub fn enable(&self, id: CallbackId) -> Result<(), IrqError> {
        self.registry.lock().set_callback_enabled(id, true)
    }

    pub fn disable(&self, id: CallbackId) -> Result<(), IrqError> {
        self.registry.lock().set_callback_enabled(id, false)
    }

    /// Removes one callback, tearing its pin down if it was the last one.
    pub fn remove(&self, id: CallbackId) -> Result<(), IrqError> {
        let _setup = self.setup.lock();
        let detached = {
            let mut registry = self.registry.lock();
            let detached = registry.remove_callback(id)?;
            if let Some(conf) = &detached {
                self.unwatch(conf);
            }
            detached
        };

        debug!("callback {id} removed");
        if let Some(conf) = detached
            && let Err(e) = self.teardown(conf)
        {
            warn!("{e}");
        }
        Ok(())
    }

    pub fn enable_pin(&self, pin: u32) -> Result<(), IrqError> {
        self.registry.lock().set_pin_enabled(pin, true)
    }

    /// Mutes every callback on `pin`. Edges are still drained while disabled.
    pub fn disable_pin(&self, pin: u32) -> Result<(), IrqError> {
        self.registry.lock().set_pin_enabled(pin, false)
    }

    pub fn remove_pin(&self, pin: u32) -> Result<(), IrqError> {
        let _setup = self.setup.lock();
        let conf = {
            let mut registry = self.registry.lock();
            let conf = registry.remove_pin(pin)?;
            self.unwatch(&conf);
            conf
        };

        if let Err(e) = self.teardown(conf) {
            warn!("{e}");
        }
        Ok(())
    }

    /// Current logic level of an attached pin.
    pub fn read_value(&self, pin: u32) -> Result<bool, IrqError> {
        if self.registry.lock().get(pin).is_none() {
            return Err(IrqError::NotFound(format!("pin {pin}")));
        }
        self.driver.read_pin_value(pin)
    }

    pub fn get_interrupts(&self) -> Vec<PinSnapshot> {
        self.registry.lock().snapshot()
    }

    /// Tears down every pin, stops the dispatch thread and releases the
    /// driver's control descriptors. Calling it again is a no-op.
    ///
    /// The setup lock is released before joining the dispatch thread, so a
    /// running callback that calls back into the service gets `NotFound` or
    /// `Closed` instead of blocking the join.
    pub fn close(&self) -> Result<(), IrqError> {
        let (mut dispatcher, first_err) = {
            let _setup = self.setup.lock();
            let Some(dispatcher) = self.dispatcher.lock().take() else {
                return Ok(());
            };

            let pins = {
                let mut registry = self.registry.lock();
                let pins = registry.drain();
                for conf in &pins {
                    self.unwatch(conf);
                }
                pins
            };

            let mut first_err = None;
            for conf in pins {
                if let Err(e) = self.teardown(conf) {
                    warn!("{e}");
                    first_err.get_or_insert(e);
                }
            }
            (dispatcher, first_err)
        };

        let stopped = dispatcher.shutdown();
        self.driver.release();
        info!("interrupt service closed");

        match first_err {
            Some(e) => Err(e),
            None => stopped,
        }
    }

    // caller holds the registry lock so dispatch never sees a watched fd
    // without its entry
    fn unwatch(&self, conf: &PinConfig) {
        if let Err(e) = self.epoll.delete(conf.value_fd()) {
            warn!("deregister pin {} from epoll: {e}", conf.pin);
        }
    }

    fn teardown(&self, conf: PinConfig) -> Result<(), IrqError> {
        let pin = conf.pin;
        drop(conf.into_value_fd());
        gpio::release_pin(self.driver.as_ref(), pin)
            .map_err(|e| IrqError::Io(format!("teardown pin {pin}: {e}")))?;
        info!("pin {pin} released");
        Ok(())
    }
}

impl<D: GpioDriver + 'static> Drop for InterruptService<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing interrupt service on drop: {e}");
        }
    }
}
