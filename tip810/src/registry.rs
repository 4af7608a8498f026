//! The set of CAN buses in a process and their shared receive task

use core::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tip810_core::{AddressSpace, Carrier, CarrierError, IrqCommand, Site};

use crate::address::{self, AddressDescriptor};
use crate::config::{BusRate, EngineConfig};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::interrupt::InterruptHandler;
use crate::message::{Message, CAN_DATA_SIZE};
use crate::queue::{self, Consumer, Producer, QueueStatistics, Receipt};
use crate::reg::{Chip, Control};

/// TEWS Technologies manufacturer code
pub const MANUFACTURER_TEWS: u8 = 0xb3;
/// TIP810 model code
pub const MODEL_TIP810: u8 = 0x01;

const IRQ_LINE: u8 = 0;

/// Drain the receive queue until every interrupt handler is gone.
pub(crate) fn receive_task(queue: Consumer<Receipt>) {
    log::info!("CAN receive task started");
    while let Some(Receipt { device, message }) = queue.pop() {
        device.dispatch(&message);
    }
    log::debug!("CAN receive task exiting");
}

/// All CAN buses of the process.
///
/// Buses are [`create`](Registry::create)d one by one while the system is
/// configured, then [`initialise`](Registry::initialise) connects their
/// interrupts and starts the receive task. Dropping the registry takes every
/// chip off the bus.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use tip810::{BusRate, EngineConfig, Registry};
/// # use tip810_core::{Carrier, Site};
/// # fn carrier() -> Arc<dyn Carrier> { unimplemented!() }
/// let mut registry = Registry::new(carrier(), EngineConfig::new());
/// registry.create("CAN1", Site::new(0, 0), 0x60, BusRate::try_from(500)?)?;
/// registry.initialise()?;
///
/// let address = registry.parse_address("CAN1/100:0x126 0")?;
/// let bus = address.device;
/// # Ok::<(), tip810::Error>(())
/// ```
pub struct Registry {
    carrier: Arc<dyn Carrier>,
    config: EngineConfig,
    devices: Vec<Arc<Device>>,
    queue: Option<Arc<QueueStatistics>>,
    receive_task: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl Registry {
    /// Create an empty registry using `carrier` to reach the modules
    pub fn new(carrier: Arc<dyn Carrier>, config: EngineConfig) -> Self {
        Self {
            carrier,
            config,
            devices: Vec::new(),
            queue: None,
            receive_task: None,
            shut_down: false,
        }
    }

    fn initialised(&self) -> bool {
        self.receive_task.is_some()
    }

    /// Register the TIP810 at `site` as bus `name`.
    ///
    /// The chip is left in reset with the bus timing loaded; it does not
    /// take part in bus traffic until [`Registry::initialise`].
    pub fn create(
        &mut self,
        name: &str,
        site: Site,
        vector: u8,
        bus_rate: BusRate,
    ) -> Result<Arc<Device>> {
        if self.initialised() {
            return Err(Error::AlreadyInitialised);
        }
        self.carrier
            .validate(site, MANUFACTURER_TEWS, MODEL_TIP810)?;
        let timing = bus_rate.timing()?;

        if let Some(existing) = self
            .devices
            .iter()
            .find(|d| d.name() == name || d.site() == site)
        {
            return Err(Error::DuplicateDevice(existing.name().to_owned()));
        }

        let base = self.carrier.base_address(site, AddressSpace::Io)?;
        // Safety: The `Carrier` contract guarantees the I/O space is mapped
        // for the process lifetime and handed over exclusively; the site was
        // checked above not to be in use by another bus.
        let chip = unsafe { Chip::new(base) };
        chip.hold(timing.btr0, timing.btr1);
        self.carrier
            .irq_command(site, IRQ_LINE, IrqCommand::StatActive)?;

        let device = Arc::new(Device::new(
            name.to_owned(),
            site,
            vector,
            bus_rate,
            chip,
            self.config.silence_errors,
        ));
        self.devices.push(device.clone());
        log::info!("{name}: created on {site} at {bus_rate}");
        Ok(device)
    }

    /// Find the bus called `name`
    pub fn open(&self, name: &str) -> Result<Arc<Device>> {
        self.devices
            .iter()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| Error::NoSuchDevice(name.to_owned()))
    }

    /// Every registered bus, in creation order
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Start the receive task, connect every bus's interrupt and put the
    /// chips on the bus. Call once, after the last [`Registry::create`].
    ///
    /// A bus whose interrupt cannot be connected stays in reset while the
    /// others go on the bus; the first such error is returned.
    pub fn initialise(&mut self) -> Result<()> {
        if self.initialised() {
            return Err(Error::AlreadyInitialised);
        }

        let (producer, consumer) = queue::bounded(self.config.receive_queue_capacity);
        self.queue = Some(producer.statistics().clone());
        self.receive_task = Some(
            thread::Builder::new()
                .name("canRecvTask".into())
                .spawn(move || receive_task(consumer))?,
        );

        let mut first_error = None;
        for device in &self.devices {
            if let Err(e) = self.connect(device, &producer) {
                log::error!("{}: cannot connect interrupt: {e}", device.name());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn connect(&self, device: &Arc<Device>, producer: &Producer<Receipt>) -> Result<()> {
        let site = device.site();
        device.clear_counters();
        let handler = InterruptHandler::new(device.clone(), producer.clone());
        self.carrier
            .connect_interrupt(site, device.vector(), Arc::new(handler))?;
        device.chip.vector.write(device.vector());
        self.carrier.irq_command(site, IRQ_LINE, IrqCommand::Enable)?;
        device.mark_connected();
        device.chip.control.write(Control::RUNNING);
        log::debug!("{}: interrupts enabled, vector {:#04x}", device.name(), device.vector());
        Ok(())
    }

    /// Take every chip off the bus and disable its interrupts. Safe to call
    /// more than once; later calls do nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        for device in &self.devices {
            let site = device.site();
            device.chip.control.write(Control::RESET);
            for command in [IrqCommand::Disable, IrqCommand::StatUnused] {
                match self.carrier.irq_command(site, IRQ_LINE, command) {
                    Ok(_) | Err(CarrierError::Unsupported(_)) => {}
                    Err(e) => log::warn!("{}: {e}", device.name()),
                }
            }
        }
        log::info!("CAN buses shut down");
    }

    fn running(&self, name: &str) -> Result<Arc<Device>> {
        let device = self.open(name)?;
        if !device.is_connected() {
            return Err(Error::NotInitialised);
        }
        Ok(device)
    }

    /// Reset bus `name`, clearing its counters
    pub fn reset(&self, name: &str) -> Result<()> {
        self.open(name)?.reset()
    }

    /// Take bus `name` off the bus
    pub fn stop(&self, name: &str) -> Result<()> {
        self.open(name)?.stop();
        Ok(())
    }

    /// Put bus `name` back on the bus
    pub fn restart(&self, name: &str) -> Result<()> {
        self.open(name)?.restart()
    }

    /// Parse a textual address and look up the bus it names.
    pub fn parse_address(&self, text: &str) -> Result<AddressDescriptor> {
        let address = address::parse(text)?;
        let device = self.open(&address.bus_name)?;
        Ok(AddressDescriptor { address, device })
    }

    /// Receive queue fill levels, once initialised
    pub fn queue_statistics(&self) -> Option<&QueueStatistics> {
        self.queue.as_deref()
    }

    /// Send a single message on bus `name` without waiting for the
    /// transmitter. A remote frame requests `data.len()` bytes.
    pub fn send_test(&self, name: &str, identifier: u16, remote: bool, data: &[u8]) -> Result<()> {
        let device = self.running(name)?;
        if data.len() > CAN_DATA_SIZE {
            return Err(Error::BadMessage);
        }
        let message = if remote {
            Message::remote(identifier, data.len() as u8)?
        } else {
            Message::new(identifier, data)?
        };
        device.write(&message, Some(Duration::ZERO))
    }

    /// Write a summary of every bus to `out`. Higher `level`s add counters,
    /// then callback and read state, then the decoded chip status.
    pub fn report(&self, level: u8, out: &mut dyn fmt::Write) -> fmt::Result {
        for device in &self.devices {
            writeln!(
                out,
                "  {} ({}, vector {:#04x}): {}",
                device.name(),
                device.site(),
                device.vector(),
                device.bus_rate()
            )?;
            if level >= 1 {
                let s = device.statistics();
                writeln!(
                    out,
                    "    transmitted: {}  received: {}  overruns: {}",
                    s.transmitted, s.received, s.overruns
                )?;
                write!(out, "    errors: {}  bus off: {}  unrouted: {}", s.errors, s.bus_off, s.unrouted)?;
                match s.last_unrouted {
                    Some(id) => writeln!(out, " (last {id:#05x})")?,
                    None => writeln!(out)?,
                }
            }
            if level >= 2 {
                let ids = device.handled_identifiers();
                if !ids.is_empty() {
                    write!(out, "    callbacks for:")?;
                    for id in ids {
                        write!(out, " {id:#05x}")?;
                    }
                    writeln!(out)?;
                }
                if let Some(id) = device.pending_read() {
                    writeln!(out, "    read pending for {id:#05x}")?;
                }
            }
            if level >= 3 {
                writeln!(out, "    {:?}", device.chip_status())?;
            }
        }
        if level >= 1 {
            if let Some(queue) = self.queue_statistics() {
                writeln!(
                    out,
                    "  receive queue: {} of {} max used, {} overflows",
                    queue.high_water(),
                    queue.capacity(),
                    queue.overflows()
                )?;
            }
        }
        Ok(())
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("devices", &self.devices)
            .field("initialised", &self.initialised())
            .finish()
    }
}
