//! In-memory stand-ins for the TIP810 hardware and its carrier board

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use tip810_core::{AddressSpace, Carrier, CarrierError, InterruptService, IrqCommand, Site};

use crate::config::BusRate;
use crate::device::Device;
use crate::interrupt::{InterruptHandler, InterruptSet};
use crate::message::Message;
use crate::queue::{self, Consumer, QueueStatistics, Receipt};
use crate::reg::{Chip, Control, RegisterBlock, Status};
use crate::registry::{receive_task, MANUFACTURER_TEWS, MODEL_TIP810};

pub(crate) const TX_BUFFER_FREE: u8 = 0x04;
pub(crate) const ERROR_STATUS: u8 = 0x40;
pub(crate) const BUS_OFF: u8 = 0x80;

/// A zeroed register block that is never freed
#[derive(Clone, Copy)]
pub(crate) struct RegisterMemory {
    block: NonNull<RegisterBlock>,
}

// Safety: The block is leaked and only ever accessed through volatile cells,
// the way hardware registers are shared between threads.
unsafe impl Send for RegisterMemory {}
unsafe impl Sync for RegisterMemory {}

impl RegisterMemory {
    pub(crate) fn new() -> Self {
        // Safety: Every field of the block is a byte or a `u16` cell; all
        // zeroes is a valid value.
        let block: Box<RegisterBlock> = Box::new(unsafe { core::mem::zeroed() });
        Self {
            block: NonNull::from(Box::leak(block)),
        }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.block.cast()
    }

    pub(crate) fn chip(&self) -> Chip {
        // Safety: The block is leaked, so it stays valid. Tests poke the
        // same registers the way hardware would.
        unsafe { Chip::new(self.base()) }
    }

    pub(crate) fn block(&self) -> &'static RegisterBlock {
        // Safety: Leaked in `new`, never freed.
        unsafe { self.block.as_ref() }
    }
}

impl RegisterBlock {
    /// Present `bits` in the read-only status register
    pub(crate) fn set_status(&self, bits: u8) {
        self.status.write(Status::from(bits));
    }

    /// Last value written to the command register
    pub(crate) fn command_bits(&self) -> u8 {
        self.command.bits()
    }
}

/// A single bus wired straight to its interrupt handler, without carrier or
/// registry.
#[derive(Clone)]
pub(crate) struct Bench {
    inner: Arc<BenchInner>,
}

struct BenchInner {
    memory: RegisterMemory,
    device: Arc<Device>,
    handler: InterruptHandler,
    stats: Arc<QueueStatistics>,
    consumer: Mutex<Option<Consumer<Receipt>>>,
}

impl Bench {
    pub(crate) fn new() -> Self {
        Self::with_queue_capacity(16)
    }

    pub(crate) fn with_queue_capacity(capacity: usize) -> Self {
        let memory = RegisterMemory::new();
        let device = Arc::new(Device::new(
            "CAN1".to_owned(),
            Site::new(0, 0),
            0x60,
            BusRate::try_from(500).unwrap(),
            memory.chip(),
            true,
        ));
        device.mark_connected();
        memory.block().control.write(Control::RUNNING);
        let (producer, consumer) = queue::bounded(capacity);
        let stats = producer.statistics().clone();
        Self {
            inner: Arc::new(BenchInner {
                memory,
                handler: InterruptHandler::new(device.clone(), producer),
                device,
                stats,
                consumer: Mutex::new(Some(consumer)),
            }),
        }
    }

    pub(crate) fn bus(&self) -> Arc<Device> {
        self.inner.device.clone()
    }

    pub(crate) fn chip(&self) -> &'static RegisterBlock {
        self.inner.memory.block()
    }

    pub(crate) fn queue_statistics(&self) -> Arc<QueueStatistics> {
        self.inner.stats.clone()
    }

    /// Take the receiving end of the queue
    pub(crate) fn consumer(&self) -> Consumer<Receipt> {
        self.inner
            .consumer
            .lock()
            .unwrap()
            .take()
            .expect("queue consumer already taken")
    }

    /// Run the receive task on its own thread
    pub(crate) fn start(&self) {
        let consumer = self.consumer();
        std::thread::spawn(move || receive_task(consumer));
    }

    /// Run `effect` on the registers whenever the chip is put into reset
    pub(crate) fn on_reset_request(&self, effect: impl Fn(&RegisterBlock) + Send + Sync + 'static) {
        if self.inner.device.on_reset_request.set(Box::new(effect)).is_err() {
            panic!("reset effect already installed");
        }
    }

    /// Assert the interrupt line with `sources` pending
    pub(crate) fn raise(&self, sources: InterruptSet) {
        self.chip().interrupt.write(sources);
        self.inner.handler.service();
        self.chip().interrupt.write(InterruptSet::NONE);
    }

    /// Place `message` in the receive buffer and interrupt
    pub(crate) fn receive(&self, message: &Message) {
        self.chip().rx_buffer.store(message);
        self.raise(InterruptSet::RECEIVE);
    }
}

struct SimModule {
    memory: RegisterMemory,
    manufacturer: u8,
    model: u8,
    handler: Option<Arc<dyn InterruptService>>,
    irq_commands: Vec<IrqCommand>,
}

/// Carrier board with TIP810 modules in the given slots
pub(crate) struct SimCarrier {
    modules: Mutex<HashMap<Site, SimModule>>,
}

impl SimCarrier {
    pub(crate) fn new(sites: impl IntoIterator<Item = Site>) -> Arc<Self> {
        let modules = sites
            .into_iter()
            .map(|site| {
                let module = SimModule {
                    memory: RegisterMemory::new(),
                    manufacturer: MANUFACTURER_TEWS,
                    model: MODEL_TIP810,
                    handler: None,
                    irq_commands: Vec::new(),
                };
                (site, module)
            })
            .collect();
        Arc::new(Self {
            modules: Mutex::new(modules),
        })
    }

    pub(crate) fn chip(&self, site: Site) -> &'static RegisterBlock {
        self.modules.lock().unwrap()[&site].memory.block()
    }

    /// Connect a foreign handler to `site`, as if another driver held its
    /// vector
    pub(crate) fn occupy(&self, site: Site) {
        struct Foreign;
        impl InterruptService for Foreign {
            fn service(&self) {}
        }
        self.modules.lock().unwrap().get_mut(&site).unwrap().handler = Some(Arc::new(Foreign));
    }

    pub(crate) fn irq_commands(&self, site: Site) -> Vec<IrqCommand> {
        self.modules.lock().unwrap()[&site].irq_commands.clone()
    }

    pub(crate) fn raise(&self, site: Site, sources: InterruptSet) {
        let handler = self.modules.lock().unwrap()[&site]
            .handler
            .clone()
            .expect("interrupt not connected");
        let chip = self.chip(site);
        chip.interrupt.write(sources);
        handler.service();
        chip.interrupt.write(InterruptSet::NONE);
    }

    pub(crate) fn receive(&self, site: Site, message: &Message) {
        self.chip(site).rx_buffer.store(message);
        self.raise(site, InterruptSet::RECEIVE);
    }
}

// Safety: The register blocks are leaked and each is handed out for one site
// only.
unsafe impl Carrier for SimCarrier {
    fn validate(&self, site: Site, manufacturer: u8, model: u8) -> Result<(), CarrierError> {
        let modules = self.modules.lock().unwrap();
        let module = modules.get(&site).ok_or(CarrierError::NoModule(site))?;
        if module.manufacturer != manufacturer {
            return Err(CarrierError::WrongManufacturer {
                site,
                expected: manufacturer,
                found: module.manufacturer,
            });
        }
        if module.model != model {
            return Err(CarrierError::WrongModel {
                site,
                expected: model,
                found: module.model,
            });
        }
        Ok(())
    }

    fn base_address(&self, site: Site, space: AddressSpace) -> Result<NonNull<u8>, CarrierError> {
        assert_eq!(space, AddressSpace::Io);
        let modules = self.modules.lock().unwrap();
        let module = modules.get(&site).ok_or(CarrierError::NoModule(site))?;
        Ok(module.memory.base())
    }

    fn irq_command(
        &self,
        site: Site,
        _line: u8,
        command: IrqCommand,
    ) -> Result<bool, CarrierError> {
        let mut modules = self.modules.lock().unwrap();
        let module = modules.get_mut(&site).ok_or(CarrierError::NoModule(site))?;
        module.irq_commands.push(command);
        Ok(false)
    }

    fn connect_interrupt(
        &self,
        site: Site,
        vector: u8,
        handler: Arc<dyn InterruptService>,
    ) -> Result<(), CarrierError> {
        let mut modules = self.modules.lock().unwrap();
        let module = modules.get_mut(&site).ok_or(CarrierError::NoModule(site))?;
        if module.handler.is_some() {
            return Err(CarrierError::VectorInUse(vector));
        }
        module.handler = Some(handler);
        Ok(())
    }
}
