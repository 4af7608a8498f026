//! One CAN bus: its chip, counters, callbacks and the synchronous
//! transmit and request/reply paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::{Duration, Instant};

use tip810_core::Site;

use crate::config::BusRate;
use crate::error::{Error, Result};
use crate::interrupt::BusStatus;
use crate::message::{FrameKind, Message, CAN_IDENTIFIERS};
use crate::reg::{Chip, Command, Control, Status};
use crate::sync::Signal;

/// Receives every message that arrives with the identifier it was
/// registered for.
///
/// Handlers run on the receive task, one message at a time for all buses.
/// They must return promptly and must not wait for other traffic.
pub trait MessageHandler: Send + Sync {
    /// Examine a received message
    fn on_message(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn on_message(&self, message: &Message) {
        self(message)
    }
}

/// Told about changes of the bus state.
///
/// Handlers run in interrupt context and must never block.
pub trait StatusHandler: Send + Sync {
    /// React to a bus state change
    fn on_status(&self, status: BusStatus);
}

impl<F> StatusHandler for F
where
    F: Fn(BusStatus) + Send + Sync,
{
    fn on_status(&self, status: BusStatus) {
        self(status)
    }
}

fn same_handler<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    // Compare data pointers only; vtable pointers of the same type may differ
    // between codegen units.
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

const NO_IDENTIFIER: u32 = u32::MAX;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) transmitted: AtomicU64,
    pub(crate) received: AtomicU64,
    pub(crate) overruns: AtomicU64,
    pub(crate) unrouted: AtomicU64,
    pub(crate) last_unrouted: AtomicU32,
    pub(crate) errors: AtomicU64,
    pub(crate) bus_off: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        let counters = Self::default();
        counters.last_unrouted.store(NO_IDENTIFIER, Ordering::Relaxed);
        counters
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn clear(&self) {
        for counter in [
            &self.transmitted,
            &self.received,
            &self.overruns,
            &self.unrouted,
            &self.errors,
            &self.bus_off,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_unrouted.store(NO_IDENTIFIER, Ordering::Relaxed);
    }
}

/// Snapshot of a bus's traffic and error counters
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Messages whose transmission completed
    pub transmitted: u64,
    /// Messages taken off the receive queue
    pub received: u64,
    /// Receive overruns recovered from
    pub overruns: u64,
    /// Received messages nobody had registered for
    pub unrouted: u64,
    /// Identifier of the most recent unrouted message
    pub last_unrouted: Option<u16>,
    /// Error warning interrupts
    pub errors: u64,
    /// Bus-off events
    pub bus_off: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingRead {
    Idle,
    Waiting(u16),
    Replied(Message),
}

/// A registered CAN bus.
///
/// Devices are created through [`Registry::create`](crate::Registry::create)
/// and live as long as the registry holds them.
pub struct Device {
    name: String,
    site: Site,
    vector: u8,
    bus_rate: BusRate,
    pub(crate) chip: Chip,
    pub(crate) tx_ready: Signal,
    read_lock: Mutex<()>,
    reply_arrived: Signal,
    pending: Mutex<PendingRead>,
    pub(crate) counters: Counters,
    message_handlers: RwLock<BTreeMap<u16, Vec<Arc<dyn MessageHandler>>>>,
    status_handlers: RwLock<Vec<Arc<dyn StatusHandler>>>,
    pub(crate) silence_errors: bool,
    connected: AtomicBool,
    /// Stands in for what the chip does to its registers on reset-request
    #[cfg(test)]
    pub(crate) on_reset_request: std::sync::OnceLock<Box<dyn Fn(&crate::reg::RegisterBlock) + Send + Sync>>,
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("site", &self.site)
            .field("vector", &self.vector)
            .field("bus_rate", &self.bus_rate)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub(crate) fn new(
        name: String,
        site: Site,
        vector: u8,
        bus_rate: BusRate,
        chip: Chip,
        silence_errors: bool,
    ) -> Self {
        Self {
            name,
            site,
            vector,
            bus_rate,
            chip,
            tx_ready: Signal::new(true),
            read_lock: Mutex::new(()),
            reply_arrived: Signal::new(false),
            pending: Mutex::new(PendingRead::Idle),
            counters: Counters::new(),
            message_handlers: RwLock::new(BTreeMap::new()),
            status_handlers: RwLock::new(Vec::new()),
            silence_errors,
            connected: AtomicBool::new(false),
            #[cfg(test)]
            on_reset_request: std::sync::OnceLock::new(),
        }
    }

    /// Bus name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Carrier and slot of the module
    pub fn site(&self) -> Site {
        self.site
    }

    /// Interrupt vector of the module
    pub fn vector(&self) -> u8 {
        self.vector
    }

    /// Configured bit rate
    pub fn bus_rate(&self) -> BusRate {
        self.bus_rate
    }

    fn pending(&self) -> MutexGuard<'_, PendingRead> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send `message`, waiting at most `timeout` for the transmit buffer;
    /// `None` waits indefinitely.
    ///
    /// Returns once the message is in the chip's transmit buffer, not when
    /// it has been sent.
    pub fn write(&self, message: &Message, timeout: Option<Duration>) -> Result<()> {
        message.validate()?;

        if !self.tx_ready.wait(timeout) {
            return Err(Error::Timeout);
        }

        if self.chip.status.read().transmit_buffer_released() {
            self.chip.tx_buffer.store(message);
            self.chip.command.write(Command::TRANSMISSION_REQUEST);
            Ok(())
        } else {
            self.tx_ready.signal();
            log::warn!("{}: transmit buffer locked while transmitter ready", self.name);
            Err(Error::TransmitterBusy)
        }
    }

    /// Ask for the message with `request`'s identifier by sending a remote
    /// frame and wait for the reply. `timeout` bounds the whole exchange.
    ///
    /// Only one read may be outstanding per bus; a second concurrent read
    /// fails with [`Error::DeviceBusy`].
    pub fn read(&self, request: Message, timeout: Option<Duration>) -> Result<Message> {
        request.validate()?;

        let _guard = match self.read_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(Error::DeviceBusy),
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };

        // A deadline past the end of time means no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        *self.pending() = PendingRead::Waiting(request.identifier);

        let rtr = Message {
            kind: FrameKind::Remote,
            ..request
        };
        let sent = self.write(&rtr, timeout);
        let replied = sent.is_ok() && {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.reply_arrived.wait(remaining)
        };

        let slot = core::mem::replace(&mut *self.pending(), PendingRead::Idle);
        if !replied {
            // A reply landing between the timeout and clearing the slot
            // leaves a stale signal behind.
            self.reply_arrived.try_wait();
        }
        sent?;
        match slot {
            PendingRead::Replied(reply) => Ok(reply),
            _ => Err(Error::Timeout),
        }
    }

    /// Deliver a message taken off the receive queue.
    pub(crate) fn dispatch(&self, message: &Message) {
        Counters::bump(&self.counters.received);

        let handlers = self
            .message_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message.identifier)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            Counters::bump(&self.counters.unrouted);
            self.counters
                .last_unrouted
                .store(u32::from(message.identifier), Ordering::Relaxed);
        }
        for handler in handlers {
            handler.on_message(message);
        }

        let mut pending = self.pending();
        if *pending == PendingRead::Waiting(message.identifier) {
            *pending = PendingRead::Replied(*message);
            drop(pending);
            self.reply_arrived.signal();
        }
    }

    /// Run every status handler, in registration order.
    pub(crate) fn notify_status(&self, status: BusStatus) {
        let handlers = self
            .status_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            handler.on_status(status);
        }
    }

    /// Call `handler` for every message received with `identifier`.
    /// Handlers for the same identifier run in registration order.
    pub fn register_message_callback(
        &self,
        identifier: u16,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if usize::from(identifier) >= CAN_IDENTIFIERS {
            return Err(Error::BadMessage);
        }
        self.message_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(identifier)
            .or_default()
            .push(handler);
        Ok(())
    }

    /// Remove the first registration of `handler` for `identifier`.
    pub fn remove_message_callback(
        &self,
        identifier: u16,
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if usize::from(identifier) >= CAN_IDENTIFIERS {
            return Err(Error::BadMessage);
        }
        let mut table = self
            .message_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let list = table.get_mut(&identifier).ok_or(Error::NoMessage)?;
        let index = list
            .iter()
            .position(|h| same_handler(h, handler))
            .ok_or(Error::NoMessage)?;
        list.remove(index);
        if list.is_empty() {
            table.remove(&identifier);
        }
        Ok(())
    }

    /// Call `handler` whenever the bus changes between ok, error and bus-off.
    pub fn register_status_callback(&self, handler: Arc<dyn StatusHandler>) {
        self.status_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Identifiers that have at least one message handler
    pub fn handled_identifiers(&self) -> Vec<u16> {
        self.message_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Identifier of the outstanding synchronous read, if any
    pub fn pending_read(&self) -> Option<u16> {
        match *self.pending() {
            PendingRead::Waiting(identifier) => Some(identifier),
            _ => None,
        }
    }

    /// Whether the bus's interrupt handler is connected, so that its chip
    /// may run
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotInitialised)
        }
    }

    /// Take the chip off the bus. Counters are kept.
    pub fn stop(&self) {
        self.chip.control.modify(|mut c| {
            c.set_reset_request(true);
            c
        });
        #[cfg(test)]
        if let Some(hook) = self.on_reset_request.get() {
            hook(&self.chip);
        }
    }

    /// Put the chip back on the bus with every interrupt source enabled and
    /// release any writer waiting for the transmit buffer.
    ///
    /// Fails with [`Error::NotInitialised`] until the bus's interrupt
    /// handler is connected.
    pub fn restart(&self) -> Result<()> {
        self.ensure_connected()?;
        self.resume();
        Ok(())
    }

    pub(crate) fn resume(&self) {
        self.chip.control.write(Control::RUNNING);
        self.tx_ready.signal();
    }

    pub(crate) fn clear_counters(&self) {
        self.counters.clear();
    }

    /// Reset the chip and clear every counter. Fails like
    /// [`restart`](Self::restart) on a bus that is not connected.
    pub fn reset(&self) -> Result<()> {
        self.ensure_connected()?;
        self.stop();
        self.clear_counters();
        self.tx_ready.signal();
        self.chip.control.write(Control::RUNNING);
        Ok(())
    }

    /// Current traffic and error counters
    pub fn statistics(&self) -> Statistics {
        let c = &self.counters;
        let last = c.last_unrouted.load(Ordering::Relaxed);
        Statistics {
            transmitted: c.transmitted.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            overruns: c.overruns.load(Ordering::Relaxed),
            unrouted: c.unrouted.load(Ordering::Relaxed),
            last_unrouted: u16::try_from(last).ok(),
            errors: c.errors.load(Ordering::Relaxed),
            bus_off: c.bus_off.load(Ordering::Relaxed),
        }
    }

    /// Decoded chip status register
    pub fn chip_status(&self) -> Status {
        self.chip.status.read()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interrupt::InterruptSet;
    use crate::sim::{Bench, RegisterMemory, TX_BUFFER_FREE};
    use std::thread;

    #[test]
    fn write_loads_transmit_buffer_and_requests_transmission() {
        let bench = Bench::new();
        let bus = bench.bus();
        bench.chip().set_status(TX_BUFFER_FREE);

        let message = Message::new(0x123, &[0xde, 0xad]).unwrap();
        bus.write(&message, Some(Duration::ZERO)).unwrap();

        assert_eq!(bench.chip().command_bits(), 0x01);
        assert_eq!(bench.chip().tx_buffer.load(), message);
    }

    #[test]
    fn write_then_transmit_interrupt_signals_once() {
        let bench = Bench::new();
        let bus = bench.bus();
        bench.chip().set_status(TX_BUFFER_FREE);

        for length in [0, 3, 8] {
            let message = Message::new(0x7ff, &[0x55; 8][..length]).unwrap();
            bus.write(&message, Some(Duration::ZERO)).unwrap();
            assert!(!bus.tx_ready.is_raised());

            bench.raise(InterruptSet::TRANSMIT);
            assert!(bus.tx_ready.is_raised());
            bench.raise(InterruptSet::TRANSMIT);
            assert!(bus.tx_ready.try_wait());
            assert!(!bus.tx_ready.try_wait());
            bus.tx_ready.signal();
        }
        assert_eq!(bus.statistics().transmitted, 6);
    }

    #[test]
    fn write_times_out_while_transmitter_is_taken() {
        let bench = Bench::new();
        let bus = bench.bus();
        bench.chip().set_status(TX_BUFFER_FREE);

        let message = Message::new(1, &[]).unwrap();
        bus.write(&message, None).unwrap();
        assert!(matches!(
            bus.write(&message, Some(Duration::from_millis(10))),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn locked_transmit_buffer_reports_busy_and_rearms() {
        let bench = Bench::new();
        let bus = bench.bus();
        bench.chip().set_status(0);

        let message = Message::new(1, &[]).unwrap();
        assert!(matches!(
            bus.write(&message, Some(Duration::ZERO)),
            Err(Error::TransmitterBusy)
        ));
        assert!(bus.tx_ready.is_raised());
    }

    #[test]
    fn bad_message_never_reaches_chip() {
        let bench = Bench::new();
        let bus = bench.bus();
        bench.chip().set_status(TX_BUFFER_FREE);

        let mut message = Message::new(1, &[]).unwrap();
        message.identifier = 0x800;
        assert!(matches!(bus.write(&message, None), Err(Error::BadMessage)));
        assert_eq!(bench.chip().command_bits(), 0);
        assert!(bus.tx_ready.is_raised());
    }

    #[test]
    fn read_times_out_and_leaves_device_usable() {
        let bench = Bench::new();
        let bus = bench.bus();
        bench.chip().set_status(TX_BUFFER_FREE);

        let request = Message::remote(0x42, 2).unwrap();
        let start = Instant::now();
        assert!(matches!(
            bus.read(request, Some(Duration::from_millis(50))),
            Err(Error::Timeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(bus.pending_read(), None);

        // The remote frame went out; completing it re-arms the transmitter.
        assert!(bench.chip().tx_buffer.descriptor().rtr());
        bench.raise(InterruptSet::TRANSMIT);
        bus.write(&Message::new(0x43, &[1]).unwrap(), Some(Duration::ZERO))
            .unwrap();
        bench.raise(InterruptSet::TRANSMIT);

        assert!(matches!(
            bus.read(request, Some(Duration::from_millis(10))),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn read_returns_reply() {
        let bench = Bench::new();
        let bus = bench.bus();
        bench.start();
        bench.chip().set_status(TX_BUFFER_FREE);

        let responder = {
            let bench = bench.clone();
            thread::spawn(move || {
                let bus = bench.bus();
                while bus.pending_read().is_none() {
                    thread::sleep(Duration::from_millis(1));
                }
                bench.raise(InterruptSet::TRANSMIT);
                bench.receive(&Message::new(0x42, &[9, 8]).unwrap());
            })
        };

        let request = Message::remote(0x42, 2).unwrap();
        let reply = bus.read(request, Some(Duration::from_secs(5))).unwrap();
        responder.join().unwrap();

        assert_eq!(reply.payload(), &[9, 8]);
        assert_eq!(reply.kind, FrameKind::Data);
        assert_eq!(bus.pending_read(), None);
    }

    #[test]
    fn concurrent_read_is_busy() {
        let bench = Bench::new();
        let bus = bench.bus();
        bench.chip().set_status(TX_BUFFER_FREE);

        let first = {
            let bus = bus.clone();
            thread::spawn(move || {
                bus.read(Message::remote(1, 0).unwrap(), Some(Duration::from_millis(200)))
            })
        };
        while bus.pending_read().is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            bus.read(Message::remote(2, 0).unwrap(), Some(Duration::ZERO)),
            Err(Error::DeviceBusy)
        ));
        assert!(matches!(first.join().unwrap(), Err(Error::Timeout)));
    }

    #[test]
    fn callbacks_run_in_registration_order_and_can_be_removed() {
        let bench = Bench::new();
        let bus = bench.bus();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first: Arc<dyn MessageHandler> = {
            let seen = seen.clone();
            Arc::new(move |m: &Message| seen.lock().unwrap().push(("first", m.data[0])))
        };
        let second: Arc<dyn MessageHandler> = {
            let seen = seen.clone();
            Arc::new(move |m: &Message| seen.lock().unwrap().push(("second", m.data[0])))
        };
        bus.register_message_callback(0x100, first.clone()).unwrap();
        bus.register_message_callback(0x100, second.clone()).unwrap();

        bus.dispatch(&Message::new(0x100, &[1]).unwrap());
        bus.remove_message_callback(0x100, &first).unwrap();
        bus.dispatch(&Message::new(0x100, &[2]).unwrap());

        assert_eq!(
            *seen.lock().unwrap(),
            [("first", 1), ("second", 1), ("second", 2)]
        );
        assert!(matches!(
            bus.remove_message_callback(0x100, &first),
            Err(Error::NoMessage)
        ));
        assert!(matches!(
            bus.register_message_callback(2048, second),
            Err(Error::BadMessage)
        ));
    }

    #[test]
    fn remove_takes_first_of_duplicate_registrations() {
        let bench = Bench::new();
        let bus = bench.bus();
        let handler: Arc<dyn MessageHandler> = Arc::new(|_: &Message| {});

        bus.register_message_callback(5, handler.clone()).unwrap();
        bus.register_message_callback(5, handler.clone()).unwrap();
        bus.remove_message_callback(5, &handler).unwrap();
        assert_eq!(bus.handled_identifiers(), [5]);
        bus.remove_message_callback(5, &handler).unwrap();
        assert!(bus.handled_identifiers().is_empty());
    }

    #[test]
    fn unrouted_messages_are_counted() {
        let bench = Bench::new();
        let bus = bench.bus();

        bus.dispatch(&Message::new(0x33, &[]).unwrap());
        bus.dispatch(&Message::new(0x34, &[]).unwrap());

        let stats = bus.statistics();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.unrouted, 2);
        assert_eq!(stats.last_unrouted, Some(0x34));
    }

    #[test]
    fn reset_clears_counters_and_restarts() {
        let bench = Bench::new();
        let bus = bench.bus();
        bus.dispatch(&Message::new(0x33, &[]).unwrap());
        bus.stop();
        assert!(bench.chip().control.read().reset_request());

        bus.reset().unwrap();
        assert_eq!(bus.statistics(), Statistics::default());
        assert!(bench.chip().control.read() == Control::RUNNING);
        assert!(bus.tx_ready.is_raised());
    }

    #[test]
    fn unconnected_bus_stays_off() {
        let memory = RegisterMemory::new();
        let bus = Device::new(
            "CAN9".to_owned(),
            Site::new(1, 3),
            0x70,
            BusRate::try_from(125).unwrap(),
            memory.chip(),
            true,
        );
        bus.stop();

        assert!(!bus.is_connected());
        assert!(matches!(bus.restart(), Err(Error::NotInitialised)));
        assert!(matches!(bus.reset(), Err(Error::NotInitialised)));
        assert!(memory.block().control.read().reset_request());
    }

    #[test]
    fn huge_timeouts_wait_without_deadline() {
        let bench = Bench::new();
        let bus = bench.bus();
        bench.start();
        bench.chip().set_status(TX_BUFFER_FREE);

        let message = Message::new(0x10, &[1]).unwrap();
        bus.write(&message, Some(Duration::MAX)).unwrap();
        bench.raise(InterruptSet::TRANSMIT);

        let responder = {
            let bench = bench.clone();
            thread::spawn(move || {
                let bus = bench.bus();
                while bus.pending_read().is_none() {
                    thread::sleep(Duration::from_millis(1));
                }
                bench.raise(InterruptSet::TRANSMIT);
                bench.receive(&Message::new(0x11, &[7]).unwrap());
            })
        };
        let reply = bus
            .read(Message::remote(0x11, 1).unwrap(), Some(Duration::MAX))
            .unwrap();
        responder.join().unwrap();
        assert_eq!(reply.payload(), &[7]);
    }
}
