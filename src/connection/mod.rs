//! Register bus abstraction and completion signalling
//!
//! The controller is reached through a narrow register-oriented bus supplied
//! by the host ([`RegisterIo`]). Command completion is signalled out-of-band
//! by the attention interrupt line; the host forwards each edge through an
//! [`AttentionSignal`] and the flasher blocks on the paired [`AttentionSlot`].

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::time::Duration;

use log::{debug, trace};

use crate::error::{ConnectionError, TimedOutCommand, TransportError};

pub mod discovery;

/// Register-level access to the controller, provided by the host.
///
/// Addresses are page-0 register addresses. Reads and writes must be
/// performed as single bus transactions; the protocol relies on multi-byte
/// accesses hitting auto-incrementing register windows.
pub trait RegisterIo {
    fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), TransportError>;

    fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Host-side handle used to forward the attention interrupt.
///
/// The channel holds a single pending notification; posting while one is
/// already pending is a no-op, matching the level-triggered nature of the
/// interrupt line.
#[derive(Clone)]
pub struct AttentionSignal {
    tx: SyncSender<()>,
}

impl AttentionSignal {
    pub fn post(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Consumer end of the attention channel, owned by the [`Connection`].
pub struct AttentionSlot {
    rx: Receiver<()>,
}

impl AttentionSlot {
    fn wait(&self, timeout: Duration) -> Result<(), ConnectionError> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(ConnectionError::Timeout(TimedOutCommand::default()))
            }
        }
    }

    fn drain(&self) {
        loop {
            match self.rx.try_recv() {
                Ok(()) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }
}

/// Create a connected attention signal/slot pair.
pub fn attention_pair() -> (AttentionSignal, AttentionSlot) {
    let (tx, rx) = sync_channel(1);
    (AttentionSignal { tx }, AttentionSlot { rx })
}

/// Directive to the host to hold off power-state transitions while a flash
/// session is running.
pub trait PowerHold {
    fn stay_awake(&mut self) {}
    fn relax(&mut self) {}
}

/// [`PowerHold`] implementation for hosts without suspend states.
#[derive(Debug, Default)]
pub struct NoopPower;

impl PowerHold for NoopPower {}

/// A register bus paired with the attention channel.
pub struct Connection {
    transport: Box<dyn RegisterIo + Send>,
    attention: AttentionSlot,
    attention_enabled: bool,
}

impl Connection {
    pub fn new(transport: impl RegisterIo + Send + 'static, attention: AttentionSlot) -> Self {
        Connection {
            transport: Box::new(transport),
            attention,
            attention_enabled: false,
        }
    }

    pub fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<(), ConnectionError> {
        self.transport.read(addr, buf)?;
        trace!("read {:#06x}: {:02x?}", addr, buf);
        Ok(())
    }

    pub fn read_u8(&mut self, addr: u16) -> Result<u8, ConnectionError> {
        let mut buf = [0];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn write(&mut self, addr: u16, bytes: &[u8]) -> Result<(), ConnectionError> {
        trace!("write {:#06x}: {:02x?}", addr, bytes);
        self.transport.write(addr, bytes)?;
        Ok(())
    }

    pub fn write_u8(&mut self, addr: u16, value: u8) -> Result<(), ConnectionError> {
        self.write(addr, &[value])
    }

    /// Start consuming attention interrupts. Any edge delivered while the
    /// interrupt was routed to touch reporting is stale and gets dropped.
    pub fn enable_attention(&mut self) {
        debug!("attention interrupt enabled");
        self.attention.drain();
        self.attention_enabled = true;
    }

    pub fn disable_attention(&mut self) {
        debug!("attention interrupt disabled");
        self.attention_enabled = false;
        self.attention.drain();
    }

    pub fn attention_enabled(&self) -> bool {
        self.attention_enabled
    }

    /// Drop a pending notification, if any. Used when the device is found
    /// already in bootloader mode and the edge that got it there is stale.
    pub fn clear_attention(&mut self) {
        self.attention.drain();
    }

    /// Block until the next attention edge or the timeout elapses.
    pub fn wait_attention(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        if !self.attention_enabled {
            return Err(ConnectionError::Timeout(TimedOutCommand::default()));
        }
        self.attention.wait(timeout)
    }
}
