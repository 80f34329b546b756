//! A `smoltcp` phy [`Device`] backed by plain in-memory queues.
//!
//! Grounded on the shape of the teacher's own `connlib::l3-tcp::InMemoryDevice`: a layer-3
//! (IP-medium) virtual NIC with no real hardware underneath. Packets pushed via
//! [`InMemoryDevice::inject`] become readable by the `smoltcp` interface; packets the interface
//! transmits are drained via [`InMemoryDevice::drain`] by the driver task, which re-encrypts them
//! and ships them out over a real UDP socket to the owning peer.

use std::collections::VecDeque;

use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;

const MTU: usize = 1280;

pub struct InMemoryDevice {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
}

impl Default for InMemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDevice {
    pub fn new() -> Self {
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
        }
    }

    pub fn inject(&mut self, packet: Vec<u8>) {
        self.inbound.push_back(packet);
    }

    pub fn drain(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }

    pub fn has_pending_rx(&self) -> bool {
        !self.inbound.is_empty()
    }
}

impl Device for InMemoryDevice {
    type RxToken<'a> = RxTok;
    type TxToken<'a> = TxTok<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.inbound.pop_front()?;
        Some((RxTok { packet }, TxTok { sink: &mut self.outbound }))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxTok { sink: &mut self.outbound })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = MTU;
        let mut checksum = ChecksumCapabilities::default();
        checksum.ipv4 = Checksum::Tx;
        checksum.tcp = Checksum::Tx;
        checksum.udp = Checksum::Tx;
        checksum.icmpv4 = Checksum::Tx;
        caps.checksum = checksum;
        caps
    }
}

pub struct RxTok {
    packet: Vec<u8>,
}

impl RxToken for RxTok {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.packet)
    }
}

pub struct TxTok<'a> {
    sink: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxToken for TxTok<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.sink.push_back(buf);
        result
    }
}
