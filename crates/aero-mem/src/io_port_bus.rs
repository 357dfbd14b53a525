use std::collections::HashMap;

use tracing::trace;

/// A device on the port-mapped I/O space.
///
/// `size` is the access width in bytes (1, 2 or 4). Reads return the value in the
/// low `size` bytes of the result.
pub trait PortIoDevice {
    fn read(&mut self, port: u16, size: u8) -> u32;
    fn write(&mut self, port: u16, size: u8, value: u32);

    /// Reset the device back to its power-on state.
    fn reset(&mut self) {}
}

struct RangeDevice {
    start: u16,
    len: u16,
    dev: Box<dyn PortIoDevice>,
}

impl RangeDevice {
    fn end_exclusive(&self) -> u32 {
        u32::from(self.start) + u32::from(self.len)
    }

    fn contains(&self, port: u16) -> bool {
        let p = u32::from(port);
        p >= u32::from(self.start) && p < self.end_exclusive()
    }
}

/// Routes `IN`/`OUT` accesses to registered devices.
///
/// Exact-port registrations win over range registrations. Ports nobody claims read
/// as all-ones for the access width and swallow writes.
#[derive(Default)]
pub struct IoPortBus {
    devices: HashMap<u16, Box<dyn PortIoDevice>>,
    ranges: Vec<RangeDevice>,
}

fn open_bus(size: u8) -> u32 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

impl IoPortBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, port: u16, device: Box<dyn PortIoDevice>) {
        self.devices.insert(port, device);
    }

    pub fn unregister(&mut self, port: u16) -> Option<Box<dyn PortIoDevice>> {
        self.devices.remove(&port)
    }

    /// Registers a single device over `start..start + len`.
    ///
    /// Ranges may not overlap each other or wrap past port 0xFFFF.
    pub fn register_range(&mut self, start: u16, len: u16, dev: Box<dyn PortIoDevice>) {
        assert!(len != 0, "I/O port range length must be non-zero");

        let end_exclusive = u32::from(start) + u32::from(len);
        assert!(
            end_exclusive <= 0x1_0000,
            "I/O port range wraps past 0xFFFF: start={start:#x} len={len:#x}"
        );

        let idx = self.ranges.partition_point(|r| r.start < start);
        if let Some(prev) = idx.checked_sub(1).and_then(|i| self.ranges.get(i)) {
            assert!(
                u32::from(start) >= prev.end_exclusive(),
                "overlapping I/O port ranges: new=[{start:#x}..{end_exclusive:#x}) prev=[{:#x}..{:#x})",
                prev.start,
                prev.end_exclusive()
            );
        }
        if let Some(next) = self.ranges.get(idx) {
            assert!(
                end_exclusive <= u32::from(next.start),
                "overlapping I/O port ranges: new=[{start:#x}..{end_exclusive:#x}) next=[{:#x}..{:#x})",
                next.start,
                next.end_exclusive()
            );
        }

        self.ranges.insert(idx, RangeDevice { start, len, dev });
    }

    fn device_for(&mut self, port: u16) -> Option<&mut Box<dyn PortIoDevice>> {
        if self.devices.contains_key(&port) {
            return self.devices.get_mut(&port);
        }
        let idx = self.ranges.partition_point(|r| r.start <= port).checked_sub(1)?;
        let range = self.ranges.get_mut(idx)?;
        if range.contains(port) {
            Some(&mut range.dev)
        } else {
            None
        }
    }

    pub fn read(&mut self, port: u16, size: u8) -> u32 {
        match self.device_for(port) {
            Some(dev) => dev.read(port, size) & open_bus(size),
            None => {
                trace!(port = format_args!("{port:#06x}"), size, "read from unclaimed I/O port");
                open_bus(size)
            }
        }
    }

    pub fn write(&mut self, port: u16, size: u8, value: u32) {
        match self.device_for(port) {
            Some(dev) => dev.write(port, size, value & open_bus(size)),
            None => {
                trace!(port = format_args!("{port:#06x}"), size, value, "write to unclaimed I/O port");
            }
        }
    }

    pub fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 1) as u8
    }

    pub fn read_u16(&mut self, port: u16) -> u16 {
        self.read(port, 2) as u16
    }

    pub fn read_u32(&mut self, port: u16) -> u32 {
        self.read(port, 4)
    }

    pub fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, 1, u32::from(value));
    }

    pub fn write_u16(&mut self, port: u16, value: u16) {
        self.write(port, 2, u32::from(value));
    }

    pub fn write_u32(&mut self, port: u16, value: u32) {
        self.write(port, 4, value);
    }

    pub fn reset(&mut self) {
        for dev in self.devices.values_mut() {
            dev.reset();
        }
        for range in &mut self.ranges {
            range.dev.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Latch(Rc<RefCell<Vec<(u16, u8, u32)>>>);

    impl PortIoDevice for Latch {
        fn read(&mut self, port: u16, _size: u8) -> u32 {
            0xAB00 | u32::from(port & 0xFF)
        }

        fn write(&mut self, port: u16, size: u8, value: u32) {
            self.0.borrow_mut().push((port, size, value));
        }
    }

    #[test]
    fn unclaimed_ports_read_all_ones_for_the_access_width() {
        let mut bus = IoPortBus::new();
        assert_eq!(bus.read_u8(0x80), 0xFF);
        assert_eq!(bus.read_u16(0x80), 0xFFFF);
        assert_eq!(bus.read_u32(0x80), 0xFFFF_FFFF);
    }

    #[test]
    fn exact_port_wins_over_range() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut bus = IoPortBus::new();
        bus.register_range(0x3F8, 8, Box::new(Latch(log.clone())));
        bus.write_u8(0x3F9, 0x12);
        assert_eq!(log.borrow().as_slice(), &[(0x3F9, 1, 0x12)]);

        let exact = Rc::new(RefCell::new(Vec::new()));
        bus.register(0x3F9, Box::new(Latch(exact.clone())));
        bus.write_u16(0x3F9, 0x3456);
        assert_eq!(exact.borrow().as_slice(), &[(0x3F9, 2, 0x3456)]);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn reads_are_truncated_to_access_width() {
        let mut bus = IoPortBus::new();
        bus.register(0x61, Box::new(Latch(Rc::default())));
        assert_eq!(bus.read_u8(0x61), 0x61);
        assert_eq!(bus.read_u16(0x61), 0xAB61);
    }

    #[test]
    #[should_panic(expected = "overlapping I/O port ranges")]
    fn overlapping_ranges_are_rejected() {
        let mut bus = IoPortBus::new();
        bus.register_range(0x60, 8, Box::new(Latch(Rc::default())));
        bus.register_range(0x64, 4, Box::new(Latch(Rc::default())));
    }
}
