/// A memory-mapped device window.
///
/// Handlers receive absolute physical addresses. The bus only calls a handler when
/// the whole access (`address..address + size`) lies inside the inclusive range it
/// was registered with, so handlers never see partially covered accesses.
///
/// Only the byte accessors are required; wider accesses default to little-endian
/// composition of byte accesses and can be overridden by devices with real
/// wide registers.
pub trait MmioHandler {
    fn read_u8(&mut self, address: u64) -> u8;
    fn write_u8(&mut self, address: u64, value: u8);

    fn read_u16(&mut self, address: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(address), self.read_u8(address + 1)])
    }

    fn read_u32(&mut self, address: u64) -> u32 {
        let lo = self.read_u16(address) as u32;
        let hi = self.read_u16(address + 2) as u32;
        lo | (hi << 16)
    }

    fn read_u64(&mut self, address: u64) -> u64 {
        let lo = self.read_u32(address) as u64;
        let hi = self.read_u32(address + 4) as u64;
        lo | (hi << 32)
    }

    fn write_u16(&mut self, address: u64, value: u16) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(address + i as u64, b);
        }
    }

    fn write_u32(&mut self, address: u64, value: u32) {
        self.write_u16(address, value as u16);
        self.write_u16(address + 2, (value >> 16) as u16);
    }

    fn write_u64(&mut self, address: u64, value: u64) {
        self.write_u32(address, value as u32);
        self.write_u32(address + 4, (value >> 32) as u32);
    }
}
