//! Guest physical address space and port I/O routing for the CPU core.
//!
//! [`MemoryBus`] splits the physical address space into fixed 4 KiB pages. Each
//! page is either backed by RAM (readable and/or writable), routed to an MMIO
//! handler, or unmapped. RAM accesses take a direct fast path; everything else
//! goes through the handler lookup, and unmapped accesses follow the open-bus
//! convention (reads return all-ones, writes are dropped).
//!
//! Pages referenced by translated code are flagged with
//! [`PageType::CACHED_CODE`]. A write that actually changes the contents of such
//! a page fires the code invalidation callback registered on the bus, so the
//! code cache can throw away stale translations.
//!
//! [`IoPortBus`] is the separate port-mapped I/O space (`IN`/`OUT`).

#![forbid(unsafe_code)]

mod io_port_bus;
mod memory_bus;
mod mmio;
mod page;
mod physical_memory;

pub use io_port_bus::{IoPortBus, PortIoDevice};
pub use memory_bus::{BusValue, CodeInvalidationCallback, MemoryBus, MemoryBusConfig, MemoryBusError};
pub use mmio::MmioHandler;
pub use page::{PageType, PAGE_MASK, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE};
pub use physical_memory::{PhysicalMemory, PhysicalMemoryError};
