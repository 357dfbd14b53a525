#![allow(dead_code)]

use aero_cpu_core::{BackendKind, CpuConfig, CpuModel, ExecDispatcher, RunExit};
use aero_mem::{MemoryBus, MemoryBusConfig};
use anyhow::{bail, Context, Result};

/// Linear address of real-mode code loaded by [`Machine::real_mode`]
/// (CS=0x0100, IP=0).
pub const CODE: u64 = 0x1000;

pub const BACKENDS: [BackendKind; 2] = [BackendKind::Interpreter, BackendKind::CachedInterpreter];

/// Routes `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Machine {
    pub dispatcher: ExecDispatcher,
}

impl Machine {
    /// A Pentium with 1 MiB of RAM, `code` at 0100:0000 and SS:SP = 0000:8000.
    pub fn real_mode(backend: BackendKind, code: &[u8]) -> Result<Self> {
        init_tracing();
        let bus = MemoryBus::new(MemoryBusConfig {
            address_bits: 32,
            ram_size: 0x10_0000,
        })
        .context("create memory bus")?;
        let config = CpuConfig {
            model: CpuModel::Pentium,
            backend,
            ..CpuConfig::default()
        };
        let mut dispatcher = ExecDispatcher::new(config, bus).context("create dispatcher")?;

        let cpu = dispatcher.cpu_mut();
        cpu.bus.write_bytes(CODE, code);
        cpu.set_real_mode_entry(0x0100, 0);
        cpu.state.set_reg32(aero_cpu_core::state::gpr::ESP, 0x8000);
        Ok(Self { dispatcher })
    }

    /// Writes a real-mode IVT entry.
    pub fn set_vector(&mut self, vector: u8, segment: u16, offset: u16) {
        let bus = &mut self.cpu_mut().bus;
        let entry = u64::from(vector) * 4;
        bus.write_u16(entry, offset);
        bus.write_u16(entry + 2, segment);
    }

    pub fn load(&mut self, addr: u64, bytes: &[u8]) {
        self.cpu_mut().bus.write_bytes(addr, bytes);
    }

    pub fn cpu(&self) -> &aero_cpu_core::Cpu {
        self.dispatcher.cpu()
    }

    pub fn cpu_mut(&mut self) -> &mut aero_cpu_core::Cpu {
        self.dispatcher.cpu_mut()
    }

    /// Runs until the CPU halts. Anything else within `budget` cycles is an
    /// error.
    pub fn run_until_halt(&mut self, budget: u64) -> Result<()> {
        match self.dispatcher.run(budget) {
            RunExit::Halted => Ok(()),
            RunExit::BudgetExhausted => bail!(
                "cpu still running after {budget} cycles (eip={:#x})",
                self.cpu().state.eip
            ),
            RunExit::Shutdown(exit) => bail!("cpu shut down: {exit:?}"),
        }
    }
}
