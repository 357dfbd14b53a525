use std::cell::Cell;
use std::rc::Rc;

use aero_cpu_core::backend::{
    interpret_block, BlockExit, BlockSource, CodeBuffer, CodeCacheStats, CodeGenerator, CodeHandle, CompileError,
};
use aero_cpu_core::decode::Instruction;
use aero_cpu_core::state::gpr;
use aero_cpu_core::{BackendKind, Cpu, CpuConfig, ExecDispatcher, RunExit};
use aero_mem::{MemoryBus, MemoryBusConfig};
use pretty_assertions::assert_eq;

const CODE: u64 = 0x1000;

/// Keeps decoded instructions in a table and emits the table index as the
/// "generated code".
#[derive(Default)]
struct TableGenerator {
    blocks: Vec<Vec<Instruction>>,
    executed: Rc<Cell<u32>>,
}

impl CodeGenerator for TableGenerator {
    fn compile(&mut self, source: &BlockSource<'_>, buffer: &mut CodeBuffer) -> Result<CodeHandle, CompileError> {
        let handle = buffer.allocate(self.estimate_size(source))?;
        buffer.code_mut(handle)[..4].copy_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        self.blocks.push(source.instructions.to_vec());
        Ok(handle)
    }

    fn execute(&mut self, code: &[u8], cpu: &mut Cpu) -> BlockExit {
        self.executed.set(self.executed.get() + 1);
        let index = u32::from_le_bytes([code[0], code[1], code[2], code[3]]) as usize;
        interpret_block(cpu, &self.blocks[index], |_| true)
    }
}

fn bus() -> MemoryBus {
    MemoryBus::new(MemoryBusConfig {
        address_bits: 32,
        ram_size: 0x10_0000,
    })
    .unwrap()
}

fn load(dispatcher: &mut ExecDispatcher, code: &[u8]) {
    let cpu = dispatcher.cpu_mut();
    cpu.bus.write_bytes(CODE, code);
    cpu.set_real_mode_entry(0x0100, 0);
}

fn recompiler(code_buffer_size: usize) -> (ExecDispatcher, Rc<Cell<u32>>) {
    let generator = TableGenerator::default();
    let executed = generator.executed.clone();
    let config = CpuConfig {
        backend: BackendKind::Recompiler,
        code_buffer_size,
        ..CpuConfig::default()
    };
    let dispatcher = ExecDispatcher::with_code_generator(config, bus(), Box::new(generator)).unwrap();
    (dispatcher, executed)
}

// mov cx, 10 ; l: add ax, cx ; loop l ; hlt
const SUM_LOOP: [u8; 8] = [0xB9, 0x0A, 0x00, 0x01, 0xC8, 0xE2, 0xFC, 0xF4];

#[test]
fn recompiler_matches_the_interpreter() {
    let (mut dispatcher, executed) = recompiler(64 * 1024);
    load(&mut dispatcher, &SUM_LOOP);
    assert_eq!(dispatcher.run(10_000), RunExit::Halted);
    assert_eq!(dispatcher.cpu().state.ax(), 55);
    assert!(executed.get() > 1);

    let mut interpreter = ExecDispatcher::new(
        CpuConfig {
            backend: BackendKind::Interpreter,
            ..CpuConfig::default()
        },
        bus(),
    )
    .unwrap();
    load(&mut interpreter, &SUM_LOOP);
    assert_eq!(interpreter.run(10_000), RunExit::Halted);
    assert_eq!(interpreter.cpu().state.ax(), dispatcher.cpu().state.ax());
    assert_eq!(interpreter.stats(), CodeCacheStats::default());
}

#[test]
fn self_modifying_block_is_destroyed_after_it_exits() {
    let (mut dispatcher, executed) = recompiler(64 * 1024);
    let mut code = vec![0x90; 0x12];
    // mov byte [cs:0x0010], 0x4B ; jmp 0x10
    code[..8].copy_from_slice(&[0x2E, 0xC6, 0x06, 0x10, 0x00, 0x4B, 0xEB, 0x08]);
    // 0x10: inc cx (patched to dec bx) ; hlt
    code[0x10..].copy_from_slice(&[0x41, 0xF4]);
    load(&mut dispatcher, &code);

    assert_eq!(dispatcher.run(1_000), RunExit::Halted);
    let state = &dispatcher.cpu().state;
    assert_eq!(state.cx(), 0);
    assert_eq!(state.reg16(gpr::EBX), 0xFFFF);

    let stats = dispatcher.stats();
    assert_eq!(stats.deferred, 1);
    assert_eq!(stats.compiled, 2);
    assert_eq!(executed.get(), 2);
}

#[test]
fn external_write_recompiles_the_block() {
    let mut dispatcher = ExecDispatcher::new(CpuConfig::default(), bus()).unwrap();
    // inc ax ; hlt
    load(&mut dispatcher, &[0x40, 0xF4]);
    assert_eq!(dispatcher.run(100), RunExit::Halted);
    assert_eq!(dispatcher.cpu().state.ax(), 1);
    assert!(dispatcher.cpu().bus.is_cached_code_page(CODE));

    // dec ax ; hlt
    load(&mut dispatcher, &[0x48, 0xF4]);
    assert!(!dispatcher.cpu().bus.is_cached_code_page(CODE));
    assert_eq!(dispatcher.run(100), RunExit::Halted);
    assert_eq!(dispatcher.cpu().state.ax(), 0);

    let stats = dispatcher.stats();
    assert_eq!(stats.invalidated, 1);
    assert_eq!(stats.compiled, 2);
}

#[test]
fn code_buffer_exhaustion_flushes_and_keeps_running() {
    // Room for the first three-instruction block and nothing else.
    let (mut dispatcher, _) = recompiler(128 * 3 + 64);
    load(&mut dispatcher, &SUM_LOOP);

    assert_eq!(dispatcher.run(10_000), RunExit::Halted);
    assert_eq!(dispatcher.cpu().state.ax(), 55);
    let stats = dispatcher.stats();
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.uncached, 2);
}

#[test]
fn explicit_flush_drops_code_pages() {
    let mut dispatcher = ExecDispatcher::new(CpuConfig::default(), bus()).unwrap();
    load(&mut dispatcher, &[0x90, 0xF4]);
    dispatcher.run(100);
    assert!(dispatcher.cpu().bus.is_cached_code_page(CODE));

    dispatcher.flush_code_cache();
    assert!(!dispatcher.cpu().bus.is_cached_code_page(CODE));
    assert_eq!(dispatcher.stats().flushes, 1);
}
