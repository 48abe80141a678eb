//! The motherboard bus: owns memory, the DMA
//! cursor, the device and port registries, the interrupt controller, and the
//! boot sequence. Grounded on BasicCPU's own `Motherboard` class, which plays
//! the same coordinating role between the CPU and its devices.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{info, warn};

use crate::devices::{Device, DeviceInit, SharedMemory};
use crate::error::MotherboardError;
use crate::interrupt::{InterruptController, InterruptLines};
use crate::processor::Cpu;

const MIN_MEMORY: usize = 1024;
const INITIAL_RESERVED_CURSOR: usize = 4;

/// A reported device or boot failure, handed to whatever exception reporter
/// the caller installed.
pub type ExceptionReporter = Box<dyn Fn(&str) + Send>;

/// The port-addressable device registry, handed to the CPU once boot
/// finishes initialising every device. A `write` opcode goes through here
/// rather than through `Motherboard` directly, since the motherboard itself
/// is consumed by `start` before the CPU's fetch-execute loop begins.
pub struct PortBus {
    devices: Mutex<Vec<Box<dyn Device>>>,
    ports: HashMap<u16, String>,
}

impl PortBus {
    fn new(devices: Vec<Box<dyn Device>>, ports: HashMap<u16, String>) -> Self {
        PortBus { devices: Mutex::new(devices), ports }
    }

    /// A bus with no devices and no bound ports, for unit tests that don't
    /// exercise port I/O.
    pub fn empty() -> Self {
        PortBus { devices: Mutex::new(Vec::new()), ports: HashMap::new() }
    }

    pub fn write(&self, port: u16, word: u32) -> Result<(), MotherboardError> {
        let owner = self.ports.get(&port).cloned().ok_or(MotherboardError::NoSuchPort { port })?;
        let mut devices = self.devices.lock().unwrap();
        let device = devices.iter_mut().find(|d| d.name() == owner).expect("port map and device registry agree");
        device.write(word, port);
        Ok(())
    }

    /// The first framebuffer-shaped device's DMA region, if any is bound.
    pub fn framebuffer_region(&self) -> Option<(usize, u32, u32)> {
        self.devices.lock().unwrap().iter().find_map(|d| d.framebuffer_region())
    }
}

pub struct Motherboard {
    memory_size: usize,
    min_avail_memory: usize,
    memory: SharedMemory,
    reserved_cursor: usize,
    bios: Option<(Vec<u8>, u32)>,
    devices: Vec<Box<dyn Device>>,
    ports: HashMap<u16, String>,
    interrupt_controller: Option<Arc<InterruptController>>,
    interrupt_lines: Arc<InterruptLines>,
    cpu: Option<Cpu>,
    threads: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    aborted: bool,
    reporter: ExceptionReporter,
}

impl Motherboard {
    pub fn new(memory_size: usize) -> Self {
        Motherboard {
            memory_size,
            min_avail_memory: 0,
            memory: Arc::new(Mutex::new(Vec::new())),
            reserved_cursor: INITIAL_RESERVED_CURSOR,
            bios: None,
            devices: Vec::new(),
            ports: HashMap::new(),
            interrupt_controller: None,
            interrupt_lines: InterruptLines::new(),
            cpu: None,
            threads: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            aborted: false,
            reporter: Box::new(|msg| warn!("{}", msg)),
        }
    }

    pub fn set_memory_size(&mut self, n: usize) {
        self.memory_size = n;
    }

    pub fn set_min_avail_memory(&mut self, n: usize) {
        self.min_avail_memory = n;
    }

    pub fn set_bios(&mut self, bytes: Vec<u8>, entry_address: u32) {
        self.bios = Some((bytes, entry_address));
    }

    pub fn set_exception_reporter(&mut self, reporter: impl Fn(&str) + Send + 'static) {
        self.reporter = Box::new(reporter);
    }

    pub fn add_cpu(&mut self, cpu: Cpu) {
        self.cpu = Some(cpu);
    }

    pub fn add_device(&mut self, device: Box<dyn Device>) {
        self.devices.push(device);
    }

    pub fn interrupt_lines(&self) -> Arc<InterruptLines> {
        Arc::clone(&self.interrupt_lines)
    }

    /// Requested up front so the interrupt controller's DMA region is
    /// reserved before any other device's, matching boot step 3.
    pub fn install_interrupt_controller(&mut self, num_lines: u32) -> Result<(), MotherboardError> {
        let size = num_lines as usize * 4;
        if self.memory_size.saturating_sub(self.reserved_cursor + size) < self.min_avail_memory {
            return Err(MotherboardError::OutOfMemory {
                requested: size,
                available: self.memory_size.saturating_sub(self.reserved_cursor),
            });
        }
        let base = self.reserved_cursor;
        self.reserved_cursor += size;
        self.interrupt_controller = Some(Arc::new(InterruptController::new(base, Arc::clone(&self.interrupt_lines))));
        Ok(())
    }

    pub fn interrupt_controller(&self) -> Option<Arc<InterruptController>> {
        self.interrupt_controller.clone()
    }

    pub fn memory(&self) -> SharedMemory {
        Arc::clone(&self.memory)
    }

    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Runs the full boot sequence, then the CPU's
    /// main loop to completion. Consumes `self` because the devices'
    /// background threads, once joined, cannot be restarted.
    pub fn start(mut self) -> Result<(), MotherboardError> {
        if self.cpu.is_none() {
            return Err(MotherboardError::NoCpus);
        }
        if self.memory_size < MIN_MEMORY {
            return Err(MotherboardError::InsufficientMemory { requested: self.memory_size, minimum: MIN_MEMORY });
        }

        info!("allocating {} bytes of memory", self.memory_size);
        *self.memory.lock().unwrap() = vec![0u8; self.memory_size];

        if self.aborted {
            return Err(MotherboardError::Aborted);
        }

        let devices = std::mem::take(&mut self.devices);
        let mut initialised = Vec::with_capacity(devices.len());
        for mut device in devices {
            let mut ctx = DeviceInit {
                device_name: device.name().to_string(),
                memory_size: self.memory_size,
                min_avail_memory: self.min_avail_memory,
                reserved_cursor: &mut self.reserved_cursor,
                ports: &mut self.ports,
                memory: Arc::clone(&self.memory),
                interrupt_controller: self.interrupt_controller.clone(),
                shutdown: Arc::clone(&self.shutdown),
                threads: &mut self.threads,
            };
            match device.init(&mut ctx) {
                Ok(()) => {
                    info!("device `{}` initialised", device.name());
                    initialised.push(device);
                }
                Err(e) => {
                    let message = format!("device `{}` failed to initialise: {}", device.name(), e);
                    warn!("{}", message);
                    (self.reporter)(&message);
                }
            }
            if self.aborted {
                return Err(MotherboardError::Aborted);
            }
        }
        self.devices = initialised;

        let (bios, entry) = self.bios.take().unwrap_or_else(|| (Vec::new(), self.reserved_cursor as u32));
        let entry = (entry as usize + 3) / 4 * 4;
        {
            let mut memory = self.memory.lock().unwrap();
            let end = entry + bios.len();
            if end > memory.len() {
                memory.resize(end, 0);
            }
            memory[entry..end].copy_from_slice(&bios);
        }
        info!("BIOS loaded at {:#010x} ({} bytes)", entry, bios.len());

        let ports = PortBus::new(std::mem::take(&mut self.devices), self.ports.clone());

        let mut cpu = self.cpu.take().expect("checked above");
        info!("starting master CPU at {:#010x}", entry);
        let run_result = cpu.start(
            Arc::clone(&self.memory),
            Arc::clone(&self.interrupt_lines),
            self.interrupt_controller.clone(),
            ports,
            self.memory_size,
            entry as u32,
        );

        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        for handle in std::mem::take(&mut self.threads) {
            let _ = handle.join();
        }

        if let Err(e) = &run_result {
            let message = format!("runtime fault: {}", e);
            warn!("{}", message);
            (self.reporter)(&message);
        }
        info!("motherboard shut down");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDevice {
        name: String,
        dma_request: usize,
    }

    impl Device for StubDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn init(&mut self, ctx: &mut DeviceInit) -> Result<(), MotherboardError> {
            ctx.reserve_dma(self.dma_request)?;
            ctx.request_port(0)?;
            Ok(())
        }

        fn write(&mut self, _word: u32, _port: u16) {}
    }

    #[test]
    fn dma_reservations_are_monotonic_and_bounded() {
        let mut mb = Motherboard::new(1024);
        mb.set_min_avail_memory(512);

        let mut ports = HashMap::new();
        let mut cursor = INITIAL_RESERVED_CURSOR;
        let mut threads = Vec::new();
        let memory: SharedMemory = Arc::new(Mutex::new(vec![0u8; 1024]));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut ctx = DeviceInit {
            device_name: "dev".to_string(),
            memory_size: 1024,
            min_avail_memory: 512,
            reserved_cursor: &mut cursor,
            ports: &mut ports,
            memory: Arc::clone(&memory),
            interrupt_controller: None,
            shutdown: Arc::clone(&shutdown),
            threads: &mut threads,
        };

        let first = ctx.reserve_dma(100).unwrap();
        assert_eq!(first, INITIAL_RESERVED_CURSOR);
        assert!(ctx.reserve_dma(500).is_err());
    }

    #[test]
    fn boot_fails_with_no_cpu() {
        let mb = Motherboard::new(4096);
        assert!(matches!(mb.start(), Err(MotherboardError::NoCpus)));
    }

    #[test]
    fn boot_fails_below_minimum_memory() {
        let mut mb = Motherboard::new(16);
        mb.add_cpu(Cpu::new());
        assert!(matches!(mb.start(), Err(MotherboardError::InsufficientMemory { .. })));
    }
}
