//! The device interface and the boot-time context a device uses to reserve
//! memory/ports and spawn its background thread.
//!
//! Concrete devices reserve a DMA region once during `init` and thereafter
//! talk to the guest purely through that shared memory slice and through
//! `write`. DMA regions are plain slices of the single shared memory buffer:
//! there is no separate per-device backing store to keep in sync.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::MotherboardError;
use crate::interrupt::InterruptController;

pub type SharedMemory = Arc<Mutex<Vec<u8>>>;

/// A device bound into the motherboard. `init` runs once, synchronously,
/// during boot; it is the only place a device reserves resources.
pub trait Device: Send {
    fn name(&self) -> &str;

    fn init(&mut self, ctx: &mut DeviceInit) -> Result<(), MotherboardError>;

    /// Invoked by `PortBus::write` when the guest writes to this device's
    /// port.
    fn write(&mut self, word: u32, port: u16);

    /// The DMA region a framebuffer-shaped device paints into, if this
    /// device is one: `(base_address, width, height)`. The CPU's
    /// `clrset`/`clrsetv` opcodes consult this through `PortBus` rather than
    /// knowing any device's address directly. Devices that
    /// are not a framebuffer leave the default.
    fn framebuffer_region(&self) -> Option<(usize, u32, u32)> {
        None
    }
}

/// Boot-time handle passed to `Device::init`. Bundles the bookkeeping a
/// device needs to reserve DMA/ports and to spawn its own background
/// thread, without exposing the rest of the motherboard's internal state.
pub struct DeviceInit<'a> {
    pub(crate) device_name: String,
    pub(crate) memory_size: usize,
    pub(crate) min_avail_memory: usize,
    pub(crate) reserved_cursor: &'a mut usize,
    pub(crate) ports: &'a mut std::collections::HashMap<u16, String>,
    pub(crate) memory: SharedMemory,
    pub(crate) interrupt_controller: Option<Arc<InterruptController>>,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) threads: &'a mut Vec<JoinHandle<()>>,
}

impl<'a> DeviceInit<'a> {
    /// Allocate `size` bytes from the front of memory.
    /// Never relocated or released; fails if fewer than `min_avail_memory`
    /// bytes would remain for the running program afterward.
    pub fn reserve_dma(&mut self, size: usize) -> Result<usize, MotherboardError> {
        let remaining_after = self.memory_size.saturating_sub(*self.reserved_cursor + size);
        if remaining_after < self.min_avail_memory {
            return Err(MotherboardError::OutOfMemory {
                requested: size,
                available: self.memory_size.saturating_sub(*self.reserved_cursor),
            });
        }
        let addr = *self.reserved_cursor;
        *self.reserved_cursor += size;
        Ok(addr)
    }

    /// Bind to `preferred`, or to the lowest free port `>= 1` when
    /// `preferred == 0`.
    pub fn request_port(&mut self, preferred: u16) -> Result<u16, MotherboardError> {
        if preferred == 0 {
            let mut candidate: u16 = 1;
            while self.ports.contains_key(&candidate) {
                candidate += 1;
            }
            self.ports.insert(candidate, self.device_name.clone());
            Ok(candidate)
        } else if self.ports.contains_key(&preferred) {
            Err(MotherboardError::PortTaken { port: preferred, owner: self.ports[&preferred].clone() })
        } else {
            self.ports.insert(preferred, self.device_name.clone());
            Ok(preferred)
        }
    }

    pub fn memory(&self) -> SharedMemory {
        Arc::clone(&self.memory)
    }

    pub fn interrupt_controller(&self) -> Option<Arc<InterruptController>> {
        self.interrupt_controller.clone()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Register a background thread to be joined when the motherboard shuts
    /// down. The closure is
    /// responsible for observing `shutdown_flag()` and returning promptly.
    pub fn spawn_thread(&mut self, f: impl FnOnce() + Send + 'static) {
        self.threads.push(std::thread::spawn(f));
    }
}

pub fn read_be32(memory: &[u8], addr: usize) -> u32 {
    u32::from_be_bytes([memory[addr], memory[addr + 1], memory[addr + 2], memory[addr + 3]])
}

pub fn write_be32(memory: &mut [u8], addr: usize, value: u32) {
    memory[addr..addr + 4].copy_from_slice(&value.to_be_bytes());
}

/// Interrupt line the timer device raises on every tick.
pub const TIMER_INT_LINE: u32 = 0;
/// Interrupt line the framebuffer's keyboard input raises.
pub const KEYBOARD_INT_LINE: u32 = 1;
/// Pin the framebuffer's keyboard input latches its scancode into.
pub const KEYBOARD_DATA_PIN: u32 = 0;

const TIMER_MIN_INTERVAL_US: u32 = 1_000;
const TIMER_MAX_INTERVAL_US: u32 = 1_000_000;
const TIMER_DEFAULT_INTERVAL_US: u32 = 999_999;

/// Raises `TIMER_INT_LINE` at a guest-configurable period: a single
/// background thread sleeps for `interval` microseconds and fires an
/// interrupt each time it wakes, unless the interval is zero.
///
/// The motherboard owns the `JoinHandle` (via `DeviceInit::spawn_thread`)
/// and the loop polls the shared `shutdown` flag, so `Motherboard::start`
/// can join it cleanly on the way out.
pub struct TimerDevice {
    interval_us: Arc<std::sync::atomic::AtomicU32>,
    preferred_port: u16,
}

impl TimerDevice {
    pub fn new() -> Self {
        TimerDevice {
            interval_us: Arc::new(std::sync::atomic::AtomicU32::new(TIMER_DEFAULT_INTERVAL_US)),
            preferred_port: 1,
        }
    }

    /// Binds to `port` instead of the default, so a board with several
    /// devices can give each one a distinct port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.preferred_port = port;
        self
    }
}

impl Default for TimerDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for TimerDevice {
    fn name(&self) -> &str {
        "Timer"
    }

    fn init(&mut self, ctx: &mut DeviceInit) -> Result<(), MotherboardError> {
        ctx.request_port(self.preferred_port)?;
        let interval = Arc::clone(&self.interval_us);
        let shutdown = ctx.shutdown_flag();
        let ic = ctx.interrupt_controller();
        ctx.spawn_thread(move || {
            let Some(ic) = ic else { return };
            while !shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                let raw = interval.load(std::sync::atomic::Ordering::SeqCst);
                if raw == 0 {
                    std::thread::sleep(std::time::Duration::from_millis(500));
                    continue;
                }
                let clamped = raw.clamp(TIMER_MIN_INTERVAL_US, TIMER_MAX_INTERVAL_US);
                std::thread::sleep(std::time::Duration::from_micros(clamped as u64));
                if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                ic.interrupt(TIMER_INT_LINE);
            }
        });
        Ok(())
    }

    fn write(&mut self, word: u32, _port: u16) {
        self.interval_us.store(word, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Emits a NUL-terminated payload to a host sink on every port write.
/// Grounded on `dev/charoutputdevice.cpp`, which prints the DMA buffer
/// through `printf` on every write; here the sink is an injected `Write` so
/// tests can capture the guest's output instead of the process's real
/// stdout.
pub struct CharOutDevice {
    region: usize,
    memory: Option<SharedMemory>,
    sink: Arc<Mutex<dyn std::io::Write + Send>>,
    preferred_port: u16,
}

const CHAROUT_BUFFER_SIZE: usize = 83;
const CHAROUT_PAYLOAD_LEN: usize = 81;

impl CharOutDevice {
    /// Writes to the host's real stdout.
    pub fn new() -> Self {
        CharOutDevice { region: 0, memory: None, sink: Arc::new(Mutex::new(std::io::stdout())), preferred_port: 1 }
    }

    /// Writes to an arbitrary sink instead, e.g. a buffer a test can inspect
    /// after the machine halts.
    pub fn with_sink(sink: Arc<Mutex<dyn std::io::Write + Send>>) -> Self {
        CharOutDevice { region: 0, memory: None, sink, preferred_port: 1 }
    }

    /// Binds to `port` instead of the default, so a board with several
    /// devices can give each one a distinct port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.preferred_port = port;
        self
    }
}

impl Default for CharOutDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for CharOutDevice {
    fn name(&self) -> &str {
        "HostStdout"
    }

    fn init(&mut self, ctx: &mut DeviceInit) -> Result<(), MotherboardError> {
        self.region = ctx.reserve_dma(CHAROUT_BUFFER_SIZE)?;
        let memory = ctx.memory();
        memory.lock().unwrap()[self.region + CHAROUT_BUFFER_SIZE - 1] = 0;
        self.memory = Some(memory);
        ctx.request_port(self.preferred_port)?;
        Ok(())
    }

    /// Emits the NUL-terminated payload currently sitting in this device's
    /// DMA region (byte 0 is the flag byte the guest sets before writing;
    /// the payload itself starts at offset 1, per `charoutputdevice.cpp`).
    fn write(&mut self, _word: u32, _port: u16) {
        let Some(memory) = &self.memory else { return };
        let memory = memory.lock().unwrap();
        let payload = &memory[self.region + 1..self.region + 1 + CHAROUT_PAYLOAD_LEN];
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let mut sink = self.sink.lock().unwrap();
        let _ = sink.write_all(&payload[..end]);
        let _ = sink.flush();
    }
}

/// Pixel width/height of the framebuffer's DMA region.
pub const FRAMEBUFFER_WIDTH: u32 = 1920;
pub const FRAMEBUFFER_HEIGHT: u32 = 1080;
const FRAMEBUFFER_HEADER: usize = 4;

/// Paints guest pixel data to a host window on every refresh tick, running
/// its own background thread that owns the `minifb::Window` and repaints
/// from the DMA buffer.
///
/// Keyboard input is latched the same way: a scancode (with the release bit
/// set in the high byte) is written to `KEYBOARD_DATA_PIN` and
/// `KEYBOARD_INT_LINE` is raised.
pub struct FramebufferDevice {
    region: usize,
    headless: bool,
    preferred_port: u16,
}

const REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(16);

impl FramebufferDevice {
    /// Opens a real `minifb` window.
    pub fn new() -> Self {
        FramebufferDevice { region: 0, headless: false, preferred_port: 8 }
    }

    /// Headless variant for tests and any board configuration with no host
    /// display attached; the DMA region and port still work, painting is a
    /// no-op.
    pub fn headless() -> Self {
        FramebufferDevice { region: 0, headless: true, preferred_port: 8 }
    }

    /// Binds to `port` instead of the default, so a board with several
    /// devices can give each one a distinct port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.preferred_port = port;
        self
    }
}

impl Default for FramebufferDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for FramebufferDevice {
    fn name(&self) -> &str {
        "HostDisplay"
    }

    fn init(&mut self, ctx: &mut DeviceInit) -> Result<(), MotherboardError> {
        let size = FRAMEBUFFER_HEADER + FRAMEBUFFER_WIDTH as usize * FRAMEBUFFER_HEIGHT as usize * 3;
        self.region = ctx.reserve_dma(size)?;
        let memory = ctx.memory();
        write_be32(&mut memory.lock().unwrap(), self.region, (FRAMEBUFFER_WIDTH << 16) | FRAMEBUFFER_HEIGHT);
        ctx.request_port(self.preferred_port)?;

        if self.headless {
            return Ok(());
        }

        let region = self.region;
        let shutdown = ctx.shutdown_flag();
        let interrupt_controller = ctx.interrupt_controller();
        ctx.spawn_thread(move || {
            let mut window = match minifb::Window::new(
                "BasicCPU",
                FRAMEBUFFER_WIDTH as usize,
                FRAMEBUFFER_HEIGHT as usize,
                minifb::WindowOptions::default(),
            ) {
                Ok(window) => window,
                Err(_) => return,
            };
            let mut buffer = vec![0u32; FRAMEBUFFER_WIDTH as usize * FRAMEBUFFER_HEIGHT as usize];

            while !shutdown.load(std::sync::atomic::Ordering::SeqCst) && window.is_open() {
                {
                    let memory = memory.lock().unwrap();
                    let pixels = &memory[region + FRAMEBUFFER_HEADER..];
                    for (i, chunk) in pixels.chunks_exact(3).enumerate().take(buffer.len()) {
                        buffer[i] = (chunk[0] as u32) << 16 | (chunk[1] as u32) << 8 | chunk[2] as u32;
                    }
                }
                let _ = window.update_with_buffer(&buffer, FRAMEBUFFER_WIDTH as usize, FRAMEBUFFER_HEIGHT as usize);

                if let Some(ic) = &interrupt_controller {
                    for key in window.get_keys_pressed(minifb::KeyRepeat::No) {
                        ic.set_pin(KEYBOARD_DATA_PIN, key as u32);
                        ic.interrupt(KEYBOARD_INT_LINE);
                    }
                    for key in window.get_keys_released() {
                        ic.set_pin(KEYBOARD_DATA_PIN, key as u32 | 0x100);
                        ic.interrupt(KEYBOARD_INT_LINE);
                    }
                }

                std::thread::sleep(REFRESH_INTERVAL);
            }
        });
        Ok(())
    }

    fn write(&mut self, _word: u32, _port: u16) {
        // The background thread always redraws from the latest DMA
        // contents on its own tick: a write only needs to
        // have landed in memory by the next tick, so there is nothing
        // further to do here.
    }

    fn framebuffer_region(&self) -> Option<(usize, u32, u32)> {
        Some((self.region, FRAMEBUFFER_WIDTH, FRAMEBUFFER_HEIGHT))
    }
}
