//! The three error taxonomies, one enum per public
//! API boundary. Library code propagates these with `?`; only the CLI
//! front-end (`main.rs`) turns them into process exit codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("unknown mnemonic `{mnemonic}`")]
    UnknownMnemonic { mnemonic: String },

    #[error("unknown register `{name}`")]
    UnknownRegister { name: String },

    #[error("unknown symbol `{name}`")]
    UnknownSymbol { name: String },

    #[error("symbol `{name}` is already defined")]
    DuplicateSymbol { name: String },

    #[error("instruction `{mnemonic}` is missing an argument")]
    MissingArgument { mnemonic: String },

    #[error("instruction `{mnemonic}` received an argument of the wrong kind")]
    InvalidArgumentType { mnemonic: String },

    #[error("relative jump from {from:#x} to {to:#x} (offset {offset}) exceeds the 16-bit signed range")]
    JumpOutOfRange { from: u32, to: u32, offset: i64 },

    #[error("port {port} exceeds the 16-bit port field")]
    PortOutOfRange { port: u32 },

    #[error("shift amount {amount} exceeds 32 bits")]
    ShiftOutOfRange { amount: u32 },
}

#[derive(Debug, Error)]
pub enum MotherboardError {
    #[error("no CPU was registered with the motherboard")]
    NoCpus,

    #[error("memory size {requested} is below the minimum of {minimum}")]
    InsufficientMemory { requested: usize, minimum: usize },

    #[error("out of DMA memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("port {port} is already bound to device `{owner}`")]
    PortTaken { port: u16, owner: String },

    #[error("no device is bound to port {port}")]
    NoSuchPort { port: u16 },

    #[error("device `{device}` failed to initialise: {reason}")]
    DeviceInitFailed { device: String, reason: String },

    #[error("boot was aborted before the CPU started")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("instruction fault at {address:#010x}: {reason}")]
    InstructionFault { address: u32, reason: String },

    #[error("memory access at {address:#010x} is out of bounds (memory size {memory_size})")]
    MemoryOutOfBounds { address: u32, memory_size: usize },

    #[error(transparent)]
    Boot(#[from] MotherboardError),
}
