mod memory;
mod transport;

pub use memory::MemoryTransport;
pub use transport::{Result, Transport};
