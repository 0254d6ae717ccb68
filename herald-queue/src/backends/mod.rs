mod file;
mod memory;

pub use file::FileQueueStore;
pub use memory::MemoryQueueStore;
