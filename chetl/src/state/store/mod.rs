mod base;
mod diskv;
mod memory;
mod mmap;

pub use base::*;
pub use diskv::*;
pub use memory::*;
pub use mmap::*;
