mod block;
mod container;

pub use block::{BlockNumber, BlockStorage};
pub use container::{ContainerFile, ContainerFileBuilder};
