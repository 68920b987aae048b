//! Domain layer: the ports through which the parity engine talks to its
//! collaborators (chunk I/O submission and configuration persistence).

pub mod ports;

pub use ports::{
    ChunkIo, ChunkIoCompletion, ChunkIoRequest, ConfigStore, IoDirection, IoDone, IoFault,
    IoHandle,
};
