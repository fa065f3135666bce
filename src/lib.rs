//! Low-energy radio core: adapter monitoring, discovery scanning and GATT
//! sessions over a pluggable host radio stack.

pub mod bluetooth;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod radio;
