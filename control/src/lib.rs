#![cfg_attr(not(test), no_std)]

pub mod lstsq;
mod observer;
pub use observer::*;
mod pid;
pub use pid::*;
mod thermistor;
pub use thermistor::*;
