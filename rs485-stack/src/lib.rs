//! The RS-485 half-duplex master stack: serial transport setup, frame
//! codec, CRC16 and the round-robin polling scheduler.

pub mod crc;
pub mod crc_store;
pub mod frame;
pub mod master;
pub mod serial;

pub use crc_store::CrcErrorCounter;
pub use frame::{Frame, FrameError};
pub use master::{frame_timeout, Master, MasterEvent};
