//! Delivery bookkeeping shared by the embedded emulator.

pub mod ack_id;
pub mod deadline;
