//! CAN-bus adapter: maps the abstract frame sink onto CAN-FD messages and
//! runs the distributed node-id acquisition state machine.

pub mod adapter;
pub mod low_level;
