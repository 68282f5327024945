pub mod backend;
pub mod bcp;
pub mod bus_load;
pub mod socketcan_backend;

pub use backend::{CanBackend, CanFrame};
