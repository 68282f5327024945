pub mod modbus;
pub mod relay;
pub mod scpi;
pub mod usbtmc;

/// Narrow capability shared by every SCPI-speaking instrument transport
/// (serial ASRL, USB-TMC character device). Modeled as a trait per the
/// "dynamic duck-typed instrument handles" re-architecture instead:
/// a small interface instead of polymorphism over a full VISA surface.
pub trait ScpiTransport: Send {
    fn write_line(&mut self, line: &str) -> crate::error::GwResult<()>;
    fn read_line(&mut self) -> crate::error::GwResult<String>;
    fn reset_input(&mut self) -> crate::error::GwResult<()>;
}
