pub mod bluetooth;
pub mod logging;
pub mod registry;
