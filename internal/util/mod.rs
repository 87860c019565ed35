pub mod shutdown;
pub mod usage;
pub mod volume;
