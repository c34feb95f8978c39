//! Machine definitions: parsing, validation, and the name-keyed registry
//! used to resolve nested, branch, and launched machine references.

pub mod definition;
pub mod registry;

pub use definition::ConfigError;
pub use registry::MachineRegistry;
