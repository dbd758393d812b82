//! Job bodies shipped with the worker binary.

pub mod command;

pub use command::CommandJob;
