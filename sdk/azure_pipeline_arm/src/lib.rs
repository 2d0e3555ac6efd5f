#![doc = include_str!("../README.md")]

pub mod connection;
pub mod providers;
pub mod registration;

pub use connection::{Connection, ConnectionBuilder};
pub use registration::{RegistrationError, RegistrationOptions, RegistrationPolicy};
