//! OpenADR 2.0b "Simple" pull-profile VEN protocol engine.

pub mod config;
pub mod error;
pub mod payload;
pub mod signing;
pub mod store;
pub mod transport;
/// Agent, dispatcher, and the event/report state machines.
pub mod ven;
