#[macro_use]
extern crate tracing;

#[macro_use]
extern crate serde;

pub mod channel;
pub mod client;
pub mod coordinator;
pub mod injector;
pub mod logging;
pub mod message;
pub mod settings;
