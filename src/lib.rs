//! Client for the Reson 7k remote control protocol.
//!
//! Commands are framed and sent to the 7k center over TCP or UDP, and the records it
//! streams back are split into ping bundles, diagnostic slots and command replies.

pub mod args;
pub mod client;
pub mod command;
pub mod cycle;
pub mod demux;
pub mod error;
pub mod frame;
pub mod record;
pub mod sweep;
pub mod transport;

pub use client::{Client, ClientConfig, Subscription, Via};
pub use command::{Command, CommandLink, CommandName, DeliveryKind};
pub use demux::{Correlation, PingBundle};
pub use error::{Error, Result};
pub use record::{Record, RecordType};
