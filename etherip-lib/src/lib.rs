#![forbid(unsafe_code)]

//! EtherNet/IP client library and scan driver for Allen-Bradley
//! ControlLogix PLCs: encapsulated CIP over TCP, named-tag reads and
//! writes, and a per-PLC scan engine with subscriber callbacks.

pub mod cip;
pub mod codec;
pub mod config;
pub mod encap;
pub mod error;
pub mod registry;
pub mod scan;
pub mod stats;
pub mod tag;
pub mod transport;

pub use cip::types::{CipType, CipValue, TypedData};
pub use config::{load_from_path, DriverConfig, PlcConfig, TagConfig};
pub use error::{EipError, Result};
pub use registry::{Driver, Plc, PlcSnapshot, Subscriber, TagInfo, TagState};
pub use tag::{TagPath, TagSegment};
pub use transport::{read_tag_adhoc, write_tag_adhoc, Identity, Session};
