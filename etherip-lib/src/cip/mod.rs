#![forbid(unsafe_code)]

//! Common Industrial Protocol: object paths, Message-Router framing and the
//! explicit-messaging services used for tag access.

pub mod mr;
pub mod path;
pub mod service;
pub mod types;
