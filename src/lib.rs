#![allow(clippy::uninlined_format_args)]

pub mod analyzer;
pub mod association;
pub mod capture;
pub mod config;
pub mod output;
pub mod protocol;
pub mod reassembly;
pub mod sctp;
pub mod tsn;
