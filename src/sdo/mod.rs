//! SDO (Service Data Object) sub-protocols (spec.md §4.4/§4.5 — components
//! H and I), sharing the CiA 301 wire framing in [`command`].

pub mod client;
pub mod command;
pub mod server;

pub use client::{SdoClient, SdoClientError, SdoClientReturn};
pub use server::SdoServer;
