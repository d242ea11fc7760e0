#![cfg_attr(not(feature = "std"), no_std)]

//! Core protocol engines for a CANopen (CiA 301/309) device stack.
//!
//! This crate implements the tightly-coupled state machines that make up the
//! hard engineering of a CANopen node: the Object Dictionary, the SDO
//! server/client, the PDO engine, SYNC, NMT/Heartbeat, Emergency, the
//! indicator-LED controller and the CiA 309-3 ASCII gateway. The CAN driver
//! (frame transmit/receive, filters, bus-off detection), persistent storage
//! and the hosting application are external collaborators; this crate only
//! defines the trait boundary (`hal::CanInterface`) they must satisfy.

extern crate alloc;

// --- Foundation modules ---
pub mod crc;
pub mod fifo;
pub mod hal;
pub mod types;

// --- Protocol engines (spec.md §2, components B..L) ---
pub mod emcy;
pub mod gateway;
pub mod led;
pub mod nmt;
pub mod od;
pub mod pdo;
pub mod sdo;
pub mod sync;

// --- Node composition root ---
pub mod node;

// --- Top-level exports ---
pub use hal::{CanFrame, CanInterface, CanOpenError};
pub use node::Node;
pub use types::NodeId;
