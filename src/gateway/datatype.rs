//! Re-exports the CiA 309-3 typed codec (`CO_GTWA_dataType_t`) the gateway
//! drives. The codec itself lives in [`crate::fifo::ascii`] since SDO block
//! transfer's CRC accumulation and the gateway's line parser share the same
//! `Fifo` primitives; this module just names the gateway's view of it.

pub use crate::fifo::ascii::Datatype;

/// Datatype assumed when a `read` command omits the trailing datatype
/// token. The source always requires an explicit datatype for `write` but
/// documents `read`'s as optional without naming a default; `hex` is the
/// only datatype in the set that represents an arbitrary-length value
/// without a width assumption, so it is the safest default for a type-blind
/// dump.
pub const DEFAULT_READ_DATATYPE: Datatype = Datatype::Hex;
