//! Gateway command-engine states (`CO_GTWA_state_t`, spec.md §4.10).
//!
//! The source's state enum also carries a dozen `LSS_*` sub-states and
//! `LOG`/`HELP`/`LED` states. Those either belong to the LSS master's own
//! state machine (out of scope here, spec.md §1 "Excluded") or need no
//! cross-tick bookkeeping in this implementation: `log`/`help`/`led` compose
//! their entire response synchronously inside the `Idle` dispatch and never
//! hold the engine in a distinct state. Only the two multi-tick SDO
//! operations are modeled as states.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Waiting for, and parsing, a new command line.
    Idle,
    /// An SDO upload is in progress; `process` drives the client and waits
    /// for its terminal result.
    Read,
    /// An SDO download is in progress.
    Write,
    /// The download ended in a server abort; nothing is left to purge in
    /// this crate's one-shot download path, so this is a one-tick detour
    /// back to `Idle`.
    WriteAborted,
}
