//! The FAME-Z fabric control protocol: payload grammar, longest-prefix
//! handler dispatch, and request/response correlation, shared by the
//! broker (switch) and every client.
//!
//! The protocol is textual and modeled on Gen-Z Link CTL semantics:
//! space-separated commands, CSV `Key=Value` arguments, `,Tag=<n>`
//! correlation for exchanges that need an acknowledgment, and a trailing
//! `!FZT=<n>` tracker for diagnostics.

pub mod correlate;
pub mod grammar;
pub mod table;

pub use correlate::{Correlator, TagEntry, Tracker};
pub use grammar::{Request, TRACKER_PREFIX, csv_to_map, parse_request, with_tracker};
pub use table::{Handler, HandlerTable, Outcome, RequestEnv};
