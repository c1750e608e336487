//! Pure mail text handling: quotes, addresses, threading headers, HTML.

pub mod address;
pub mod html;
pub mod quote;
pub mod threading;

pub use address::{CandidateSet, build_candidate_set, extract_address, extract_addresses};
pub use quote::{QuoteStripper, extract_latest_reply};
pub use threading::{ThreadHeaders, generate_message_id, merge_references, parse_references};
