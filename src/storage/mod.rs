//! Ceremony output storage.
//!
//! Every artifact a ceremony produces is written exactly once; see
//! [`output::write_new`].

pub mod output;
