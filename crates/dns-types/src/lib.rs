//! Wire types for the subset of DNS which a captive-portal responder
//! needs: the fixed header and a single, uncompressed, question.

pub mod protocol;
