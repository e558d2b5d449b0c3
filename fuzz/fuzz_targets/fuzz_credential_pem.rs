#![no_main]

//! Fuzz target for PEM credential parsing.
//!
//! Splits arbitrary input into a key half and a certificate half and feeds
//! both through the credential loader. Malformed material must come back as
//! a format error, never a panic or a leaked engine error-queue entry.

use libfuzzer_sys::fuzz_target;

use tlswrap::Credential;

fuzz_target!(|data: &[u8]| {
    let mid = data.len() / 2;
    let _ = Credential::from_pem(&data[..mid], &data[mid..]);
});
