#![no_main]
use libfuzzer_sys::fuzz_target;

use dns_types::protocol::types::Header;

fuzz_target!(|header: Header| {
    let serialised = header.to_octets();
    let deserialised = Header::from_octets(&serialised);
    assert_eq!(Ok(header), deserialised);
});
