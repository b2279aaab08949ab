#![no_main]
use libfuzzer_sys::fuzz_target;

use dns_types::protocol::types::Header;

fuzz_target!(|data: &[u8]| {
    if let Ok(deserialised) = Header::from_octets(data) {
        let serialised = deserialised.to_octets();
        let re_deserialised = Header::from_octets(&serialised);
        assert_eq!(Ok(deserialised), re_deserialised);
    }
});
