#![no_main]
use libfuzzer_sys::fuzz_target;

use dns_portal::classify::{classify, Outcome};
use dns_portal::settings::DomainPattern;
use dns_types::protocol::types::HEADER_LEN;

fuzz_target!(|data: &[u8]| {
    match classify(data, &DomainPattern::new("example.com")) {
        Outcome::Matched(query) | Outcome::NoMatch(query) => {
            let question = query.question.octets();
            assert_eq!(&data[HEADER_LEN..HEADER_LEN + question.len()], question);
        }
        Outcome::Malformed(_) => (),
    }
});
