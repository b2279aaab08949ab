#![no_main]
use libfuzzer_sys::fuzz_target;
use std::net::{Ipv4Addr, SocketAddrV4};

use dns_portal::server::{Processed, Server};
use dns_portal::transport::test_util::MemoryTransport;

const UPSTREAM: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 53);

// Each datagram is fed in from either a client or the upstream
// nameserver.  Whatever it contains, the server must not panic and must
// send at most one datagram in response.
fuzz_target!(|datagrams: Vec<(bool, Vec<u8>)>| {
    let mut server = Server::new(MemoryTransport::new());
    server
        .start(53, "example.com", Ipv4Addr::new(192, 168, 4, 1), Some(UPSTREAM))
        .unwrap();

    for (from_upstream, octets) in datagrams {
        let from = if from_upstream {
            SocketAddrV4::new(UPSTREAM, 53)
        } else {
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 4, 2), 5353)
        };

        server.transport_mut().push(&octets, from);
        let processed = server.process_next_request().unwrap();
        assert!(matches!(processed, Processed::Handled(_)));
        assert!(server.transport_mut().take_sent().len() <= 1);
    }
});
