//! Performance benchmarks for the lobby hot paths

use peer::lobby::Role;
use peer::membership::{ConnectionTable, LobbyMembership};
use peer::memory::MemoryNetwork;
use peer::relay::{route, RecentIds};
use peer::transport::{Transport, TransportEvent};
use shared::{decode_frame, encode_frame, ChatEntry, Message, Packet, PeerId};
use std::time::Instant;

fn chat_message(n: u64) -> Message {
    let from = PeerId::from("ChainNode-bench");
    Message::Chat {
        messages: vec![ChatEntry {
            id: format!("ChainNode-bench_{}_abcdefghi", n),
            peer_id: from.clone(),
            text: "a reasonably sized chat line for the benchmark".to_string(),
            timestamp: n,
        }],
        from,
    }
}

/// Benchmarks admitting and removing members of a large lobby
#[test]
fn benchmark_membership_churn() {
    let peers: Vec<PeerId> = (0..64)
        .map(|i| PeerId::new(format!("ChainNode-{:03}", i)))
        .collect();

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut membership = LobbyMembership::new(peers.len());
        membership.seed(peers[0].clone());
        for peer in &peers[1..] {
            membership.admit(peer.clone());
        }
        assert!(membership.is_full());
        for peer in &peers[1..] {
            membership.remove(peer);
        }
    }

    let duration = start.elapsed();
    println!(
        "Membership churn: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks host-side fan-out over the in-process network
#[test]
fn benchmark_relay_fan_out() {
    let network = MemoryNetwork::new();
    let (mut host, mut host_rx) = network.endpoint();
    let host_id = PeerId::from("ChainNode-host");
    host.listen(&host_id);

    let mut guests = Vec::new();
    let mut table = ConnectionTable::new();
    for i in 0..16 {
        let (mut guest, rx) = network.endpoint();
        let guest_id = PeerId::new(format!("ChainNode-g{}", i));
        guest.listen(&guest_id);
        let conn = host.connect(&host_id, &guest_id);
        table.insert(guest_id, conn);
        guests.push((guest, rx));
    }
    while host_rx.try_recv().is_ok() {}

    let message = chat_message(1);
    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let report = route(&mut host, &table, Role::Host, &message, None);
        assert_eq!(report.sent, 16);
    }

    let duration = start.elapsed();
    println!(
        "Relay fan-out to 16 guests: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    let (_, rx) = &mut guests[0];
    let mut received = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, TransportEvent::Data { .. }) {
            received += 1;
        }
    }
    assert_eq!(received, iterations);

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks length-prefixed packet framing
#[test]
fn benchmark_frame_codec() {
    let packet = Packet::Send {
        channel: 42,
        message: chat_message(7),
    };

    let iterations = 50_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let frame = encode_frame(&packet).unwrap();
        let decoded = decode_frame(&frame[4..]).unwrap();
        assert!(matches!(decoded, Packet::Send { channel: 42, .. }));
    }

    let duration = start.elapsed();
    println!(
        "Frame codec: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks the duplicate-suppression window under constant inserts
#[test]
fn benchmark_recent_id_window() {
    let mut recent = RecentIds::new(256);
    let ids: Vec<String> = (0..10_000).map(|i| format!("ChainNode-x_{}_id", i)).collect();

    let start = Instant::now();
    for id in &ids {
        assert!(recent.insert(id));
        assert!(!recent.insert(id));
    }
    let duration = start.elapsed();

    println!(
        "Recent-id window: {} inserts in {:?}",
        ids.len() * 2,
        duration
    );
    assert_eq!(recent.len(), 256);

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}
