use sensnode::config::{NodeConfig, RadioConfig};
use sensnode::hal::MonotonicClock;
use sensnode::link::{ReliableLink, RfMessage, LIVENESS_TIMEOUT_MS, RADIO_SETTLE_MS, RF_CMD_RETRY, RF_CMD_WAIT_MS};
use sensnode::node::NodeStatusTable;
use sensnode::sim::{ManualClock, MemoryStorage, SimMedium, SimRadio};

const GATEWAY: u8 = 100;

fn link(medium: &SimMedium, clock: &ManualClock, node_id: u8) -> ReliableLink<SimRadio<ManualClock>, ManualClock> {
    let radio = SimRadio::new(medium.clone(), clock.clone());
    let mut link = ReliableLink::new(radio, clock.clone(), node_id, RadioConfig::default());
    assert!(link.init());
    link
}

fn address(node_id: u8) -> u64 {
    RadioConfig::default().address_of(node_id)
}

/// A leaf that answers every `LOG n` with `PONG n`, claiming to be `reply_from`.
fn pong_responder(medium: &SimMedium, node_id: u8, reply_from: u8) {
    medium.add_responder(address(node_id), move |msg| {
        let n = msg.text().strip_prefix("LOG ")?;
        RfMessage::new(reply_from, msg.from_id, &format!("PONG {n}"), 0).ok()
    });
}

#[test]
fn test_request_without_reply_exhausts_retries() {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let mut gateway = link(&medium, &clock, GATEWAY);

    let msg = gateway.message(1, "LOG 3").unwrap();
    assert!(!gateway.send_then_receive(&msg, 1, 100, 3));

    assert_eq!(gateway.radio().tx_count(), 3);
    assert!(gateway.radio().is_listening());
    assert!(clock.millis() >= 300);
}

#[test]
fn test_request_returns_reply() {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let mut gateway = link(&medium, &clock, GATEWAY);
    pong_responder(&medium, 1, 1);

    let msg = gateway.message(1, "LOG 5").unwrap();
    let reply = gateway.request(&msg, 1, 100, 3).unwrap();
    assert_eq!(reply.text(), "PONG 5");
    assert_eq!(reply.from_id, 1);
    assert_eq!(reply.to_id, GATEWAY);
    assert_eq!(gateway.radio().tx_count(), 1);
    assert!(gateway.radio().is_listening());
}

#[test]
fn test_liveness_check_marks_silent_node_offline() {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let mut gateway = link(&medium, &clock, GATEWAY);
    pong_responder(&medium, 1, 1);
    pong_responder(&medium, 3, 3);

    let mut table = NodeStatusTable::new();
    gateway.check_node_status(&[1, 2, 3], 12, &mut table);

    assert_eq!(table.get(&1), Some(&true));
    assert_eq!(table.get(&2), Some(&false));
    assert_eq!(table.get(&3), Some(&true));
    // Settle delay plus one full timeout for the silent node.
    assert!(clock.millis() >= RADIO_SETTLE_MS + LIVENESS_TIMEOUT_MS);

    let sent: Vec<String> = medium
        .transmissions()
        .iter()
        .filter(|t| t.from_address == address(GATEWAY))
        .filter_map(|t| t.message())
        .map(|m| m.text().to_string())
        .collect();
    assert_eq!(sent, vec!["LOG 12", "LOG 12", "LOG 12"]);
}

#[test]
fn test_liveness_ignores_reply_from_wrong_node() {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let mut gateway = link(&medium, &clock, GATEWAY);
    pong_responder(&medium, 2, 3);

    let mut table = NodeStatusTable::new();
    gateway.check_node_status(&[2], 1, &mut table);
    assert_eq!(table.get(&2), Some(&false));
}

#[test]
fn test_leaf_answers_log_request() {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let mut gateway = link(&medium, &clock, GATEWAY);
    let mut leaf = link(&medium, &clock, 1);
    let storage = MemoryStorage::new();

    // Noise first: a request for another leaf must not be answered.
    medium.inject(10, address(1), RfMessage::new(GATEWAY, 2, "LOG 9", 0).unwrap().encode());
    medium.inject(50, address(1), RfMessage::new(GATEWAY, 1, "LOG 7", 0).unwrap().encode());

    assert_eq!(leaf.await_log_request(&mut storage.clone()), 7);
    assert_eq!(storage.log_number(), 7);

    let pong = gateway.receive(10).unwrap();
    assert_eq!(pong.text(), "PONG 7");
    assert_eq!((pong.from_id, pong.to_id), (1, GATEWAY));
    assert_eq!(leaf.radio().tx_count(), 1);
}

#[test]
fn test_command_retry_reaches_every_peer() {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let config = NodeConfig::gateway(GATEWAY, 2);
    let peers: Vec<u8> = config.peer_ids().collect();
    let mut gateway = link(&medium, &clock, GATEWAY);
    let mut leaves: Vec<_> = peers.iter().map(|&id| link(&medium, &clock, id)).collect();

    gateway.send_command_with_retry(&peers, "CMD_RF_SYNC").unwrap();

    assert_eq!(gateway.radio().tx_count(), usize::from(RF_CMD_RETRY) * peers.len());
    assert_eq!(clock.millis(), u64::from(RF_CMD_RETRY) * RF_CMD_WAIT_MS);
    for leaf in &mut leaves {
        for _ in 0..RF_CMD_RETRY {
            let msg = leaf.receive(1).unwrap();
            assert_eq!(msg.text(), "CMD_RF_SYNC");
            assert_eq!(msg.to_id, leaf.node_id());
        }
        assert!(leaf.receive(5).is_none());
    }
}

#[test]
fn test_oversized_command_is_refused() {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let mut gateway = link(&medium, &clock, GATEWAY);
    assert!(gateway.broadcast_command(&[1], &"X".repeat(30)).is_err());
    assert_eq!(gateway.radio().tx_count(), 0);
}
