use sensnode::clock::to_calendar;
use sensnode::config::{NodeConfig, RadioConfig};
use sensnode::hal::{Frame, MonotonicClock};
use sensnode::sim::{ManualClock, ScriptedTimeSource, SimHandles, SimMedium, SimRadio};
use sensnode::timesync::{encode_sync, estimate_correction, SyncSample, SYNC_ROUNDS};
use sensnode::{CommandError, NodeState, NodeStateMachine, RadioCommand, RfMessage, TickOutcome};

type SimNode = NodeStateMachine<SimRadio<ManualClock>, ManualClock>;

const GATEWAY: u8 = 100;
// 2025-07-01 12:00:00 UTC
const EPOCH_S: u64 = 1_751_371_200;
const EPOCH_MS: u64 = EPOCH_S * 1000;

fn address(node_id: u8) -> u64 {
    RadioConfig::default().address_of(node_id)
}

fn frame(from: u8, to: u8, text: &str) -> Frame {
    RfMessage::new(from, to, text, 0).unwrap().encode()
}

/// Stand-in for a leaf that answers liveness checks and ignores the rest.
fn leaf_responder(medium: &SimMedium, node_id: u8) {
    medium.add_responder(address(node_id), move |msg| {
        let n = msg.text().strip_prefix("LOG ")?;
        RfMessage::new(node_id, msg.from_id, &format!("PONG {n}"), 0).ok()
    });
}

fn booted_gateway() -> (SimNode, SimMedium, SimHandles) {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let handles = SimHandles::new();
    leaf_responder(&medium, 1);
    leaf_responder(&medium, 2);

    let radio = SimRadio::new(medium.clone(), clock.clone());
    let peripherals = handles.gateway_peripherals(ScriptedTimeSource::fixed(EPOCH_S));
    let mut node = NodeStateMachine::new(NodeConfig::gateway(GATEWAY, 2), radio, clock, peripherals).unwrap();
    assert!(node.boot());
    (node, medium, handles)
}

/// Inject one sync round per two seconds starting at `first_at`, with a
/// constant `offset` and one extra millisecond of gateway time per round.
fn inject_sync_rounds(medium: &SimMedium, node_id: u8, first_at: u64, offset: u64) -> Vec<SyncSample> {
    (0..SYNC_ROUNDS as u64)
        .map(|i| {
            let local_time = first_at + i * 2_000;
            let gateway_time = local_time + offset + i;
            let msg = RfMessage::new(GATEWAY, node_id, &encode_sync(gateway_time), gateway_time).unwrap();
            medium.inject(local_time, address(node_id), msg.encode());
            SyncSample {
                gateway_time,
                local_time,
            }
        })
        .collect()
}

fn booted_leaf() -> (SimNode, SimMedium, ManualClock, SimHandles) {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let handles = SimHandles::new();
    let radio = SimRadio::new(medium.clone(), clock.clone());
    let mut node = NodeStateMachine::new(NodeConfig::leaf(1, 2), radio, clock.clone(), handles.leaf_peripherals()).unwrap();

    medium.inject(4_000, address(1), frame(GATEWAY, 1, "LOG 7"));
    inject_sync_rounds(&medium, 1, 6_000, EPOCH_MS);
    assert!(node.boot());
    (node, medium, clock, handles)
}

fn tick_until<F>(node: &mut SimNode, limit: usize, mut done: F) -> bool
where
    F: FnMut(&mut SimNode) -> bool,
{
    for _ in 0..limit {
        if done(node) {
            return true;
        }
        node.tick();
    }
    done(node)
}

fn texts_since(medium: &SimMedium, from: usize) -> Vec<String> {
    medium.transmissions()[from..]
        .iter()
        .filter_map(|t| t.message())
        .map(|m| m.text().to_string())
        .collect()
}

#[test]
fn test_gateway_boot_checks_leaves_and_syncs() {
    let (mut node, medium, handles) = booted_gateway();

    assert_eq!(node.state(), NodeState::Idle);
    assert_eq!(node.context().online_count(), 2);
    assert!(node.context().flags.time_ntp_synced);
    assert!(node.context().flags.mqtt_connected);
    assert!(node.now() >= EPOCH_MS);
    assert_eq!(handles.broker.client_id().as_deref(), Some("GATEWAY"));

    let texts = texts_since(&medium, 0);
    assert_eq!(texts.iter().filter(|t| t.starts_with("LOG 0")).count(), 2);
    assert_eq!(texts.iter().filter(|t| t.starts_with("SYNC ")).count(), SYNC_ROUNDS * 2);
}

#[test]
fn test_gateway_forwards_schedule_then_resyncs() {
    let (mut node, medium, handles) = booted_gateway();
    let before = medium.transmissions().len();

    handles.broker.inject("CMD_SN");
    node.tick();

    assert_eq!(
        handles.broker.drain_published(),
        vec!["CMD_SN: Sensing scheduled using default parameters."]
    );
    assert_eq!(node.state(), NodeState::RfCommunicating);
    let schedule = node.context().schedule;
    assert_eq!(schedule.scheduled_end_ms - schedule.scheduled_start_ms, 60_000);
    assert_eq!(schedule.scheduled_start_ms % 1000, 0);

    let texts = texts_since(&medium, before);
    let schedule_text = RadioCommand::schedule(&schedule).encode();
    assert!(schedule_text.starts_with("S_25070112"));
    assert_eq!(texts.iter().filter(|t| **t == schedule_text).count(), 6);
    assert_eq!(texts.iter().filter(|t| *t == "CMD_RF_SYNC").count(), 6);
    assert_eq!(texts[0], schedule_text);

    let before_sync = medium.transmissions().len();
    node.tick();
    assert_eq!(node.state(), NodeState::Idle);
    assert!(!node.context().flags.time_rf_required);
    assert!(node.context().flags.sensing_scheduled);
    assert!(!node.context().flags.sensing_requested);
    assert_eq!(texts_since(&medium, before_sync).len(), SYNC_ROUNDS * 2);
}

#[test]
fn test_rejected_commands_publish_reason() {
    let (mut node, _medium, handles) = booted_gateway();
    let pulses_before = handles.indicator.error_pulses();

    handles.broker.inject("CMD_SFN_10_100Hz_10s");
    handles.broker.inject("CMD_FOO");
    handles.broker.inject("CMD_SENSING_2020-01-01_00:00:00_100Hz_10s");
    node.tick();

    assert_eq!(
        handles.broker.drain_published(),
        vec![
            CommandError::DelayTooShort.to_string(),
            CommandError::Unknown("CMD_FOO".to_string()).to_string(),
            CommandError::StartInPast.to_string(),
        ]
    );
    assert_eq!(handles.indicator.error_pulses(), pulses_before + 3);
    assert_eq!(handles.indicator.last_state(), Some(NodeState::Idle));
    assert_eq!(node.state(), NodeState::Idle);
    assert!(!node.context().flags.sensing_requested);
    assert!(!node.context().flags.sensing_scheduled);
}

#[test]
fn test_ntp_command_resyncs_gateway_and_leaves() {
    let (mut node, medium, handles) = booted_gateway();

    handles.broker.inject("CMD_NTP");
    node.tick();
    assert_eq!(handles.broker.drain_published(), vec!["CMD_NTP: time synchronization started."]);
    assert_eq!(node.state(), NodeState::WifiCommunicating);

    node.tick();
    assert_eq!(node.state(), NodeState::Idle);
    assert!(!node.context().flags.gateway_ntp_required);
    assert!(!node.context().flags.leafnode_ntp_required);
    assert!(node.context().flags.time_rf_required);

    let before = medium.transmissions().len();
    node.tick();
    assert_eq!(node.state(), NodeState::RfCommunicating);
    assert!(texts_since(&medium, before).iter().all(|t| t == "CMD_RF_SYNC"));
}

#[test]
fn test_retrieval_streams_file_or_reports_missing() {
    let (mut node, _medium, handles) = booted_gateway();
    handles.storage.insert_file("N100_001.txt", b"line one\nline two\n");

    handles.broker.inject("CMD_RETRIEVAL_N100_001");
    node.tick();
    assert_eq!(node.state(), NodeState::WifiCommunicating);
    node.tick();
    assert_eq!(node.state(), NodeState::Idle);
    assert_eq!(
        handles.broker.drain_published(),
        vec!["N100_001.txt[1/1]:line one\nline two\n", "N100_001.txt[done]"]
    );
    assert!(node.context().flags.data_retrieval_sent);
    assert!(!node.context().flags.data_retrieval_requested);

    handles.broker.inject("CMD_RETRIEVAL_N100_009");
    let mut published = Vec::new();
    assert!(tick_until(&mut node, 5_000, |_| {
        published.extend(handles.broker.drain_published());
        !published.is_empty()
    }));
    assert_eq!(published, vec!["Retrieval failed: N100_009.txt not found"]);
}

#[test]
fn test_leaf_reboot_rechecks_liveness_and_resyncs() {
    let (mut node, medium, handles) = booted_gateway();

    handles.broker.inject("CMD_LEAFNODE_REBOOT");
    node.tick();
    assert_eq!(handles.broker.drain_published(), vec!["Reboot scheduled."]);
    assert_eq!(node.state(), NodeState::Idle);

    let before = medium.transmissions().len();
    node.tick();
    let texts = texts_since(&medium, before);
    assert_eq!(&texts[..6], vec!["CMD_REBOOT"; 6].as_slice());
    assert_eq!(&texts[6..8], &["LOG 0", "LOG 0"]);
    assert!(texts[8..].iter().all(|t| t == "CMD_RF_SYNC"));
    assert_eq!(node.state(), NodeState::RfCommunicating);
}

#[test]
fn test_gateway_reboot_command() {
    let (mut node, _medium, handles) = booted_gateway();

    handles.broker.inject("CMD_GATEWAY_REBOOT");
    node.tick();
    assert_eq!(node.state(), NodeState::Idle);
    node.tick();
    assert_eq!(node.state(), NodeState::Boot);
    assert_eq!(node.tick(), TickOutcome::Reboot);
}

#[test]
fn test_gateway_full_sensing_cycle() {
    let (mut node, _medium, handles) = booted_gateway();

    handles.broker.inject("CMD_SFN_60_100Hz_2s");
    let mut published = Vec::new();
    assert!(tick_until(&mut node, 200_000, |_| {
        published.extend(handles.broker.drain_published());
        published.iter().any(|t| t == "Sensing completed!")
    }));
    assert_eq!(published[0], "CMD_SFN: Sensing successfully scheduled.");
    assert_eq!(node.state(), NodeState::Idle);
    assert!(!node.context().flags.sensing_scheduled);
    assert!(!node.context().flags.sensing_active);
    assert_eq!(handles.storage.log_number(), 1);

    let data = handles.storage.file("N100_001.txt").unwrap();
    assert!(data.contains("Sampling Rate: 100 Hz"));
    assert!(data.contains("Duration: 2 s"));
    let samples = data
        .lines()
        .filter(|line| line.split(',').next().is_some_and(|t| t.trim().parse::<u64>().is_ok()))
        .count();
    assert!((198..=200).contains(&samples), "got {samples} samples");

    handles.broker.inject("CMD_RETRIEVAL_N100_001");
    let mut chunks = Vec::new();
    assert!(tick_until(&mut node, 5_000, |_| {
        chunks.extend(handles.broker.drain_published());
        chunks.last().is_some_and(|t| t.ends_with("[done]"))
    }));
    assert!(chunks[0].starts_with("N100_001.txt[1/"));
    let rebuilt: String = chunks[..chunks.len() - 1]
        .iter()
        .filter_map(|c| c.split_once("]:").map(|(_, data)| data))
        .collect();
    assert_eq!(rebuilt, data);
}

#[test]
fn test_leaf_boot_takes_log_number_and_sync() {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let handles = SimHandles::new();
    let radio = SimRadio::new(medium.clone(), clock.clone());
    let mut node = NodeStateMachine::new(NodeConfig::leaf(1, 2), radio, clock.clone(), handles.leaf_peripherals()).unwrap();

    medium.inject(4_000, address(1), frame(GATEWAY, 1, "LOG 7"));
    let samples = inject_sync_rounds(&medium, 1, 6_000, EPOCH_MS);
    assert!(node.boot());

    assert_eq!(node.state(), NodeState::Idle);
    assert_eq!(handles.storage.log_number(), 7);
    assert!(node.context().flags.time_rf_synced);

    let expected = estimate_correction(&samples).unwrap();
    assert_eq!(node.context().clock.drift_ratio, expected.drift_ratio);
    assert_eq!(node.context().clock.time_offset, expected.time_offset);
    assert_eq!(clock.millis(), 18_000);
    // Offsets run EPOCH+0..=EPOCH+6; the trimmed mean is EPOCH+3.
    assert_eq!(node.now(), EPOCH_MS + 18_000 + 3);

    let pongs: Vec<RfMessage> = medium
        .transmissions()
        .iter()
        .filter(|t| t.from_address == address(1))
        .filter_map(|t| t.message())
        .collect();
    assert_eq!(pongs.len(), 1);
    assert_eq!(pongs[0].text(), "PONG 7");
    assert_eq!(pongs[0].to_id, GATEWAY);
}

#[test]
fn test_leaf_applies_gateway_schedule() {
    let (mut node, medium, clock, _handles) = booted_leaf();

    let start = (node.now() / 1000 + 120) * 1000;
    let command = RadioCommand::Schedule {
        at: to_calendar(start),
        rate_hz: 100,
        duration_s: 10,
    };
    medium.inject(clock.millis() + 10, address(1), frame(GATEWAY, 1, &command.encode()));
    node.tick();

    let ctx = node.context();
    assert_eq!(ctx.state, NodeState::Idle);
    assert!(ctx.flags.sensing_scheduled);
    assert_eq!(ctx.schedule.scheduled_start_ms, start);
    assert_eq!(ctx.schedule.scheduled_end_ms, start + 10_000);
    assert_eq!(ctx.schedule.rate_hz, 100);
}

#[test]
fn test_leaf_ignores_frames_for_other_nodes_then_reboots() {
    let (mut node, medium, clock, _handles) = booted_leaf();

    medium.inject(clock.millis() + 10, address(1), frame(GATEWAY, 2, "CMD_REBOOT"));
    node.tick();
    assert_eq!(node.state(), NodeState::Idle);
    assert!(!node.context().flags.reboot_required_leafnode);

    medium.inject(clock.millis() + 10, address(1), frame(GATEWAY, 1, "CMD_REBOOT"));
    node.tick();
    assert_eq!(node.state(), NodeState::Boot);
    assert!(node.context().flags.reboot_required_leafnode);
    assert_eq!(node.tick(), TickOutcome::Reboot);
}

#[test]
fn test_leaf_resyncs_on_command() {
    let (mut node, medium, clock, handles) = booted_leaf();

    let now = clock.millis();
    medium.inject(now + 10, address(1), frame(GATEWAY, 1, "CMD_RF_SYNC"));
    let samples = inject_sync_rounds(&medium, 1, now + 1_000, EPOCH_MS + 5_000);
    node.tick();
    assert_eq!(node.state(), NodeState::RfCommunicating);
    assert!(node.context().flags.time_rf_required);

    node.tick();
    assert_eq!(node.state(), NodeState::Idle);
    assert!(!node.context().flags.time_rf_required);
    let expected = estimate_correction(&samples).unwrap();
    assert_eq!(node.context().clock.time_offset, expected.time_offset);
    assert_eq!(handles.indicator.last_state(), Some(NodeState::Idle));
}

#[test]
fn test_leaf_answers_log_request_when_idle() {
    let (mut node, medium, clock, handles) = booted_leaf();

    medium.inject(clock.millis() + 10, address(1), frame(GATEWAY, 1, "LOG 9"));
    node.tick();
    assert_eq!(handles.storage.log_number(), 9);
    assert_eq!(node.state(), NodeState::Idle);
    let last = medium.transmissions().last().and_then(|t| t.message()).unwrap();
    assert_eq!(last.text(), "PONG 9");
}
