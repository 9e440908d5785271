use proptest::prelude::*;
use sensnode::config::RadioConfig;
use sensnode::hal::MonotonicClock;
use sensnode::link::{ReliableLink, RfMessage};
use sensnode::sim::{ManualClock, ScriptedTimeSource, SimMedium, SimRadio};
use sensnode::timesync::*;
use sensnode::ClockModel;

const GATEWAY: u8 = 100;
// 2025-07-01 12:00:00 UTC
const EPOCH_MS: u64 = 1_751_371_200_000;

fn link(medium: &SimMedium, clock: &ManualClock, node_id: u8) -> ReliableLink<SimRadio<ManualClock>, ManualClock> {
    let radio = SimRadio::new(medium.clone(), clock.clone());
    let mut link = ReliableLink::new(radio, clock.clone(), node_id, RadioConfig::default());
    assert!(link.init());
    link
}

fn sync_frame(to_id: u8, gateway_time: u64) -> [u8; 32] {
    RfMessage::new(GATEWAY, to_id, &encode_sync(gateway_time), gateway_time)
        .unwrap()
        .encode()
}

#[test]
fn test_gateway_broadcast_schedule() {
    let medium = SimMedium::new();
    let clock = ManualClock::new(5_000);
    let mut gateway = link(&medium, &clock, GATEWAY);
    let mut model = ClockModel::new();
    model.apply_reference(EPOCH_MS, 5_000);

    assert!(broadcast_sync(&mut gateway, &[1, 2], &mut model));

    let sent: Vec<RfMessage> = medium.transmissions().iter().filter_map(|t| t.message()).collect();
    assert_eq!(sent.len(), SYNC_ROUNDS * 2);
    let expected_span = SYNC_INTERVAL_FIRST_MS + (SYNC_ROUNDS as u64 - 2) * SYNC_INTERVAL_MS;
    assert_eq!(clock.millis(), 5_000 + expected_span);

    for msg in &sent {
        let announced = parse_sync(msg.text()).unwrap();
        assert_eq!(announced, msg.timestamp_ms);
        assert!(announced >= EPOCH_MS);
    }
    // Round 1 goes out right away, round 2 after the long pause.
    assert_eq!(parse_sync(sent[0].text()), Some(EPOCH_MS));
    assert_eq!(parse_sync(sent[2].text()), Some(EPOCH_MS + SYNC_INTERVAL_FIRST_MS));
    assert_eq!(sent.iter().filter(|m| m.to_id == 1).count(), SYNC_ROUNDS);
}

#[test]
fn test_leaf_collects_rounds_addressed_to_it() {
    let medium = SimMedium::new();
    let clock = ManualClock::new(0);
    let mut leaf = link(&medium, &clock, 1);
    let address = RadioConfig::default().address_of(1);

    // Gateway runs 500 ppm fast: one extra millisecond every two seconds.
    let mut samples = Vec::new();
    for i in 0..SYNC_ROUNDS as u64 {
        let local_time = 1_000 + i * 2_000;
        let gateway_time = EPOCH_MS + local_time + i;
        medium.inject(local_time, address, sync_frame(1, gateway_time));
        samples.push(SyncSample {
            gateway_time,
            local_time,
        });
        // Frames for other leaves and other traffic are ignored.
        medium.inject(local_time + 500, address, sync_frame(2, 42));
    }
    medium.inject(300, address, RfMessage::new(GATEWAY, 1, "CMD_RF_SYNC", 0).unwrap().encode());

    let mut model = ClockModel::new();
    let correction = collect_sync(&mut leaf, &mut model);

    assert_eq!(Some(correction), estimate_correction(&samples));
    assert_eq!(model.drift_ratio, correction.drift_ratio);
    assert_eq!(model.time_offset, correction.time_offset);
    assert_eq!(model.last_sync_running_time, 1_000 + 6 * 2_000);
    assert!((correction.drift_ratio - 1.0005).abs() < 1e-9);
}

#[test]
fn test_known_drift_and_offset() {
    // Gateway runs 100 ppm fast against the leaf.
    let samples: Vec<SyncSample> = (1..=7u64)
        .map(|i| SyncSample {
            gateway_time: EPOCH_MS + 10_000 * i + i,
            local_time: 10_000 * i,
        })
        .collect();

    let correction = estimate_correction(&samples).unwrap();
    assert!((correction.drift_ratio - 1.0001).abs() < 1e-12);
    // Diffs are EPOCH+1..=EPOCH+7; extremes dropped.
    assert_eq!(correction.time_offset, EPOCH_MS as i64 + 4);
}

#[test]
fn test_drift_and_offset_with_jitter_outliers() {
    // 200 ppm fast gateway, one late round (+50 ms) and one early round (-30 ms).
    let jitter = |i: u64| match i {
        4 => 50,
        6 => -30,
        _ => 0i64,
    };
    let samples: Vec<SyncSample> = (1..=7u64)
        .map(|i| SyncSample {
            gateway_time: (EPOCH_MS as i64 + 10_000 * i as i64 + 2 * i as i64 + jitter(i)) as u64,
            local_time: 10_000 * i,
        })
        .collect();

    // Drifts against round 1: 2/10000, 4/20000, 56/30000, 8/40000, -20/50000, 12/60000.
    // Dropping 56/30000 and -20/50000 leaves four rounds of 0.0002.
    // Diffs: +2 +4 +6 +58 +10 -18 +14; dropping +58 and -18 leaves 36/5 = 7.2, truncated to 7.
    let correction = estimate_correction(&samples).unwrap();
    assert!((correction.drift_ratio - 1.0002).abs() < 1e-12);
    assert_eq!(correction.time_offset, EPOCH_MS as i64 + 7);

    let mut model = ClockModel::new();
    model.apply_correction(correction.drift_ratio, correction.time_offset, 70_000);
    assert_eq!(model.time_offset, EPOCH_MS as i64 + 7);
    assert!((model.drift_ratio - 1.0002).abs() < 1e-12);
}

#[test]
fn test_no_samples_no_correction() {
    assert_eq!(estimate_correction(&[]), None);
}

#[test]
fn test_reference_rejects_stale_epoch() {
    let clock = ManualClock::new(2_345);
    let mut model = ClockModel::new();
    let mut source = ScriptedTimeSource::new([Some(1_600_000_000)], None);

    assert!(!sync_reference_time(&mut source, &clock, &mut model));
    assert_eq!(model.time_offset, 0);
    assert_eq!(clock.millis(), 2_345 + u64::from(REFERENCE_SYNC_ATTEMPTS) * REFERENCE_RETRY_DELAY_MS);
}

#[test]
fn test_reference_keeps_drift_and_local_phase() {
    let clock = ManualClock::new(2_345);
    let mut model = ClockModel::new();
    model.apply_correction(1.0002, 0, 0);
    let mut source = ScriptedTimeSource::new([None, Some(MIN_VALID_EPOCH - 1)], Some(EPOCH_MS / 1000));

    assert!(sync_reference_time(&mut source, &clock, &mut model));
    let local_now = clock.millis();
    assert_eq!(local_now, 2_345 + 2 * REFERENCE_RETRY_DELAY_MS);
    assert_eq!(model.drift_ratio, 1.0002);
    assert_eq!(model.last_sync_running_time, local_now);
    assert_eq!(model.get_unified_time(local_now), EPOCH_MS + local_now % 1000);
}

#[test]
fn test_blocking_reference_sync_counts_rounds() {
    let clock = ManualClock::new(0);
    let mut model = ClockModel::new();
    let failures = vec![None; REFERENCE_SYNC_ATTEMPTS as usize * 2];
    let mut source = ScriptedTimeSource::new(failures, Some(EPOCH_MS / 1000));

    assert_eq!(sync_reference_time_blocking(&mut source, &clock, &mut model), 3);
    let waited = 2 * (u64::from(REFERENCE_SYNC_ATTEMPTS) * REFERENCE_RETRY_DELAY_MS + REFERENCE_OUTER_BACKOFF_MS);
    assert_eq!(clock.millis(), waited);
    assert_eq!(model.get_unified_time(waited), EPOCH_MS + waited % 1000);
}

proptest! {
    #[test]
    fn prop_single_outlier_is_trimmed(
        offset in 1_000_000i64..2_000_000_000_000,
        outlier in prop_oneof![-500_000i64..-1, 1i64..1_000_000],
        index in 1usize..SYNC_ROUNDS,
    ) {
        let samples: Vec<SyncSample> = (0..SYNC_ROUNDS)
            .map(|i| {
                let local_time = 3_000 + i as u64 * 2_000;
                let skew = if i == index { outlier } else { 0 };
                SyncSample {
                    gateway_time: (local_time as i64 + offset + skew) as u64,
                    local_time,
                }
            })
            .collect();

        let correction = estimate_correction(&samples).unwrap();
        prop_assert_eq!(correction.time_offset, offset);
        prop_assert_eq!(correction.drift_ratio, 1.0);
    }
}
