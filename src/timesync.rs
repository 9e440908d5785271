//! Clock synchronization: external reference sync on the gateway, and the
//! radio round-trip procedure that lets leaves learn drift and offset
//! against the gateway's unified time.

use crate::clock::ClockModel;
use crate::hal::{MonotonicClock, Radio, TimeSource};
use crate::link::{ReliableLink, RfMessage, LEAF_LISTEN_WINDOW_MS};
use heapless::Vec;
use tracing::{debug, info, warn};

pub const SYNC_ROUNDS: usize = 7;
/// Pause after the first broadcast round, long enough for clocks to separate.
pub const SYNC_INTERVAL_FIRST_MS: u64 = 20_000;
pub const SYNC_INTERVAL_MS: u64 = 2_000;
/// Minimum lead time a scheduling command must leave for synchronization.
pub const TIME_SYNC_RESERVED_TIME: u64 = 60_000;

/// 2025-01-01 00:00:00 UTC. Anything earlier is a stale or garbage answer.
pub const MIN_VALID_EPOCH: u64 = 1_735_689_600;
pub const REFERENCE_SYNC_ATTEMPTS: u32 = 5;
pub const REFERENCE_RETRY_DELAY_MS: u64 = 1_000;
/// Backoff between whole bounded procedures at call sites that must not
/// proceed unsynchronized.
pub const REFERENCE_OUTER_BACKOFF_MS: u64 = 2_000;

const SYNC_PREFIX: &str = "SYNC";

/// Query the reference service up to [`REFERENCE_SYNC_ATTEMPTS`] times.
/// On success the clock offset is replaced and the drift ratio kept.
pub fn sync_reference_time<C: MonotonicClock>(
    source: &mut dyn TimeSource,
    clock: &C,
    model: &mut ClockModel,
) -> bool {
    for attempt in 1..=REFERENCE_SYNC_ATTEMPTS {
        let Some(epoch) = source.fetch_epoch_seconds() else {
            warn!(attempt, "failed to get reference time");
            clock.delay_ms(REFERENCE_RETRY_DELAY_MS);
            continue;
        };
        if epoch < MIN_VALID_EPOCH {
            warn!(attempt, epoch, "invalid reference epoch");
            clock.delay_ms(REFERENCE_RETRY_DELAY_MS);
            continue;
        }

        let local_now = clock.millis();
        // Sub-second phase comes from the local clock.
        let epoch_ms = epoch * 1000 + local_now % 1000;
        model.apply_reference(epoch_ms, local_now);
        info!(epoch, unified = %model.get_calendar(local_now), "reference time synchronized");
        return true;
    }
    warn!(attempts = REFERENCE_SYNC_ATTEMPTS, "reference sync failed");
    false
}

/// Re-run [`sync_reference_time`] until it succeeds. Returns the number of
/// bounded procedures it took.
pub fn sync_reference_time_blocking<C: MonotonicClock>(
    source: &mut dyn TimeSource,
    clock: &C,
    model: &mut ClockModel,
) -> u32 {
    let mut rounds = 1;
    while !sync_reference_time(source, clock, model) {
        warn!(rounds, backoff_ms = REFERENCE_OUTER_BACKOFF_MS, "reference sync failed, retrying");
        clock.delay_ms(REFERENCE_OUTER_BACKOFF_MS);
        rounds += 1;
    }
    rounds
}

/// One received broadcast: the gateway's announced time and our local
/// receipt time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    pub gateway_time: u64,
    pub local_time: u64,
}

impl SyncSample {
    pub fn diff(&self) -> i64 {
        self.gateway_time as i64 - self.local_time as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockCorrection {
    pub drift_ratio: f64,
    pub time_offset: i64,
}

fn trimmed_mean_f64(values: &[f64]) -> Option<f64> {
    if values.len() < 3 {
        return None;
    }
    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    let sum: f64 = values.iter().sum();
    Some((sum - max - min) / (values.len() - 2) as f64)
}

/// Integer variant; truncates toward zero.
fn trimmed_mean_i64(values: &[i64]) -> Option<i64> {
    let max = *values.iter().max()?;
    let min = *values.iter().min()?;
    if values.len() < 3 {
        return None;
    }
    let sum: i64 = values.iter().sum();
    Some((sum - max - min) / (values.len() - 2) as i64)
}

/// Drift and offset from a run of sync samples.
///
/// Drift for round `i` is `(gatewayΔ - localΔ) / localΔ` against round 0;
/// offset is the raw per-round difference. Both are trimmed means (single
/// max and min dropped). Rounds whose local delta is not positive carry no
/// drift information and are skipped; with fewer than three drift samples
/// the drift correction is zero.
pub fn estimate_correction(samples: &[SyncSample]) -> Option<ClockCorrection> {
    let first = samples.first()?;
    let drifts: Vec<f64, SYNC_ROUNDS> = samples
        .iter()
        .skip(1)
        .filter_map(|s| {
            let local_delta = s.local_time as i64 - first.local_time as i64;
            if local_delta <= 0 {
                return None;
            }
            let gateway_delta = s.gateway_time as i64 - first.gateway_time as i64;
            Some((gateway_delta - local_delta) as f64 / local_delta as f64)
        })
        .take(SYNC_ROUNDS)
        .collect();

    let drift_avg = trimmed_mean_f64(&drifts).unwrap_or_else(|| {
        warn!(samples = drifts.len(), "too few drift samples, keeping nominal rate");
        0.0
    });

    let diffs: Vec<i64, SYNC_ROUNDS> = samples.iter().take(SYNC_ROUNDS).map(SyncSample::diff).collect();
    let time_offset = trimmed_mean_i64(&diffs)?;

    Some(ClockCorrection {
        drift_ratio: 1.0 + drift_avg,
        time_offset,
    })
}

/// `SYNC <high> <low>`: the 64-bit time split into two 32-bit halves so
/// the text always fits the payload.
pub fn encode_sync(gateway_time: u64) -> String {
    format!("{SYNC_PREFIX} {} {}", gateway_time >> 32, gateway_time & 0xFFFF_FFFF)
}

pub fn parse_sync(text: &str) -> Option<u64> {
    let mut parts = text.strip_prefix(SYNC_PREFIX)?.split_whitespace();
    let high: u32 = parts.next()?.parse().ok()?;
    let low: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((u64::from(high) << 32) | u64::from(low))
}

/// Gateway side: announce unified time to every peer for [`SYNC_ROUNDS`]
/// rounds. Fire-and-forget, always succeeds.
pub fn broadcast_sync<R: Radio, C: MonotonicClock>(
    link: &mut ReliableLink<R, C>,
    peers: &[u8],
    model: &mut ClockModel,
) -> bool {
    info!(rounds = SYNC_ROUNDS, peers = peers.len(), "starting time synchronization as gateway");
    let own_id = link.node_id();

    for round in 0..SYNC_ROUNDS {
        for &node_id in peers {
            let current_time = model.get_unified_time(link.clock().millis());
            match RfMessage::new(own_id, node_id, &encode_sync(current_time), current_time) {
                Ok(msg) => {
                    link.transmit(node_id, &msg);
                    debug!(round = round + 1, node_id, current_time, "sync broadcast");
                }
                Err(e) => warn!(error = %e, "cannot frame sync message"),
            }
        }

        if round == 0 {
            link.clock().delay_ms(SYNC_INTERVAL_FIRST_MS);
        } else if round < SYNC_ROUNDS - 1 {
            link.clock().delay_ms(SYNC_INTERVAL_MS);
        }
    }

    info!("gateway time synchronization complete");
    true
}

/// Leaf side: block until [`SYNC_ROUNDS`] sync frames addressed to this node
/// have arrived, then install the estimated correction. There is no
/// timeout; an absent gateway stalls the leaf here.
pub fn collect_sync<R: Radio, C: MonotonicClock>(
    link: &mut ReliableLink<R, C>,
    model: &mut ClockModel,
) -> ClockCorrection {
    info!(node_id = link.node_id(), "starting time synchronization as leaf");
    let own_id = link.node_id();
    let mut samples: Vec<SyncSample, SYNC_ROUNDS> = Vec::new();

    while !samples.is_full() {
        let Some(msg) = link.receive(LEAF_LISTEN_WINDOW_MS) else {
            continue;
        };
        if msg.to_id != own_id {
            continue;
        }
        let Some(gateway_time) = parse_sync(msg.text()) else {
            continue;
        };
        let sample = SyncSample {
            gateway_time,
            local_time: link.clock().millis(),
        };
        debug!(
            round = samples.len() + 1,
            gateway_time,
            local_time = sample.local_time,
            diff = sample.diff(),
            "sync sample"
        );
        // Loop condition guarantees room.
        let _ = samples.push(sample);
    }

    let local_now = link.clock().millis();
    let correction = estimate_correction(&samples).unwrap_or(ClockCorrection {
        drift_ratio: model.drift_ratio,
        time_offset: model.time_offset,
    });
    model.apply_correction(correction.drift_ratio, correction.time_offset, local_now);
    info!(
        drift_ratio = correction.drift_ratio,
        time_offset = correction.time_offset,
        last_sync = local_now,
        "leaf time synchronization complete"
    );
    correction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_text_round_trip() {
        let t = 1_751_371_200_123;
        let text = encode_sync(t);
        assert!(text.len() <= crate::link::PAYLOAD_CAPACITY);
        assert_eq!(parse_sync(&text), Some(t));
        assert_eq!(parse_sync("SYNC 1"), None);
        assert_eq!(parse_sync("SYNC 1 2 3"), None);
        assert_eq!(parse_sync("PONG 1"), None);
    }

    #[test]
    fn test_trimmed_means() {
        assert_eq!(trimmed_mean_i64(&[5, 1, 100, 3, 4]), Some(4));
        assert_eq!(trimmed_mean_i64(&[1, 2]), None);
        assert_eq!(trimmed_mean_f64(&[0.5, 10.0, -10.0]), Some(0.5));
    }

    #[test]
    fn test_offset_truncates_toward_zero() {
        assert_eq!(trimmed_mean_i64(&[-1, -2, -2, 0, -9]), Some(-1));
    }

    #[test]
    fn test_no_drift_when_clocks_agree() {
        let samples: std::vec::Vec<SyncSample> = (0..SYNC_ROUNDS as u64)
            .map(|i| SyncSample {
                gateway_time: 1_000_000 + i * 2_000,
                local_time: 10_000 + i * 2_000,
            })
            .collect();
        let correction = estimate_correction(&samples).unwrap();
        assert!((correction.drift_ratio - 1.0).abs() < 1e-12);
        assert_eq!(correction.time_offset, 990_000);
    }

    #[test]
    fn test_degenerate_local_deltas_keep_nominal_rate() {
        let samples = [SyncSample { gateway_time: 500, local_time: 100 }; SYNC_ROUNDS];
        let correction = estimate_correction(&samples).unwrap();
        assert!((correction.drift_ratio - 1.0).abs() < f64::EPSILON);
        assert_eq!(correction.time_offset, 400);
    }
}
