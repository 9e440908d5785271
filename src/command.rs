//! Textual command protocols.
//!
//! Operator commands arrive on the broker and are handled by the gateway;
//! the gateway forwards the subset leaves care about over the radio. Both
//! grammars parse into tagged variants up front, so a command is either
//! fully valid or rejected before any state is touched.

use crate::clock::{from_calendar, to_calendar, CalendarTime};
use crate::config::MAX_SENSING_RATE_HZ;
use crate::link::PAYLOAD_CAPACITY;
use crate::node::{NodeContext, NodeState, SensingSchedule};
use crate::timesync::TIME_SYNC_RESERVED_TIME;
use core::fmt;
use core::str::FromStr;
use tracing::{info, warn};

pub const CMD_NTP: &str = "CMD_NTP";
pub const CMD_SN: &str = "CMD_SN";
pub const CMD_SFN_PREFIX: &str = "CMD_SFN_";
pub const CMD_SENSING_PREFIX: &str = "CMD_SENSING_";
pub const CMD_RETRIEVAL_PREFIX: &str = "CMD_RETRIEVAL_";
pub const CMD_REBOOT: &str = "CMD_REBOOT";
pub const CMD_GATEWAY_REBOOT: &str = "CMD_GATEWAY_REBOOT";
pub const CMD_LEAFNODE_REBOOT: &str = "CMD_LEAFNODE_REBOOT";
pub const CMD_RF_SYNC: &str = "CMD_RF_SYNC";
pub const RADIO_SCHEDULE_PREFIX: &str = "S_";

/// Longest retrieval name accepted; keeps `<name>.txt[i/n]:` labels short.
pub const MAX_RETRIEVAL_NAME_LEN: usize = 24;

/// Rejections. The `Display` text is what the operator sees on the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("CMD_SFN ignored: invalid format.")]
    DelayedFormat,
    #[error("CMD_SENSING ignored: invalid format.")]
    AbsoluteFormat,
    #[error("Sensing command ignored: rate must be 1-{max} Hz and duration at least 1 s.", max = MAX_SENSING_RATE_HZ)]
    BadParameters { rate_hz: u32, duration_s: u32 },
    #[error("Sensing command ignored: {rate_hz} Hz / {duration_s} s does not fit a radio frame.")]
    TooLongForRadio { rate_hz: u32, duration_s: u32 },
    #[error("CMD_RETRIEVAL ignored: invalid file name.")]
    RetrievalName,
    #[error("CMD_SFN ignored: delay too short for time sync.")]
    DelayTooShort,
    #[error("Sensing command ignored: start time is in the past!")]
    StartInPast,
    #[error("Sensing command ignored: not enough time for time synchronization!")]
    NoSyncMargin,
    #[error("Sensing command ignored: start time {0} cannot be sent to leaf nodes.")]
    StartOutOfRadioRange(CalendarTime),
    #[error("invalid radio schedule: {0}")]
    RadioScheduleFormat(String),
}

impl CommandError {
    /// Well-formed schedule that violates a timing constraint. These roll
    /// the sensing flags back; everything else leaves state untouched.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            CommandError::DelayTooShort
                | CommandError::StartInPast
                | CommandError::NoSyncMargin
                | CommandError::StartOutOfRadioRange(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootScope {
    All,
    Gateway,
    Leaves,
}

/// Operator command received on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCommand {
    Ntp,
    ScheduleNow,
    ScheduleDelayed { delay_s: u32, rate_hz: u32, duration_s: u32 },
    ScheduleAbsolute { at: CalendarTime, rate_hz: u32, duration_s: u32 },
    Retrieve { name: String },
    Reboot(RebootScope),
    RfSync,
}

/// `S_<YYMMDDHHMMSS>_<rate>_<dur>` length for the given parameters.
fn radio_schedule_len(rate_hz: u32, duration_s: u32) -> usize {
    RADIO_SCHEDULE_PREFIX.len() + 12 + format!("_{rate_hz}_{duration_s}").len()
}

/// Whether a schedule with these parameters can be forwarded to leaves.
pub fn schedule_fits_radio(rate_hz: u32, duration_s: u32) -> bool {
    radio_schedule_len(rate_hz, duration_s) <= PAYLOAD_CAPACITY
}

fn check_schedule_parameters(rate_hz: u32, duration_s: u32) -> Result<(), CommandError> {
    if rate_hz == 0 || rate_hz > MAX_SENSING_RATE_HZ || duration_s == 0 {
        return Err(CommandError::BadParameters { rate_hz, duration_s });
    }
    if !schedule_fits_radio(rate_hz, duration_s) {
        return Err(CommandError::TooLongForRadio { rate_hz, duration_s });
    }
    Ok(())
}

/// `<rate>Hz` and `<dur>s`.
fn parse_rate_duration(rate: &str, duration: &str) -> Option<(u32, u32)> {
    let rate_hz = rate.strip_suffix("Hz")?.parse().ok()?;
    let duration_s = duration.strip_suffix('s')?.parse().ok()?;
    Some((rate_hz, duration_s))
}

fn parse_delayed(args: &str) -> Result<BrokerCommand, CommandError> {
    let parts: Vec<&str> = args.split('_').collect();
    let [delay, rate, duration] = parts.as_slice() else {
        return Err(CommandError::DelayedFormat);
    };
    let delay_s = delay.parse().map_err(|_| CommandError::DelayedFormat)?;
    let (rate_hz, duration_s) = parse_rate_duration(rate, duration).ok_or(CommandError::DelayedFormat)?;
    check_schedule_parameters(rate_hz, duration_s)?;
    Ok(BrokerCommand::ScheduleDelayed {
        delay_s,
        rate_hz,
        duration_s,
    })
}

fn parse_fields<const N: usize>(text: &str, sep: char) -> Option<[u16; N]> {
    let mut fields = [0u16; N];
    let mut parts = text.split(sep);
    for field in &mut fields {
        *field = parts.next()?.parse().ok()?;
    }
    parts.next().is_none().then_some(fields)
}

/// `YYYY-MM-DD_HH:MM:SS_<rate>Hz_<dur>s`
fn parse_absolute(args: &str) -> Result<BrokerCommand, CommandError> {
    let parts: Vec<&str> = args.split('_').collect();
    let [date, time, rate, duration] = parts.as_slice() else {
        return Err(CommandError::AbsoluteFormat);
    };
    let [year, month, day] = parse_fields::<3>(date, '-').ok_or(CommandError::AbsoluteFormat)?;
    let [hour, minute, second] = parse_fields::<3>(time, ':').ok_or(CommandError::AbsoluteFormat)?;
    let narrow = |v: u16| u8::try_from(v).map_err(|_| CommandError::AbsoluteFormat);
    let at = CalendarTime::new(
        year,
        narrow(month)?,
        narrow(day)?,
        narrow(hour)?,
        narrow(minute)?,
        narrow(second)?,
    )
    .map_err(|_| CommandError::AbsoluteFormat)?;
    let (rate_hz, duration_s) = parse_rate_duration(rate, duration).ok_or(CommandError::AbsoluteFormat)?;
    check_schedule_parameters(rate_hz, duration_s)?;
    Ok(BrokerCommand::ScheduleAbsolute {
        at,
        rate_hz,
        duration_s,
    })
}

fn parse_retrieval(name: &str) -> Result<BrokerCommand, CommandError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_RETRIEVAL_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if !valid {
        return Err(CommandError::RetrievalName);
    }
    Ok(BrokerCommand::Retrieve { name: name.to_string() })
}

impl FromStr for BrokerCommand {
    type Err = CommandError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim_end_matches(['\r', '\n']);
        match text {
            CMD_NTP => return Ok(BrokerCommand::Ntp),
            CMD_SN => return Ok(BrokerCommand::ScheduleNow),
            CMD_REBOOT => return Ok(BrokerCommand::Reboot(RebootScope::All)),
            CMD_GATEWAY_REBOOT => return Ok(BrokerCommand::Reboot(RebootScope::Gateway)),
            CMD_LEAFNODE_REBOOT => return Ok(BrokerCommand::Reboot(RebootScope::Leaves)),
            CMD_RF_SYNC => return Ok(BrokerCommand::RfSync),
            _ => {}
        }
        if let Some(args) = text.strip_prefix(CMD_SFN_PREFIX) {
            parse_delayed(args)
        } else if let Some(args) = text.strip_prefix(CMD_SENSING_PREFIX) {
            parse_absolute(args)
        } else if let Some(name) = text.strip_prefix(CMD_RETRIEVAL_PREFIX) {
            parse_retrieval(name)
        } else {
            Err(CommandError::Unknown(text.to_string()))
        }
    }
}

impl fmt::Display for BrokerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerCommand::Ntp => f.write_str(CMD_NTP),
            BrokerCommand::ScheduleNow => f.write_str(CMD_SN),
            BrokerCommand::ScheduleDelayed {
                delay_s,
                rate_hz,
                duration_s,
            } => write!(f, "{CMD_SFN_PREFIX}{delay_s}_{rate_hz}Hz_{duration_s}s"),
            BrokerCommand::ScheduleAbsolute { at, rate_hz, duration_s } => write!(
                f,
                "{CMD_SENSING_PREFIX}{:04}-{:02}-{:02}_{:02}:{:02}:{:02}_{rate_hz}Hz_{duration_s}s",
                at.year, at.month, at.day, at.hour, at.minute, at.second
            ),
            BrokerCommand::Retrieve { name } => write!(f, "{CMD_RETRIEVAL_PREFIX}{name}"),
            BrokerCommand::Reboot(RebootScope::All) => f.write_str(CMD_REBOOT),
            BrokerCommand::Reboot(RebootScope::Gateway) => f.write_str(CMD_GATEWAY_REBOOT),
            BrokerCommand::Reboot(RebootScope::Leaves) => f.write_str(CMD_LEAFNODE_REBOOT),
            BrokerCommand::RfSync => f.write_str(CMD_RF_SYNC),
        }
    }
}

/// Command the gateway sends to leaves over the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCommand {
    Reboot,
    RfSync,
    Schedule { at: CalendarTime, rate_hz: u32, duration_s: u32 },
    LogNumber(i16),
}

impl RadioCommand {
    /// Radio form of a schedule starting at `start_ms` (unified time).
    pub fn schedule(schedule: &SensingSchedule) -> Self {
        RadioCommand::Schedule {
            at: to_calendar(schedule.scheduled_start_ms),
            rate_hz: schedule.rate_hz,
            duration_s: schedule.duration_s,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            RadioCommand::Reboot => CMD_REBOOT.to_string(),
            RadioCommand::RfSync => CMD_RF_SYNC.to_string(),
            RadioCommand::Schedule { at, rate_hz, duration_s } => {
                format!("{RADIO_SCHEDULE_PREFIX}{}_{rate_hz}_{duration_s}", at.to_compact())
            }
            RadioCommand::LogNumber(n) => format!("LOG {n}"),
        }
    }

    fn parse_schedule(args: &str) -> Result<Self, CommandError> {
        let bad = || CommandError::RadioScheduleFormat(args.to_string());
        let mut parts = args.split('_');
        let (Some(stamp), Some(rate), Some(duration), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        let at = CalendarTime::from_compact(stamp).map_err(|_| bad())?;
        let rate_hz: u32 = rate.parse().map_err(|_| bad())?;
        let duration_s: u32 = duration.parse().map_err(|_| bad())?;
        if rate_hz == 0 || rate_hz > MAX_SENSING_RATE_HZ || duration_s == 0 {
            return Err(bad());
        }
        Ok(RadioCommand::Schedule { at, rate_hz, duration_s })
    }
}

impl FromStr for RadioCommand {
    type Err = CommandError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            CMD_REBOOT => Ok(RadioCommand::Reboot),
            CMD_RF_SYNC => Ok(RadioCommand::RfSync),
            _ => {
                if let Some(args) = text.strip_prefix(RADIO_SCHEDULE_PREFIX) {
                    Self::parse_schedule(args)
                } else if let Some(n) = crate::link::parse_log_request(text) {
                    Ok(RadioCommand::LogNumber(n))
                } else {
                    Err(CommandError::Unknown(text.to_string()))
                }
            }
        }
    }
}

/// What the caller should do after an accepted broker command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutcome {
    /// Confirmation to publish, if any.
    pub reply: Option<String>,
    pub next_state: Option<NodeState>,
}

impl CommandOutcome {
    fn reply(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            next_state: None,
        }
    }
}

/// Store the schedule, unless leaves would read its radio timestamp back
/// as a different century.
fn accept_schedule(ctx: &mut NodeContext, schedule: SensingSchedule) -> Result<(), CommandError> {
    let start = to_calendar(schedule.scheduled_start_ms);
    if !start.fits_compact() {
        return Err(reject_schedule(ctx, CommandError::StartOutOfRadioRange(start)));
    }
    ctx.schedule = schedule;
    ctx.flags.time_rf_required = true;
    ctx.flags.sensing_requested = true;
    ctx.flags.sensing_scheduled = true;
    info!(
        start = %to_calendar(schedule.scheduled_start_ms),
        rate_hz = schedule.rate_hz,
        duration_s = schedule.duration_s,
        "sensing scheduled"
    );
    Ok(())
}

fn reject_schedule(ctx: &mut NodeContext, err: CommandError) -> CommandError {
    ctx.flags.sensing_requested = false;
    ctx.flags.sensing_scheduled = false;
    warn!(error = %err, "sensing command rejected");
    err
}

/// Apply an operator command on the gateway. `now` is the current unified
/// time. On `Err` the sensing flags are either untouched (malformed input)
/// or rolled back to false (timing constraint violated).
pub fn apply_broker_command(
    ctx: &mut NodeContext,
    command: &BrokerCommand,
    now: u64,
) -> Result<CommandOutcome, CommandError> {
    info!(command = %command, "broker command received");
    let second_aligned = (now / 1000) * 1000;

    match command {
        BrokerCommand::Ntp => {
            ctx.flags.gateway_ntp_required = true;
            ctx.flags.leafnode_ntp_required = true;
            Ok(CommandOutcome {
                reply: Some("CMD_NTP: time synchronization started.".to_string()),
                next_state: Some(NodeState::WifiCommunicating),
            })
        }
        BrokerCommand::ScheduleNow => {
            let start = second_aligned + TIME_SYNC_RESERVED_TIME;
            let schedule = SensingSchedule::starting_at(
                start,
                ctx.config.default_sensing_rate_hz,
                ctx.config.default_sensing_duration_s,
            );
            accept_schedule(ctx, schedule)?;
            Ok(CommandOutcome::reply("CMD_SN: Sensing scheduled using default parameters."))
        }
        BrokerCommand::ScheduleDelayed {
            delay_s,
            rate_hz,
            duration_s,
        } => {
            let delay_ms = u64::from(*delay_s) * 1000;
            if delay_ms < TIME_SYNC_RESERVED_TIME {
                return Err(reject_schedule(ctx, CommandError::DelayTooShort));
            }
            accept_schedule(ctx, SensingSchedule::starting_at(second_aligned + delay_ms, *rate_hz, *duration_s))?;
            Ok(CommandOutcome::reply("CMD_SFN: Sensing successfully scheduled."))
        }
        BrokerCommand::ScheduleAbsolute { at, rate_hz, duration_s } => {
            let start = from_calendar(at);
            if now > start {
                return Err(reject_schedule(ctx, CommandError::StartInPast));
            }
            if start < now + TIME_SYNC_RESERVED_TIME {
                return Err(reject_schedule(ctx, CommandError::NoSyncMargin));
            }
            accept_schedule(ctx, SensingSchedule::starting_at(start, *rate_hz, *duration_s))?;
            Ok(CommandOutcome::reply("CMD_SENSING: Sensing successfully scheduled."))
        }
        BrokerCommand::Retrieve { name } => {
            ctx.retrieval_file = Some(format!("{name}.txt"));
            ctx.flags.data_retrieval_requested = true;
            ctx.flags.data_retrieval_sent = false;
            Ok(CommandOutcome {
                reply: None,
                next_state: Some(NodeState::WifiCommunicating),
            })
        }
        BrokerCommand::Reboot(scope) => {
            if matches!(scope, RebootScope::All | RebootScope::Gateway) {
                ctx.flags.reboot_required_gateway = true;
            }
            if matches!(scope, RebootScope::All | RebootScope::Leaves) {
                ctx.flags.reboot_required_leafnode = true;
            }
            Ok(CommandOutcome::reply("Reboot scheduled."))
        }
        BrokerCommand::RfSync => {
            ctx.flags.time_rf_required = true;
            Ok(CommandOutcome::reply("CMD_RF_SYNC: radio time sync requested."))
        }
    }
}

/// Apply a gateway command on a leaf. Schedules are trusted as already
/// validated. Returns the state to move to, if any. `LogNumber` needs the
/// storage collaborator and is answered by the link layer instead.
pub fn apply_radio_command(ctx: &mut NodeContext, command: &RadioCommand) -> Option<NodeState> {
    match command {
        RadioCommand::Reboot => {
            info!(node_id = ctx.config.node_id, "reboot command received");
            ctx.flags.reboot_required_leafnode = true;
            Some(NodeState::Boot)
        }
        RadioCommand::RfSync => {
            info!(node_id = ctx.config.node_id, "radio sync command received");
            ctx.flags.time_rf_required = true;
            Some(NodeState::RfCommunicating)
        }
        RadioCommand::Schedule { at, rate_hz, duration_s } => {
            ctx.schedule = SensingSchedule::starting_at(from_calendar(at), *rate_hz, *duration_s);
            ctx.flags.sensing_scheduled = true;
            info!(
                node_id = ctx.config.node_id,
                start = %at,
                rate_hz,
                duration_s,
                start_ms = ctx.schedule.scheduled_start_ms,
                "sensing scheduled by gateway"
            );
            None
        }
        RadioCommand::LogNumber(_) => None,
    }
}
