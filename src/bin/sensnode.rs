use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use sensnode::clock::to_calendar;
use sensnode::command::RebootScope;
use sensnode::config::{DEFAULT_SENSING_DURATION_S, DEFAULT_SENSING_RATE_HZ};
use sensnode::BrokerCommand;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, Level};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const DEFAULT_TIMEOUT_S: &str = "60";

fn number_validator(v: String) -> Result<(), String> {
    v.parse::<u32>()
        .map(|_| ())
        .map_err(|_| format!("'{}' is not a positive number", v))
}

fn rate_arg() -> Arg<'static, 'static> {
    Arg::with_name("rate")
        .short("r")
        .long("rate")
        .value_name("HZ")
        .help("Sampling rate in Hz")
        .takes_value(true)
        .validator(number_validator)
}

fn duration_arg() -> Arg<'static, 'static> {
    Arg::with_name("duration")
        .short("d")
        .long("duration")
        .value_name("SECONDS")
        .help("Sampling duration in seconds")
        .takes_value(true)
        .validator(number_validator)
}

fn cli() -> App<'static, 'static> {
    App::new("sensnode")
        .version("0.1.0")
        .about("Operator console for a simulated sensing network")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator operator port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .value_name("SECONDS")
                .help("How long to wait for the gateway's reply")
                .takes_value(true)
                .default_value(DEFAULT_TIMEOUT_S)
                .validator(number_validator)
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log connection and event traffic to stderr")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ntp").about("Resynchronize the gateway with the reference time service"))
        .subcommand(SubCommand::with_name("sense").about("Start sensing one minute from now with default parameters"))
        .subcommand(
            SubCommand::with_name("sense-in")
                .about("Start sensing after a delay")
                .arg(
                    Arg::with_name("delay")
                        .help("Delay in seconds (at least 60)")
                        .required(true)
                        .validator(number_validator),
                )
                .arg(rate_arg())
                .arg(duration_arg()),
        )
        .subcommand(
            SubCommand::with_name("sense-at")
                .about("Start sensing at an absolute UTC time")
                .arg(Arg::with_name("date").help("YYYY-MM-DD").required(true))
                .arg(Arg::with_name("time").help("HH:MM:SS").required(true))
                .arg(rate_arg())
                .arg(duration_arg()),
        )
        .subcommand(
            SubCommand::with_name("retrieve")
                .about("Download a data file from the gateway")
                .arg(Arg::with_name("name").help("File name without .txt, e.g. N100_001").required(true)),
        )
        .subcommand(
            SubCommand::with_name("reboot").about("Reboot nodes").arg(
                Arg::with_name("scope")
                    .help("Which nodes to reboot")
                    .possible_values(&["all", "gateway", "leaves"])
                    .default_value("all"),
            ),
        )
        .subcommand(SubCommand::with_name("rf-sync").about("Rerun radio time synchronization"))
        .subcommand(
            SubCommand::with_name("raw")
                .about("Send a command string unmodified")
                .arg(Arg::with_name("command").required(true)),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Stream node status and gateway messages (Ctrl+C to stop)")
                .arg(
                    Arg::with_name("format")
                        .short("f")
                        .long("format")
                        .takes_value(true)
                        .possible_values(&["table", "json"])
                        .default_value("table"),
                ),
        )
}

/// `--verbose` may follow the subcommand, so look in both places.
fn log_level(matches: &ArgMatches<'_>) -> Level {
    let verbose = matches.is_present("verbose") || matches.subcommand().1.map_or(false, |m| m.is_present("verbose"));
    if verbose {
        Level::DEBUG
    } else {
        Level::WARN
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = cli().get_matches();

    let level = log_level(&matches);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let timeout = Duration::from_secs(matches.value_of("timeout").unwrap_or(DEFAULT_TIMEOUT_S).parse()?);

    let command = match matches.subcommand() {
        ("monitor", Some(sub_matches)) => return monitor(host, port, sub_matches.value_of("format") == Some("json")).await,
        ("raw", Some(sub_matches)) => sub_matches.value_of("command").unwrap_or_default().to_string(),
        (name, sub_matches) => match build_command(name, sub_matches) {
            Ok(command) => command.to_string(),
            Err(e) => {
                eprintln!("{} {}", "❌".red(), e.bright_red());
                std::process::exit(2);
            }
        },
    };

    let wait_for_file = command.starts_with(sensnode::command::CMD_RETRIEVAL_PREFIX);
    println!("{} {}", "📨 Sending".bright_blue(), command.bright_white());
    send_command(host, port, &command, timeout, wait_for_file).await
}

fn rate_and_duration(matches: &ArgMatches<'_>) -> (u32, u32) {
    let rate = matches
        .value_of("rate")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SENSING_RATE_HZ);
    let duration = matches
        .value_of("duration")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SENSING_DURATION_S);
    (rate, duration)
}

/// Build and locally validate the broker command for a subcommand.
fn build_command(name: &str, matches: Option<&ArgMatches<'_>>) -> Result<BrokerCommand, String> {
    let command = match (name, matches) {
        ("ntp", _) => BrokerCommand::Ntp,
        ("sense", _) => BrokerCommand::ScheduleNow,
        ("rf-sync", _) => BrokerCommand::RfSync,
        ("sense-in", Some(m)) => {
            let (rate_hz, duration_s) = rate_and_duration(m);
            let delay_s = m.value_of("delay").and_then(|v| v.parse().ok()).unwrap_or_default();
            BrokerCommand::ScheduleDelayed {
                delay_s,
                rate_hz,
                duration_s,
            }
        }
        ("sense-at", Some(m)) => {
            let (rate_hz, duration_s) = rate_and_duration(m);
            let date = m.value_of("date").unwrap_or_default();
            let time = m.value_of("time").unwrap_or_default();
            format!("CMD_SENSING_{date}_{time}_{rate_hz}Hz_{duration_s}s")
                .parse::<BrokerCommand>()
                .map_err(|e| e.to_string())?
        }
        ("retrieve", Some(m)) => {
            let name = m.value_of("name").unwrap_or_default();
            let name = name.strip_suffix(".txt").unwrap_or(name);
            BrokerCommand::Retrieve { name: name.to_string() }
        }
        ("reboot", m) => BrokerCommand::Reboot(match m.and_then(|m| m.value_of("scope")) {
            Some("gateway") => RebootScope::Gateway,
            Some("leaves") => RebootScope::Leaves,
            _ => RebootScope::All,
        }),
        _ => return Err(format!("unknown subcommand '{name}'")),
    };
    // Round-trip through the parser so malformed values fail here, not on the gateway.
    command.to_string().parse::<BrokerCommand>().map_err(|e| e.to_string())
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    debug!(%addr, "connecting to simulator");
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to simulator at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Simulator is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "cargo run --bin sensnode-sim".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            Err(e.into())
        }
    }
}

fn is_failure(text: &str) -> bool {
    text.contains("ignored") || text.contains("Unknown command") || text.contains("failed") || text.contains("invalid")
}

async fn send_command(
    host: &str,
    port: u16,
    command: &str,
    timeout: Duration,
    wait_for_file: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(command.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    debug!(command, ?timeout, "command sent");

    let mut lines = BufReader::new(reader).lines();
    let mut file_contents = String::new();
    let outcome = tokio::time::timeout(timeout, async {
        while let Some(line) = lines.next_line().await? {
            let Ok(event) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            if event["type"] != "broker" {
                continue;
            }
            let text = event["text"].as_str().unwrap_or_default();
            debug!(text, "broker event");

            if wait_for_file {
                if text.ends_with("[done]") {
                    return Ok::<bool, std::io::Error>(true);
                }
                if text.starts_with("Retrieval failed") {
                    println!("{} {}", "❌".red(), text.bright_red());
                    return Ok(false);
                }
                if let Some((_, data)) = text.split_once("]:") {
                    file_contents.push_str(data);
                    continue;
                }
            }

            if is_failure(text) {
                println!("{} {}", "❌".red(), text.bright_red());
                return Ok(false);
            }
            println!("{} {}", "✅".green(), text.bright_green());
            return Ok(true);
        }
        Ok(false)
    })
    .await;

    match outcome {
        Ok(Ok(true)) => {
            if wait_for_file {
                print!("{}", file_contents);
                println!("{} {} bytes received", "✅".green(), file_contents.len());
            }
            Ok(())
        }
        Ok(Ok(false)) => std::process::exit(1),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            eprintln!("{} No reply after {} s", "⏰".yellow(), timeout.as_secs());
            eprintln!("{} The gateway may be busy with a radio sync; try again shortly", "💡".yellow());
            Err("Command timeout".into())
        }
    }
}

fn colored_state(state: &str) -> ColoredString {
    match state {
        "IDLE" => state.green(),
        "SAMPLING" | "PREPARING" => state.bright_cyan().bold(),
        "ERROR" => state.red().bold(),
        _ => state.yellow(),
    }
}

async fn monitor(host: &str, port: u16, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();
    println!("{}", "📡 Monitoring sensing network (Press Ctrl+C to stop)...".bright_blue().bold());

    while let Some(line) = lines.next_line().await? {
        if json {
            println!("{}", line);
            continue;
        }
        let Ok(event) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        match event["type"].as_str() {
            Some("broker") => {
                println!("{} {}", "💬".bright_white(), event["text"].as_str().unwrap_or_default().bright_white());
            }
            Some("status") => {
                let Some(nodes) = event["nodes"].as_array() else {
                    continue;
                };
                println!("{}", "│ Node │ State              │ Unified time (UTC)      │ Drift        │ Offset ms      │".bright_white());
                for node in nodes {
                    let unified = node["unified_time"].as_u64().unwrap_or(0);
                    println!(
                        "│ {:>4} │ {:<18} │ {:<23} │ {:>12.9} │ {:>14} │",
                        node["node_id"].as_u64().unwrap_or(0),
                        colored_state(node["state"].as_str().unwrap_or("?")),
                        to_calendar(unified).to_string(),
                        node["drift_ratio"].as_f64().unwrap_or(1.0),
                        node["time_offset"].as_i64().unwrap_or(0),
                    );
                }
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_is_global() {
        let quiet = cli().get_matches_from(vec!["sensnode", "ntp"]);
        assert_eq!(log_level(&quiet), Level::WARN);

        let loud = cli().get_matches_from(vec!["sensnode", "rf-sync", "--verbose"]);
        assert_eq!(log_level(&loud), Level::DEBUG);
        let loud = cli().get_matches_from(vec!["sensnode", "-v", "monitor"]);
        assert_eq!(log_level(&loud), Level::DEBUG);
    }

    #[test]
    fn test_build_command_validates_schedules() {
        let matches = cli().get_matches_from(vec!["sensnode", "sense-in", "90", "-r", "100", "-d", "10"]);
        let (name, sub) = matches.subcommand();
        assert_eq!(build_command(name, sub).map(|c| c.to_string()), Ok("CMD_SFN_90_100Hz_10s".to_string()));

        let matches = cli().get_matches_from(vec!["sensnode", "sense-at", "2025-02-30", "12:00:00"]);
        let (name, sub) = matches.subcommand();
        assert!(build_command(name, sub).is_err());
    }
}
