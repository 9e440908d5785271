use clap::{App, Arg};
use parking_lot::Mutex;
use sensnode::config::NetworkProfile;
use sensnode::hal::SystemClock;
use sensnode::sim::{HostTimeSource, SimBroker, SimHandles, SimMedium, SimRadio, SkewedClock};
use sensnode::{NodeSnapshot, NodeStateMachine};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{error, info, warn, Level};

const DEFAULT_PORT: &str = "8080";
const EVENT_BROADCAST_BUFFER_SIZE: usize = 256;
const BROKER_PUMP_INTERVAL_MS: u64 = 100;

type SnapshotStore = Arc<Mutex<BTreeMap<u8, NodeSnapshot>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("sensnode-sim")
        .version("0.1.0")
        .about("Simulated gateway and leaf nodes sharing one radio medium")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Operator bridge port")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Network profile (JSON)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("leaves")
                .short("n")
                .long("leaves")
                .value_name("COUNT")
                .help("Number of leaf nodes (overrides the profile)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("skew-ppm")
                .long("skew-ppm")
                .value_name("PPM")
                .help("Oscillator error of leaf n is n * PPM")
                .takes_value(true)
                .default_value("40"),
        )
        .arg(
            Arg::with_name("status-interval")
                .long("status-interval")
                .value_name("MS")
                .help("Status snapshot period")
                .takes_value(true)
                .default_value("1000"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut profile = match matches.value_of("config") {
        Some(path) => NetworkProfile::from_json(&std::fs::read_to_string(path)?)?,
        None => NetworkProfile::default(),
    };
    if let Some(leaves) = matches.value_of("leaves") {
        profile.leaf_count = leaves.parse()?;
    }
    profile.validate()?;
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let skew_ppm: i32 = matches.value_of("skew-ppm").unwrap_or("0").parse()?;
    let status_interval: u64 = matches.value_of("status-interval").unwrap_or("1000").parse()?;

    println!("Sensing Network Simulator");
    println!("=========================");
    println!(
        "gateway {} + {} leaves, {} Hz / {} s default sensing",
        profile.gateway_id, profile.leaf_count, profile.default_sensing_rate_hz, profile.default_sensing_duration_s
    );

    let running = Arc::new(AtomicBool::new(true));
    let snapshots: SnapshotStore = Arc::new(Mutex::new(BTreeMap::new()));
    let medium = SimMedium::unrecorded();
    let air_clock = SystemClock::new();
    let gateway_handles = SimHandles::new();

    spawn_gateway(&profile, &medium, air_clock, &gateway_handles, &running, &snapshots)?;
    for (index, config) in profile.leaf_configs().into_iter().enumerate() {
        let node_id = config.node_id;
        let skew = skew_ppm * i32::from(node_id);
        let clock = SkewedClock::new(air_clock, skew, 1000 * (index as u64 + 1));
        let radio = SimRadio::new(medium.clone(), air_clock);
        let handles = SimHandles::new();
        let node = NodeStateMachine::new(config, radio, clock, handles.leaf_peripherals())?;
        info!(node_id, skew_ppm = skew, "leaf node started");
        spawn_node(node, &running, &snapshots);
    }

    let (event_tx, _) = broadcast::channel(EVENT_BROADCAST_BUFFER_SIZE);

    let tcp_broker = gateway_handles.broker.clone();
    let tcp_event_tx = event_tx.clone();
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(port, tcp_broker, tcp_event_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    let pump_broker = gateway_handles.broker.clone();
    let pump_tx = event_tx.clone();
    let broker_pump = tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(BROKER_PUMP_INTERVAL_MS));
        loop {
            interval.tick().await;
            for text in pump_broker.drain_published() {
                info!(message = %text, "gateway published");
                let event = serde_json::json!({ "type": "broker", "text": text });
                // No subscribers is fine.
                let _ = pump_tx.send(event.to_string());
            }
        }
    });

    let status_snapshots = Arc::clone(&snapshots);
    let status_tx = event_tx.clone();
    let status_task = tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(status_interval.max(100)));
        loop {
            interval.tick().await;
            let nodes: Vec<NodeSnapshot> = status_snapshots.lock().values().cloned().collect();
            match serde_json::to_string(&serde_json::json!({ "type": "status", "nodes": nodes })) {
                Ok(line) => {
                    let _ = status_tx.send(line);
                }
                Err(e) => warn!("Failed to encode status: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    running.store(false, Ordering::SeqCst);
    tcp_server.abort();
    broker_pump.abort();
    status_task.abort();
    println!("Sensing network simulator stopped");

    Ok(())
}

fn spawn_gateway(
    profile: &NetworkProfile,
    medium: &SimMedium,
    clock: SystemClock,
    handles: &SimHandles,
    running: &Arc<AtomicBool>,
    snapshots: &SnapshotStore,
) -> Result<(), Box<dyn std::error::Error>> {
    let radio = SimRadio::new(medium.clone(), clock);
    let node = NodeStateMachine::new(
        profile.gateway_config(),
        radio,
        clock,
        handles.gateway_peripherals(HostTimeSource),
    )?;
    info!(node_id = profile.gateway_id, "gateway node started");
    spawn_node(node, running, snapshots);
    Ok(())
}

fn spawn_node<R, C>(mut node: NodeStateMachine<R, C>, running: &Arc<AtomicBool>, snapshots: &SnapshotStore)
where
    R: sensnode::hal::Radio + Send + 'static,
    C: sensnode::hal::MonotonicClock + Send + 'static,
{
    let running = Arc::clone(running);
    let snapshots = Arc::clone(snapshots);
    thread::spawn(move || {
        let node_id = node.context().config.node_id;
        node.run(|node| {
            snapshots.lock().insert(node_id, node.snapshot());
            running.load(Ordering::SeqCst)
        });
        info!(node_id, "node stopped");
    });
}

async fn start_tcp_server(
    port: u16,
    broker: SimBroker,
    event_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("Operator bridge listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New operator connected: {}", addr);
                let client_broker = broker.clone();
                let client_event_rx = event_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_broker, client_event_rx).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("Operator {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    broker: SimBroker,
    mut event_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    let event_writer = Arc::clone(&writer);
    let event_task = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            let mut writer_guard = event_writer.lock().await;
            if let Err(e) = writer_guard.write_all(event.as_bytes()).await {
                warn!("Failed to send event: {}", e);
                break;
            }
            if let Err(e) = writer_guard.write_all(b"\n").await {
                warn!("Failed to send event newline: {}", e);
                break;
            }
        }
    });

    // Every line is an operator command published on the gateway's subscribe topic.
    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let command = line.trim();
                if command.is_empty() {
                    continue;
                }
                info!(command, "operator command");
                broker.inject(command);
                let ack = serde_json::json!({ "type": "queued", "command": command });
                let mut writer_guard = writer.lock().await;
                writer_guard.write_all(ack.to_string().as_bytes()).await?;
                writer_guard.write_all(b"\n").await?;
            }
            Err(e) => {
                error!("Error reading from client: {}", e);
                break;
            }
        }
    }

    event_task.abort();
    Ok(())
}
