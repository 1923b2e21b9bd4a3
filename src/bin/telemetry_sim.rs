//! Fleet Simulator
//!
//! Publishes fleet-manager pose messages for a handful of simulated tuggers
//! to an MQTT broker, so the relay can be exercised without hardware. With
//! `--replay` it republishes a file of captured payloads, one JSON object
//! per line, instead.
//!
//! Usage: cargo run --bin telemetry-sim -- --broker 127.0.0.1:1883 --robots 3 --hz 10

use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

/// Sector-local floor area the simulated paths stay inside
const CENTER_X: f64 = 50_000.0;
const CENTER_Y: f64 = 30_000.0;
const RADIUS_X: f64 = 20_000.0;
const RADIUS_Y: f64 = 12_000.0;

/// Seconds per full loop
const LOOP_PERIOD: f64 = 20.0;

#[derive(Parser)]
#[command(name = "telemetry-sim")]
#[command(about = "Simulated AMR fleet publishing pose telemetry over MQTT")]
struct Cli {
    /// Broker address as host:port
    #[arg(long, default_value = "127.0.0.1:1883")]
    broker: String,

    /// Messages go to <prefix>/<robot>/status
    #[arg(long, default_value = "ati_fm")]
    topic_prefix: String,

    #[arg(long, default_value_t = 3)]
    robots: usize,

    /// Updates per second per robot
    #[arg(long, default_value_t = 10.0)]
    hz: f64,

    /// Stop after this many seconds (runs until Ctrl+C when omitted)
    #[arg(long)]
    duration: Option<u64>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Republish captured payloads line by line instead of simulating
    #[arg(long)]
    replay: Option<PathBuf>,
}

struct Robot {
    name: String,
    battery: f64,
    phase: f64,
}

impl Robot {
    fn new(index: usize) -> Self {
        Self {
            name: format!("tugger-{:02}", index + 1),
            battery: 95.0 - (index as f64 * 4.0) % 30.0,
            phase: index as f64 * 0.6,
        }
    }

    /// Elliptical loop; heading follows the tangent
    fn pose_at(&self, t: f64) -> (f64, f64, f64) {
        let w = 2.0 * std::f64::consts::PI / LOOP_PERIOD;
        let angle = w * t + self.phase;
        let x = CENTER_X + RADIUS_X * angle.sin();
        let y = CENTER_Y + RADIUS_Y * angle.cos();
        let heading = (-RADIUS_Y * angle.sin()).atan2(RADIUS_X * angle.cos());
        (x, y, heading)
    }

    fn message(&self, t: f64, timestamp_ms: i64) -> Value {
        let (x, y, yaw) = self.pose_at(t);
        json!({
            "sherpa_name": self.name,
            "pose": [round2(x), round2(y), 0.0, 0.0, 0.0, yaw],
            "battery_status": round2(self.battery - t / 600.0).max(5.0),
            "mode": "Fleet",
            "timestamp": timestamp_ms,
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn parse_broker(addr: &str) -> anyhow::Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse()?)),
        None => Ok((addr.to_string(), 1883)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (host, port) = parse_broker(&cli.broker)?;

    let client_id = format!("telemetry-sim-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, host.clone(), port);
    options.set_keep_alive(Duration::from_secs(30));
    if let Some(username) = &cli.username {
        options.set_credentials(username.clone(), cli.password.clone().unwrap_or_default());
    }

    let (client, mut eventloop) = AsyncClient::new(options, 1_000);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => println!("Connected to {}:{}", host, port),
                Ok(_) => {}
                Err(e) => {
                    eprintln!("MQTT error: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    if let Some(path) = &cli.replay {
        return replay(&client, &cli.topic_prefix, path).await;
    }

    let robots: Vec<Robot> = (0..cli.robots).map(Robot::new).collect();
    let period = Duration::from_secs_f64(1.0 / cli.hz.max(0.1));

    println!("Fleet Simulator");
    println!("  Broker: {}", cli.broker);
    println!("  Robots: {}", robots.len());
    println!("  Rate:   {} Hz ({:?} per update)", cli.hz, period);
    println!();

    let started = Instant::now();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        let t = started.elapsed().as_secs_f64();
        if cli.duration.is_some_and(|d| t >= d as f64) {
            break;
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        for robot in &robots {
            let topic = format!("{}/{}/status", cli.topic_prefix, robot.name);
            let payload = robot.message(t, now_ms).to_string();
            client
                .publish(topic, QoS::AtLeastOnce, false, payload.into_bytes())
                .await?;
            sent += 1;
        }
        if sent % (robots.len().max(1) as u64 * 50) == 0 {
            println!("  {} messages published", sent);
        }
    }

    let _ = client.disconnect().await;
    println!("Simulation complete: {} messages published", sent);
    Ok(())
}

/// Republish each JSON line; the device name is taken from the payload
async fn replay(client: &AsyncClient, prefix: &str, path: &Path) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut sent = 0;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let value: Value = serde_json::from_str(line)?;
        let device = ["sherpa_name", "device_id", "deviceId", "DeviceId"]
            .iter()
            .find_map(|k| value.get(*k).and_then(Value::as_str))
            .unwrap_or("replay");
        let topic = format!("{}/{}/status", prefix, device);
        client
            .publish(topic, QoS::AtLeastOnce, false, line.as_bytes().to_vec())
            .await?;
        sent += 1;
    }

    // let the event loop flush before disconnecting
    sleep(Duration::from_millis(500)).await;
    let _ = client.disconnect().await;
    println!("Replayed {} message(s) from {:?}", sent, path);
    Ok(())
}
