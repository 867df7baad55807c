//! `cozylife-scan`: sweep a network range for CozyLife devices and print a
//! ready-to-use devices file for the daemon.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use cozylife_local::protocol::PORT;
use cozylife_local::scanner::{self, ScanResult, type_name};

#[derive(Parser)]
#[command(
    name = "cozylife-scan",
    about = "Scan a network range for CozyLife devices (TCP port 5555)"
)]
struct Args {
    /// CIDR block (192.168.1.0/24), dash range
    /// (192.168.1.100-192.168.1.200), or single IP
    target: String,

    /// Concurrent probes
    #[arg(long, default_value_t = 50)]
    concurrency: usize,

    /// Connect timeout per host, in seconds
    #[arg(long, default_value_t = 2)]
    timeout: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let ips = match scanner::parse_targets(&args.target) {
        Ok(ips) => ips,
        Err(e) => {
            eprintln!("Invalid target: {e}");
            std::process::exit(1);
        }
    };

    println!(
        "Scanning {} address(es) for CozyLife devices on port {}...\n",
        ips.len(),
        PORT
    );

    let connect_timeout = Duration::from_secs(args.timeout.max(1));
    let limit = Arc::new(Semaphore::new(args.concurrency.max(1)));
    let mut probes = JoinSet::new();
    for ip in ips {
        let limit = Arc::clone(&limit);
        probes.spawn(async move {
            let _permit = limit.acquire_owned().await.ok()?;
            scanner::probe(ip, PORT, connect_timeout).await
        });
    }

    let mut devices: Vec<ScanResult> = Vec::new();
    while let Some(result) = probes.join_next().await {
        let Ok(Some(device)) = result else { continue };
        println!("✓ Found device at {}", device.ip);
        println!("  Type: {} ({})", type_name(&device.type_code), device.type_code);
        println!("  Serial: {}", device.device_id);
        println!("  Model: {}", device.model);
        println!();
        devices.push(device);
    }
    devices.sort_by_key(|d| d.ip);

    println!("{}", "=".repeat(70));
    println!("Scan complete. Found {} CozyLife device(s).", devices.len());
    println!("{}", "=".repeat(70));

    if devices.is_empty() {
        println!("\nNo devices found. Make sure:");
        println!("  1. Devices are powered on and connected to your network");
        println!("  2. You're scanning the correct IP range");
        println!("  3. Your firewall allows connections to port {PORT}");
        return;
    }

    let entries: Vec<_> = devices
        .iter()
        .enumerate()
        .map(|(i, device)| {
            json!({
                "ip": device.ip.to_string(),
                "alias": format!("{}_{:02}", alias_base(&device.type_code), i + 1),
            })
        })
        .collect();

    println!("\nGenerated devices.json for the cozylife-local daemon:\n");
    match serde_json::to_string_pretty(&entries) {
        Ok(block) => println!("{block}"),
        Err(e) => eprintln!("Failed to render config block: {e}"),
    }
    println!("\nAdjust the aliases to something meaningful and point");
    println!("DEVICES_FILE at the file.");
}

fn alias_base(type_code: &str) -> &'static str {
    match type_code {
        "00" => "Switch",
        "01" => "Light",
        "02" => "EnergyStorage",
        _ => "Device",
    }
}
