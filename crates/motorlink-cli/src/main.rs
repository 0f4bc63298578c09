use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use motorlink_core::map::StorageClass;
use motorlink_core::prelude::*;
use motorlink_core::protocol::list_ports;

/// Read parameters from a MotorLink controller
#[derive(Parser)]
#[command(name = "motorlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "MOTORLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port, overrides the configuration file
    #[arg(short, long, global = true, env = "MOTORLINK_PORT")]
    port: Option<String>,

    /// Baud rate, overrides the configuration file
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// Talk to the built-in simulated controller instead of a port
    #[arg(long, global = true)]
    demo: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Print the memory map
    Map,

    /// Read parameters or groups once
    Get {
        /// Dotted paths such as `status.pwm` or `meters`; all when omitted
        paths: Vec<String>,

        /// Print the reading as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll parameters until interrupted, printing link events
    Watch {
        /// Dotted paths; defaults to the `status` group
        paths: Vec<String>,

        /// Poll period in milliseconds
        #[arg(short, long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "motorlink_core=debug,motorlink=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<DriverConfig> {
    let mut config = match &cli.config {
        Some(path) => DriverConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DriverConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.serial.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = baud;
    }
    if cli.demo {
        config.serial.port = "demo".to_string();
    } else if config.serial.port.is_empty() {
        bail!("no serial port given; use --port, --config or --demo");
    }
    Ok(config)
}

async fn connect(cli: &Cli) -> Result<MotorController> {
    let config = load_config(cli)?;
    let registry = default_map().context("building memory map")?;
    let port = config.serial.port.clone();

    let mut manager = ControllerManager::new(registry, config.clone());
    let opened = if cli.demo {
        let demo = DemoController::new().with_live_values();
        manager.add_transport(demo, config.serial).await
    } else {
        manager.add_port_with(config.serial).await
    };
    let controller = opened.with_context(|| format!("opening {}", port))?;
    info!(port = %port, "port open");
    Ok(controller)
}

fn request_for(registry: &Registry, paths: &[String]) -> Result<ParamRequest> {
    let request = if paths.is_empty() {
        registry.resolve("")?
    } else {
        registry.select(paths.iter().map(String::as_str))?
    };
    Ok(request)
}

/// Print one line per value, with units where the path names a known parameter
fn print_reading(registry: &Registry, prefix: &str, reading: &Reading) {
    match reading {
        Reading::Value(value) => {
            let units = registry
                .lookup(prefix)
                .map(|d| d.units().to_string())
                .unwrap_or_default();
            if units.is_empty() || matches!(value, Value::Percent(_)) {
                println!("{:<32} {}", prefix, value);
            } else {
                println!("{:<32} {} {}", prefix, value, units);
            }
        }
        Reading::Bundle(entries) => {
            for (name, entry) in entries {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}.{}", prefix, name)
                };
                print_reading(registry, &path, entry);
            }
        }
    }
}

fn list_serial_ports() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }
    for port in ports {
        match port.usb {
            Some(usb) => println!(
                "{:<20} {:04x}:{:04x} {}",
                port.name,
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            None => println!("{}", port.name),
        }
    }
}

fn print_map() -> Result<()> {
    let registry = default_map()?;
    for d in registry.iter() {
        let storage = match d.storage() {
            StorageClass::NonVolatile => "eeprom",
            StorageClass::RamLow | StorageClass::RamHigh => "ram",
        };
        let addresses: Vec<String> = d.addresses().iter().map(|a| format!("{:#05x}", a)).collect();
        println!(
            "{:<32} {:<20} {:<6} {:<14} {:?}{}",
            d.key(),
            d.name(),
            storage,
            addresses.join(","),
            d.scale(),
            if d.is_writable() { " (rw)" } else { "" }
        );
    }
    Ok(())
}

async fn get(cli: &Cli, paths: &[String], json: bool) -> Result<()> {
    let controller = connect(cli).await?;
    let registry = controller.registry().clone();
    let request = request_for(&registry, paths)?;

    let reading = controller.get(request).await.context("reading controller")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reading)?);
    } else {
        print_reading(&registry, "", &reading);
    }
    controller.shutdown().await;
    Ok(())
}

async fn watch(cli: &Cli, paths: &[String], interval_ms: u64) -> Result<()> {
    let controller = connect(cli).await?;
    let registry = controller.registry().clone();
    let paths = if paths.is_empty() {
        vec!["status".to_string()]
    } else {
        paths.to_vec()
    };
    let request = request_for(&registry, &paths)?;

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DriverEvent::Sending(_) | DriverEvent::Receiving(_) => {}
                DriverEvent::Error(message) => warn!("port error: {}", message),
                other => println!("-- {:?}", other),
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match controller.get(request.clone()).await {
                    Ok(reading) => println!("{}", serde_json::to_string(&reading)?),
                    Err(e) => warn!("read failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let counters = controller.counters().await?;
    println!("{}", serde_json::to_string_pretty(&counters)?);
    controller.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Ports => list_serial_ports(),
        Commands::Map => print_map()?,
        Commands::Get { paths, json } => get(&cli, paths, *json).await?,
        Commands::Watch { paths, interval_ms } => watch(&cli, paths, *interval_ms).await?,
    }
    Ok(())
}
