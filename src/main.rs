use anyhow::Context;
use bluedoor_controller::domain::models::{
    AppEvent, ConnectionState, MessageSeverity, Passcode, PeripheralAddress, UnlockOutcome,
};
use bluedoor_controller::domain::settings::SettingsService;
use bluedoor_controller::infrastructure::bluetooth::{BtleplugRadio, DoorLockService, ServiceHandle};
use bluedoor_controller::infrastructure::event_bus::EventBus;
use bluedoor_controller::infrastructure::logging::init_logger;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bluedoor")]
#[command(about = "Bluetooth LE client for a keypad door lock")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log level or filter, e.g. "debug" or "bluedoor_controller=trace"
    #[arg(short, long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected to the default lock and report its state
    Run {
        /// Unlock once connected, then exit
        #[arg(long)]
        unlock: bool,
    },
    /// List nearby locks
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },
    /// Make a lock the default device
    Select {
        /// Bluetooth address, e.g. AA:BB:CC:DD:EE:FF
        address: String,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Set the unlock passcode
    Passcode { digits: String },
    /// Print the current settings
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match cli.config {
        Some(path) => SettingsService::load(path),
        None => SettingsService::new()?,
    };
    let _guard = init_logger(&settings.get().log_settings, cli.log_level.as_deref())?;
    let store = Arc::new(Mutex::new(settings));

    match cli.command {
        Commands::Run { unlock } => run(store, unlock).await,
        Commands::Scan { duration } => scan(store, Duration::from_secs(duration)).await,
        Commands::Select { address, name } => {
            let address: PeripheralAddress = address.parse()?;
            lock(&store).set_default_device(Some(address.clone()), name)?;
            println!("Default device set to {}", address);
            Ok(())
        }
        Commands::Passcode { digits } => {
            let passcode: Passcode = digits.parse()?;
            lock(&store).set_passcode(&passcode)?;
            println!("Passcode updated ({} digits)", passcode.len());
            Ok(())
        }
        Commands::Show => show(&store),
    }
}

fn lock(store: &Mutex<SettingsService>) -> std::sync::MutexGuard<'_, SettingsService> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Running {
    handle: ServiceHandle,
    task: JoinHandle<()>,
    events: broadcast::Receiver<AppEvent>,
}

async fn start(store: Arc<Mutex<SettingsService>>) -> anyhow::Result<Running> {
    let bus = EventBus::new();
    let events = bus.subscribe();
    let (tx, rx) = mpsc::unbounded_channel();
    let radio = BtleplugRadio::new(tx.clone()).await?;
    let (handle, task) = DoorLockService::spawn(Box::new(radio), store, bus, tx, rx);
    Ok(Running {
        handle,
        task,
        events,
    })
}

impl Running {
    async fn stop(self) -> anyhow::Result<()> {
        // Already stopped is fine.
        let _ = self.handle.shutdown();
        self.task.await.context("Lock service task failed")
    }
}

async fn run(store: Arc<Mutex<SettingsService>>, unlock: bool) -> anyhow::Result<()> {
    if lock(&store).get().default_device_address.is_none() {
        warn!("No default device; use `bluedoor scan` and `bluedoor select` first");
    }
    let mut running = start(store).await?;
    let mut unlock_pending = unlock;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            event = running.events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                print_event(&event);
                match event {
                    AppEvent::ConnectionStateChanged(ConnectionState::Connected) if unlock_pending => {
                        unlock_pending = false;
                        if let Err(e) = running.handle.unlock().await {
                            warn!("Unlock failed: {}", e);
                            break;
                        }
                    }
                    AppEvent::UnlockFinished(_) if unlock => break,
                    _ => {}
                }
            }
        }
    }

    running.stop().await
}

async fn scan(store: Arc<Mutex<SettingsService>>, window: Duration) -> anyhow::Result<()> {
    let mut running = start(store).await?;
    running.handle.start_device_scan(Some(window)).await?;
    println!("Scanning for locks ({} seconds)...", window.as_secs());

    loop {
        match running.events.recv().await {
            Ok(AppEvent::DeviceFound(record)) => {
                let rssi = record
                    .signal_strength
                    .map(|r| format!("{} dBm", r))
                    .unwrap_or_else(|| "N/A".to_string());
                println!("  {} ({}) RSSI: {}", record.display_name(), record.address, rssi);
            }
            Ok(AppEvent::ScanningChanged(false)) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Missed {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    running.stop().await
}

fn show(store: &Mutex<SettingsService>) -> anyhow::Result<()> {
    let service = lock(store);
    let mut settings = service.get().clone();
    settings.passcode = settings.passcode().to_string();
    if let Some(path) = service.path() {
        println!("# {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::ConnectionStateChanged(state) => println!("Connection: {:?}", state),
        AppEvent::DoorStateChanged(state) => println!("Door: {:?}", state),
        AppEvent::UnlockFinished(UnlockOutcome::Completed) => println!("Passcode sent"),
        AppEvent::UnlockFinished(UnlockOutcome::Cancelled) => println!("Unlock cancelled"),
        AppEvent::UnlockFinished(UnlockOutcome::Failed(reason)) => {
            println!("Unlock failed: {}", reason)
        }
        AppEvent::LogMessage(message) => match message.severity {
            MessageSeverity::Error | MessageSeverity::Warning => {
                eprintln!("{}", message.message)
            }
            _ => println!("{}", message.message),
        },
        AppEvent::ScanningChanged(_) | AppEvent::DeviceFound(_) => {}
    }
}
