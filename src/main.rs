// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Latchkey command line client.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use latchkey::bluetooth::ble_constants::KEY_COUNT;
use latchkey::bluetooth::simulated::{self, SimulatedLock, SimulatedTransport};
use latchkey::bluetooth::{DiscoveredLock, Transport};
use latchkey::config::Config;
use latchkey::crypto::Checksum;
use latchkey::events::{
    event_channel, Event, EventLoop, EventReceiver, EventSender, Outcome, UiEvent,
};
use latchkey::protocol::{ProtocolMachine, StateStore};
use latchkey::storage::KeyStore;
use latchkey::ui::console;

#[derive(Parser)]
#[command(name = "latchkey")]
#[command(version, about = "Client for a Bluetooth LE door lock")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Talk to an in-process simulated lock instead of a real one
    #[arg(long, global = true)]
    simulate: bool,

    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for locks
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Unlock the door with the active key
    Unlock,
    /// Exchange a new key with the lock
    Exchange {
        /// Key slot on the lock
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..i64::from(KEY_COUNT)))]
        key: u8,
    },
    /// Show the active key and the selected lock
    Status,
    /// Forget the active key and/or the selected lock
    Forget {
        /// Forget only the key
        #[arg(long)]
        key: bool,
        /// Forget only the lock
        #[arg(long)]
        lock: bool,
    },
}

/// Where the user picks a lock from when none is known.
enum Scanner {
    Simulated,
    #[cfg(feature = "bluez")]
    Bluez {
        adapter: Option<String>,
        timeout: Duration,
    },
}

impl Scanner {
    async fn scan(&self) -> Result<Vec<DiscoveredLock>> {
        match self {
            Scanner::Simulated => Ok(simulated::scan()),
            #[cfg(feature = "bluez")]
            Scanner::Bluez { adapter, timeout } => {
                latchkey::bluetooth::gatt_client::scan(adapter.as_deref(), *timeout).await
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    let ok = match cli.command {
        Command::Scan { timeout } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.scan_timeout());
            scan(&config, cli.simulate, timeout).await?
        }
        Command::Unlock => run_task(&config, cli.simulate, Event::StartUnlock).await?,
        Command::Exchange { key } => {
            run_task(&config, cli.simulate, Event::StartKeyExchange(key)).await?
        }
        Command::Status => status(&config, cli.simulate)?,
        Command::Forget { key, lock } => {
            let both = !key && !lock;
            forget(&config, cli.simulate, key || both, lock || both)?
        }
    };

    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_logging(config: &Config, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Keys used against the simulated lock are kept apart from real ones.
fn data_dir(config: &Config, simulate: bool) -> Result<PathBuf> {
    let dir = config.data_dir()?;
    Ok(if simulate { dir.join("simulated") } else { dir })
}

fn open_store(config: &Config, simulate: bool) -> Result<KeyStore> {
    KeyStore::new(&data_dir(config, simulate)?)
}

async fn scan(config: &Config, simulate: bool, timeout: Duration) -> Result<bool> {
    let locks = scanner(config, simulate, timeout)?.scan().await?;
    if locks.is_empty() {
        println!("No locks found");
    } else {
        println!("Found {} lock(s):", locks.len());
        for lock in &locks {
            println!("  {}", lock);
        }
    }
    Ok(true)
}

fn scanner(config: &Config, simulate: bool, timeout: Duration) -> Result<Scanner> {
    if simulate {
        return Ok(Scanner::Simulated);
    }

    #[cfg(feature = "bluez")]
    {
        Ok(Scanner::Bluez {
            adapter: config.adapter.clone(),
            timeout,
        })
    }
    #[cfg(not(feature = "bluez"))]
    {
        let _ = (config, timeout);
        anyhow::bail!("Built without BlueZ support, use --simulate")
    }
}

async fn run_task(config: &Config, simulate: bool, start: Event) -> Result<bool> {
    let store = open_store(config, simulate)?;
    let scanner = scanner(config, simulate, config.scan_timeout())?;
    let (events_tx, events_rx) = event_channel();

    if simulate {
        let mut lock = SimulatedLock::new(config.auto_confirm_simulated);
        if let Some(key) = store.key() {
            lock.install_key(key.key_number, key.secret)?;
        }
        let transport = SimulatedTransport::new(Arc::new(Mutex::new(lock)), events_tx.clone());
        return drive(transport, Box::new(store), events_tx, events_rx, start, scanner).await;
    }

    #[cfg(feature = "bluez")]
    {
        let transport = latchkey::bluetooth::gatt_client::GattClient::new(
            events_tx.clone(),
            config.adapter.as_deref(),
        )
        .await?;
        drive(transport, Box::new(store), events_tx, events_rx, start, scanner).await
    }
    #[cfg(not(feature = "bluez"))]
    {
        let _ = (events_rx, start);
        anyhow::bail!("Built without BlueZ support, use --simulate")
    }
}

/// Run one task to completion, answering the machine's questions on the
/// terminal.
async fn drive<T: Transport + 'static>(
    transport: T,
    store: Box<dyn StateStore>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    start: Event,
    scanner: Scanner,
) -> Result<bool> {
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let machine = ProtocolMachine::new(transport, store, ui_tx, events_tx.clone());
    let event_loop = tokio::spawn(EventLoop::new(machine, events_rx).run_until(async {
        let _ = stop_rx.await;
    }));

    events_tx.send(start).context("Event loop stopped")?;
    let answered = answer(&mut ui_rx, &events_tx, &scanner).await;
    if answered.is_err() {
        // Abort a task still holding the link.
        let _ = events_tx.send(Event::Failure);
    }

    let _ = stop_tx.send(());
    event_loop
        .await
        .context("Event loop failed")?
        .shutdown()
        .await;

    let ok = answered?;
    debug!("Task done (ok: {})", ok);
    Ok(ok)
}

/// Print notifications and answer prompts until the task is over.
async fn answer(
    ui_rx: &mut mpsc::UnboundedReceiver<UiEvent>,
    events_tx: &EventSender,
    scanner: &Scanner,
) -> Result<bool> {
    while let Some(event) = ui_rx.recv().await {
        println!("{}", console::describe(&event));

        match event {
            UiEvent::SelectDevice => {
                let locks = scanner.scan().await?;
                let chosen = prompt(move |input, output| {
                    console::choose_lock(input, output, &locks)
                })
                .await?;
                let next = match chosen {
                    Some(lock) => Event::DeviceSelected(lock.address),
                    None => Event::Failure,
                };
                events_tx.send(next).context("Event loop stopped")?;
            }
            UiEvent::TaskFinished {
                result: Ok(Outcome::KeyExchanged { checksum, .. }),
                ..
            } => {
                let matches = confirm_checksum(checksum).await?;
                let answer = if matches {
                    Event::KeyConfirmed
                } else {
                    Event::KeyDenied
                };
                events_tx.send(answer).context("Event loop stopped")?;
            }
            UiEvent::TaskFinished { result, .. } => return Ok(result.is_ok()),
            UiEvent::KeyCommitted { .. } => return Ok(true),
            UiEvent::KeyDiscarded | UiEvent::Rejected(_) => return Ok(false),
            UiEvent::TaskStarted(_) | UiEvent::DisplayChecksum(_) => {}
        }
    }
    Ok(false)
}

async fn confirm_checksum(checksum: Checksum) -> Result<bool> {
    let question = format!(
        "Does the lock show the checksum {}?",
        console::group(&checksum)
    );
    prompt(move |input, output| console::ask_yes_no(input, output, &question)).await
}

/// Ask on the terminal without blocking the runtime.
async fn prompt<F, R>(ask: F) -> Result<R>
where
    F: FnOnce(&mut io::StdinLock<'static>, &mut io::Stdout) -> io::Result<R> + Send + 'static,
    R: Send + 'static,
{
    let answer = tokio::task::spawn_blocking(move || {
        let mut input = io::stdin().lock();
        let mut output = io::stdout();
        ask(&mut input, &mut output)
    })
    .await
    .context("Prompt task failed")?
    .context("Failed to read answer")?;
    Ok(answer)
}

fn status(config: &Config, simulate: bool) -> Result<bool> {
    let store = open_store(config, simulate)?;
    print_status(&store, store.path());
    Ok(true)
}

fn print_status(store: &KeyStore, path: &Path) {
    match store.key() {
        Some(key) => {
            let confirmed = store
                .key_confirmed()
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!(
                "Key:  {} (checksum {}, confirmed {})",
                key.key_number,
                console::group(&Checksum::of_secret(&key.secret)),
                confirmed
            );
        }
        None => println!("Key:  none"),
    }
    println!(
        "Lock: {}",
        store.endpoint().unwrap_or_else(|| "none".to_string())
    );
    println!(
        "File: {} (saved {})",
        path.display(),
        store.updated().format("%Y-%m-%d %H:%M")
    );
}

fn forget(config: &Config, simulate: bool, key: bool, lock: bool) -> Result<bool> {
    let mut store = open_store(config, simulate)?;
    if key {
        store.clear_key()?;
        info!("Key forgotten");
    }
    if lock {
        store.clear_endpoint()?;
        info!("Lock forgotten");
    }
    print_status(&store, store.path());
    Ok(true)
}
