// Copyright 2024 The caphost Authors.
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

//! The host daemon binary: reads its plugin registry, wires a
//! [`caphost_core::Host`] to stdin/stdout as the upstream relay
//! connection, and drives it until the relay closes.

mod config;

use std::io;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use caphost_core::{Host, PeerInvokeStrategy, RefusingStrategy, RelayForwardingStrategy, RoutingEvent};
use caphost_protocol::{spawn_reader_thread, FramedReader, FramedWriter, WriterHandle};

/// How often a `Tick` event is pushed onto the dispatcher's queue to
/// drive heartbeat bookkeeping.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[clap(name = "caphostd", about = "Host daemon for the capability plugin runtime")]
struct Args {
    /// Path to the plugin registry TOML file.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,

    /// Suppress all logging below `error`.
    #[clap(short, long)]
    quiet: bool,

    /// Allow plugins to invoke each other's capabilities by relaying
    /// their peer-invoke requests upstream. Off by default per the
    /// refusing strategy.
    #[clap(long)]
    allow_peer_invoke: bool,

    /// Dump collected `caphost-trace` samples to this path (Chrome trace
    /// event format) on shutdown.
    #[clap(long)]
    trace_out: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    init_logging(&args);

    if args.trace_out.is_some() {
        caphost_trace::enable_tracing();
    }

    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let cfg = config::load(&config_path);

    let strategy: Box<dyn PeerInvokeStrategy> =
        if args.allow_peer_invoke { Box::new(RelayForwardingStrategy) } else { Box::new(RefusingStrategy) };

    let offer = cfg.limits;
    let relay_writer = WriterHandle::new(FramedWriter::new(io::stdout(), offer.max_chunk));
    let (host, events_rx, events_tx) = Host::new(relay_writer, offer);
    let mut host = host.with_peer_invoke_strategy(strategy);

    log::info!("caphostd starting from {:?}, {} plugin(s) registered", config_path, cfg.catalog.iter().count());
    host.register_catalog(&cfg.catalog);

    let relay_reader = FramedReader::new(io::stdin(), offer.max_frame);
    let relay_tx = events_tx.clone();
    let relay_tx_close = events_tx.clone();
    spawn_reader_thread(
        relay_reader,
        move |frame| {
            let _ = relay_tx.send(RoutingEvent::Relay(frame));
        },
        move |_| {
            let _ = relay_tx_close.send(RoutingEvent::RelayClosed);
        },
    );

    spawn_tick_thread(events_tx);

    host.run(events_rx);
    log::info!("caphostd exiting");

    if let Some(path) = args.trace_out {
        dump_trace(&path);
    }
}

fn spawn_tick_thread(events_tx: mpsc::Sender<RoutingEvent>) {
    thread::spawn(move || loop {
        thread::sleep(TICK_INTERVAL);
        if events_tx.send(RoutingEvent::Tick).is_err() {
            return;
        }
    });
}

fn dump_trace(path: &std::path::Path) {
    caphost_trace::disable_tracing();
    let samples = caphost_trace::samples_cloned_sorted();
    match std::fs::File::create(path) {
        Ok(file) => {
            if let Err(e) = caphost_trace_dump::chrome_trace::serialize(samples.iter(), caphost_trace_dump::chrome_trace::OutputFormat::JsonArray, file) {
                log::error!("failed writing trace dump to {:?}: {:?}", path, e);
            }
        }
        Err(e) => log::error!("failed creating trace dump file {:?}: {}", path, e),
    }
}

fn init_logging(args: &Args) {
    let level = if args.quiet {
        log::LevelFilter::Error
    } else {
        match args.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    let level = std::env::var("CAPHOST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(level);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(io::stderr());

    if let Some(data_dir) = dirs::data_dir() {
        let log_dir = data_dir.join("caphost");
        if std::fs::create_dir_all(&log_dir).is_ok() {
            if let Ok(file) = fern::log_file(log_dir.join("caphostd.log")) {
                dispatch = dispatch.chain(file);
            }
        }
    }

    if dispatch.apply().is_err() {
        eprintln!("logger already initialized");
    }
}
