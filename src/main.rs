// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use std::process::ExitCode;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use respshard::config::ProxyConfig;
use respshard::worker;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: respshard <config-file>");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        },
    };

    let config = match ProxyConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from '{}': {}", config_path, e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        },
    };

    tracing::info!(backends = config.backends.len(), workers = config.num_workers, "starting up");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut signals = match Signals::new([SIGTERM, SIGINT]) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to install signal handlers: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        },
    };
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let handles = match worker::spawn_workers(config, shutdown_rx) {
        Ok(handles) => handles,
        Err(e) => {
            eprintln!("failed to start workers: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        },
    };

    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("a worker thread panicked");
        }
    }

    tracing::info!("shutdown complete");
    ExitCode::from(EXIT_OK)
}
