//! Simulated BCP network over in-memory mock links.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use structopt::StructOpt;

use bcp::link::mock::MockLink;
use bcp::prelude::*;

#[derive(Debug, StructOpt)]
struct Options {
    #[structopt(long, default_value = "5")]
    /// Number of simulated nodes, including the sink (node 0)
    pub nodes: u16,

    #[structopt(long, default_value = "400")]
    /// Number of ticks to run
    pub ticks: u32,

    #[structopt(long, default_value = "10")]
    /// Milliseconds advanced per tick
    pub tick_ms: u32,

    #[structopt(long, default_value = "info")]
    /// Configure log level
    pub log_level: simplelog::LevelFilter,
}

struct LoggingCallbacks {
    addr: NodeAddr,
}

impl Callbacks for LoggingCallbacks {
    fn recv(&mut self, origin: NodeAddr, payload: &[u8]) {
        info!("sink {:?}: delivered {:02x?} from {:?}", self.addr, payload, origin);
    }

    fn sent(&mut self, payload: &[u8]) {
        debug!("node {:?}: {:02x?} acked", self.addr, payload);
    }

    fn dropped(&mut self) {
        debug!("node {:?}: send dropped", self.addr);
    }
}

fn main() -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let opts = Options::from_args();

    let log_cfg = simplelog::ConfigBuilder::new().build();
    let _ = simplelog::SimpleLogger::init(opts.log_level, log_cfg);

    info!("Starting bcp-sim with {} nodes", opts.nodes);

    let config = Config::default();

    let mut connections: std::vec::Vec<Connection<MockLink, BasicWeight>> = (0..opts.nodes)
        .map(|i| {
            let mut c = Connection::new(config.clone(), NodeAddr(i), MockLink::new(), BasicWeight);
            c.set_sink(i == 0, 0);
            c
        })
        .collect();

    for c in connections.iter_mut() {
        c.open(0, 0).map_err(|e| anyhow::anyhow!("open failed: {:?}", e))?;
    }

    let mut rng = rand::thread_rng();
    let mut now_ms = 0u32;

    for tick in 0..opts.ticks {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        // Non-sink nodes occasionally originate a sample.
        for c in connections.iter_mut().skip(1) {
            if tick % 20 == 0 {
                let addr = c.self_addr();
                let mut cb = LoggingCallbacks { addr };
                let sample: u8 = rand::Rng::gen(&mut rng);
                let _ = c.send(&[sample], now_ms, &mut cb, &mut rng);
            }
        }

        // Every node's pending transmissions become visible to every
        // other node's link on the shared medium, before any of them
        // poll their inbox this tick.
        let mut outbound = std::vec::Vec::new();
        for c in connections.iter_mut() {
            while let Some(frame) = c.link_mut().sent.pop() {
                outbound.push(frame);
            }
        }
        for frame in &outbound {
            for c in connections.iter_mut() {
                let _ = c.link_mut().inject(frame.clone());
            }
        }

        for c in connections.iter_mut() {
            let addr = c.self_addr();
            let mut cb = LoggingCallbacks { addr };
            c.poll(now_ms, &mut cb)
                .map_err(|e| anyhow::anyhow!("poll failed: {:?}", e))?;
        }

        now_ms += opts.tick_ms;
    }

    Ok(())
}
