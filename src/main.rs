use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use triomphe::Arc;

use netfq_rs::hw::QueueId;
use netfq_rs::pool::{PoolId, PoolTable};
use netfq_rs::queue::Interface;
use netfq_rs::sim::{SimNic, SimPoolSpec};

/// Command line options.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Packets to push through the loopback wire.
    #[clap(short, long, default_value_t = 1_000_000)]
    packets: u64,

    /// Burst size per transmit/receive call.
    #[clap(short, long, default_value_t = 32)]
    burst: usize,

    /// UDP payload bytes per packet.
    #[clap(short = 's', long, default_value_t = 64)]
    payload: usize,

    /// Buffers in the interface pool.
    #[clap(long, default_value_t = 1024)]
    pool_buffers: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("Loopback forward started with parameters:");
    println!("* packets: {}", args.packets);
    println!("* burst: {}", args.burst);
    println!("* payload: {} bytes", args.payload);
    println!("* pool buffers: {}", args.pool_buffers);

    let mut nic = SimNic::new(
        &[SimPoolSpec {
            id: PoolId(1),
            buf_size: 2048,
            count: args.pool_buffers,
        }],
        2,
        256,
    );
    nic.wire_loopback(QueueId(0), QueueId(1), PoolId(1));
    let nic = Arc::new(nic);

    let mut pools = PoolTable::new();
    pools.register(*nic.pool_info(PoolId(1)));
    let iface = Interface::new(nic.clone(), pools, PoolId(1), 0);
    let portal = iface.portal()?;

    let mut rng = rand::rng();
    let payload: Vec<u8> = (0..args.payload).map(|_| rng.random()).collect();
    let builder = etherparse::PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(9000, 9001);
    let mut frame = Vec::new();
    builder.write(&mut frame, &payload)?;

    let forwarded = std::sync::Arc::new(AtomicU64::new(0));
    let term = std::sync::Arc::new(AtomicBool::new(false));
    let stats_handle = {
        let forwarded = forwarded.clone();
        let term = term.clone();
        thread::spawn(move || {
            let mut old_total = 0;
            while !term.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(1));
                let count = forwarded.load(Ordering::SeqCst);
                println!("pkt/sec: {}", count.saturating_sub(old_total));
                old_total = count;
            }
        })
    };

    let mut sent_total = 0u64;
    let mut received_total = 0u64;
    let mut rx = Vec::with_capacity(args.burst);
    while sent_total < args.packets {
        let want = args.burst.min((args.packets - sent_total) as usize);
        let mut batch = Vec::with_capacity(want);
        for _ in 0..want {
            let Some(mut pkt) = iface.alloc() else { break };
            pkt.append(&frame)?;
            batch.push(pkt);
        }
        sent_total += iface.transmit(&portal, QueueId(0), &mut batch) as u64;
        batch.clear();

        let got = iface.receive(&portal, QueueId(1), &mut rx, args.burst);
        received_total += got as u64;
        forwarded.fetch_add(got as u64, Ordering::SeqCst);
        rx.clear();
    }
    // Drain whatever is still sitting on the receive ring.
    while iface.receive(&portal, QueueId(1), &mut rx, args.burst) > 0 {
        received_total += rx.len() as u64;
        forwarded.fetch_add(rx.len() as u64, Ordering::SeqCst);
        rx.clear();
    }

    term.store(true, Ordering::SeqCst);
    stats_handle.join().expect("stats thread panicked");

    println!(
        "done: {} sent, {} received, {} dropped on the wire",
        sent_total,
        received_total,
        nic.wire_drops()
    );
    Ok(())
}
