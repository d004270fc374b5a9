//! Round-trip latency of a synchronous RPC against a polling consumer, the
//! hot control-plane path of the engine. Run with `cargo bench`.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use fastpath::rpc::{RpcReq, RpcRet, RpcRing};

const WARMUP: usize = 1_000;
const ITERS: usize = 100_000;

fn main() {
    let ring = Arc::new(RpcRing::new(512));

    let consumer = {
        let ring = ring.clone();
        thread::spawn(move || loop {
            let Some(msg) = ring.pop() else {
                std::hint::spin_loop();
                continue;
            };
            let stop = matches!(msg.req, RpcReq::Close { .. });
            if let Some(done) = msg.done {
                done.complete(Ok(RpcRet::Int(0)));
            }
            if stop {
                break;
            }
        })
    };

    for _ in 0..WARMUP {
        ring.call(RpcReq::ArpLookup { ip: 0 }).unwrap();
    }

    let mut lat_ns: Vec<u64> = Vec::with_capacity(ITERS);
    for _ in 0..ITERS {
        let t0 = Instant::now();
        ring.call(RpcReq::ArpLookup { ip: 0 }).unwrap();
        lat_ns.push(t0.elapsed().as_nanos() as u64);
    }

    ring.call(RpcReq::Close { fd: -1 }).unwrap();
    consumer.join().unwrap();

    lat_ns.sort_unstable();
    let pct = |p: f64| lat_ns[((lat_ns.len() as f64 * p) as usize).min(lat_ns.len() - 1)];
    let mean: u64 = lat_ns.iter().sum::<u64>() / lat_ns.len() as u64;
    println!("rpc call->return latency over {} iters (ns)", ITERS);
    println!(
        "p1 {:>7}  p50 {:>7}  p99 {:>7}  max {:>7}  mean {:>7}",
        pct(0.01),
        pct(0.50),
        pct(0.99),
        lat_ns[lat_ns.len() - 1],
        mean
    );
}
