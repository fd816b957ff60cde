#![cfg(target_family = "unix")]
//! The same exchange as the leaked-buffer tests, but over memory-file
//! mappings, the way two processes would share the regions.

use std::sync::mpsc;
use std::time::Duration;

use memfile::CreateOptions;
use shm_bus::{Bus, BusConfig, ChannelLayout, EndpointConfig, Region, Wait};
use shm_notify::loopback;

const LAYOUT: ChannelLayout = ChannelLayout::new(448, 8, 8);

fn mapped_views(name: &str) -> (Region, Region) {
    let file = CreateOptions::new()
        .create(name)
        .expect("to create a memory file");
    file.set_len(LAYOUT.total_size as u64).unwrap();
    let a = Region::map(&file).unwrap();
    let b = Region::map(&file).unwrap();
    (a, b)
}

#[test]
fn exchange_over_mapped_regions() {
    let (la, lb) = loopback();
    let (a_tx, b_rx) = mapped_views("bus-ab");
    let (b_tx, a_rx) = mapped_views("bus-ba");
    let a = Bus::new(BusConfig::new(LAYOUT, LAYOUT), a_tx, a_rx, la.clone()).unwrap();
    let b = Bus::new(BusConfig::new(LAYOUT, LAYOUT), b_tx, b_rx, lb.clone()).unwrap();
    la.open(a.link_handler());
    lb.open(b.link_handler());

    let (seen_tx, seen) = mpsc::channel();
    let _sink = b
        .register(EndpointConfig {
            name: "mapped".to_owned(),
            on_receive: Box::new(move |buf| {
                let _ = seen_tx.send(buf.to_vec());
            }),
            on_bound: Box::new(|| {}),
        })
        .unwrap();

    let (tx, bound) = mpsc::channel();
    let source = a
        .register(EndpointConfig {
            name: "mapped".to_owned(),
            on_receive: Box::new(|_| {}),
            on_bound: Box::new(move || {
                let _ = tx.send(());
            }),
        })
        .unwrap();
    bound.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut buf = a.tx_buffer(16, Wait::Forever).unwrap();
    buf[..16].copy_from_slice(b"mapped exchange!");
    source.send_buffer(buf, 16).unwrap();

    assert_eq!(
        seen.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"mapped exchange!"
    );
}
