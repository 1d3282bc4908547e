use criterion::{Criterion, criterion_group, criterion_main};

use midds_core::channel::{ChannelMode, SignalProtocol};
use midds_core::hardware::sim::SimBoard;
use midds_core::instrument::Midds;
use midds_core::protocol::{self, DecodeError, Frame};

fn process_edge_stream() {
    let sim = SimBoard::new();
    let mut midds = Midds::new(sim.board()).unwrap();

    midds.on_receive(&protocol::encode(&Frame::Connect));
    midds.poll();
    midds.on_receive(&protocol::encode(&Frame::ChannelSettings {
        channel: 3,
        mode: ChannelMode::MonitorBoth,
        protocol: SignalProtocol::ThreeVoltThree,
    }));
    midds.poll();
    sim.take_tx();

    let mut outbound = Vec::new();
    let mut level = false;
    for burst in 0..200u32 {
        for _ in 0..50 {
            if sim.advance_counter(1700) {
                midds.on_update_interrupt();
            }
            level = !level;
            if sim.edge(3, level) {
                midds.on_capture_interrupt(3);
            }
        }
        sim.advance_ms(burst % 2 + 100);
        midds.poll();
        outbound.extend_from_slice(&sim.take_tx());
    }

    let mut total_stamps = 0u64;
    let mut rest = &outbound[..];
    while !rest.is_empty() {
        match protocol::decode(rest) {
            Ok((Frame::Monitor { stamps, .. }, consumed)) => {
                total_stamps += stamps.len() as u64;
                rest = &rest[consumed..];
            }
            Ok((_, consumed)) => rest = &rest[consumed..],
            Err(DecodeError::NotEnoughData) => break,
            Err(_) => rest = &rest[1..],
        }
    }
    println!("{total_stamps}");
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("frame_stream", |b| b.iter(process_edge_stream));
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = criterion_benchmark
}
criterion_main!(benches);
