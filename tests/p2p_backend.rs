//! End-to-end exercise of the point-to-point backend (spec.md §4.G) over
//! real loopback TCP: two processes rendezvous, each wraps a `Container`
//! around its own `P2pBackend`, and a repartitioning from a single owner to
//! a two-way split moves data across the wire.

use std::net::TcpListener;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use partgrid::backend::p2p::{run_home, run_peer, P2pBackend};
use partgrid::container::Container;
use partgrid::index::{Slice, Space};
use partgrid::partitioning::{AccessIntent, Assignment, Partitioning};
use partgrid::types::Type;
use partgrid::Group;

fn ephemeral_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[test]
fn repartition_moves_data_between_two_processes() {
    let home_port = ephemeral_port();
    let my_port0 = ephemeral_port();
    let my_port1 = ephemeral_port();

    let space = Space::new(&[(0, 8)]).unwrap();
    let ty = Type::f64();

    let rank0 = thread::spawn(move || {
        let group = run_home("127.0.0.1", home_port, 2, 0).unwrap();
        let backend = Box::new(P2pBackend::new(0, "127.0.0.1", my_port0).unwrap());
        let mut container = Container::new(space.clone(), ty.clone(), Rc::new(group), backend).unwrap();

        let whole = Slice::new(&[(0, 8)]).unwrap();
        let initial = Partitioning::new(
            &space,
            vec![Assignment { rank: 0, slice: whole, intent: AccessIntent::Write }],
        )
        .unwrap();
        container.set_partitioning(initial).unwrap();

        {
            let buffer = container.mapping_mut().unwrap().buffer_mut().unwrap();
            for (i, chunk) in buffer.chunks_mut(8).enumerate() {
                chunk.copy_from_slice(&(i as f64).to_ne_bytes());
            }
        }

        let left = Slice::new(&[(0, 4)]).unwrap();
        let right = Slice::new(&[(4, 8)]).unwrap();
        let split = Partitioning::new(
            &space,
            vec![
                Assignment { rank: 0, slice: left, intent: AccessIntent::ReadWrite },
                Assignment { rank: 1, slice: right, intent: AccessIntent::ReadWrite },
            ],
        )
        .unwrap();
        container.set_partitioning(split).unwrap();

        let buffer = container.mapping().unwrap().buffer().unwrap().to_vec();
        buffer
    });

    // Give the home listener a moment to bind before the peer dials.
    thread::sleep(Duration::from_millis(50));

    let space1 = Space::new(&[(0, 8)]).unwrap();
    let ty1 = Type::f64();
    let rank1 = thread::spawn(move || {
        let group = run_peer("127.0.0.1", home_port, "127.0.0.1", my_port1, 2, 1).unwrap();
        let backend = Box::new(P2pBackend::new(1, "127.0.0.1", my_port1).unwrap());
        let mut container = Container::new(space1.clone(), ty1.clone(), Rc::new(group), backend).unwrap();

        let initial = Partitioning::new(
            &space1,
            vec![Assignment { rank: 0, slice: space1.full_slice(), intent: AccessIntent::Write }],
        )
        .unwrap();
        container.set_partitioning(initial).unwrap();

        let left = Slice::new(&[(0, 4)]).unwrap();
        let right = Slice::new(&[(4, 8)]).unwrap();
        let split = Partitioning::new(
            &space1,
            vec![
                Assignment { rank: 0, slice: left, intent: AccessIntent::ReadWrite },
                Assignment { rank: 1, slice: right, intent: AccessIntent::ReadWrite },
            ],
        )
        .unwrap();
        container.set_partitioning(split).unwrap();

        container.mapping().unwrap().buffer().unwrap().to_vec()
    });

    let rank0_buffer = rank0.join().unwrap();
    let rank1_buffer = rank1.join().unwrap();

    let expected_left: Vec<f64> = (0..4).map(|i| i as f64).collect();
    let expected_right: Vec<f64> = (4..8).map(|i| i as f64).collect();

    let as_f64 = |bytes: &[u8]| -> Vec<f64> {
        bytes.chunks(8).map(|c| f64::from_ne_bytes(c.try_into().unwrap())).collect()
    };

    assert_eq!(as_f64(&rank0_buffer), expected_left);
    assert_eq!(as_f64(&rank1_buffer), expected_right);
}
