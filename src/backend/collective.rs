//! `CollectiveBackend`, the double-sweep backend of spec.md §4.F, and
//! `InProcessCollective`, the in-process `Collective` instance it runs
//! over by default.
//!
//! Grounded on `trace/mod.rs`'s pattern of a generic type parameterized
//! over its own small capability trait (`Trace<Key, Val, Time, R>` over
//! `Batch`): `CollectiveBackend<C: Collective>` is the same shape, generic
//! over the transport instead of over a batch representation.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Barrier, Mutex};

use crate::action::{Action, TransitionPlan};
use crate::backend::{Backend, Collective, TransferId};
use crate::error::PartgridError;
use crate::group::Group;
use crate::index::Slice;
use crate::mapping::Mapping;
use crate::partitioning::AccessIntent;
use crate::reduce::{Primitive, ReduceOp};
use crate::transition::Transition;

/// An `n`-member, in-process `Collective`: one instance per simulated
/// rank, point-to-point channels wired pairwise with `std::sync::mpsc`, an
/// `all_reduce_sum` built from a shared accumulator behind a `Barrier`.
/// Used by tests and as the default transport `CollectiveBackend` wires up
/// when no external one is supplied.
pub struct InProcessCollective {
    index: usize,
    peers: usize,
    senders: Vec<Option<Mutex<mpsc::Sender<Vec<u8>>>>>,
    receivers: Vec<Option<Mutex<mpsc::Receiver<Vec<u8>>>>>,
    reduce_state: Arc<ReduceState>,
}

struct ReduceState {
    barrier: Barrier,
    accumulator: Mutex<Vec<u8>>,
}

impl InProcessCollective {
    /// Builds `n` wired-together instances, one per rank, ready to be
    /// handed one each to `n` threads (or used directly in single-threaded
    /// tests that only ever address a subset of them).
    pub fn build_group(n: usize) -> Vec<InProcessCollective> {
        let mut senders: Vec<Vec<Option<Mutex<mpsc::Sender<Vec<u8>>>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<Mutex<mpsc::Receiver<Vec<u8>>>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();

        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let (tx, rx) = mpsc::channel();
                senders[i][j] = Some(Mutex::new(tx));
                receivers[j][i] = Some(Mutex::new(rx));
            }
        }

        let reduce_state = Arc::new(ReduceState {
            barrier: Barrier::new(n.max(1)),
            accumulator: Mutex::new(Vec::new()),
        });

        (0..n)
            .map(|i| InProcessCollective {
                index: i,
                peers: n,
                senders: std::mem::take(&mut senders[i]),
                receivers: std::mem::take(&mut receivers[i]),
                reduce_state: reduce_state.clone(),
            })
            .collect()
    }
}

impl Collective for InProcessCollective {
    fn index(&self) -> usize { self.index }
    fn peers(&self) -> usize { self.peers }

    fn send(&self, peer: usize, bytes: &[u8]) -> Result<(), PartgridError> {
        let sender = self.senders.get(peer).and_then(|s| s.as_ref()).ok_or_else(|| {
            PartgridError::config(format!("no channel from rank {} to rank {peer}", self.index))
        })?;
        sender
            .lock()
            .unwrap()
            .send(bytes.to_vec())
            .map_err(|_| PartgridError::protocol(format!("peer {peer} channel closed")))
    }

    fn recv(&self, peer: usize) -> Result<Vec<u8>, PartgridError> {
        let receiver = self.receivers.get(peer).and_then(|r| r.as_ref()).ok_or_else(|| {
            PartgridError::config(format!("no channel from rank {peer} to rank {}", self.index))
        })?;
        receiver
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| PartgridError::protocol(format!("peer {peer} channel closed")))
    }

    fn all_reduce_sum(&self, buffer: &mut [u8], primitive: Primitive) -> Result<(), PartgridError> {
        let count = buffer.len() / primitive.size();
        {
            let mut acc = self.reduce_state.accumulator.lock().unwrap();
            if acc.len() != buffer.len() {
                *acc = primitive.identity(ReduceOp::Sum).repeat(count);
            }
            primitive.reduce(ReduceOp::Sum, &mut acc, buffer, count);
        }
        self.reduce_state.barrier.wait();
        {
            let acc = self.reduce_state.accumulator.lock().unwrap();
            buffer.copy_from_slice(&acc);
        }
        self.reduce_state.barrier.wait();
        if self.index == 0 {
            self.reduce_state.accumulator.lock().unwrap().clear();
        }
        self.reduce_state.barrier.wait();
        Ok(())
    }
}

struct PendingTransfer {
    transition: Transition,
    plan: TransitionPlan,
}

/// The backend of spec.md §4.F. Blocking synchronous, per §5: `exec` does
/// all of it — local `Copy`/`Init`, the pairwise double-sweep exchange of
/// every `Send`/`Recv` action, and every `Reduce` region's combine — so
/// `wait`/`probe` reduce to bookkeeping once `exec` returns.
///
/// The pairwise exchange schedule is the double-sweep of spec.md §4.F:
/// `2N` phases, where in phase `p < N` a rank recvs from peer `p` first if
/// `p` has the lower rank (then sends), and sends first otherwise (then
/// recvs); phases `p >= N` flip that polarity. Every rank computes the
/// same phase-to-peer mapping independently, so no coordination message is
/// needed to agree on it — of any communicating pair, exactly one side
/// always recvs before it sends, which is what makes `Collective::send`'s
/// blocking semantics safe to rely on here.
pub struct CollectiveBackend<C: Collective> {
    collective: C,
    rank: usize,
    pending: HashMap<TransferId, PendingTransfer>,
    next_id: TransferId,
}

impl<C: Collective> CollectiveBackend<C> {
    /// Wraps `collective`, whose own `index()` becomes this backend's
    /// rank.
    pub fn new(collective: C) -> Self {
        let rank = collective.index();
        CollectiveBackend { collective, rank, pending: HashMap::new(), next_id: 0 }
    }
}

impl<C: Collective> Backend for CollectiveBackend<C> {
    fn finalize(&mut self, group: &Group) -> Result<(), PartgridError> {
        if group.size() != self.collective.peers() {
            return Err(PartgridError::config(format!(
                "group has {} members, collective transport has {}",
                group.size(),
                self.collective.peers()
            )));
        }
        Ok(())
    }

    fn update_group(&mut self, group: &Group) -> Result<(), PartgridError> {
        self.finalize(group)
    }

    fn prepare(&mut self, plan: Transition) -> Result<TransferId, PartgridError> {
        let id = self.next_id;
        self.next_id += 1;
        let rank_plan = TransitionPlan::for_rank(&plan, self.rank);
        self.pending.insert(id, PendingTransfer { transition: plan, plan: rank_plan });
        Ok(id)
    }

    fn exec(
        &mut self,
        id: TransferId,
        old_mapping: &Mapping,
        new_mapping: &mut Mapping,
        elem_size: usize,
    ) -> Result<(), PartgridError> {
        let transfer = self
            .pending
            .get(&id)
            .ok_or_else(|| PartgridError::config(format!("no such transfer {id}")))?;

        for action in transfer.plan.actions() {
            match action {
                Action::Copy { slice } => {
                    let bytes = old_mapping.pack(slice);
                    new_mapping.unpack(slice, &bytes);
                }
                Action::Init { slice, intent } => {
                    let bytes = init_bytes(intent, slice.len(), elem_size, new_mapping.primitive());
                    new_mapping.unpack(slice, &bytes);
                }
                Action::Send { .. } | Action::Recv { .. } => {}
            }
        }

        // Every Send/Recv action this rank holds, bucketed per peer and
        // concatenated in the plan's deterministic order — the same order
        // the peer sees its matching Recv/Send actions in, since both
        // sides sort by `(peer rank, slice)`.
        let mut outgoing: HashMap<usize, Vec<u8>> = HashMap::new();
        let mut incoming: HashMap<usize, Vec<Slice>> = HashMap::new();
        for action in transfer.plan.actions() {
            match action {
                Action::Send { peer, slice } => {
                    outgoing.entry(*peer).or_default().extend(old_mapping.pack(slice));
                }
                Action::Recv { peer, slice, .. } => {
                    incoming.entry(*peer).or_default().push(*slice);
                }
                Action::Copy { .. } | Action::Init { .. } => {}
            }
        }

        let n = self.collective.peers();
        for phase in 0..2 * n {
            let peer = phase % n;
            if peer == self.rank {
                continue;
            }
            let peer_is_lower = peer < self.rank;
            let recv_first = if phase < n { peer_is_lower } else { !peer_is_lower };
            if recv_first {
                self.recv_from(&incoming, peer, new_mapping)?;
                self.send_to(&outgoing, peer)?;
            } else {
                self.send_to(&outgoing, peer)?;
                self.recv_from(&incoming, peer, new_mapping)?;
            }
        }

        // Reduction regions (spec.md §4.F/§4.H): a full-group sum delegates
        // to the transport's native all-reduce; anything else is realized
        // as a manual subgroup reduce, the lowest-rank output member
        // receiving from every other input member and forwarding the
        // combined result to the rest of the output subgroup.
        for record in transfer.transition.red.clone() {
            let full_group_sum =
                record.op == ReduceOp::Sum && record.input_group.len() == n && record.output_group.len() == n;
            if full_group_sum {
                if let Some(primitive) = new_mapping.primitive() {
                    let mut buf = if record.input_group.contains(&self.rank) {
                        old_mapping.pack(&record.slice)
                    } else {
                        primitive.identity(record.op).repeat(record.slice.len())
                    };
                    self.collective.all_reduce_sum(&mut buf, primitive)?;
                    if record.output_group.contains(&self.rank) {
                        new_mapping.unpack(&record.slice, &buf);
                    }
                }
                continue;
            }

            let lowest = *record.output_group.iter().min().expect("red record has an empty output group");
            if self.rank == lowest {
                let seed = if record.input_group.contains(&self.rank) {
                    old_mapping.pack(&record.slice)
                } else if let Some(primitive) = new_mapping.primitive() {
                    primitive.identity(record.op).repeat(record.slice.len())
                } else {
                    vec![0u8; record.slice.len() * elem_size]
                };
                new_mapping.unpack(&record.slice, &seed);

                for &input in &record.input_group {
                    if input == self.rank {
                        continue;
                    }
                    let incoming = self.collective.recv(input)?;
                    if let Some(primitive) = new_mapping.primitive() {
                        let current = new_mapping.pack(&record.slice);
                        let mut combined = vec![0u8; current.len()];
                        primitive.reduce_into(record.op, &mut combined, &current, &incoming, record.slice.len());
                        new_mapping.unpack(&record.slice, &combined);
                    } else {
                        new_mapping.unpack(&record.slice, &incoming);
                    }
                }

                let result = new_mapping.pack(&record.slice);
                for &out in &record.output_group {
                    if out != lowest {
                        self.collective.send(out, &result)?;
                    }
                }
            } else if record.input_group.contains(&self.rank) {
                let bytes = old_mapping.pack(&record.slice);
                self.collective.send(lowest, &bytes)?;
            } else if record.output_group.contains(&self.rank) {
                let bytes = self.collective.recv(lowest)?;
                new_mapping.unpack(&record.slice, &bytes);
            }
        }

        Ok(())
    }

    fn wait(&mut self, _id: TransferId, _new_mapping: &mut Mapping) -> Result<(), PartgridError> {
        // `exec` already moved every byte: this backend is blocking
        // synchronous (spec.md §5), so there is nothing left to wait for.
        Ok(())
    }

    fn probe(&mut self, id: TransferId) -> Result<bool, PartgridError> {
        Ok(self.pending.contains_key(&id))
    }

    fn cleanup(&mut self, id: TransferId) -> Result<(), PartgridError> {
        self.pending.remove(&id);
        Ok(())
    }
}

impl<C: Collective> CollectiveBackend<C> {
    fn send_to(&self, outgoing: &HashMap<usize, Vec<u8>>, peer: usize) -> Result<(), PartgridError> {
        match outgoing.get(&peer) {
            Some(bytes) => self.collective.send(peer, bytes),
            None => Ok(()),
        }
    }

    fn recv_from(
        &self,
        incoming: &HashMap<usize, Vec<Slice>>,
        peer: usize,
        new_mapping: &mut Mapping,
    ) -> Result<(), PartgridError> {
        let slices = match incoming.get(&peer) {
            Some(slices) => slices,
            None => return Ok(()),
        };
        let bytes = self.collective.recv(peer)?;
        let mut offset = 0;
        for slice in slices {
            let len = slice.len() * new_mapping.elem_size();
            new_mapping.unpack(slice, &bytes[offset..offset + len]);
            offset += len;
        }
        Ok(())
    }
}

fn init_bytes(intent: &AccessIntent, count: usize, elem_size: usize, primitive: Option<Primitive>) -> Vec<u8> {
    match (intent, primitive) {
        (AccessIntent::Reduce(op), Some(p)) => p.identity(*op).repeat(count),
        _ => vec![0u8; count * elem_size],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Slice, Space};
    use crate::partitioning::{Assignment, Partitioning};
    use crate::transition::plan;

    fn sl(bounds: &[(i64, i64)]) -> Slice { Slice::new(bounds).unwrap() }

    #[test]
    fn two_rank_exchange_moves_bytes() {
        let space = Space::new(&[(0, 8)]).unwrap();
        let old = Partitioning::new(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 4)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(4, 8)]), intent: AccessIntent::Write },
            ],
        )
        .unwrap();
        let new = Partitioning::new(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 5)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(5, 8)]), intent: AccessIntent::Write },
            ],
        )
        .unwrap();
        let transition = plan(Some(&old), &new);

        let mut collectives = InProcessCollective::build_group(2);
        let c1 = collectives.pop().unwrap();
        let c0 = collectives.pop().unwrap();

        let old0 = Mapping::new(sl(&[(0, 4)]), 8).unwrap();
        let mut new0 = Mapping::new(sl(&[(0, 5)]), 8).unwrap();
        let old1 = Mapping::new(sl(&[(4, 8)]), 8).unwrap();
        let mut new1 = Mapping::new(sl(&[(5, 8)]), 8).unwrap();

        let mut backend0 = CollectiveBackend::new(c0);
        let mut backend1 = CollectiveBackend::new(c1);
        let id0 = backend0.prepare(transition.clone()).unwrap();
        let id1 = backend1.prepare(transition).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                backend0.exec(id0, &old0, &mut new0, 8).unwrap();
                backend0.wait(id0, &mut new0).unwrap();
            });
            scope.spawn(|| {
                backend1.exec(id1, &old1, &mut new1, 8).unwrap();
                backend1.wait(id1, &mut new1).unwrap();
            });
        });

        assert!(new0.is_allocated());
        assert!(new1.is_allocated());
    }

    #[test]
    fn manual_subgroup_reduce_combines_and_broadcasts() {
        let space = Space::new(&[(0, 2)]).unwrap();
        let old = Partitioning::new(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 2)]), intent: AccessIntent::Reduce(ReduceOp::Max) },
                Assignment { rank: 1, slice: sl(&[(0, 2)]), intent: AccessIntent::Reduce(ReduceOp::Max) },
            ],
        )
        .unwrap();
        let new = Partitioning::new(
            &space,
            vec![Assignment { rank: 2, slice: sl(&[(0, 2)]), intent: AccessIntent::Reduce(ReduceOp::Max) }],
        )
        .unwrap();
        let transition = plan(Some(&old), &new);
        assert_eq!(transition.red.len(), 1);
        assert_eq!(transition.red[0].input_group, vec![0, 1]);
        assert_eq!(transition.red[0].output_group, vec![2]);

        let mut collectives = InProcessCollective::build_group(3);
        let c2 = collectives.pop().unwrap();
        let c1 = collectives.pop().unwrap();
        let c0 = collectives.pop().unwrap();

        let pack_f64 = |values: &[f64]| values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();

        let mut old0 = Mapping::new(sl(&[(0, 2)]), 8).unwrap().with_primitive(Primitive::F64);
        old0.unpack(&sl(&[(0, 2)]), &pack_f64(&[3.0, 9.0]));
        let mut old1 = Mapping::new(sl(&[(0, 2)]), 8).unwrap().with_primitive(Primitive::F64);
        old1.unpack(&sl(&[(0, 2)]), &pack_f64(&[7.0, 5.0]));
        let old2 = Mapping::new(sl(&[(0, 0)]), 8).unwrap();

        let mut new0 = Mapping::new(sl(&[(0, 2)]), 8).unwrap();
        let mut new1 = Mapping::new(sl(&[(0, 2)]), 8).unwrap();
        let mut new2 = Mapping::new(sl(&[(0, 2)]), 8).unwrap().with_primitive(Primitive::F64);

        let mut backend0 = CollectiveBackend::new(c0);
        let mut backend1 = CollectiveBackend::new(c1);
        let mut backend2 = CollectiveBackend::new(c2);
        let id0 = backend0.prepare(transition.clone()).unwrap();
        let id1 = backend1.prepare(transition.clone()).unwrap();
        let id2 = backend2.prepare(transition).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| backend0.exec(id0, &old0, &mut new0, 8).unwrap());
            scope.spawn(|| backend1.exec(id1, &old1, &mut new1, 8).unwrap());
            scope.spawn(|| backend2.exec(id2, &old2, &mut new2, 8).unwrap());
        });

        let result = new2.pack(&sl(&[(0, 2)]));
        let values: Vec<f64> = result.chunks(8).map(|c| f64::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(values, vec![7.0, 9.0]);
    }

    #[test]
    fn full_group_sum_uses_native_all_reduce() {
        let space = Space::new(&[(0, 2)]).unwrap();
        let old = Partitioning::new(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 2)]), intent: AccessIntent::Reduce(ReduceOp::Sum) },
                Assignment { rank: 1, slice: sl(&[(0, 2)]), intent: AccessIntent::Reduce(ReduceOp::Sum) },
                Assignment { rank: 2, slice: sl(&[(0, 2)]), intent: AccessIntent::Reduce(ReduceOp::Sum) },
            ],
        )
        .unwrap();
        let new = old.clone();
        let transition = plan(Some(&old), &new);
        assert_eq!(transition.red.len(), 1);
        assert_eq!(transition.red[0].input_group, vec![0, 1, 2]);
        assert_eq!(transition.red[0].output_group, vec![0, 1, 2]);

        let mut collectives = InProcessCollective::build_group(3);
        let c2 = collectives.pop().unwrap();
        let c1 = collectives.pop().unwrap();
        let c0 = collectives.pop().unwrap();

        let pack_f64 = |values: &[f64]| values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();

        let mut old0 = Mapping::new(sl(&[(0, 2)]), 8).unwrap().with_primitive(Primitive::F64);
        old0.unpack(&sl(&[(0, 2)]), &pack_f64(&[1.0, 2.0]));
        let mut old1 = Mapping::new(sl(&[(0, 2)]), 8).unwrap().with_primitive(Primitive::F64);
        old1.unpack(&sl(&[(0, 2)]), &pack_f64(&[10.0, 20.0]));
        let mut old2 = Mapping::new(sl(&[(0, 2)]), 8).unwrap().with_primitive(Primitive::F64);
        old2.unpack(&sl(&[(0, 2)]), &pack_f64(&[100.0, 200.0]));

        let mut new0 = Mapping::new(sl(&[(0, 2)]), 8).unwrap().with_primitive(Primitive::F64);
        let mut new1 = Mapping::new(sl(&[(0, 2)]), 8).unwrap().with_primitive(Primitive::F64);
        let mut new2 = Mapping::new(sl(&[(0, 2)]), 8).unwrap().with_primitive(Primitive::F64);

        let mut backend0 = CollectiveBackend::new(c0);
        let mut backend1 = CollectiveBackend::new(c1);
        let mut backend2 = CollectiveBackend::new(c2);
        let id0 = backend0.prepare(transition.clone()).unwrap();
        let id1 = backend1.prepare(transition.clone()).unwrap();
        let id2 = backend2.prepare(transition).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| backend0.exec(id0, &old0, &mut new0, 8).unwrap());
            scope.spawn(|| backend1.exec(id1, &old1, &mut new1, 8).unwrap());
            scope.spawn(|| backend2.exec(id2, &old2, &mut new2, 8).unwrap());
        });

        for mapping in [&new0, &new1, &new2] {
            let result = mapping.pack(&sl(&[(0, 2)]));
            let values: Vec<f64> = result.chunks(8).map(|c| f64::from_le_bytes(c.try_into().unwrap())).collect();
            assert_eq!(values, vec![111.0, 222.0]);
        }
    }
}
