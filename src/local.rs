//! In-process multi-rank substrate.
//!
//! [`LocalComm`] implements [`Substrate`] for a set of ranks living in one
//! process, one rank per thread. Point-to-point sends are eager and buffered
//! (a send never blocks), receives block on a per-rank mailbox, and the
//! collective patterns are built from those two primitives. This is the
//! substrate the test suite runs on; a binding to a real
//! message-passing library would implement the same trait.
//!
//! Nonblocking semantics: `isend` delivers eagerly and completes immediately;
//! `irecv` and `ibcast` are posted lazily and complete inside `wait`;
//! `iallreduce` captures the local contribution at issue time and performs the
//! reduction inside `wait`, so `ready` reports it as completable as soon as it
//! is issued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::status::Status;
use crate::substrate::{Capabilities, CombineFn, RequestId, Substrate, ANY_SOURCE, ANY_TAG};

/// Reserved tag for collective traffic. User receives with a wildcard tag
/// must not be posted concurrently with a collective on the same ranks.
const TAG_COLL: i32 = -32;

struct Envelope {
    source: i32,
    tag: i32,
    data: Vec<f64>,
}

struct Mailbox {
    queue: Mutex<Vec<Envelope>>,
    arrived: Condvar,
}

enum Pending {
    Send,
    Recv {
        source: i32,
        tag: i32,
    },
    Bcast {
        root: i32,
    },
    Allreduce {
        contrib: Vec<f64>,
        op: CombineFn,
        identity: Vec<f64>,
    },
}

struct Shared {
    size: i32,
    mailboxes: Vec<Mailbox>,
    requests: Vec<Mutex<HashMap<u64, Pending>>>,
    barrier: Barrier,
    next_request: AtomicU64,
}

/// One rank's endpoint of an in-process communicator.
///
/// Create all endpoints at once with [`LocalComm::ring`] and hand one to each
/// rank thread. Clones refer to the same rank.
#[derive(Clone)]
pub struct LocalComm {
    rank: i32,
    shared: Arc<Shared>,
}

/// Recover the guard even if another rank thread panicked while holding it.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LocalComm {
    /// Create the endpoints of an in-process communicator with `size` ranks.
    pub fn ring(size: usize) -> Vec<LocalComm> {
        let shared = Arc::new(Shared {
            size: size as i32,
            mailboxes: (0..size)
                .map(|_| Mailbox {
                    queue: Mutex::new(Vec::new()),
                    arrived: Condvar::new(),
                })
                .collect(),
            requests: (0..size).map(|_| Mutex::new(HashMap::new())).collect(),
            barrier: Barrier::new(size),
            next_request: AtomicU64::new(1),
        });
        (0..size as i32)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn check_rank(&self, rank: i32) -> Result<()> {
        if rank < 0 || rank >= self.shared.size {
            return Err(Error::InvalidRank(rank));
        }
        Ok(())
    }

    fn push(&self, dest: i32, tag: i32, data: Vec<f64>) {
        let mb = &self.shared.mailboxes[dest as usize];
        lock(&mb.queue).push(Envelope {
            source: self.rank,
            tag,
            data,
        });
        mb.arrived.notify_all();
    }

    fn matches(env: &Envelope, source: i32, tag: i32) -> bool {
        (source == ANY_SOURCE || env.source == source) && (tag == ANY_TAG || env.tag == tag)
    }

    /// Block until a matching envelope arrives in our mailbox and remove it.
    fn take_matching(&self, source: i32, tag: i32) -> Envelope {
        let mb = &self.shared.mailboxes[self.rank as usize];
        let mut queue = lock(&mb.queue);
        loop {
            if let Some(pos) = queue.iter().position(|e| Self::matches(e, source, tag)) {
                return queue.remove(pos);
            }
            queue = mb.arrived.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn copy_in(env: Envelope, buf: &mut [f64]) -> Result<Status> {
        if env.data.len() > buf.len() {
            return Err(Error::Truncated {
                received: env.data.len(),
                expected: buf.len(),
            });
        }
        buf[..env.data.len()].copy_from_slice(&env.data);
        Ok(Status {
            source: env.source,
            tag: env.tag,
            count: env.data.len(),
        })
    }

    fn next_request(&self, pending: Pending) -> RequestId {
        let id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.requests[self.rank as usize]).insert(id, pending);
        RequestId(id)
    }

    fn take_request(&self, req: RequestId) -> Result<Pending> {
        lock(&self.shared.requests[self.rank as usize])
            .remove(&req.0)
            .ok_or(Error::InvalidRequest)
    }
}

impl Substrate for LocalComm {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.shared.size
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            nonblocking: true,
            cancel: true,
            probe: true,
        }
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn send(&self, buf: &[f64], dest: i32, tag: i32) -> Result<()> {
        self.check_rank(dest)?;
        self.push(dest, tag, buf.to_vec());
        Ok(())
    }

    fn recv(&self, buf: &mut [f64], source: i32, tag: i32) -> Result<Status> {
        if source != ANY_SOURCE {
            self.check_rank(source)?;
        }
        let env = self.take_matching(source, tag);
        Self::copy_in(env, buf)
    }

    fn probe(&self, source: i32, tag: i32) -> Result<Status> {
        if source != ANY_SOURCE {
            self.check_rank(source)?;
        }
        let mb = &self.shared.mailboxes[self.rank as usize];
        let mut queue = lock(&mb.queue);
        loop {
            if let Some(env) = queue.iter().find(|e| Self::matches(e, source, tag)) {
                return Ok(Status {
                    source: env.source,
                    tag: env.tag,
                    count: env.data.len(),
                });
            }
            queue = mb.arrived.wait(queue).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn iprobe(&self, source: i32, tag: i32) -> Result<Option<Status>> {
        if source != ANY_SOURCE {
            self.check_rank(source)?;
        }
        let mb = &self.shared.mailboxes[self.rank as usize];
        let queue = lock(&mb.queue);
        Ok(queue
            .iter()
            .find(|e| Self::matches(e, source, tag))
            .map(|env| Status {
                source: env.source,
                tag: env.tag,
                count: env.data.len(),
            }))
    }

    fn bcast(&self, buf: &mut [f64], root: i32) -> Result<()> {
        self.check_rank(root)?;
        if self.rank == root {
            for r in 0..self.shared.size {
                if r != root {
                    self.push(r, TAG_COLL, buf.to_vec());
                }
            }
            Ok(())
        } else {
            let env = self.take_matching(root, TAG_COLL);
            if env.data.len() != buf.len() {
                return Err(Error::InvalidBuffer);
            }
            buf.copy_from_slice(&env.data);
            Ok(())
        }
    }

    fn gather(&self, send: &[f64], recv: &mut [f64], root: i32) -> Result<()> {
        self.check_rank(root)?;
        if self.rank != root {
            self.push(root, TAG_COLL, send.to_vec());
            return Ok(());
        }
        let n = send.len();
        if recv.len() != n * self.shared.size as usize {
            return Err(Error::InvalidBuffer);
        }
        for r in 0..self.shared.size {
            let slot = &mut recv[r as usize * n..(r as usize + 1) * n];
            if r == root {
                slot.copy_from_slice(send);
            } else {
                let env = self.take_matching(r, TAG_COLL);
                if env.data.len() != n {
                    return Err(Error::InvalidBuffer);
                }
                slot.copy_from_slice(&env.data);
            }
        }
        Ok(())
    }

    fn gatherv(
        &self,
        send: &[f64],
        recv: &mut [f64],
        counts: &[i32],
        displs: &[i32],
        root: i32,
    ) -> Result<()> {
        self.check_rank(root)?;
        if self.rank != root {
            self.push(root, TAG_COLL, send.to_vec());
            return Ok(());
        }
        if counts.len() != self.shared.size as usize || displs.len() != counts.len() {
            return Err(Error::InvalidBuffer);
        }
        if let Some(&c) = counts.iter().find(|&&c| c < 0) {
            return Err(Error::InvalidCount(c as i64));
        }
        for r in 0..self.shared.size {
            let count = counts[r as usize] as usize;
            let displ = displs[r as usize] as usize;
            if displ + count > recv.len() {
                return Err(Error::InvalidBuffer);
            }
            let slot = &mut recv[displ..displ + count];
            if r == root {
                if send.len() != count {
                    return Err(Error::InvalidBuffer);
                }
                slot.copy_from_slice(send);
            } else {
                let env = self.take_matching(r, TAG_COLL);
                if env.data.len() != count {
                    return Err(Error::InvalidBuffer);
                }
                slot.copy_from_slice(&env.data);
            }
        }
        Ok(())
    }

    fn scatter(&self, send: &[f64], recv: &mut [f64], root: i32) -> Result<()> {
        self.check_rank(root)?;
        let n = recv.len();
        if self.rank == root {
            if send.len() != n * self.shared.size as usize {
                return Err(Error::InvalidBuffer);
            }
            for r in 0..self.shared.size {
                let slot = &send[r as usize * n..(r as usize + 1) * n];
                if r == root {
                    recv.copy_from_slice(slot);
                } else {
                    self.push(r, TAG_COLL, slot.to_vec());
                }
            }
            Ok(())
        } else {
            let env = self.take_matching(root, TAG_COLL);
            Self::copy_in(env, recv).map(|_| ())
        }
    }

    fn scatterv(
        &self,
        send: &[f64],
        counts: &[i32],
        displs: &[i32],
        recv: &mut [f64],
        root: i32,
    ) -> Result<()> {
        self.check_rank(root)?;
        if self.rank == root {
            if counts.len() != self.shared.size as usize || displs.len() != counts.len() {
                return Err(Error::InvalidBuffer);
            }
            if let Some(&c) = counts.iter().find(|&&c| c < 0) {
                return Err(Error::InvalidCount(c as i64));
            }
            for r in 0..self.shared.size {
                let count = counts[r as usize] as usize;
                let displ = displs[r as usize] as usize;
                if displ + count > send.len() {
                    return Err(Error::InvalidBuffer);
                }
                let slot = &send[displ..displ + count];
                if r == root {
                    if recv.len() != count {
                        return Err(Error::InvalidBuffer);
                    }
                    recv.copy_from_slice(slot);
                } else {
                    self.push(r, TAG_COLL, slot.to_vec());
                }
            }
            Ok(())
        } else {
            let env = self.take_matching(root, TAG_COLL);
            if env.data.len() != recv.len() {
                return Err(Error::InvalidBuffer);
            }
            recv.copy_from_slice(&env.data);
            Ok(())
        }
    }

    fn allgather(&self, send: &[f64], recv: &mut [f64]) -> Result<()> {
        let n = send.len();
        if recv.len() != n * self.shared.size as usize {
            return Err(Error::InvalidBuffer);
        }
        for r in 0..self.shared.size {
            if r != self.rank {
                self.push(r, TAG_COLL, send.to_vec());
            }
        }
        for r in 0..self.shared.size {
            let slot = &mut recv[r as usize * n..(r as usize + 1) * n];
            if r == self.rank {
                slot.copy_from_slice(send);
            } else {
                let env = self.take_matching(r, TAG_COLL);
                if env.data.len() != n {
                    return Err(Error::InvalidBuffer);
                }
                slot.copy_from_slice(&env.data);
            }
        }
        Ok(())
    }

    fn reduce(
        &self,
        send: &[f64],
        recv: &mut [f64],
        op: &CombineFn,
        identity: &[f64],
        root: i32,
    ) -> Result<()> {
        self.check_rank(root)?;
        if self.rank != root {
            self.push(root, TAG_COLL, send.to_vec());
            return Ok(());
        }
        if recv.len() != send.len() || identity.is_empty() {
            return Err(Error::InvalidBuffer);
        }
        if recv.len() % identity.len() != 0 {
            return Err(Error::InvalidBuffer);
        }
        for chunk in recv.chunks_mut(identity.len()) {
            chunk.copy_from_slice(identity);
        }
        // Rank order makes ties deterministic: the lowest contributing rank
        // reaches the accumulator first.
        for r in 0..self.shared.size {
            if r == root {
                op(send, recv);
            } else {
                let env = self.take_matching(r, TAG_COLL);
                if env.data.len() != recv.len() {
                    return Err(Error::InvalidBuffer);
                }
                op(&env.data, recv);
            }
        }
        Ok(())
    }

    fn allreduce(
        &self,
        send: &[f64],
        recv: &mut [f64],
        op: &CombineFn,
        identity: &[f64],
    ) -> Result<()> {
        if recv.len() != send.len() {
            return Err(Error::InvalidBuffer);
        }
        self.reduce(send, recv, op, identity, 0)?;
        self.bcast(recv, 0)
    }

    fn isend(&self, buf: &[f64], dest: i32, tag: i32) -> Result<RequestId> {
        self.send(buf, dest, tag)?;
        Ok(self.next_request(Pending::Send))
    }

    fn irecv(&self, _count: usize, source: i32, tag: i32) -> Result<RequestId> {
        if source != ANY_SOURCE {
            self.check_rank(source)?;
        }
        Ok(self.next_request(Pending::Recv { source, tag }))
    }

    fn ibcast(&self, root_buf: Option<&[f64]>, _count: usize, root: i32) -> Result<RequestId> {
        self.check_rank(root)?;
        if self.rank == root {
            let buf = root_buf.ok_or(Error::InvalidBuffer)?;
            for r in 0..self.shared.size {
                if r != root {
                    self.push(r, TAG_COLL, buf.to_vec());
                }
            }
        }
        Ok(self.next_request(Pending::Bcast { root }))
    }

    fn iallreduce(
        &self,
        send: &[f64],
        op: &CombineFn,
        identity: &[f64],
    ) -> Result<RequestId> {
        Ok(self.next_request(Pending::Allreduce {
            contrib: send.to_vec(),
            op: Arc::clone(op),
            identity: identity.to_vec(),
        }))
    }

    fn wait(&self, req: RequestId, out: &mut [f64]) -> Result<Status> {
        match self.take_request(req)? {
            Pending::Send => Ok(Status::empty()),
            Pending::Recv { source, tag } => {
                let env = self.take_matching(source, tag);
                Self::copy_in(env, out)
            }
            Pending::Bcast { root } => {
                if self.rank == root {
                    Ok(Status::empty())
                } else {
                    let env = self.take_matching(root, TAG_COLL);
                    Self::copy_in(env, out)
                }
            }
            Pending::Allreduce {
                contrib,
                op,
                identity,
            } => {
                if out.len() != contrib.len() {
                    return Err(Error::InvalidBuffer);
                }
                self.allreduce(&contrib, out, &op, &identity)?;
                Ok(Status {
                    source: self.rank,
                    tag: TAG_COLL,
                    count: out.len(),
                })
            }
        }
    }

    fn ready(&self, req: RequestId) -> Result<bool> {
        let table = lock(&self.shared.requests[self.rank as usize]);
        match table.get(&req.0).ok_or(Error::InvalidRequest)? {
            Pending::Send | Pending::Allreduce { .. } => Ok(true),
            Pending::Recv { source, tag } => {
                let (source, tag) = (*source, *tag);
                drop(table);
                Ok(self.iprobe(source, tag)?.is_some())
            }
            Pending::Bcast { root } => {
                if self.rank == *root {
                    Ok(true)
                } else {
                    let root = *root;
                    drop(table);
                    Ok(self.iprobe(root, TAG_COLL)?.is_some())
                }
            }
        }
    }

    fn cancel(&self, req: RequestId) -> Result<()> {
        self.take_request(req).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_op() -> CombineFn {
        Arc::new(|incoming: &[f64], acc: &mut [f64]| {
            for (a, x) in acc.iter_mut().zip(incoming) {
                *a += x;
            }
        })
    }

    fn spawn_ranks<F>(size: usize, f: F)
    where
        F: Fn(LocalComm) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = LocalComm::ring(size)
            .into_iter()
            .map(|comm| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || f(comm))
            })
            .collect();
        for h in handles {
            h.join().expect("rank thread panicked");
        }
    }

    #[test]
    fn send_recv_roundtrip() {
        spawn_ranks(2, |comm| {
            if comm.rank() == 0 {
                comm.send(&[1.0, 2.0, 3.0], 1, 7).unwrap();
            } else {
                let mut buf = [0.0; 3];
                let status = comm.recv(&mut buf, 0, 7).unwrap();
                assert_eq!(buf, [1.0, 2.0, 3.0]);
                assert_eq!(status.source, 0);
                assert_eq!(status.count, 3);
            }
        });
    }

    #[test]
    fn wildcard_recv_matches_any_source() {
        spawn_ranks(3, |comm| {
            if comm.rank() != 2 {
                comm.send(&[comm.rank() as f64], 2, 5).unwrap();
            } else {
                let mut seen = Vec::new();
                for _ in 0..2 {
                    let mut buf = [0.0];
                    let status = comm.recv(&mut buf, ANY_SOURCE, 5).unwrap();
                    assert_eq!(buf[0], status.source as f64);
                    seen.push(status.source);
                }
                seen.sort_unstable();
                assert_eq!(seen, vec![0, 1]);
            }
        });
    }

    #[test]
    fn truncated_recv_is_an_error() {
        spawn_ranks(2, |comm| {
            if comm.rank() == 0 {
                comm.send(&[1.0, 2.0], 1, 0).unwrap();
            } else {
                let mut buf = [0.0];
                let err = comm.recv(&mut buf, 0, 0).unwrap_err();
                assert!(matches!(err, Error::Truncated { received: 2, expected: 1 }));
            }
        });
    }

    #[test]
    fn bcast_delivers_to_all() {
        spawn_ranks(3, |comm| {
            let mut buf = if comm.rank() == 1 {
                vec![5.0, 6.0]
            } else {
                vec![0.0, 0.0]
            };
            comm.bcast(&mut buf, 1).unwrap();
            assert_eq!(buf, vec![5.0, 6.0]);
        });
    }

    #[test]
    fn gather_scatter_are_inverses() {
        spawn_ranks(3, |comm| {
            let rank = comm.rank();
            let send = vec![rank as f64, 10.0 + rank as f64];
            let mut gathered = if rank == 0 { vec![0.0; 6] } else { Vec::new() };
            comm.gather(&send, &mut gathered, 0).unwrap();
            if rank == 0 {
                assert_eq!(gathered, vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0]);
            }
            let mut back = vec![0.0; 2];
            comm.scatter(&gathered, &mut back, 0).unwrap();
            assert_eq!(back, send);
        });
    }

    #[test]
    fn reduce_sums_in_rank_order() {
        spawn_ranks(4, |comm| {
            let send = vec![comm.rank() as f64 + 1.0];
            let mut recv = vec![0.0];
            comm.reduce(&send, &mut recv, &sum_op(), &[0.0], 2).unwrap();
            if comm.rank() == 2 {
                assert_eq!(recv[0], 10.0);
            }
        });
    }

    #[test]
    fn allreduce_delivers_everywhere() {
        spawn_ranks(3, |comm| {
            let send = vec![1.0, comm.rank() as f64];
            let mut recv = vec![0.0; 2];
            comm.allreduce(&send, &mut recv, &sum_op(), &[0.0]).unwrap();
            assert_eq!(recv, vec![3.0, 3.0]);
        });
    }

    #[test]
    fn nonblocking_recv_completes_on_wait() {
        spawn_ranks(2, |comm| {
            if comm.rank() == 0 {
                comm.send(&[9.0], 1, 3).unwrap();
            } else {
                let req = comm.irecv(1, 0, 3).unwrap();
                let mut buf = [0.0];
                let status = comm.wait(req, &mut buf).unwrap();
                assert_eq!(buf[0], 9.0);
                assert_eq!(status.source, 0);
            }
        });
    }

    #[test]
    fn cancelled_request_is_consumed() {
        spawn_ranks(2, |comm| {
            if comm.rank() == 1 {
                let req = comm.irecv(1, 0, 3).unwrap();
                comm.cancel(req).unwrap();
                let mut buf = [0.0];
                assert!(matches!(comm.wait(req, &mut buf), Err(Error::InvalidRequest)));
            }
            comm.barrier().unwrap();
        });
    }
}
