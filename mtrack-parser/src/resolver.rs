//! Background resolver worker.
//!
//! The parser enqueues `(address id, ip, module)` triples as it discovers new
//! instruction pointers; the worker drains the queue in batches, resolves
//! each entry against its module's debug state, and hands the finished
//! batches back over a channel. Shutting down drains whatever is still
//! pending before the thread exits.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::module::Module;

/// A resolved source position. `None` fields render as the `-1` sentinel in
/// the artifact.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl Frame {
    pub fn is_unset(&self) -> bool {
        self.function.is_none() && self.file.is_none() && self.line.is_none()
    }
}

pub struct UnresolvedAddress {
    pub aid: i32,
    pub ip: u64,
    pub module: Option<Arc<Module>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub aid: i32,
    pub ip: u64,
    pub frame: Frame,
    pub inlined: Vec<Frame>,
}

#[derive(Default)]
struct Queue {
    pending: Vec<UnresolvedAddress>,
    stop: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

pub struct ResolverThread {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
    results: Receiver<Vec<ResolvedAddress>>,
}

impl ResolverThread {
    pub fn new() -> ResolverThread {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            cond: Condvar::new(),
        });
        let (tx, rx) = unbounded();
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("mtrack-resolver".into())
            .spawn(move || run(worker_shared, tx))
            .expect("spawn resolver thread");
        ResolverThread {
            shared,
            handle: Some(handle),
            results: rx,
        }
    }

    pub fn enqueue(&self, batch: Vec<UnresolvedAddress>) {
        if batch.is_empty() {
            return;
        }
        let mut queue = self.shared.queue.lock().unwrap();
        queue.pending.extend(batch);
        self.shared.cond.notify_one();
    }

    pub fn results(&self) -> &Receiver<Vec<ResolvedAddress>> {
        &self.results
    }

    /// Wake the worker, let it drain the queue, and join it.
    pub fn stop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.stop = true;
            self.shared.cond.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ResolverThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, results: Sender<Vec<ResolvedAddress>>) {
    loop {
        let pending = {
            let mut queue = shared.queue.lock().unwrap();
            while !queue.stop && queue.pending.is_empty() {
                queue = shared.cond.wait(queue).unwrap();
            }
            if queue.pending.is_empty() {
                // stop requested and nothing left to drain
                return;
            }
            std::mem::take(&mut queue.pending)
        };

        let resolved = pending
            .into_iter()
            .map(|unresolved| {
                let mut address = match &unresolved.module {
                    Some(module) => module.resolve_address(unresolved.ip),
                    None => ResolvedAddress {
                        ip: unresolved.ip,
                        ..ResolvedAddress::default()
                    },
                };
                address.aid = unresolved.aid;
                address
            })
            .collect::<Vec<_>>();
        if results.send(resolved).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_and_drains_on_stop() {
        let mut resolver = ResolverThread::new();
        resolver.enqueue(vec![
            UnresolvedAddress {
                aid: 0,
                ip: 0x1000,
                module: None,
            },
            UnresolvedAddress {
                aid: 1,
                ip: 0x2000,
                module: None,
            },
        ]);
        resolver.enqueue(vec![UnresolvedAddress {
            aid: 2,
            ip: 0x3000,
            module: None,
        }]);
        resolver.stop();

        let mut seen = Vec::new();
        for batch in resolver.results().try_iter() {
            for address in batch {
                assert!(address.frame.is_unset());
                seen.push(address.aid);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn empty_enqueue_is_a_noop() {
        let mut resolver = ResolverThread::new();
        resolver.enqueue(Vec::new());
        resolver.stop();
        assert!(resolver.results().try_iter().next().is_none());
    }
}
