/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The watchdog that turns a stalled execution into a round freeze.
//!
//! An execution is watched from the moment this replica starts working on it. If it has not
//! decided within the configured request timeout, the watchdog fires the timeout callback in its
//! own thread; the callback freezes the round in progress. Deciding unwatches the execution, and
//! freezing re-watches it so the replacement round is under the same deadline.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::types::ExecutionId;

/// A shareable handle on the set of watched executions. Deadline scans take the read lock, so the
/// timer thread's periodic sweep does not contend with watch/unwatch unless something expired.
#[derive(Clone)]
pub(crate) struct Watchdog {
    timeout: Duration,
    deadlines: Arc<RwLock<BTreeMap<ExecutionId, Instant>>>,
}

impl Watchdog {
    pub(crate) fn new(timeout: Duration) -> Watchdog {
        Watchdog {
            timeout,
            deadlines: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Start (or restart) the deadline for an execution.
    pub(crate) fn watch(&self, eid: ExecutionId) {
        self.deadlines
            .write()
            .unwrap()
            .insert(eid, Instant::now() + self.timeout);
    }

    /// Stop watching an execution. Idempotent.
    pub(crate) fn unwatch(&self, eid: ExecutionId) {
        self.deadlines.write().unwrap().remove(&eid);
    }

    /// Remove and return the executions whose deadline has passed.
    fn expired(&self) -> Vec<ExecutionId> {
        let now = Instant::now();
        let expired: Vec<ExecutionId> = self
            .deadlines
            .read()
            .unwrap()
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(eid, _)| *eid)
            .collect();
        if !expired.is_empty() {
            let mut deadlines = self.deadlines.write().unwrap();
            for eid in &expired {
                // An entry re-watched between the scan and here keeps its new deadline.
                if deadlines.get(eid).is_some_and(|deadline| *deadline <= now) {
                    deadlines.remove(eid);
                }
            }
        }
        expired
    }
}

/// Spawn the watchdog thread, which fires `on_timeout` for every watched execution whose deadline
/// passes. Each expired execution fires at most once per watch.
pub(crate) fn start_watchdog(
    watchdog: Watchdog,
    on_timeout: Box<dyn Fn(ExecutionId) + Send>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Watchdog thread disconnected from main thread")
            }
        }

        for eid in watchdog.expired() {
            on_timeout(eid);
        }
        thread::sleep(Duration::from_millis(10));
    })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn expired_deadlines_fire_once() {
        let watchdog = Watchdog::new(Duration::from_millis(20));
        watchdog.watch(7);
        let (fired_sender, fired) = mpsc::channel();
        let (shutdown_sender, shutdown) = mpsc::channel();
        let thread = start_watchdog(
            watchdog.clone(),
            Box::new(move |eid| fired_sender.send(eid).unwrap()),
            shutdown,
        );
        assert_eq!(fired.recv_timeout(Duration::from_secs(1)), Ok(7));
        assert!(fired.recv_timeout(Duration::from_millis(100)).is_err());
        shutdown_sender.send(()).unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn unwatched_executions_do_not_fire() {
        let watchdog = Watchdog::new(Duration::from_millis(20));
        watchdog.watch(7);
        watchdog.unwatch(7);
        thread::sleep(Duration::from_millis(50));
        assert!(watchdog.expired().is_empty());
    }
}
