/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-replica coordinator of concurrent consensus instances.
//!
//! The manager admits messages into a bounded window of execution ids above the last executed
//! one, lazily creates [Execution] objects the first time an admitted id is referenced, buffers
//! messages that overrun the window as out-of-context, and asks the state transfer collaborator
//! for help when the gap is too large to bridge by replay.
//!
//! The `eid -> Execution` mapping and the out-of-context buffer are mutated from the dispatch
//! path, the timer path, and state-transfer completion; each is guarded by its own lock,
//! independent of the per-execution locks. Lock acquisition order is: window bounds, then
//! out-of-context buffer, then the state transfer collaborator. Per-execution locks are only
//! taken while none of the manager's locks are held.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::app::StateTransfer;
use crate::config::CoreConfig;
use crate::events::{DeliverStateEvent, Event, RequestStateTransferEvent};
use crate::execution::Execution;
use crate::leader::LeaderModule;
use crate::messages::ConsensusMessage;
use crate::types::{ExecutionId, ReplicaId, TransferableState};

pub struct ExecutionManager {
    config: Arc<CoreConfig>,
    leader_module: Arc<LeaderModule>,
    executions: Mutex<HashMap<ExecutionId, Arc<Execution>>>,
    out_of_context: Mutex<BTreeMap<ExecutionId, Vec<ConsensusMessage>>>,
    bounds: Mutex<WindowBounds>,
    state_transfer: Mutex<Box<dyn StateTransfer>>,
    event_publisher: Option<Sender<Event>>,
}

struct WindowBounds {
    /// The greatest execution id whose decision has been recorded here, or None before the first.
    last_executed: Option<ExecutionId>,
    /// The instance currently being driven by this replica's proposer, if any.
    in_execution: Option<ExecutionId>,
    /// The id that triggered the state transfer currently in flight, if any. Further overruns do
    /// not re-request while this is set.
    requested_transfer: Option<ExecutionId>,
}

impl ExecutionManager {
    pub(crate) fn new(
        config: Arc<CoreConfig>,
        leader_module: Arc<LeaderModule>,
        state_transfer: Box<dyn StateTransfer>,
        event_publisher: Option<Sender<Event>>,
    ) -> ExecutionManager {
        ExecutionManager {
            config,
            leader_module,
            executions: Mutex::new(HashMap::new()),
            out_of_context: Mutex::new(BTreeMap::new()),
            bounds: Mutex::new(WindowBounds {
                last_executed: None,
                in_execution: None,
                requested_transfer: None,
            }),
            state_transfer: Mutex::new(state_transfer),
            event_publisher,
        }
    }

    /// Decide whether a message can be processed now.
    ///
    /// Returns true iff the message's execution id falls inside the processable window
    /// `[last_executed + 1, last_executed + paxos_high_mark]` (widened to `revival_high_mark`
    /// while a state transfer is in flight). Ids at or below `last_executed` are stale and
    /// dropped. Ids beyond the window are buffered as out-of-context, and the first such overrun
    /// triggers a state transfer request.
    pub fn check_limits(&self, msg: &ConsensusMessage) -> bool {
        let eid = msg.eid();
        let mut bounds = self.bounds.lock().unwrap();
        let next = bounds.last_executed.map_or(0, |last| last + 1);
        if eid < next {
            log::debug!("StaleMessage, {}, {}", eid, next);
            return false;
        }

        let retrieving = self.state_transfer.lock().unwrap().is_retrieving_state();
        let high_mark = if retrieving {
            self.config.revival_high_mark
        } else {
            self.config.paxos_high_mark
        };
        if eid < next + high_mark {
            return true;
        }

        self.out_of_context
            .lock()
            .unwrap()
            .entry(eid)
            .or_default()
            .push(msg.clone());

        if !retrieving && bounds.requested_transfer.is_none() {
            bounds.requested_transfer = Some(eid);
            let me = self.config.me;
            // Peers in random order, so retries by the collaborator spread across the group.
            let peers: Vec<ReplicaId> = self
                .config
                .replicas
                .shuffled_ids()
                .into_iter()
                .filter(|id| *id != me)
                .collect();
            self.state_transfer
                .lock()
                .unwrap()
                .request_transfer(me, &peers, eid);
            Event::publish(
                &self.event_publisher,
                Event::RequestStateTransfer(RequestStateTransferEvent {
                    timestamp: SystemTime::now(),
                    eid,
                }),
            );
        }
        false
    }

    /// The existing execution for `eid`, or a freshly created one. Creation here is the only
    /// mutation point of the `eid -> Execution` mapping besides removal.
    pub fn get_execution(&self, eid: ExecutionId) -> Arc<Execution> {
        let mut executions = self.executions.lock().unwrap();
        executions
            .entry(eid)
            .or_insert_with(|| Arc::new(Execution::new(eid, self.config.n())))
            .clone()
    }

    /// The execution for `eid` if it can still decide on this replica, creating it if needed.
    /// Ids at or below `last_executed` are settled and retired; asking for one returns None
    /// instead of resurrecting a blank execution that would never decide.
    pub(crate) fn undecided_execution(&self, eid: ExecutionId) -> Option<Arc<Execution>> {
        let bounds = self.bounds.lock().unwrap();
        if bounds.last_executed.is_some_and(|last| eid <= last) {
            return None;
        }
        // Holding the bounds lock here keeps a concurrent `decided(eid)` from retiring the
        // execution between the check and the lookup.
        Some(self.get_execution(eid))
    }

    /// Idempotent removal; returns None if the execution is absent.
    pub fn remove_execution(&self, eid: ExecutionId) -> Option<Arc<Execution>> {
        self.executions.lock().unwrap().remove(&eid)
    }

    /// Whether out-of-context messages are buffered for `eid`.
    pub fn there_are_pendent_messages(&self, eid: ExecutionId) -> bool {
        self.out_of_context.lock().unwrap().contains_key(&eid)
    }

    /// Drop the buffered out-of-context messages for `eid`.
    pub fn remove_out_of_contexts(&self, eid: ExecutionId) {
        self.out_of_context.lock().unwrap().remove(&eid);
    }

    /// Take the buffered out-of-context messages for `eid`, leaving none behind.
    pub(crate) fn take_out_of_contexts(&self, eid: ExecutionId) -> Vec<ConsensusMessage> {
        self.out_of_context
            .lock()
            .unwrap()
            .remove(&eid)
            .unwrap_or_default()
    }

    /// Atomically claim the next execution id for this replica's proposer. Returns None while an
    /// instance is already in execution.
    pub(crate) fn try_start_execution(&self) -> Option<ExecutionId> {
        let mut bounds = self.bounds.lock().unwrap();
        if bounds.in_execution.is_some() {
            return None;
        }
        let next = bounds.last_executed.map_or(0, |last| last + 1);
        bounds.in_execution = Some(next);
        Some(next)
    }

    /// Release the in-execution slot claimed by [ExecutionManager::try_start_execution] without a
    /// decision. Only the claimant for `eid` is released.
    pub(crate) fn abort_execution(&self, eid: ExecutionId) {
        let mut bounds = self.bounds.lock().unwrap();
        if bounds.in_execution == Some(eid) {
            bounds.in_execution = None;
        }
    }

    /// Note that a proposal for `eid` is being driven, whether by this replica or by the leader.
    pub(crate) fn note_in_execution(&self, eid: ExecutionId) {
        let mut bounds = self.bounds.lock().unwrap();
        let next = bounds.last_executed.map_or(0, |last| last + 1);
        if bounds.in_execution.is_none() && eid >= next {
            bounds.in_execution = Some(eid);
        }
    }

    pub fn last_executed(&self) -> Option<ExecutionId> {
        self.bounds.lock().unwrap().last_executed
    }

    /// Record that `eid` decided: advance the window, free the in-execution slot, retire the
    /// execution, prune leader history that fell behind the window, and return any buffered
    /// messages for `eid + 1` so the caller can replay them.
    pub(crate) fn decided(&self, eid: ExecutionId) -> Vec<ConsensusMessage> {
        let mut bounds = self.bounds.lock().unwrap();
        if bounds.last_executed.map_or(true, |last| eid > last) {
            bounds.last_executed = Some(eid);
        }
        bounds.in_execution = None;
        drop(bounds);

        self.remove_execution(eid);
        self.remove_out_of_contexts(eid);
        if eid >= self.config.paxos_high_mark {
            self.leader_module
                .remove_stable_consensus_info(eid - self.config.paxos_high_mark);
        }
        self.take_out_of_contexts(eid + 1)
    }

    /// Replace all execution state at or below `state.last_eid` with the externally supplied
    /// snapshot, seed leader history from the checkpoint, and unblock whoever was waiting on the
    /// replaced executions. Returns the buffered messages that the new window can now process.
    pub(crate) fn deliver_state(&self, state: &TransferableState) -> Vec<ConsensusMessage> {
        let mut bounds = self.bounds.lock().unwrap();
        bounds.last_executed = Some(state.last_eid);
        bounds.in_execution = None;
        bounds.requested_transfer = None;
        drop(bounds);

        self.leader_module
            .set_round_zero_leader(state.last_checkpoint_eid, state.last_checkpoint_leader);
        self.leader_module
            .decided(state.last_eid, state.last_checkpoint_leader);

        let mut executions = self.executions.lock().unwrap();
        let superseded: Vec<Arc<Execution>> = executions
            .iter()
            .filter(|(eid, _)| **eid <= state.last_eid)
            .map(|(_, execution)| execution.clone())
            .collect();
        executions.retain(|eid, _| *eid > state.last_eid);
        drop(executions);
        for execution in superseded {
            execution.supersede();
        }

        let mut out_of_context = self.out_of_context.lock().unwrap();
        *out_of_context = out_of_context.split_off(&(state.last_eid + 1));
        let window_end = state.last_eid + self.config.paxos_high_mark;
        let mut beyond = out_of_context.split_off(&(window_end + 1));
        let replayable: Vec<ConsensusMessage> = std::mem::take(&mut *out_of_context)
            .into_values()
            .flatten()
            .collect();
        std::mem::swap(&mut *out_of_context, &mut beyond);
        drop(out_of_context);

        Event::publish(
            &self.event_publisher,
            Event::DeliverState(DeliverStateEvent {
                timestamp: SystemTime::now(),
                last_eid: state.last_eid,
            }),
        );
        replayable
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testing;
    use crate::types::hash_value;

    struct CountingStateTransfer {
        requests: Arc<AtomicUsize>,
    }

    impl StateTransfer for CountingStateTransfer {
        fn request_transfer(&mut self, me: ReplicaId, peers: &[ReplicaId], _eid: ExecutionId) {
            // Every other group member is offered, in whatever order, and never this replica.
            let mut peers = peers.to_vec();
            assert!(!peers.contains(&me));
            peers.sort_unstable();
            assert_eq!(peers, vec![1, 2, 3]);
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        fn is_retrieving_state(&self) -> bool {
            false
        }
    }

    fn manager() -> (ExecutionManager, Arc<AtomicUsize>) {
        let (_, config) = testing::core_config(4, 1);
        let requests = Arc::new(AtomicUsize::new(0));
        let leader_module = Arc::new(LeaderModule::new(4));
        let manager = ExecutionManager::new(
            config,
            leader_module,
            Box::new(CountingStateTransfer {
                requests: requests.clone(),
            }),
            None,
        );
        (manager, requests)
    }

    fn weak_msg(eid: ExecutionId) -> ConsensusMessage {
        ConsensusMessage::weak(1, eid, 0, hash_value(b"v"))
    }

    #[test]
    fn window_admission() {
        let (manager, requests) = manager();
        // Bring last_executed to 10.
        for eid in 0..=10 {
            manager.decided(eid);
        }

        assert!(manager.check_limits(&weak_msg(50)));
        assert!(!manager.there_are_pendent_messages(50));

        assert!(!manager.check_limits(&weak_msg(500)));
        assert!(manager.there_are_pendent_messages(500));
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        // A second overrun for the same gap does not re-request.
        assert!(!manager.check_limits(&weak_msg(500)));
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_messages_are_dropped_not_buffered() {
        let (manager, _) = manager();
        for eid in 0..=10 {
            manager.decided(eid);
        }
        assert!(!manager.check_limits(&weak_msg(7)));
        assert!(!manager.there_are_pendent_messages(7));
    }

    #[test]
    fn removal_is_idempotent() {
        let (manager, _) = manager();
        let execution = manager.get_execution(3);
        assert_eq!(execution.eid(), 3);
        assert!(manager.remove_execution(3).is_some());
        assert!(manager.remove_execution(3).is_none());
    }

    #[test]
    fn settled_executions_are_not_resurrected_for_waiters() {
        let (manager, _) = manager();
        manager.get_execution(0);
        manager.decided(0);

        assert!(manager.undecided_execution(0).is_none());
        // No blank execution was left behind for the retired id.
        assert!(manager.executions.lock().unwrap().is_empty());

        // Ids still ahead of the window are created on demand as before.
        assert!(manager.undecided_execution(1).is_some());
    }

    #[test]
    fn decided_returns_buffered_messages_for_the_next_eid() {
        let (manager, _) = manager();
        for eid in 0..=10 {
            manager.decided(eid);
        }
        // Buffer something far ahead, then walk the window up to just below it.
        assert!(!manager.check_limits(&weak_msg(500)));
        for eid in 11..=498 {
            assert!(manager.decided(eid).is_empty());
        }
        let replay = manager.decided(499);
        assert_eq!(replay.len(), 1);
        assert!(!manager.there_are_pendent_messages(500));
    }

    #[test]
    fn deliver_state_fast_forwards_and_unblocks() {
        let (manager, _) = manager();
        let execution = manager.get_execution(0);
        let state = TransferableState {
            last_checkpoint_eid: 90,
            last_checkpoint_round: 0,
            last_checkpoint_leader: 2,
            last_eid: 100,
            batch_metadata: Vec::new(),
        };
        let replay = manager.deliver_state(&state);
        assert!(replay.is_empty());
        assert_eq!(manager.last_executed(), Some(100));
        // The old execution was superseded: waiting on it returns immediately.
        assert!(execution
            .wait_decision(std::time::Duration::from_secs(5))
            .is_none());
        // And it is gone from the map.
        assert!(manager.remove_execution(0).is_none());
    }
}
