/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::events::*;
use crate::logging::Logger;

/// The type of an event handler installed through
/// [ReplicaSpec](crate::replica::ReplicaSpec)'s builder.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) start_execution_handlers: Vec<HandlerPtr<StartExecutionEvent>>,
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub(crate) freeze_handlers: Vec<HandlerPtr<FreezeEvent>>,
    pub(crate) collect_handlers: Vec<HandlerPtr<CollectEvent>>,
    pub(crate) receive_proposal_handlers: Vec<HandlerPtr<ReceiveProposalEvent>>,
    pub(crate) receive_vote_handlers: Vec<HandlerPtr<ReceiveVoteEvent>>,
    pub(crate) receive_freeze_handlers: Vec<HandlerPtr<ReceiveFreezeEvent>>,
    pub(crate) receive_collect_handlers: Vec<HandlerPtr<ReceiveCollectEvent>>,
    pub(crate) decide_handlers: Vec<HandlerPtr<DecideEvent>>,
    pub(crate) request_state_transfer_handlers: Vec<HandlerPtr<RequestStateTransferEvent>>,
    pub(crate) deliver_state_handlers: Vec<HandlerPtr<DeliverStateEvent>>,
}

impl EventHandlers {
    pub(crate) fn new(
        log_events: bool,
        on_start_execution: Option<HandlerPtr<StartExecutionEvent>>,
        on_propose: Option<HandlerPtr<ProposeEvent>>,
        on_vote: Option<HandlerPtr<VoteEvent>>,
        on_freeze: Option<HandlerPtr<FreezeEvent>>,
        on_collect: Option<HandlerPtr<CollectEvent>>,
        on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
        on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
        on_receive_freeze: Option<HandlerPtr<ReceiveFreezeEvent>>,
        on_receive_collect: Option<HandlerPtr<ReceiveCollectEvent>>,
        on_decide: Option<HandlerPtr<DecideEvent>>,
        on_request_state_transfer: Option<HandlerPtr<RequestStateTransferEvent>>,
        on_deliver_state: Option<HandlerPtr<DeliverStateEvent>>,
    ) -> EventHandlers {
        let mut handlers = EventHandlers {
            start_execution_handlers: on_start_execution.into_iter().collect(),
            propose_handlers: on_propose.into_iter().collect(),
            vote_handlers: on_vote.into_iter().collect(),
            freeze_handlers: on_freeze.into_iter().collect(),
            collect_handlers: on_collect.into_iter().collect(),
            receive_proposal_handlers: on_receive_proposal.into_iter().collect(),
            receive_vote_handlers: on_receive_vote.into_iter().collect(),
            receive_freeze_handlers: on_receive_freeze.into_iter().collect(),
            receive_collect_handlers: on_receive_collect.into_iter().collect(),
            decide_handlers: on_decide.into_iter().collect(),
            request_state_transfer_handlers: on_request_state_transfer.into_iter().collect(),
            deliver_state_handlers: on_deliver_state.into_iter().collect(),
        };
        if log_events {
            handlers.add_logging_handlers();
        }
        handlers
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start_execution_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.freeze_handlers.is_empty()
            && self.collect_handlers.is_empty()
            && self.receive_proposal_handlers.is_empty()
            && self.receive_vote_handlers.is_empty()
            && self.receive_freeze_handlers.is_empty()
            && self.receive_collect_handlers.is_empty()
            && self.decide_handlers.is_empty()
            && self.request_state_transfer_handlers.is_empty()
            && self.deliver_state_handlers.is_empty()
    }

    fn add_logging_handlers(&mut self) {
        self.start_execution_handlers.push(StartExecutionEvent::get_logger());
        self.propose_handlers.push(ProposeEvent::get_logger());
        self.vote_handlers.push(VoteEvent::get_logger());
        self.freeze_handlers.push(FreezeEvent::get_logger());
        self.collect_handlers.push(CollectEvent::get_logger());
        self.receive_proposal_handlers.push(ReceiveProposalEvent::get_logger());
        self.receive_vote_handlers.push(ReceiveVoteEvent::get_logger());
        self.receive_freeze_handlers.push(ReceiveFreezeEvent::get_logger());
        self.receive_collect_handlers.push(ReceiveCollectEvent::get_logger());
        self.decide_handlers.push(DecideEvent::get_logger());
        self.request_state_transfer_handlers.push(RequestStateTransferEvent::get_logger());
        self.deliver_state_handlers.push(DeliverStateEvent::get_logger());
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::StartExecution(event) => {
                self.start_execution_handlers.iter().for_each(|handler| handler(&event))
            }
            Event::Propose(event) => self.propose_handlers.iter().for_each(|handler| handler(&event)),
            Event::Vote(event) => self.vote_handlers.iter().for_each(|handler| handler(&event)),
            Event::Freeze(event) => self.freeze_handlers.iter().for_each(|handler| handler(&event)),
            Event::Collect(event) => self.collect_handlers.iter().for_each(|handler| handler(&event)),
            Event::ReceiveProposal(event) => {
                self.receive_proposal_handlers.iter().for_each(|handler| handler(&event))
            }
            Event::ReceiveVote(event) => {
                self.receive_vote_handlers.iter().for_each(|handler| handler(&event))
            }
            Event::ReceiveFreeze(event) => {
                self.receive_freeze_handlers.iter().for_each(|handler| handler(&event))
            }
            Event::ReceiveCollect(event) => {
                self.receive_collect_handlers.iter().for_each(|handler| handler(&event))
            }
            Event::Decide(event) => self.decide_handlers.iter().for_each(|handler| handler(&event)),
            Event::RequestStateTransfer(event) => self
                .request_state_transfer_handlers
                .iter()
                .for_each(|handler| handler(&event)),
            Event::DeliverState(event) => {
                self.deliver_state_handlers.iter().for_each(|handler| handler(&event))
            }
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        if let Ok(event) = event_subscriber.try_recv() {
            event_handlers.fire_handlers(event)
        } else {
            thread::yield_now()
        }
    })
}
