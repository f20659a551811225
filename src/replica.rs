/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Assembly of the protocol components into a running replica, and the handle through which users
//! interact with it.
//!
//! A replica is specified with a [ReplicaSpec] and started with [ReplicaSpec::start], which
//! validates the configuration, wires the components together, and spawns the background threads:
//! the poller (pulls messages out of the network provider), the dispatcher (verifies origins,
//! admits messages into the window, and routes them), the watchdog (freezes stalled rounds), and,
//! if any event handler is installed, the event bus. Dropping the returned [Replica] shuts the
//! threads down in the reverse order.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::acceptor::Acceptor;
use crate::app::{App, StateTransfer};
use crate::config::{Configuration, ConfigurationError, CoreConfig};
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPtr};
use crate::events::*;
use crate::execution::Decision;
use crate::execution_manager::ExecutionManager;
use crate::leader::LeaderModule;
use crate::messages::ConsensusMessage;
use crate::networking::{start_polling, Network, SenderHandle};
use crate::proposer::Proposer;
use crate::timeouts::{start_watchdog, Watchdog};
use crate::types::{ExecutionId, ReplicaId, RoundNumber, TransferableState, VerifyingKey};

/// Everything needed to start a replica: the delivery layer, the network provider, the state
/// transfer collaborator, the configuration, and any number of optional event handlers.
///
/// Constructed with the builder pattern:
///
/// ```ignore
/// let replica = ReplicaSpec::builder()
///     .app(app)
///     .network(network)
///     .state_transfer(Box::new(state_transfer))
///     .configuration(configuration)
///     .on_decide(Box::new(|event| println!("decided execution {}", event.eid)))
///     .build()
///     .start()?;
/// ```
#[derive(TypedBuilder)]
pub struct ReplicaSpec<N: Network, A: App> {
    app: A,
    network: N,
    state_transfer: Box<dyn StateTransfer>,
    configuration: Configuration,
    #[builder(default, setter(strip_option))]
    on_start_execution: Option<HandlerPtr<StartExecutionEvent>>,
    #[builder(default, setter(strip_option))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(strip_option))]
    on_vote: Option<HandlerPtr<VoteEvent>>,
    #[builder(default, setter(strip_option))]
    on_freeze: Option<HandlerPtr<FreezeEvent>>,
    #[builder(default, setter(strip_option))]
    on_collect: Option<HandlerPtr<CollectEvent>>,
    #[builder(default, setter(strip_option))]
    on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
    #[builder(default, setter(strip_option))]
    on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
    #[builder(default, setter(strip_option))]
    on_receive_freeze: Option<HandlerPtr<ReceiveFreezeEvent>>,
    #[builder(default, setter(strip_option))]
    on_receive_collect: Option<HandlerPtr<ReceiveCollectEvent>>,
    #[builder(default, setter(strip_option))]
    on_decide: Option<HandlerPtr<DecideEvent>>,
    #[builder(default, setter(strip_option))]
    on_request_state_transfer: Option<HandlerPtr<RequestStateTransferEvent>>,
    #[builder(default, setter(strip_option))]
    on_deliver_state: Option<HandlerPtr<DeliverStateEvent>>,
}

impl<N: Network + 'static, A: App + 'static> ReplicaSpec<N, A> {
    /// Validate the configuration and start the replica. Configuration problems are reported here,
    /// before any thread is spawned or any message sent.
    pub fn start(mut self) -> Result<Replica<N>, ConfigurationError> {
        let config = Arc::new(self.configuration.into_core()?);
        self.network.init_replica_set(config.replicas.clone());

        let event_handlers = EventHandlers::new(
            config.log_events,
            self.on_start_execution,
            self.on_propose,
            self.on_vote,
            self.on_freeze,
            self.on_collect,
            self.on_receive_proposal,
            self.on_receive_vote,
            self.on_receive_freeze,
            self.on_receive_collect,
            self.on_decide,
            self.on_request_state_transfer,
            self.on_deliver_state,
        );
        let (event_publisher, event_bus) = if !event_handlers.is_empty() {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let (shutdown_sender, shutdown) = mpsc::channel();
            let thread = start_event_bus(event_handlers, event_subscriber, shutdown);
            (Some(event_publisher), Some((thread, shutdown_sender)))
        } else {
            (None, None)
        };

        let leader_module = Arc::new(LeaderModule::new(config.n()));
        let manager = Arc::new(ExecutionManager::new(
            config.clone(),
            leader_module.clone(),
            self.state_transfer,
            event_publisher.clone(),
        ));
        let sender = Arc::new(SenderHandle::new(config.clone(), self.network.clone()));
        let app = Arc::new(Mutex::new(self.app));
        let watchdog = Watchdog::new(config.request_timeout);

        let (to_dispatch, from_poller) = mpsc::channel();
        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(self.network, to_dispatch.clone(), poller_shutdown_receiver);

        let acceptor = Arc::new(Acceptor::new(
            config.clone(),
            manager.clone(),
            leader_module.clone(),
            sender.clone(),
            app,
            watchdog.clone(),
            to_dispatch.clone(),
            event_publisher.clone(),
        ));
        let proposer = Arc::new(Proposer::new(
            config.clone(),
            manager.clone(),
            leader_module.clone(),
            sender,
            watchdog.clone(),
            event_publisher,
        ));

        let (watchdog_shutdown, watchdog_shutdown_receiver) = mpsc::channel();
        let watchdog_thread = {
            let acceptor = acceptor.clone();
            start_watchdog(
                watchdog,
                Box::new(move |eid| acceptor.trigger_freeze(eid)),
                watchdog_shutdown_receiver,
            )
        };

        let (dispatch_shutdown, dispatch_shutdown_receiver) = mpsc::channel();
        let dispatch = start_dispatch(
            config.clone(),
            manager.clone(),
            acceptor,
            proposer.clone(),
            from_poller,
            dispatch_shutdown_receiver,
        );

        Ok(Replica {
            config,
            manager,
            leader_module,
            proposer,
            to_dispatch,
            poller: Some(poller),
            poller_shutdown,
            dispatch: Some(dispatch),
            dispatch_shutdown,
            watchdog_thread: Some(watchdog_thread),
            watchdog_shutdown,
            event_bus,
        })
    }
}

/// Spawn the dispatch thread. Before a message reaches a protocol component, the network origin
/// must be the group member the message claims as its sender, and the message must fall inside
/// the admission window.
fn start_dispatch<N: Network + 'static, A: App + 'static>(
    config: Arc<CoreConfig>,
    manager: Arc<ExecutionManager>,
    acceptor: Arc<Acceptor<N, A>>,
    proposer: Arc<Proposer<N>>,
    from_poller: Receiver<(VerifyingKey, ConsensusMessage)>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Dispatch thread disconnected from main thread")
            }
        }

        if let Ok((origin, msg)) = from_poller.try_recv() {
            if config.replicas.position(&origin) != Some(msg.sender()) {
                log::debug!("MisattributedMessage, {}, {}", msg.sender(), msg.eid());
                continue;
            }
            if !manager.check_limits(&msg) {
                continue;
            }
            match msg {
                ConsensusMessage::Collect(collect) => proposer.collect_received(collect),
                msg => acceptor.process_message(msg),
            }
        } else {
            thread::yield_now()
        }
    })
}

/// A handle on a running replica. Dropping it shuts the replica down.
pub struct Replica<N: Network + 'static> {
    config: Arc<CoreConfig>,
    manager: Arc<ExecutionManager>,
    leader_module: Arc<LeaderModule>,
    proposer: Arc<Proposer<N>>,
    to_dispatch: Sender<(VerifyingKey, ConsensusMessage)>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    dispatch: Option<JoinHandle<()>>,
    dispatch_shutdown: Sender<()>,
    watchdog_thread: Option<JoinHandle<()>>,
    watchdog_shutdown: Sender<()>,
    event_bus: Option<(JoinHandle<()>, Sender<()>)>,
}

impl<N: Network + 'static> Replica<N> {
    /// This replica's id: its position in the configured replica set.
    pub fn id(&self) -> ReplicaId {
        self.config.me
    }

    /// Propose a value for the next execution. Returns the execution id it was proposed for, or
    /// None if this replica does not lead the next execution or another one is still in flight.
    pub fn submit(&self, value: Vec<u8>) -> Option<ExecutionId> {
        self.proposer.start_execution(value)
    }

    /// The replica believed to lead the given round of the given execution. Client requests should
    /// be forwarded to the leader of round 0 of the next execution.
    pub fn get_leader(&self, eid: ExecutionId, round: RoundNumber) -> ReplicaId {
        self.leader_module.get_leader(eid, round)
    }

    /// The greatest execution id this replica has seen decide, if any.
    pub fn last_executed(&self) -> Option<ExecutionId> {
        self.manager.last_executed()
    }

    /// Block until the given execution decides, the timeout passes, or the execution is superseded
    /// by state transfer. An execution that already decided and was retired returns None
    /// immediately; callers observe decisions through their [App](crate::app::App) or an event
    /// handler, not by querying old ids.
    pub fn wait_decision(&self, eid: ExecutionId, timeout: Duration) -> Option<Decision> {
        self.manager.undecided_execution(eid)?.wait_decision(timeout)
    }

    /// Hand the core a state snapshot retrieved out-of-band, completing the transfer the core
    /// requested through its [StateTransfer] collaborator. Messages that were buffered beyond the
    /// old window and now fall inside the new one are replayed.
    pub fn deliver_state(&self, state: TransferableState) {
        for msg in self.manager.deliver_state(&state) {
            if let Some(pk) = self.config.replicas.get(msg.sender()) {
                let _ = self.to_dispatch.send((*pk, msg));
            }
        }
    }
}

impl<N: Network + 'static> Drop for Replica<N> {
    fn drop(&mut self) {
        self.poller_shutdown.send(()).unwrap();
        self.poller.take().unwrap().join().unwrap();

        self.dispatch_shutdown.send(()).unwrap();
        self.dispatch.take().unwrap().join().unwrap();

        self.watchdog_shutdown.send(()).unwrap();
        self.watchdog_thread.take().unwrap().join().unwrap();

        if let Some((thread, shutdown)) = self.event_bus.take() {
            shutdown.send(()).unwrap();
            thread.join().unwrap();
        }
    }
}
