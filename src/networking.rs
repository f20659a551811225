/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for pluggable peer-to-peer networking, as well as the internal
//! types replicas use to interact with the network.
//!
//! The core never blocks on network I/O: sending is fire-and-forget into the provider, and a
//! dedicated poller thread turns the provider's non-blocking `recv` into a channel the dispatch
//! loop can block on. Authentication and encryption of the transport are the provider's concern;
//! the provider vouches for the origin key it returns from [Network::recv].

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::CoreConfig;
use crate::messages::ConsensusMessage;
use crate::types::{ReplicaId, ReplicaSet, VerifyingKey};

pub trait Network: Clone + Send {
    /// Informs the network provider of the replica set on wake-up.
    fn init_replica_set(&mut self, replicas: ReplicaSet);

    /// Send a message to all group members without blocking. The broadcast must also loop the
    /// message back to the sending replica itself: replicas count their own votes by receiving
    /// them like everyone else's.
    fn broadcast(&mut self, message: ConsensusMessage);

    /// Send a message to the specified peer without blocking. A peer may send to itself.
    fn send(&mut self, peer: VerifyingKey, message: ConsensusMessage);

    /// Receive a message from any peer. Returns immediately with a None if no message is
    /// available now.
    fn recv(&mut self) -> Option<(VerifyingKey, ConsensusMessage)>;
}

/// Spawn the poller thread, which polls the [Network] for messages and forwards them into the
/// dispatch queue. The queue's sender is shared: buffered out-of-context messages are replayed
/// through it once they come back into the admission window.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    to_dispatch: Sender<(VerifyingKey, ConsensusMessage)>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some((origin, msg)) = network.recv() {
            let _ = to_dispatch.send((origin, msg));
        } else {
            thread::yield_now()
        }
    })
}

/// A shareable sending end of the network, which resolves replica ids to public keys.
///
/// Messages to peers outside the replica set are silently dropped, mirroring how inbound messages
/// from outsiders are discarded.
pub(crate) struct SenderHandle<N: Network> {
    config: Arc<CoreConfig>,
    network: Mutex<N>,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(config: Arc<CoreConfig>, network: N) -> SenderHandle<N> {
        SenderHandle {
            config,
            network: Mutex::new(network),
        }
    }

    pub(crate) fn broadcast(&self, msg: ConsensusMessage) {
        self.network.lock().unwrap().broadcast(msg)
    }

    pub(crate) fn send(&self, peer: ReplicaId, msg: ConsensusMessage) {
        if let Some(pk) = self.config.replicas.get(peer) {
            self.network.lock().unwrap().send(*pk, msg)
        }
    }
}
