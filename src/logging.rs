/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [config](crate::config::Configuration).
//!
//! Logging goes through the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. Hashes are rendered as the first
//! seven characters of their Base64 encoding.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const START_EXECUTION: &str = "StartExecution";
pub const PROPOSE: &str = "Propose";
pub const VOTE: &str = "Vote";
pub const FREEZE: &str = "Freeze";
pub const COLLECT: &str = "Collect";

pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const RECEIVE_VOTE: &str = "ReceiveVote";
pub const RECEIVE_FREEZE: &str = "ReceiveFreeze";
pub const RECEIVE_COLLECT: &str = "ReceiveCollect";

pub const DECIDE: &str = "Decide";
pub const REQUEST_STATE_TRANSFER: &str = "RequestStateTransfer";
pub const DELIVER_STATE: &str = "DeliverState";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for StartExecutionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartExecutionEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_EXECUTION,
                secs_since_unix_epoch(event.timestamp),
                event.eid,
                first_seven_base64_chars(&event.value_hash),
            )
        })
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(event.timestamp),
                event.eid,
                event.round,
                first_seven_base64_chars(&event.value_hash),
            )
        })
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &VoteEvent| {
            log::info!(
                "{}, {}, {:?}, {}, {}, {}",
                VOTE,
                secs_since_unix_epoch(event.timestamp),
                event.kind,
                event.eid,
                event.round,
                first_seven_base64_chars(&event.value_hash),
            )
        })
    }
}

impl Logger for FreezeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &FreezeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                FREEZE,
                secs_since_unix_epoch(event.timestamp),
                event.eid,
                event.round,
            )
        })
    }
}

impl Logger for CollectEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CollectEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COLLECT,
                secs_since_unix_epoch(event.timestamp),
                event.eid,
                event.round,
                event.leader,
            )
        })
    }
}

impl Logger for ReceiveProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PROPOSAL,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.eid,
                event.round,
                first_seven_base64_chars(&event.value_hash),
            )
        })
    }
}

impl Logger for ReceiveVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveVoteEvent| {
            log::info!(
                "{}, {}, {}, {:?}, {}, {}, {}",
                RECEIVE_VOTE,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.kind,
                event.eid,
                event.round,
                first_seven_base64_chars(&event.value_hash),
            )
        })
    }
}

impl Logger for ReceiveFreezeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveFreezeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_FREEZE,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.eid,
                event.round,
            )
        })
    }
}

impl Logger for ReceiveCollectEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveCollectEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_COLLECT,
                secs_since_unix_epoch(event.timestamp),
                event.origin,
                event.eid,
                event.round,
                event.leader,
            )
        })
    }
}

impl Logger for DecideEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &DecideEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                DECIDE,
                secs_since_unix_epoch(event.timestamp),
                event.eid,
                event.round,
                first_seven_base64_chars(&event.value_hash),
            )
        })
    }
}

impl Logger for RequestStateTransferEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &RequestStateTransferEvent| {
            log::info!(
                "{}, {}, {}",
                REQUEST_STATE_TRANSFER,
                secs_since_unix_epoch(event.timestamp),
                event.eid,
            )
        })
    }
}

impl Logger for DeliverStateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &DeliverStateEvent| {
            log::info!(
                "{}, {}, {}",
                DELIVER_STATE,
                secs_since_unix_epoch(event.timestamp),
                event.last_eid,
            )
        })
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
