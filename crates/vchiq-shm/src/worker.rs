//! Per-transport worker threads.
//!
//! Two threads per side, mirroring the two local events: the trigger worker
//! drains the peer's message stream, the recycle worker turns returned
//! slots into TX permits. Both park on their event word and exit when the
//! transport's cancel token fires.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::transport::Transport;

pub struct Workers {
    trigger: JoinHandle<()>,
    recycle: JoinHandle<()>,
}

impl Workers {
    pub fn join(self) {
        // A worker panic is a bug; surface it instead of swallowing it
        self.trigger.join().unwrap();
        self.recycle.join().unwrap();
    }
}

/// Spawn the trigger and recycle workers for one transport.
pub fn spawn(transport: Arc<Transport>) -> io::Result<Workers> {
    let role = transport.role().name();
    let trigger = thread::Builder::new()
        .name(format!("vchiq-trigger-{role}"))
        .spawn({
            let transport = transport.clone();
            move || trigger_loop(&transport)
        })?;
    let recycle = thread::Builder::new()
        .name(format!("vchiq-recycle-{role}"))
        .spawn(move || recycle_loop(&transport))?;
    Ok(Workers { trigger, recycle })
}

fn trigger_loop(transport: &Transport) {
    trace!(role = transport.role().name(), "trigger worker up");
    loop {
        // Drain first: the event may have fired before we were running
        transport.process_rx();
        if transport
            .local_trigger()
            .wait(None, transport.cancel_token())
            .is_err()
        {
            break;
        }
    }
    trace!(role = transport.role().name(), "trigger worker down");
}

fn recycle_loop(transport: &Transport) {
    trace!(role = transport.role().name(), "recycle worker up");
    loop {
        transport.process_recycle();
        if transport
            .local_recycle()
            .wait(None, transport.cancel_token())
            .is_err()
        {
            break;
        }
    }
    trace!(role = transport.role().name(), "recycle worker down");
}
