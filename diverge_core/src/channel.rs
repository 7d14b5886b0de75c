use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// The shared-memory exchange between two paired engine processes that run
/// the same units and compare observable output. The core only publishes
/// and compares; transport and process pairing live behind this trait.
pub trait EquivalenceChannel: Send {
    fn is_client(&self) -> bool;
    fn is_server(&self) -> bool;
    fn write_bytes(&mut self, data: &[u8]);
    /// Signals the server that the client's payload is ready.
    fn post_client(&mut self);
    /// Blocks until the server has published its payload.
    fn wait_server(&mut self);
    fn read_bytes(&mut self) -> Vec<u8>;
}

#[derive(Default)]
struct PairState {
    client_payload: VecDeque<Vec<u8>>,
    server_payload: VecDeque<Vec<u8>>,
    client_posted: bool,
}

struct PairShared {
    state: Mutex<PairState>,
    server_ready: Condvar,
}

/// In-process implementation of the channel, one handle per role. Used by
/// tests and by same-process target pairs.
pub struct PairedChannel {
    shared: Arc<PairShared>,
    client: bool,
}

impl PairedChannel {
    pub fn pair() -> (PairedChannel, PairedChannel) {
        let shared = Arc::new(PairShared {
            state: Mutex::new(PairState::default()),
            server_ready: Condvar::new(),
        });
        (
            PairedChannel {
                shared: shared.clone(),
                client: true,
            },
            PairedChannel {
                shared,
                client: false,
            },
        )
    }
}

impl EquivalenceChannel for PairedChannel {
    fn is_client(&self) -> bool {
        self.client
    }

    fn is_server(&self) -> bool {
        !self.client
    }

    fn write_bytes(&mut self, data: &[u8]) {
        let mut state = self.shared.state.lock().unwrap();
        if self.client {
            state.client_payload.push_back(data.to_vec());
        } else {
            state.server_payload.push_back(data.to_vec());
            self.shared.server_ready.notify_all();
        }
    }

    fn post_client(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.client_posted = true;
    }

    fn wait_server(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        while state.server_payload.is_empty() {
            state = self.shared.server_ready.wait(state).unwrap();
        }
    }

    fn read_bytes(&mut self) -> Vec<u8> {
        let mut state = self.shared.state.lock().unwrap();
        let queue = if self.client {
            &mut state.server_payload
        } else {
            &mut state.client_payload
        };
        queue.pop_front().unwrap_or_default()
    }
}
