// dialog.rs - Per-Call-ID history of messages sent by the session

use crate::Message;
use ahash::AHashMap;
use std::collections::VecDeque;
use tracing::debug;

pub const DEFAULT_MAX_DIALOGS: usize = 256;

/// Messages sent under each Call-ID, oldest Call-ID evicted first once
/// `capacity` distinct Call-IDs are held.
#[derive(Debug)]
pub struct DialogTable {
    entries: AHashMap<String, Vec<Message>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for DialogTable {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_DIALOGS)
    }
}

impl DialogTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: AHashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, call_id: &str, message: Message) {
        if let Some(history) = self.entries.get_mut(call_id) {
            history.push(message);
            return;
        }

        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                debug!("Evicting dialog history for Call-ID {}", oldest);
                self.entries.remove(&oldest);
            }
        }

        self.order.push_back(call_id.to_string());
        self.entries.insert(call_id.to_string(), vec![message]);
    }

    pub fn get(&self, call_id: &str) -> Option<&[Message]> {
        self.entries.get(call_id).map(Vec::as_slice)
    }

    /// Most recent request sent under `call_id`.
    pub fn last_request(&self, call_id: &str) -> Option<&Message> {
        self.entries
            .get(call_id)?
            .iter()
            .rev()
            .find(|message| message.is_request())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
