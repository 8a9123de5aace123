use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;

// One ticket per path with an origin fetch in flight. The first caller to
// insert a ticket is the leader; everyone else waits for the broadcast and
// re-enters the lookup from the top.
#[derive(Clone, Default)]
pub struct FlightRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Ticket>>>>,
}

struct Ticket {
    done: AtomicBool,
    notify: Notify,
}

pub enum Flight {
    Leader(FlightPermit),
    Follower(FlightWaiter),
}

// Releases the ticket on drop, so the registry is cleaned up on every exit
// path of the leader's work, panics included.
pub struct FlightPermit {
    inner: Arc<RwLock<HashMap<String, Arc<Ticket>>>>,
    ticket: Arc<Ticket>,
    path: String,
}

pub struct FlightWaiter {
    ticket: Arc<Ticket>,
}

impl FlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, path: &str) -> Flight {
        if let Some(ticket) = self.inner.read().expect("flight map").get(path) {
            return Flight::Follower(FlightWaiter {
                ticket: Arc::clone(ticket),
            });
        }

        let mut map = self.inner.write().expect("flight map");
        // Another task may have inserted between the read and write locks.
        if let Some(ticket) = map.get(path) {
            return Flight::Follower(FlightWaiter {
                ticket: Arc::clone(ticket),
            });
        }

        let ticket = Arc::new(Ticket {
            done: AtomicBool::new(false),
            notify: Notify::new(),
        });
        map.insert(path.to_string(), Arc::clone(&ticket));
        Flight::Leader(FlightPermit {
            inner: Arc::clone(&self.inner),
            ticket,
            path: path.to_string(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.read().expect("flight map").len()
    }
}

impl FlightWaiter {
    pub async fn wait(self) {
        loop {
            let notified = self.ticket.notify.notified();
            if self.ticket.done.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(&self.path);
        }
        self.ticket.done.store(true, Ordering::Release);
        self.ticket.notify.notify_waiters();
    }
}
