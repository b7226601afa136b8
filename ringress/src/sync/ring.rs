//! Bounded, lossy, multi-producer single-consumer channel.
//!
//! The intake between the store's informers and the reconciler. When the
//! buffer is full the oldest event is dropped; loss is safe because every
//! reconciliation rebuilds the model from the store's full state.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

pub fn ring_channel<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        capacity,
    });
    (
        RingSender {
            shared: shared.clone(),
        },
        RingReceiver {
            shared,
        },
    )
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

pub struct RingSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RingSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> RingSender<T> {
    /// Never blocks; drops the oldest buffered item on overflow.
    pub fn send(&self, item: T) {
        let mut queue = self.shared.queue.lock().expect("ring buffer poisoned");
        if queue.len() == self.shared.capacity {
            queue.pop_front();
            tracing::debug!("Event buffer full, dropping oldest event");
        }
        queue.push_back(item);
        drop(queue);
        self.shared.notify.notify_one();
    }
}

pub struct RingReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> RingReceiver<T> {
    pub async fn recv(&mut self) -> T {
        loop {
            if let Some(item) = self
                .shared
                .queue
                .lock()
                .expect("ring buffer poisoned")
                .pop_front()
            {
                return item;
            }
            self.shared.notify.notified().await;
        }
    }
}
