//! Diagnostic registry of live sockets.
//!
//! Sockets bound with a registry in their [`Config`](crate::Config) register
//! on bind and drop out at teardown. Nothing in the protocol consults it.

use crate::socket::SocketInner;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};

#[derive(Clone, Default)]
pub struct Registry {
    sockets: Arc<Mutex<Vec<Weak<SocketInner>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, socket: &Arc<SocketInner>) {
        let mut sockets = self.sockets.lock();
        sockets.retain(|s| s.strong_count() > 0);
        sockets.push(Arc::downgrade(socket));
    }

    pub(crate) fn unregister(&self, socket: &SocketInner) {
        self.sockets
            .lock()
            .retain(|s| s.strong_count() > 0 && !std::ptr::eq(s.as_ptr(), socket));
    }

    /// Live sockets.
    pub fn len(&self) -> usize {
        self.sockets
            .lock()
            .iter()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dumps every live socket and each of its connections.
    pub fn write_status(&self, w: &mut impl io::Write) -> io::Result<()> {
        // Upgrade under the lock, write without it: a socket tearing down
        // concurrently unregisters through the same lock.
        let live: Vec<Arc<SocketInner>> =
            self.sockets.lock().iter().filter_map(Weak::upgrade).collect();
        writeln!(w, "{} sockets", live.len())?;
        for socket in &live {
            socket.write_status(w)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("sockets", &self.len())
            .finish()
    }
}
