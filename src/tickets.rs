use std::sync::Arc;

use dashmap::DashMap;

use crate::users::User;

// Short-lived mapping from a session identifier to the user proven during
// authentication. Written by the SSH auth callback, consumed exactly once
// when the session configuration arrives, removed on connection teardown if
// never consumed.
#[derive(Default)]
pub(crate) struct TicketStore(DashMap<usize, Arc<User>>);

impl TicketStore {
    pub(crate) fn put(&self, session_id: usize, user: Arc<User>) {
        self.0.insert(session_id, user);
    }

    // Take-and-remove. A second take for the same session returns None.
    pub(crate) fn take(&self, session_id: usize) -> Option<Arc<User>> {
        self.0.remove(&session_id).map(|(_, user)| user)
    }

    pub(crate) fn remove(&self, session_id: usize) {
        self.0.remove(&session_id);
    }
}
