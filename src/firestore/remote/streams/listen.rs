use std::ops::{Deref, DerefMut};

use crate::firestore::local::{TargetData, TargetId};
use crate::firestore::remote::datastore::{ClientMessage, ListenRequest, StreamKind, WatchTarget};
use crate::firestore::remote::stream::{PersistentStream, StreamEnvironment, StreamSettings};

/// Listen stream: adds and removes watch targets.
pub struct WatchStream {
    inner: PersistentStream,
}

impl WatchStream {
    pub fn new(settings: &StreamSettings) -> Self {
        Self {
            inner: PersistentStream::new(StreamKind::Listen, settings),
        }
    }

    pub fn watch(&mut self, env: &StreamEnvironment, target_data: &TargetData) {
        let request = ListenRequest::AddTarget(WatchTarget::from_target_data(target_data));
        self.inner.send(env, ClientMessage::Listen(request));
    }

    pub fn unwatch(&mut self, env: &StreamEnvironment, target_id: TargetId) {
        self.inner
            .send(env, ClientMessage::Listen(ListenRequest::RemoveTarget(target_id)));
    }
}

impl Deref for WatchStream {
    type Target = PersistentStream;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for WatchStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
