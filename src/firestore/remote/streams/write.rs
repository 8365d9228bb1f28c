use std::ops::{Deref, DerefMut};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::datastore::{ClientMessage, StreamKind, WriteRequest, WriteResponse};
use crate::firestore::remote::stream::{
    PersistentStream, StreamEnvironment, StreamSettings, StreamState,
};

/// What a write stream response means for the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteStreamResponse {
    HandshakeComplete,
    MutationResults {
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    },
}

/// Write stream: a handshake followed by mutation batches, each answered in
/// order.
pub struct WriteStream {
    inner: PersistentStream,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

impl WriteStream {
    pub fn new(settings: &StreamSettings) -> Self {
        Self {
            inner: PersistentStream::new(StreamKind::Write, settings),
            handshake_complete: false,
            last_stream_token: Vec::new(),
        }
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, stream_token: Vec<u8>) {
        self.last_stream_token = stream_token;
    }

    pub fn start(&mut self, env: &StreamEnvironment) {
        self.handshake_complete = false;
        self.inner.start(env);
    }

    /// Reconnects need a fresh handshake.
    pub fn on_backoff_elapsed(&mut self, env: &StreamEnvironment) -> bool {
        if self.inner.state() == StreamState::Backoff {
            self.handshake_complete = false;
        }
        self.inner.on_backoff_elapsed(env)
    }

    /// Flushes an empty write so the server can release the stream token
    /// before closing.
    pub fn stop(&mut self, env: &StreamEnvironment) {
        if self.inner.is_open() && self.handshake_complete {
            self.write_mutations(env, Vec::new());
        }
        self.inner.stop(env);
    }

    pub fn write_handshake(&mut self, env: &StreamEnvironment) {
        self.inner.send(env, ClientMessage::Write(WriteRequest::Handshake));
    }

    pub fn write_mutations(&mut self, env: &StreamEnvironment, mutations: Vec<Mutation>) {
        let request = WriteRequest::Mutations {
            stream_token: self.last_stream_token.clone(),
            mutations,
        };
        self.inner.send(env, ClientMessage::Write(request));
    }

    /// Tracks the stream token and classifies the response. The first response
    /// after a (re)connect is always the handshake.
    pub fn handle_response(&mut self, response: WriteResponse) -> FirestoreResult<WriteStreamResponse> {
        self.last_stream_token = response.stream_token;
        if !self.handshake_complete {
            if !response.write_results.is_empty() {
                return Err(internal_error("handshake response carried write results"));
            }
            self.handshake_complete = true;
            return Ok(WriteStreamResponse::HandshakeComplete);
        }
        // The first write acknowledgement, not the handshake, proves the
        // stream is usable.
        self.inner.reset_backoff();
        let commit_version = response
            .commit_version
            .ok_or_else(|| internal_error("write response without a commit version"))?;
        Ok(WriteStreamResponse::MutationResults {
            commit_version,
            results: response.write_results,
        })
    }
}

impl Deref for WriteStream {
    type Target = PersistentStream;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for WriteStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    #[test]
    fn first_response_completes_handshake() {
        let mut stream = WriteStream::new(&StreamSettings::default());
        let response = stream
            .handle_response(WriteResponse::handshake(b"t1".to_vec()))
            .unwrap();
        assert_eq!(response, WriteStreamResponse::HandshakeComplete);
        assert!(stream.handshake_complete());
        assert_eq!(stream.last_stream_token(), b"t1");

        let version = SnapshotVersion::new(Timestamp::new(3, 0));
        let response = stream
            .handle_response(WriteResponse::committed(
                b"t2".to_vec(),
                version,
                vec![MutationResult::new(version)],
            ))
            .unwrap();
        assert_eq!(
            response,
            WriteStreamResponse::MutationResults {
                commit_version: version,
                results: vec![MutationResult::new(version)],
            }
        );
        assert_eq!(stream.last_stream_token(), b"t2");
    }

    #[test]
    fn acknowledgement_without_version_is_rejected() {
        let mut stream = WriteStream::new(&StreamSettings::default());
        stream.handle_response(WriteResponse::handshake(Vec::new())).unwrap();
        assert!(stream.handle_response(WriteResponse::handshake(Vec::new())).is_err());
    }
}
