use crate::{
    stream::{BlockKind, Stream, StreamState},
    types::*,
};
use log::trace;
use std::collections::{HashMap, VecDeque};

/// How many recently closed stream ids are remembered. Frames racing a close
/// get lenient treatment while the id is in this window.
const CLOSED_GRACE: usize = 32;

/// Owns every stream of one connection and allocates outbound ids. All access
/// happens under the connection state lock.
pub struct StreamCoordinator {
    role: Role,
    next_local: StreamId,
    /// Highest peer-initiated id for which processing has begun.
    highest_remote: StreamId,
    streams: HashMap<NonZeroStreamId, Stream>,
    recently_closed: VecDeque<NonZeroStreamId>,
}

impl StreamCoordinator {
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            next_local: role.first_local_id(),
            highest_remote: 0,
            streams: HashMap::new(),
            recently_closed: VecDeque::with_capacity(CLOSED_GRACE),
        }
    }

    fn block_kind(&self) -> BlockKind {
        match self.role {
            Role::Client => BlockKind::Response,
            Role::Server => BlockKind::Request,
        }
    }

    /// Allocates the next outbound stream. Ids are odd on a client, even on a
    /// server, strictly increasing, never reused.
    pub fn create_local(
        &mut self,
        send_window: i32,
        recv_window: i32,
    ) -> Result<&mut Stream, H2Error> {
        let id = NonZeroStreamId::new(self.next_local)
            .filter(|id| id.get() <= U31_MAX.get())
            .ok_or_else(|| {
                H2Error::Connection(ErrorType::ProtocolError, "stream ids exhausted".to_owned())
            })?;
        self.next_local += 2;
        trace!("created local stream {}", id);
        let kind = self.block_kind();
        Ok(self
            .streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, kind, send_window, recv_window)))
    }

    /// Admits a peer-initiated stream first seen on a HEADERS frame (or the
    /// promised id of a PUSH_PROMISE, with `promised` set).
    pub fn create_remote(
        &mut self,
        id: NonZeroStreamId,
        promised: bool,
        send_window: i32,
        recv_window: i32,
    ) -> Result<&mut Stream, H2Error> {
        // a promised id is chosen from the server's (sender's) half
        let expect_peer_parity = !promised;
        if self.role.is_peer_initiated(id.get()) != expect_peer_parity {
            return Err(H2Error::Connection(
                ErrorType::ProtocolError,
                format!("stream id {} has the wrong parity", id),
            ));
        }
        if !promised {
            if id.get() <= self.highest_remote {
                return Err(H2Error::Connection(
                    ErrorType::ProtocolError,
                    format!("stream id {} is not increasing", id),
                ));
            }
            self.highest_remote = id.get();
        }
        trace!("created remote stream {}", id);
        let kind = self.block_kind();
        Ok(self
            .streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, kind, send_window, recv_window)))
    }

    pub fn get_mut(&mut self, id: NonZeroStreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Drops a finished stream, remembering its id for the grace period.
    pub fn remove(&mut self, id: NonZeroStreamId) -> Option<Stream> {
        let stream = self.streams.remove(&id)?;
        if self.recently_closed.len() == CLOSED_GRACE {
            self.recently_closed.pop_back();
        }
        self.recently_closed.push_front(id);
        Some(stream)
    }

    /// True if `id` was allocated at some point, i.e. a frame for it is late
    /// rather than invented.
    pub fn is_past(&self, id: NonZeroStreamId) -> bool {
        if self.role.is_peer_initiated(id.get()) {
            id.get() <= self.highest_remote
        } else {
            id.get() < self.next_local
        }
    }

    pub fn was_recently_closed(&self, id: NonZeroStreamId) -> bool {
        self.recently_closed.contains(&id)
    }

    pub fn highest_remote(&self) -> StreamId {
        self.highest_remote
    }

    /// Applies an INITIAL_WINDOW_SIZE delta to every stream's send window.
    pub fn adjust_send_windows(&mut self, delta: i32) -> Result<(), H2Error> {
        for stream in self.streams.values_mut() {
            stream.send_window = stream.send_window.checked_add(delta).ok_or_else(|| {
                H2Error::Connection(
                    ErrorType::FlowControlError,
                    format!("window of stream {} overflowed", stream.id),
                )
            })?;
        }
        Ok(())
    }

    pub fn open_local_count(&self) -> usize {
        self.streams
            .values()
            .filter(|stream| {
                !self.role.is_peer_initiated(stream.id.get())
                    && stream.state != StreamState::Closed
            })
            .count()
    }

    pub fn open_remote_count(&self) -> usize {
        self.streams
            .values()
            .filter(|stream| {
                self.role.is_peer_initiated(stream.id.get())
                    && stream.state != StreamState::Closed
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Rejects and drops every stream; used when the connection dies.
    pub fn reject_all(&mut self, mut err: impl FnMut() -> H2Error) {
        for (_, mut stream) in self.streams.drain() {
            stream.reject(err());
        }
    }

    /// Rejects local streams the peer's GOAWAY declared unprocessed.
    pub fn reject_beyond(&mut self, last_stream: StreamId) {
        let doomed: Vec<_> = self
            .streams
            .keys()
            .filter(|id| !self.role.is_peer_initiated(id.get()) && id.get() > last_stream)
            .copied()
            .collect();
        for id in doomed {
            if let Some(mut stream) = self.streams.remove(&id) {
                stream.reject(H2Error::GoingAway);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_odd_and_increasing() {
        let mut streams = StreamCoordinator::new(Role::Client);
        let ids: Vec<_> = (0..10)
            .map(|_| streams.create_local(65_535, 65_535).unwrap().id.get())
            .collect();
        assert_eq!(ids, vec![1, 3, 5, 7, 9, 11, 13, 15, 17, 19]);
    }

    #[test]
    fn server_ids_are_even() {
        let mut streams = StreamCoordinator::new(Role::Server);
        assert_eq!(streams.create_local(65_535, 65_535).unwrap().id.get(), 2);
        assert_eq!(streams.create_local(65_535, 65_535).unwrap().id.get(), 4);
    }

    #[test]
    fn remote_parity_is_enforced() {
        let mut streams = StreamCoordinator::new(Role::Server);
        // a server only accepts odd ids from its peer
        assert!(streams
            .create_remote(NonZeroStreamId::new(2).unwrap(), false, 65_535, 65_535)
            .is_err());
        assert!(streams
            .create_remote(NonZeroStreamId::new(1).unwrap(), false, 65_535, 65_535)
            .is_ok());
    }

    #[test]
    fn remote_ids_must_increase() {
        let mut streams = StreamCoordinator::new(Role::Server);
        streams
            .create_remote(NonZeroStreamId::new(5).unwrap(), false, 65_535, 65_535)
            .unwrap();
        assert!(streams
            .create_remote(NonZeroStreamId::new(3).unwrap(), false, 65_535, 65_535)
            .is_err());
    }

    #[test]
    fn window_delta_applies_to_every_stream() {
        let mut streams = StreamCoordinator::new(Role::Client);
        let first = streams.create_local(100, 65_535).unwrap().id;
        let second = streams.create_local(100, 65_535).unwrap().id;
        streams.adjust_send_windows(-150).unwrap();
        assert_eq!(streams.get_mut(first).unwrap().send_window, -50);
        assert_eq!(streams.get_mut(second).unwrap().send_window, -50);
    }

    #[test]
    fn window_delta_overflow_is_an_error() {
        let mut streams = StreamCoordinator::new(Role::Client);
        let id = streams.create_local(65_535, 65_535).unwrap().id;
        streams.get_mut(id).unwrap().send_window = i32::MAX;
        assert!(streams.adjust_send_windows(1).is_err());
    }

    #[test]
    fn removed_ids_stay_in_the_grace_window() {
        let mut streams = StreamCoordinator::new(Role::Client);
        let id = streams.create_local(65_535, 65_535).unwrap().id;
        assert!(!streams.was_recently_closed(id));
        streams.remove(id);
        assert!(streams.was_recently_closed(id));
        assert!(streams.is_past(id));
    }
}
