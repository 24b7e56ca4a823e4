//! The per-connection session state machine.
//!
//! One [`Session`] wraps one byte stream (normally a TCP socket) and moves
//! through `Handshaking → Ready → Closed`. Any codec or I/O error, and any
//! frame of an unexpected type, closes the session permanently; subsequent
//! operations return [`ProtocolError::SessionClosed`].
//!
//! Requests and responses are strictly alternated: at most one request is
//! outstanding per session, and a streaming command's data frames must be
//! fully produced or consumed before the next request. Exclusive `&mut`
//! access serializes sends; callers that share a session across threads own
//! that arrangement.

use std::io::{Read, Write};

use log::{debug, trace};

use crate::protocol::wire::Map;
use crate::protocol::{
    self, Data, Hello, Message, ProtocolError, Request, Response, CHUNK_SIZE, PROTOCOL_VERSION,
};

/// How far a data stream may run past its advertised size before the
/// receiver declares a protocol failure.
const OVERRUN_SLACK: u64 = CHUNK_SIZE as u64;

/// Which half of the bridge this session belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    /// The workstation client.
    Client,
    /// The on-target agent.
    Agent,
}

/// Lifecycle state of a session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    /// Created; no handshake yet.
    Handshaking,
    /// Handshake complete; requests may flow.
    Ready,
    /// Torn down; every operation fails.
    Closed,
}

/// The protocol state machine for one connection.
pub struct Session<S: Read + Write> {
    stream: S,
    role: Role,
    state: SessionState,
    peer_version: u64,
    next_id: u32,
}

impl<S: Read + Write> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer_version", &self.peer_version)
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl<S: Read + Write> Session<S> {
    /// Wraps a connected stream. The session starts in `Handshaking`; call
    /// [`Session::handshake`] before anything else.
    pub fn new(stream: S, role: Role) -> Self {
        Session {
            stream,
            role,
            state: SessionState::Handshaking,
            peer_version: 0,
            // Pre-incremented on allocation, so the first request id is 2.
            next_id: 1,
        }
    }

    /// Wraps a stream and performs the handshake in one step.
    pub fn establish(stream: S, role: Role, is_initiator: bool) -> Result<Self, ProtocolError> {
        let mut session = Session::new(stream, role);
        session.handshake(is_initiator)?;
        Ok(session)
    }

    /// This session's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The protocol version the peer advertised during the handshake.
    pub fn peer_version(&self) -> u64 {
        self.peer_version
    }

    /// Marks the session closed. Idempotent; the underlying socket is
    /// released when the session is dropped.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            debug!("closing session");
            self.state = SessionState::Closed;
        }
    }

    fn poison(&mut self, err: ProtocolError) -> ProtocolError {
        if self.state != SessionState::Closed {
            debug!("session error, closing: {err}");
            self.state = SessionState::Closed;
        }
        err
    }

    fn check_ready(&self) -> Result<(), ProtocolError> {
        match self.state {
            SessionState::Ready => Ok(()),
            _ => Err(ProtocolError::SessionClosed),
        }
    }

    fn write_raw(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        trace!("send {}", msg.type_name());
        match protocol::write_message(&mut self.stream, msg) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.poison(e)),
        }
    }

    fn read_raw(&mut self) -> Result<Message, ProtocolError> {
        match protocol::read_message(&mut self.stream) {
            Ok(msg) => {
                trace!("recv {}", msg.type_name());
                Ok(msg)
            }
            Err(e) => Err(self.poison(e)),
        }
    }

    /// Performs the version handshake.
    ///
    /// Whichever side initiated the TCP connection sends `hello` and expects
    /// `hello_ack`; the acceptor does the reverse. This is independent of
    /// the client/agent role, so both bind and reverse connection modes are
    /// covered by the `is_initiator` flag. The acceptor tolerates any peer
    /// version >= 1 and echoes its own version.
    pub fn handshake(&mut self, is_initiator: bool) -> Result<(), ProtocolError> {
        if self.state != SessionState::Handshaking {
            return Err(ProtocolError::SessionClosed);
        }

        let ours = Hello {
            version: PROTOCOL_VERSION,
            agent: self.role == Role::Agent,
        };

        if is_initiator {
            self.write_raw(&Message::Hello(ours))?;
            match self.read_raw()? {
                Message::HelloAck(theirs) => self.accept_peer(theirs)?,
                other => {
                    return Err(self.poison(ProtocolError::UnexpectedType {
                        expected: "hello_ack",
                        got: other.type_name().to_owned(),
                    }))
                }
            }
        } else {
            match self.read_raw()? {
                Message::Hello(theirs) => self.accept_peer(theirs)?,
                other => {
                    return Err(self.poison(ProtocolError::UnexpectedType {
                        expected: "hello",
                        got: other.type_name().to_owned(),
                    }))
                }
            }
            self.write_raw(&Message::HelloAck(ours))?;
        }

        self.state = SessionState::Ready;
        debug!(
            "handshake complete as {:?}; peer version {}",
            self.role, self.peer_version
        );
        Ok(())
    }

    fn accept_peer(&mut self, theirs: Hello) -> Result<(), ProtocolError> {
        if theirs.version < 1 {
            return Err(self.poison(ProtocolError::UnsupportedVersion(theirs.version)));
        }
        self.peer_version = theirs.version;
        Ok(())
    }

    fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        self.check_ready()?;
        self.write_raw(msg)
    }

    fn recv(&mut self) -> Result<Message, ProtocolError> {
        self.check_ready()?;
        self.read_raw()
    }

    fn next_request_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Sends one request, returning the allocated id. Client side.
    pub fn send_request(&mut self, cmd: &str, args: Map) -> Result<u32, ProtocolError> {
        self.check_ready()?;
        let id = self.next_request_id();
        self.write_raw(&Message::Request(Request {
            id,
            cmd: cmd.to_owned(),
            args,
        }))?;
        Ok(id)
    }

    /// Receives one response, failing the session on any other frame type.
    pub fn recv_response(&mut self) -> Result<Response, ProtocolError> {
        match self.recv()? {
            Message::Response(r) => Ok(r),
            other => Err(self.poison(ProtocolError::UnexpectedType {
                expected: "resp",
                got: other.type_name().to_owned(),
            })),
        }
    }

    /// Receives one request, or `None` when the peer closed cleanly at a
    /// frame boundary. Agent side.
    pub fn recv_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        self.check_ready()?;
        match protocol::read_message_opt(&mut self.stream) {
            Ok(None) => {
                debug!("peer closed the connection");
                self.state = SessionState::Closed;
                Ok(None)
            }
            Ok(Some(Message::Request(r))) => {
                trace!("recv req {} {}", r.id, r.cmd);
                Ok(Some(r))
            }
            Ok(Some(other)) => Err(self.poison(ProtocolError::UnexpectedType {
                expected: "req",
                got: other.type_name().to_owned(),
            })),
            Err(e) => Err(self.poison(e)),
        }
    }

    /// Sends one response. Agent side.
    pub fn send_response(&mut self, resp: Response) -> Result<(), ProtocolError> {
        self.send(&Message::Response(resp))
    }

    /// Sends one data frame.
    pub fn send_data(&mut self, data: Data) -> Result<(), ProtocolError> {
        self.send(&Message::Data(data))
    }

    /// Receives the next frame of a data stream, validating correlation id
    /// and sequence number. Any violation is fatal.
    pub fn recv_stream_data(&mut self, id: u32, seq: u32) -> Result<Data, ProtocolError> {
        let data = match self.recv()? {
            Message::Data(d) => d,
            other => {
                return Err(self.poison(ProtocolError::UnexpectedType {
                    expected: "data",
                    got: other.type_name().to_owned(),
                }))
            }
        };
        if data.id != id {
            return Err(self.poison(ProtocolError::Stream(format!(
                "data frame for request {} inside stream {id}",
                data.id
            ))));
        }
        if data.seq != seq {
            return Err(self.poison(ProtocolError::Stream(format!(
                "sequence gap: expected {seq}, got {}",
                data.seq
            ))));
        }
        Ok(data)
    }

    /// Consumes an entire data stream of `total` advertised bytes,
    /// returning the assembled payload.
    ///
    /// `on_progress` is invoked as `(received, total)` after every frame.
    /// A stream running more than one chunk past `total`, or ending with
    /// `done` before `total` bytes arrived, is a fatal protocol failure.
    pub fn recv_data_stream(
        &mut self,
        id: u32,
        total: u64,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(total.min(protocol::MAX_FRAME_LEN as u64) as usize);
        let mut seq: u32 = 0;
        let mut received: u64 = 0;
        loop {
            let data = self.recv_stream_data(id, seq)?;
            received += data.chunk.len() as u64;
            if received > total + OVERRUN_SLACK {
                return Err(self.poison(ProtocolError::Stream(format!(
                    "stream delivered {received} bytes, advertised {total}"
                ))));
            }
            buf.extend_from_slice(&data.chunk);
            on_progress(received, total);
            if data.done {
                if received < total {
                    return Err(self.poison(ProtocolError::Stream(format!(
                        "stream truncated at {received} of {total} bytes"
                    ))));
                }
                return Ok(buf);
            }
            seq += 1;
        }
    }

    /// Produces a complete data stream from `bytes` in 64 KiB chunks.
    ///
    /// Exactly one frame carries `done`, and it is the last; empty input
    /// yields a single empty `done` frame. `on_progress` is invoked as
    /// `(sent, total)` after every frame.
    pub fn send_data_stream(
        &mut self,
        id: u32,
        bytes: &[u8],
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), ProtocolError> {
        let total = bytes.len() as u64;
        let mut seq: u32 = 0;
        let mut off = 0;
        loop {
            let end = (off + CHUNK_SIZE).min(bytes.len());
            let done = end == bytes.len();
            self.send_data(Data {
                id,
                seq,
                chunk: bytes[off..end].to_vec(),
                done,
            })?;
            on_progress(end as u64, total);
            if done {
                return Ok(());
            }
            seq += 1;
            off = end;
        }
    }
}
