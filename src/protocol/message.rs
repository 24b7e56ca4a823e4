//! The five typed messages carried as frame payloads.
//!
//! Every message is a map with a mandatory `"type"` string field. Decoders
//! iterate the map, decode recognized keys, skip unknown ones, and verify
//! the mandatory fields of the discriminated type afterwards.

use super::wire::{Kind, Map, WireReader, WireWriter};
use super::ProtocolError;

/// Handshake greeting, sent by whichever side initiated the TCP connection.
///
/// The same shape serves both `hello` and `hello_ack`; only the `type`
/// discriminator differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Advertised protocol version.
    pub version: u64,
    /// True when the sender plays the agent role.
    pub agent: bool,
}

/// A command request, client to agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id, allocated by the client.
    pub id: u32,
    /// Opcode string.
    pub cmd: String,
    /// Command arguments.
    pub args: Map,
}

/// The reply to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Correlation id of the request this answers.
    pub id: u32,
    /// Whether the command succeeded.
    pub ok: bool,
    /// Result data; empty unless `ok`.
    pub data: Map,
    /// Failure description; empty unless `!ok`.
    pub error: String,
}

impl Response {
    /// A successful response carrying `data`.
    pub fn success(id: u32, data: Map) -> Self {
        Response {
            id,
            ok: true,
            data,
            error: String::new(),
        }
    }

    /// A failed response carrying an error string.
    pub fn failure(id: u32, error: impl Into<String>) -> Self {
        Response {
            id,
            ok: false,
            data: Map::new(),
            error: error.into(),
        }
    }
}

/// One chunk of a streaming transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    /// Correlation id of the streaming request.
    pub id: u32,
    /// Chunk sequence number, starting at 0 and contiguous.
    pub seq: u32,
    /// Chunk bytes. May be empty: with `done` unset this is a keep-alive
    /// marker, with `done` set it terminates the transfer.
    pub chunk: Vec<u8>,
    /// True on the last frame of the stream, and only there.
    pub done: bool,
}

/// Any message that can appear on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake greeting from the connection initiator.
    Hello(Hello),
    /// Handshake acknowledgement from the acceptor.
    HelloAck(Hello),
    /// A command request.
    Request(Request),
    /// A command response.
    Response(Response),
    /// A streaming transfer chunk.
    Data(Data),
}

impl Message {
    /// The wire value of this message's `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::HelloAck(_) => "hello_ack",
            Message::Request(_) => "req",
            Message::Response(_) => "resp",
            Message::Data(_) => "data",
        }
    }

    /// Encodes the message into a complete frame payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(64);
        {
            let mut w = WireWriter::new(&mut buf);
            match self {
                Message::Hello(h) | Message::HelloAck(h) => {
                    w.write_map_header(3)?;
                    w.write_str("type")?;
                    w.write_str(self.type_name())?;
                    w.write_str("version")?;
                    w.write_uint(h.version)?;
                    w.write_str("agent")?;
                    w.write_bool(h.agent)?;
                }
                Message::Request(r) => {
                    w.write_map_header(4)?;
                    w.write_str("type")?;
                    w.write_str("req")?;
                    w.write_str("id")?;
                    w.write_uint(u64::from(r.id))?;
                    w.write_str("cmd")?;
                    w.write_str(&r.cmd)?;
                    w.write_str("args")?;
                    r.args.write(&mut w)?;
                }
                Message::Response(r) => {
                    w.write_map_header(4)?;
                    w.write_str("type")?;
                    w.write_str("resp")?;
                    w.write_str("id")?;
                    w.write_uint(u64::from(r.id))?;
                    w.write_str("ok")?;
                    w.write_bool(r.ok)?;
                    if r.ok {
                        w.write_str("data")?;
                        r.data.write(&mut w)?;
                    } else {
                        w.write_str("error")?;
                        w.write_str(&r.error)?;
                    }
                }
                Message::Data(d) => {
                    w.write_map_header(5)?;
                    w.write_str("type")?;
                    w.write_str("data")?;
                    w.write_str("id")?;
                    w.write_uint(u64::from(d.id))?;
                    w.write_str("seq")?;
                    w.write_uint(u64::from(d.seq))?;
                    w.write_str("data")?;
                    w.write_bin(&d.chunk)?;
                    w.write_str("done")?;
                    w.write_bool(d.done)?;
                }
            }
        }
        Ok(buf)
    }

    /// Decodes a complete frame payload.
    pub fn decode(payload: &[u8]) -> Result<Message, ProtocolError> {
        let mut r = WireReader::new(payload);

        let mut typ: Option<&str> = None;
        let mut version: Option<u64> = None;
        let mut agent: Option<bool> = None;
        let mut id: Option<u64> = None;
        let mut cmd: Option<&str> = None;
        let mut args: Option<Map> = None;
        let mut ok: Option<bool> = None;
        let mut data_map: Option<Map> = None;
        let mut data_bin: Option<Vec<u8>> = None;
        let mut error: Option<&str> = None;
        let mut seq: Option<u64> = None;
        let mut done: Option<bool> = None;

        let n = r.read_map_header()?;
        for _ in 0..n {
            let key = r.read_str()?;
            match key {
                "type" => typ = Some(r.read_str()?),
                "version" => version = Some(r.read_uint()?),
                "agent" => agent = Some(r.read_bool()?),
                "id" => id = Some(r.read_uint()?),
                "cmd" => cmd = Some(r.read_str()?),
                "args" => args = Some(Map::read(&mut r)?),
                "ok" => ok = Some(r.read_bool()?),
                // "data" is a map in responses and a blob in data frames;
                // the marker byte disambiguates.
                "data" => match r.peek_kind()? {
                    Kind::Bin => data_bin = Some(r.read_bin()?.to_vec()),
                    Kind::Map => data_map = Some(Map::read(&mut r)?),
                    kind => {
                        return Err(ProtocolError::MalformedMessage(format!(
                            "data field holds {kind:?}, expected map or binary"
                        )))
                    }
                },
                "error" => error = Some(r.read_str()?),
                "seq" => seq = Some(r.read_uint()?),
                "done" => done = Some(r.read_bool()?),
                _ => r.skip_value()?,
            }
        }

        let typ = typ.ok_or_else(|| missing("type"))?;
        match typ {
            "hello" | "hello_ack" => {
                let hello = Hello {
                    version: version.ok_or_else(|| missing("version"))?,
                    agent: agent.ok_or_else(|| missing("agent"))?,
                };
                if typ == "hello" {
                    Ok(Message::Hello(hello))
                } else {
                    Ok(Message::HelloAck(hello))
                }
            }
            "req" => Ok(Message::Request(Request {
                id: narrow_id(id.ok_or_else(|| missing("id"))?)?,
                cmd: cmd.ok_or_else(|| missing("cmd"))?.to_owned(),
                args: args.ok_or_else(|| missing("args"))?,
            })),
            "resp" => {
                let ok = ok.ok_or_else(|| missing("ok"))?;
                Ok(Message::Response(Response {
                    id: narrow_id(id.ok_or_else(|| missing("id"))?)?,
                    ok,
                    data: data_map.unwrap_or_default(),
                    error: if ok {
                        String::new()
                    } else {
                        error.unwrap_or("unspecified error").to_owned()
                    },
                }))
            }
            "data" => Ok(Message::Data(Data {
                id: narrow_id(id.ok_or_else(|| missing("id"))?)?,
                seq: narrow_id(seq.ok_or_else(|| missing("seq"))?)?,
                chunk: data_bin.ok_or_else(|| missing("data"))?,
                done: done.ok_or_else(|| missing("done"))?,
            })),
            other => Err(ProtocolError::MalformedMessage(format!(
                "unknown message type {other:?}"
            ))),
        }
    }
}

fn missing(field: &str) -> ProtocolError {
    ProtocolError::MalformedMessage(format!("missing required field {field:?}"))
}

fn narrow_id(v: u64) -> Result<u32, ProtocolError> {
    u32::try_from(v)
        .map_err(|_| ProtocolError::MalformedMessage(format!("field value {v} exceeds 32 bits")))
}
