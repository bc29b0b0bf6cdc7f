//! The wire format: a byte-exact, unaligned, big-endian framing of the six commands
//! that flow over a tunnel.

use thiserror::Error;

pub const CMD_IDENT: u8 = 0x49;
pub const CMD_PING: u8 = 0x3f;
pub const CMD_PONG: u8 = 0x21;
pub const CMD_HELLO: u8 = 0x48;
pub const CMD_CONNECT: u8 = 0x43;
pub const CMD_BYE: u8 = 0x42;
pub const CMD_DATA: u8 = 0x44;

pub const ARG_SERVER: u8 = 0x53;
pub const ARG_CLIENT: u8 = 0x43;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn from_arg(b: u8) -> Result<Self, FrameError> {
        match b {
            ARG_SERVER => Ok(Role::Server),
            ARG_CLIENT => Ok(Role::Client),
            other => Err(FrameError::BadIdentRole(other)),
        }
    }

    fn as_arg(self) -> u8 {
        match self {
            Role::Server => ARG_SERVER,
            Role::Client => ARG_CLIENT,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unexpected command byte 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("IDENT carried an unrecognized role byte 0x{0:02x}")]
    BadIdentRole(u8),
}

/// One fully decoded item, yielded as soon as its header (and, for `DataChunk`, each
/// slice of payload) is available. `DataChunk` may be yielded several times for one
/// wire-level DATA frame if its payload spans more than one `feed` call.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodedItem<'a> {
    Ident(Role),
    Ping,
    Pong,
    Hello(u16),
    Connect(u16),
    Bye(u16),
    DataChunk { id: u16, chunk: &'a [u8] },
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitCmd,
    RdCmd { cmd: u8, want: usize },
    RdData { id: u16, remaining: u16 },
}

/// A streaming decoder: feed it whatever bytes just arrived on the tunnel, in
/// whatever chunk sizes the transport handed back, and it reassembles frames across
/// calls. Mirrors the IDENT/DEFAULT/RD-CMD/RD-DATA state machine this protocol is
/// specified around, collapsing IDENT and DEFAULT into one "waiting for a command
/// byte" state since the wire-level grammar doesn't actually differ between them —
/// callers that care whether IDENT has been seen yet track that themselves.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    scratch: [u8; 6],
    scratch_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            state: State::WaitCmd,
            scratch: [0; 6],
            scratch_len: 0,
        }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed<'a>(
        &mut self,
        mut buf: &'a [u8],
        mut on_item: impl FnMut(DecodedItem<'a>),
    ) -> Result<(), FrameError> {
        while !buf.is_empty() {
            match self.state {
                State::WaitCmd => {
                    let cmd = buf[0];
                    buf = &buf[1..];
                    let want = match cmd {
                        CMD_IDENT => 1,
                        CMD_PING => {
                            on_item(DecodedItem::Ping);
                            continue;
                        }
                        CMD_PONG => {
                            on_item(DecodedItem::Pong);
                            continue;
                        }
                        CMD_HELLO | CMD_CONNECT | CMD_BYE => 2,
                        CMD_DATA => 4,
                        other => return Err(FrameError::UnknownCommand(other)),
                    };
                    self.scratch_len = 0;
                    self.state = State::RdCmd { cmd, want };
                }
                State::RdCmd { cmd, want } => {
                    let need = want - self.scratch_len;
                    let take = need.min(buf.len());
                    self.scratch[self.scratch_len..self.scratch_len + take]
                        .copy_from_slice(&buf[..take]);
                    self.scratch_len += take;
                    buf = &buf[take..];
                    if self.scratch_len == want {
                        match cmd {
                            CMD_IDENT => {
                                on_item(DecodedItem::Ident(Role::from_arg(self.scratch[0])?));
                                self.state = State::WaitCmd;
                            }
                            CMD_HELLO => {
                                on_item(DecodedItem::Hello(be16(&self.scratch)));
                                self.state = State::WaitCmd;
                            }
                            CMD_CONNECT => {
                                on_item(DecodedItem::Connect(be16(&self.scratch)));
                                self.state = State::WaitCmd;
                            }
                            CMD_BYE => {
                                on_item(DecodedItem::Bye(be16(&self.scratch)));
                                self.state = State::WaitCmd;
                            }
                            CMD_DATA => {
                                let id = be16(&self.scratch[0..2]);
                                let len = be16(&self.scratch[2..4]);
                                self.state = if len == 0 {
                                    on_item(DecodedItem::DataChunk { id, chunk: &[] });
                                    State::WaitCmd
                                } else {
                                    State::RdData { id, remaining: len }
                                };
                            }
                            other => return Err(FrameError::UnknownCommand(other)),
                        }
                    }
                }
                State::RdData { id, remaining } => {
                    let take = (remaining as usize).min(buf.len());
                    on_item(DecodedItem::DataChunk {
                        id,
                        chunk: &buf[..take],
                    });
                    let remaining = remaining - take as u16;
                    buf = &buf[take..];
                    self.state = if remaining == 0 {
                        State::WaitCmd
                    } else {
                        State::RdData { id, remaining }
                    };
                }
            }
        }
        Ok(())
    }

}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

pub fn encode_ident(role: Role) -> [u8; 2] {
    [CMD_IDENT, role.as_arg()]
}

pub fn encode_ping() -> [u8; 1] {
    [CMD_PING]
}

pub fn encode_pong() -> [u8; 1] {
    [CMD_PONG]
}

pub fn encode_hello(id: u16) -> [u8; 3] {
    let b = id.to_be_bytes();
    [CMD_HELLO, b[0], b[1]]
}

pub fn encode_connect(id: u16) -> [u8; 3] {
    let b = id.to_be_bytes();
    [CMD_CONNECT, b[0], b[1]]
}

pub fn encode_bye(id: u16) -> [u8; 3] {
    let b = id.to_be_bytes();
    [CMD_BYE, b[0], b[1]]
}

/// Length of the `DATA id len` header every local-socket connection multiplexed
/// over a tunnel reserves at the front of its read buffer.
pub const DATA_HEADER_LEN: usize = 5;

/// The 5-byte `DATA id len` header, written into a connection's reserved front
/// offset ahead of the payload bytes already sitting in the rest of its buffer.
pub fn encode_data_header(id: u16, len: u16) -> [u8; 5] {
    let ib = id.to_be_bytes();
    let lb = len.to_be_bytes();
    [CMD_DATA, ib[0], ib[1], lb[0], lb[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(bytes: &[u8]) -> Vec<String> {
        let mut dec = FrameDecoder::new();
        let mut out = Vec::new();
        dec.feed(bytes, |item| out.push(format!("{item:?}"))).unwrap();
        out
    }

    #[test]
    fn decodes_ident_hello_data_bye_in_one_call() {
        let mut bytes = Vec::new();
        bytes.extend(encode_ident(Role::Server));
        bytes.extend(encode_hello(7));
        bytes.push(CMD_DATA);
        bytes.extend(7u16.to_be_bytes());
        bytes.extend(4u16.to_be_bytes());
        bytes.extend(b"ping");
        bytes.extend(encode_bye(7));

        let items = collect(&bytes);
        assert_eq!(
            items,
            vec![
                format!("{:?}", DecodedItem::Ident(Role::Server)),
                format!("{:?}", DecodedItem::Hello(7)),
                format!(
                    "{:?}",
                    DecodedItem::DataChunk {
                        id: 7,
                        chunk: b"ping"
                    }
                ),
                format!("{:?}", DecodedItem::Bye(7)),
            ]
        );
    }

    #[test]
    fn data_payload_split_across_feed_calls_reassembles() {
        let mut dec = FrameDecoder::new();
        let mut chunks = Vec::new();

        let mut header = vec![CMD_DATA];
        header.extend(3u16.to_be_bytes());
        header.extend(4u16.to_be_bytes());
        dec.feed(&header, |item| {
            if let DecodedItem::DataChunk { chunk, .. } = item {
                chunks.extend_from_slice(chunk);
            }
        })
        .unwrap();

        dec.feed(b"pi", |item| {
            if let DecodedItem::DataChunk { chunk, .. } = item {
                chunks.extend_from_slice(chunk);
            }
        })
        .unwrap();
        dec.feed(b"ng", |item| {
            if let DecodedItem::DataChunk { chunk, .. } = item {
                chunks.extend_from_slice(chunk);
            }
        })
        .unwrap();

        assert_eq!(chunks, b"ping");
    }

    #[test]
    fn rejects_unknown_command_byte() {
        let mut dec = FrameDecoder::new();
        let err = dec.feed(&[0xff], |_| {}).unwrap_err();
        assert!(matches!(err, FrameError::UnknownCommand(0xff)));
    }

    #[test]
    fn header_split_one_byte_at_a_time_still_decodes() {
        let mut dec = FrameDecoder::new();
        let mut seen = None;
        for &b in encode_hello(0x1234).iter() {
            dec.feed(&[b], |item| {
                if let DecodedItem::Hello(id) = item {
                    seen = Some(id);
                }
            })
            .unwrap();
        }
        assert_eq!(seen, Some(0x1234));
    }
}
