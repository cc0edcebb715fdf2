// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use crate::{
    errors::ProxyError,
    protocol::{command::Command, response::Response},
};
use bytes::{Buf, Bytes, BytesMut};
use std::mem;

fn find_crlf(buf: &[u8]) -> Option<usize> { buf.windows(2).position(|w| w == b"\r\n") }

fn parse_decimal(raw: &[u8]) -> Result<i64, ProxyError> {
    btoi::btoi(raw).map_err(|_| ProxyError::channel("malformed length prefix"))
}

/// Incremental parser for client commands: array form (`*N\r\n$L\r\n<data>\r\n...`) and,
/// for trivial interactive clients, inline form (a single CRLF-terminated line split on
/// spaces). Resumes across partial reads; never blocks.
pub struct CommandParser {
    state: CommandState,
}

enum CommandState {
    Initial,
    ReadArgLen { args: Vec<Bytes>, expected: usize },
    ReadArgData { args: Vec<Bytes>, expected: usize, remaining: usize },
    ReadTrailingCRLF { args: Vec<Bytes>, expected: usize, pending: Bytes },
}

impl Default for CommandParser {
    fn default() -> Self { CommandParser::new() }
}

impl CommandParser {
    pub fn new() -> CommandParser { CommandParser { state: CommandState::Initial } }

    /// Attempts to parse one command from the front of `buf`. Returns `Ok(None)` if more
    /// bytes are needed; in that case `buf` is left untouched so the caller can append
    /// more data and call again.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Command>, ProxyError> {
        loop {
            let state = mem::replace(&mut self.state, CommandState::Initial);
            match state {
                CommandState::Initial => {
                    if buf.is_empty() {
                        self.state = CommandState::Initial;
                        return Ok(None);
                    }

                    if buf[0] != b'*' {
                        return self.parse_inline(buf);
                    }

                    let crlf = match find_crlf(&buf[1..]) {
                        Some(p) => p,
                        None => {
                            self.state = CommandState::Initial;
                            return Ok(None);
                        },
                    };
                    let count = parse_decimal(&buf[1..1 + crlf])?;
                    if count < 0 {
                        return Err(ProxyError::channel("malformed command: negative argument count"));
                    }
                    buf.advance(1 + crlf + 2);
                    let expected = count as usize;
                    if expected == 0 {
                        return Ok(Some(Command::new(Vec::new())));
                    }
                    self.state = CommandState::ReadArgLen { args: Vec::with_capacity(expected), expected };
                },
                CommandState::ReadArgLen { args, expected } => {
                    if buf.is_empty() || buf[0] != b'$' {
                        if buf.is_empty() {
                            self.state = CommandState::ReadArgLen { args, expected };
                            return Ok(None);
                        }
                        return Err(ProxyError::channel("malformed command: expected bulk argument"));
                    }

                    let crlf = match find_crlf(&buf[1..]) {
                        Some(p) => p,
                        None => {
                            self.state = CommandState::ReadArgLen { args, expected };
                            return Ok(None);
                        },
                    };
                    let len = parse_decimal(&buf[1..1 + crlf])?;
                    if len < 0 {
                        return Err(ProxyError::channel("malformed command: negative argument length"));
                    }
                    buf.advance(1 + crlf + 2);
                    self.state = CommandState::ReadArgData { args, expected, remaining: len as usize };
                },
                CommandState::ReadArgData { args, expected, remaining } => {
                    if buf.len() < remaining {
                        self.state = CommandState::ReadArgData { args, expected, remaining };
                        return Ok(None);
                    }
                    let data = buf.split_to(remaining).freeze();
                    self.state = CommandState::ReadTrailingCRLF { args, expected, pending: data };
                },
                CommandState::ReadTrailingCRLF { mut args, expected, pending } => {
                    if buf.len() < 2 {
                        self.state = CommandState::ReadTrailingCRLF { args, expected, pending };
                        return Ok(None);
                    }
                    if &buf[0..2] != b"\r\n" {
                        return Err(ProxyError::channel("malformed command: missing argument terminator"));
                    }
                    buf.advance(2);
                    args.push(pending);
                    if args.len() == expected {
                        return Ok(Some(Command::new(args)));
                    }
                    self.state = CommandState::ReadArgLen { args, expected };
                },
            }
        }
    }

    fn parse_inline(&mut self, buf: &mut BytesMut) -> Result<Option<Command>, ProxyError> {
        let crlf = match find_crlf(buf) {
            Some(p) => p,
            None => return Ok(None),
        };
        let line = buf.split_to(crlf).freeze();
        buf.advance(2);

        let args = line
            .split(|&b| b == b' ')
            .filter(|chunk| !chunk.is_empty())
            .map(Bytes::copy_from_slice)
            .collect::<Vec<_>>();
        Ok(Some(Command::new(args)))
    }
}

/// Incremental parser for backend responses: `+`, `-`, `:`, `$`, `*` framing, with
/// recursive descent into `Multi` payloads.
pub struct ResponseParser {
    state: ResponseState,
}

enum ResponseState {
    Initial,
    ReadBulkData { remaining: usize },
    ReadTrailingCRLF { bulk: Bytes },
    MultiRecursive { remaining: usize, items: Vec<Response>, inner: Box<ResponseParser> },
}

impl Default for ResponseParser {
    fn default() -> Self { ResponseParser::new() }
}

impl ResponseParser {
    pub fn new() -> ResponseParser { ResponseParser { state: ResponseState::Initial } }

    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Response>, ProxyError> {
        loop {
            let state = mem::replace(&mut self.state, ResponseState::Initial);
            match state {
                ResponseState::Initial => {
                    if buf.is_empty() {
                        return Ok(None);
                    }

                    let sentinel = buf[0];
                    let crlf = match find_crlf(&buf[1..]) {
                        Some(p) => p,
                        None => {
                            self.state = ResponseState::Initial;
                            return Ok(None);
                        },
                    };
                    let header = &buf[1..1 + crlf];

                    match sentinel {
                        b'+' => {
                            let line = Bytes::copy_from_slice(header);
                            buf.advance(1 + crlf + 2);
                            return Ok(Some(Response::Status(line)));
                        },
                        b'-' => {
                            let line = Bytes::copy_from_slice(header);
                            buf.advance(1 + crlf + 2);
                            return Ok(Some(Response::Error(line)));
                        },
                        b':' => {
                            let value = parse_decimal(header)?;
                            buf.advance(1 + crlf + 2);
                            return Ok(Some(Response::Integer(value)));
                        },
                        b'$' => {
                            let len = parse_decimal(header)?;
                            buf.advance(1 + crlf + 2);
                            if len < 0 {
                                return Ok(Some(Response::Bulk(None)));
                            }
                            self.state = ResponseState::ReadBulkData { remaining: len as usize };
                        },
                        b'*' => {
                            let count = parse_decimal(header)?;
                            buf.advance(1 + crlf + 2);
                            if count < 0 {
                                return Ok(Some(Response::Multi(None)));
                            }
                            let count = count as usize;
                            if count == 0 {
                                return Ok(Some(Response::empty_multi()));
                            }
                            self.state = ResponseState::MultiRecursive {
                                remaining: count,
                                items: Vec::with_capacity(count),
                                inner: Box::new(ResponseParser::new()),
                            };
                        },
                        _ => return Err(ProxyError::channel("malformed response: unknown type sentinel")),
                    }
                },
                ResponseState::ReadBulkData { remaining } => {
                    if buf.len() < remaining {
                        self.state = ResponseState::ReadBulkData { remaining };
                        return Ok(None);
                    }
                    let data = buf.split_to(remaining).freeze();
                    self.state = ResponseState::ReadTrailingCRLF { bulk: data };
                },
                ResponseState::ReadTrailingCRLF { bulk } => {
                    if buf.len() < 2 {
                        self.state = ResponseState::ReadTrailingCRLF { bulk };
                        return Ok(None);
                    }
                    if &buf[0..2] != b"\r\n" {
                        return Err(ProxyError::channel("malformed response: missing bulk terminator"));
                    }
                    buf.advance(2);
                    return Ok(Some(Response::Bulk(Some(bulk))));
                },
                ResponseState::MultiRecursive { mut remaining, mut items, mut inner } => {
                    while remaining > 0 {
                        match inner.parse(buf)? {
                            Some(item) => {
                                items.push(item);
                                remaining -= 1;
                            },
                            None => {
                                self.state = ResponseState::MultiRecursive { remaining, items, inner };
                                return Ok(None);
                            },
                        }
                    }
                    return Ok(Some(Response::Multi(Some(items))));
                },
            }
        }
    }

}

/// The forwarding fast path: consumes exactly one complete response from its input
/// buffer, appending the same framed bytes to a destination buffer (or discarding
/// them if none is given), without ever materializing a `Response` value. Still
/// descends into `Multi` payloads by value so framing stays correct. A second,
/// independent entry point alongside `ResponseParser` — the two are never driven
/// against the same in-flight response at once.
pub struct ResponseForwarder {
    forward_state: ForwardState,
}

impl ResponseForwarder {
    pub fn forward(&mut self, buf: &mut BytesMut, dest: Option<&mut BytesMut>) -> Result<bool, ProxyError> {
        forward_step(&mut self.forward_state, buf, dest)
    }
}

enum ForwardState {
    Initial,
    CopyBulkData { remaining: usize },
    CopyTrailingCRLF,
    MultiRecursive { remaining: usize, inner: Box<ForwardState> },
}

fn forward_step(state: &mut ForwardState, buf: &mut BytesMut, mut dest: Option<&mut BytesMut>) -> Result<bool, ProxyError> {
    loop {
        let cur = mem::replace(state, ForwardState::Initial);
        match cur {
            ForwardState::Initial => {
                if buf.is_empty() {
                    *state = ForwardState::Initial;
                    return Ok(false);
                }
                let sentinel = buf[0];
                let crlf = match find_crlf(&buf[1..]) {
                    Some(p) => p,
                    None => {
                        *state = ForwardState::Initial;
                        return Ok(false);
                    },
                };
                let header_len = 1 + crlf + 2;

                match sentinel {
                    b'+' | b'-' | b':' => {
                        if let Some(d) = dest.as_deref_mut() {
                            d.extend_from_slice(&buf[..header_len]);
                        }
                        buf.advance(header_len);
                        return Ok(true);
                    },
                    b'$' => {
                        let len = parse_decimal(&buf[1..1 + crlf])?;
                        if let Some(d) = dest.as_deref_mut() {
                            d.extend_from_slice(&buf[..header_len]);
                        }
                        buf.advance(header_len);
                        if len < 0 {
                            // Null-bulk short-circuits immediately after the length line.
                            return Ok(true);
                        }
                        *state = ForwardState::CopyBulkData { remaining: len as usize };
                    },
                    b'*' => {
                        let count = parse_decimal(&buf[1..1 + crlf])?;
                        if let Some(d) = dest.as_deref_mut() {
                            d.extend_from_slice(&buf[..header_len]);
                        }
                        buf.advance(header_len);
                        if count <= 0 {
                            // Null-multi or empty-multi: nothing further to copy.
                            return Ok(true);
                        }
                        *state = ForwardState::MultiRecursive {
                            remaining: count as usize,
                            inner: Box::new(ForwardState::Initial),
                        };
                    },
                    _ => return Err(ProxyError::channel("malformed response: unknown type sentinel")),
                }
            },
            ForwardState::CopyBulkData { remaining } => {
                if buf.len() < remaining {
                    *state = ForwardState::CopyBulkData { remaining };
                    return Ok(false);
                }
                if let Some(d) = dest.as_deref_mut() {
                    d.extend_from_slice(&buf[..remaining]);
                }
                buf.advance(remaining);
                *state = ForwardState::CopyTrailingCRLF;
            },
            ForwardState::CopyTrailingCRLF => {
                if buf.len() < 2 {
                    *state = ForwardState::CopyTrailingCRLF;
                    return Ok(false);
                }
                if &buf[0..2] != b"\r\n" {
                    return Err(ProxyError::channel("malformed response: missing bulk terminator"));
                }
                if let Some(d) = dest.as_deref_mut() {
                    d.extend_from_slice(&buf[0..2]);
                }
                buf.advance(2);
                return Ok(true);
            },
            ForwardState::MultiRecursive { mut remaining, mut inner } => {
                while remaining > 0 {
                    match forward_step(&mut inner, buf, dest.as_deref_mut())? {
                        true => remaining -= 1,
                        false => {
                            *state = ForwardState::MultiRecursive { remaining, inner };
                            return Ok(false);
                        },
                    }
                }
                return Ok(true);
            },
        }
    }
}

impl Default for ResponseForwarder {
    fn default() -> Self { ResponseForwarder { forward_state: ForwardState::Initial } }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn array_command_parses_whole() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n"[..]);
        let mut parser = CommandParser::new();
        let cmd = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(cmd.args().len(), 2);
        assert_eq!(&cmd.args()[0][..], b"GET");
        assert_eq!(&cmd.args()[1][..], b"x");
        assert!(buf.is_empty());
    }

    #[test]
    fn inline_command_matches_array_encoding() {
        let mut inline = BytesMut::from(&b"MSET x 1 y 2 z lol\r\n"[..]);
        let mut parser = CommandParser::new();
        let from_inline = parser.parse(&mut inline).unwrap().unwrap();

        let array_form = Command::new(vec![
            Bytes::from_static(b"MSET"),
            Bytes::from_static(b"x"),
            Bytes::from_static(b"1"),
            Bytes::from_static(b"y"),
            Bytes::from_static(b"2"),
            Bytes::from_static(b"z"),
            Bytes::from_static(b"lol"),
        ]);

        assert_eq!(from_inline, array_form);
    }

    #[test]
    fn incremental_parsing_matches_whole_buffer_regardless_of_fragmentation() {
        let whole = b"*3\r\n$3\r\nSET\r\n$1\r\nx\r\n$2\r\n23\r\n".to_vec();

        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let mut parser = CommandParser::new();
            let mut buf = BytesMut::new();
            let mut pos = 0;
            let mut result = None;
            while pos < whole.len() {
                let take = rng.gen_range(1..=whole.len() - pos);
                buf.extend_from_slice(&whole[pos..pos + take]);
                pos += take;
                if let Some(cmd) = parser.parse(&mut buf).unwrap() {
                    result = Some(cmd);
                    break;
                }
            }
            let cmd = result.expect("command should complete once all bytes are fed");
            assert_eq!(&cmd.args()[0][..], b"SET");
            assert_eq!(&cmd.args()[1][..], b"x");
            assert_eq!(&cmd.args()[2][..], b"23");
        }
    }

    #[test]
    fn response_round_trips_nested_multi() {
        let original = Response::Multi(Some(vec![
            Response::Integer(1),
            Response::bulk("hello"),
            Response::Bulk(None),
            Response::Multi(Some(vec![Response::status("OK")])),
        ]));
        let mut buf = original.to_bytes();
        let total_len = buf.len();
        let mut parser = ResponseParser::new();
        let parsed = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, original);
        assert_eq!(buf.len(), 0);
        assert_eq!(parsed.to_bytes().len(), total_len);
    }

    #[test]
    fn response_incremental_parsing_tolerates_any_split() {
        let whole = Response::Multi(Some(vec![Response::bulk("abc"), Response::Integer(-7)])).to_bytes();
        let whole = whole.to_vec();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut parser = ResponseParser::new();
            let mut buf = BytesMut::new();
            let mut pos = 0;
            let mut result = None;
            while pos < whole.len() {
                let take = rng.gen_range(1..=whole.len() - pos);
                buf.extend_from_slice(&whole[pos..pos + take]);
                pos += take;
                if let Some(r) = parser.parse(&mut buf).unwrap() {
                    result = Some(r);
                    break;
                }
            }
            assert_eq!(
                result.unwrap(),
                Response::Multi(Some(vec![Response::bulk("abc"), Response::Integer(-7)]))
            );
        }
    }

    #[test]
    fn forward_copies_identical_bytes_for_nested_multi() {
        let original = Response::Multi(Some(vec![
            Response::status("OK"),
            Response::Bulk(None),
            Response::Integer(9),
        ]));
        let mut src = original.to_bytes();
        let mut dest = BytesMut::new();
        let mut forwarder = ResponseForwarder::default();
        let done = forwarder.forward(&mut src, Some(&mut dest)).unwrap();
        assert!(done);
        assert_eq!(dest.freeze(), original.to_bytes().freeze());
    }
}
