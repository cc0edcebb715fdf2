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
use crate::errors::ProxyError;
use bytes::{BufMut, Bytes, BytesMut};

/// A parsed or synthesized reply, either read off a backend connection or
/// constructed by the proxy itself.
///
/// Null-bulk and null-multi are distinguished from the empty forms; equality is
/// structural (`Bulk(None) != Bulk(Some(vec![]))`).
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Status(Bytes),
    Error(Bytes),
    Integer(i64),
    Bulk(Option<Bytes>),
    Multi(Option<Vec<Response>>),
}

impl Response {
    pub fn status<S: Into<Bytes>>(s: S) -> Response { Response::Status(s.into()) }

    pub fn error_str<S: Into<Bytes>>(s: S) -> Response { Response::Error(s.into()) }

    pub fn bulk<S: Into<Bytes>>(s: S) -> Response { Response::Bulk(Some(s.into())) }

    pub fn null_bulk() -> Response { Response::Bulk(None) }

    pub fn null_multi() -> Response { Response::Multi(None) }

    pub fn empty_multi() -> Response { Response::Multi(Some(Vec::new())) }

    pub fn ok() -> Response { Response::status("OK") }

    pub fn from_error(err: &ProxyError) -> Response { Response::Error(Bytes::from(err.wire_message())) }

    /// Writes the canonical wire encoding of this response. Always emits the
    /// array/bulk form, never a client-style inline line.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Response::Status(s) => {
                out.put_u8(b'+');
                out.extend_from_slice(s);
                out.extend_from_slice(b"\r\n");
            },
            Response::Error(s) => {
                out.put_u8(b'-');
                out.extend_from_slice(s);
                out.extend_from_slice(b"\r\n");
            },
            Response::Integer(i) => {
                out.put_u8(b':');
                let mut buf = itoa::Buffer::new();
                out.extend_from_slice(buf.format(*i).as_bytes());
                out.extend_from_slice(b"\r\n");
            },
            Response::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
            Response::Bulk(Some(b)) => {
                out.put_u8(b'$');
                let mut buf = itoa::Buffer::new();
                out.extend_from_slice(buf.format(b.len()).as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(b);
                out.extend_from_slice(b"\r\n");
            },
            Response::Multi(None) => out.extend_from_slice(b"*-1\r\n"),
            Response::Multi(Some(items)) => {
                out.put_u8(b'*');
                let mut buf = itoa::Buffer::new();
                out.extend_from_slice(buf.format(items.len()).as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
            },
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_forms_are_distinct_from_empty_forms() {
        assert_ne!(Response::null_bulk(), Response::bulk(""));
        assert_ne!(Response::null_multi(), Response::empty_multi());
    }

    #[test]
    fn status_round_trips() {
        let r = Response::status("PONG");
        assert_eq!(r.to_bytes(), "+PONG\r\n");
    }

    #[test]
    fn integer_round_trips() {
        assert_eq!(Response::Integer(-42).to_bytes(), ":-42\r\n");
    }

    #[test]
    fn null_bulk_encodes_as_minus_one() {
        assert_eq!(Response::null_bulk().to_bytes(), "$-1\r\n");
    }

    #[test]
    fn nested_multi_encodes_recursively() {
        let r = Response::Multi(Some(vec![Response::Integer(1), Response::bulk("x")]));
        assert_eq!(r.to_bytes(), "*2\r\n:1\r\n$1\r\nx\r\n");
    }
}
