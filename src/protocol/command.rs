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
use bytes::{BufMut, Bytes, BytesMut};

/// An argv-style command: an ordered list of opaque byte-string arguments. The
/// first argument is the command name. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(args: Vec<Bytes>) -> Command { Command { args } }

    pub fn arg(&self, index: usize) -> Option<&Bytes> { self.args.get(index) }

    pub fn args(&self) -> &[Bytes] { &self.args }

    pub fn len(&self) -> usize { self.args.len() }

    pub fn is_empty(&self) -> bool { self.args.is_empty() }

    /// The command name, uppercased. The original bytes are left untouched; this
    /// allocates only when the name isn't already all-uppercase ASCII.
    pub fn name_upper(&self) -> String {
        self.args
            .first()
            .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// Builds a borrowing sub-command view over a subset of this command's
    /// arguments, without copying argument bytes. The returned view must not
    /// outlive `self`.
    pub fn view(&self, indices: &[usize]) -> RefCommand<'_> {
        RefCommand {
            args: indices.iter().filter_map(|&i| self.args.get(i)).collect(),
        }
    }

    /// Builds a fully owned command from scratch, e.g. for a sub-command whose
    /// argv doesn't correspond 1:1 with the original's.
    pub fn owned(args: Vec<Bytes>) -> Command { Command::new(args) }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(b'*');
        let mut buf = itoa::Buffer::new();
        out.extend_from_slice(buf.format(self.args.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        for arg in &self.args {
            out.put_u8(b'$');
            out.extend_from_slice(buf.format(arg.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out
    }
}

/// A command view that borrows its argument bytes from a live owned `Command`.
/// Used by handlers that rewrite argv (e.g. stripping the original key list down
/// to just the keys that route to one backend) without copying.
pub struct RefCommand<'a> {
    args: Vec<&'a Bytes>,
}

impl<'a> RefCommand<'a> {
    pub fn new(args: Vec<&'a Bytes>) -> RefCommand<'a> { RefCommand { args } }

    pub fn args(&self) -> &[&'a Bytes] { &self.args }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(b'*');
        let mut buf = itoa::Buffer::new();
        out.extend_from_slice(buf.format(self.args.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        for arg in &self.args {
            out.put_u8(b'$');
            out.extend_from_slice(buf.format(arg.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
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
    fn encode_then_parse_round_trips_argv() {
        let cmd = Command::new(vec![Bytes::from_static(b"SET"), Bytes::from_static(b"x"), Bytes::from_static(b"23")]);
        let encoded = cmd.to_bytes();
        assert_eq!(encoded, "*3\r\n$3\r\nSET\r\n$1\r\nx\r\n$2\r\n23\r\n");
    }

    #[test]
    fn name_upper_normalizes_case() {
        let cmd = Command::new(vec![Bytes::from_static(b"get"), Bytes::from_static(b"x")]);
        assert_eq!(cmd.name_upper(), "GET");
    }

    #[test]
    fn ref_command_borrows_without_copying() {
        let cmd = Command::new(vec![
            Bytes::from_static(b"MGET"),
            Bytes::from_static(b"x"),
            Bytes::from_static(b"y"),
            Bytes::from_static(b"z"),
        ]);
        let sub = cmd.view(&[0, 1, 3]);
        assert_eq!(sub.to_bytes(), "*3\r\n$4\r\nMGET\r\n$1\r\nx\r\n$1\r\nz\r\n");
    }
}
