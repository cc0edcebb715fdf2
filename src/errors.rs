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
use std::fmt;

/// The wire-observable error taxonomy.
///
/// Every variant renders to a single-line RESP error whose prefix tells the
/// client which layer produced it: client usage mistakes, proxy-level
/// refusals, or upstream/backend failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Client usage errors: wrong arity, malformed subcommand, bad cursor, etc.
    Client(String),

    /// Proxy-level refusals: unimplemented command, cross-backend operation, etc.
    Proxy(String),

    /// Backend-side or upstream failures: disconnects, wrong type, bad response.
    Channel(String),
}

impl ProxyError {
    pub fn client<S: Into<String>>(msg: S) -> ProxyError { ProxyError::Client(msg.into()) }

    pub fn proxy<S: Into<String>>(msg: S) -> ProxyError { ProxyError::Proxy(msg.into()) }

    pub fn channel<S: Into<String>>(msg: S) -> ProxyError { ProxyError::Channel(msg.into()) }

    /// The RESP error prefix this error renders under.
    pub fn wire_prefix(&self) -> &'static str {
        match self {
            ProxyError::Client(_) => "ERR",
            ProxyError::Proxy(_) => "PROXYERROR",
            ProxyError::Channel(_) => "CHANNELERROR",
        }
    }

    /// Renders this error as the line that would follow a `-` sentinel on the wire.
    pub fn wire_message(&self) -> String {
        let (prefix, msg) = match self {
            ProxyError::Client(m) => (self.wire_prefix(), m),
            ProxyError::Proxy(m) => (self.wire_prefix(), m),
            ProxyError::Channel(m) => (self.wire_prefix(), m),
        };
        format!("{} {}", prefix, msg)
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.wire_message()) }
}

impl std::error::Error for ProxyError {}

/// Errors that can occur while building the proxy from its configuration, before
/// it ever accepts a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationError {
    /// A configuration value was missing or malformed.
    InvalidParameter(String),

    /// A named resource (pool, backend) referenced by the configuration doesn't exist.
    InvalidResource(String),

    /// The configuration is internally inconsistent (e.g. no backends, zero workers).
    InvalidConfiguration(String),
}

impl fmt::Display for CreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreationError::InvalidParameter(p) => write!(f, "invalid parameter: {}", p),
            CreationError::InvalidResource(r) => write!(f, "invalid resource: {}", r),
            CreationError::InvalidConfiguration(c) => write!(f, "invalid configuration: {}", c),
        }
    }
}

impl std::error::Error for CreationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_prefixes_match_taxonomy() {
        assert_eq!(ProxyError::client("bad arity").wire_message(), "ERR bad arity");
        assert_eq!(
            ProxyError::proxy("unknown command").wire_message(),
            "PROXYERROR unknown command"
        );
        assert_eq!(
            ProxyError::channel("backend disconnected before sending the response").wire_message(),
            "CHANNELERROR backend disconnected before sending the response"
        );
    }
}
