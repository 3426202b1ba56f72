//! Protocol data units.
//!
//! A [`Pdu`] is the unit of proxied data that flows through the interceptor
//! chains. It owns its byte storage, knows which endpoint it is headed to and
//! keeps weak back-references to the connection and proxy that produced it,
//! so a PDU held by an interceptor never keeps a closed connection alive.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use encoding_rs::{Encoding, UTF_8};

use crate::connection::Connection;
use crate::proxy::Proxy;

/// Protocol marker for PDUs that do not belong to a specific transport.
pub const GENERIC_PROTOCOL: &str = "generic";

/// Endpoint a PDU is headed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// Server to client traffic (S2C).
    Client,
    /// Client to server traffic (C2S).
    Server,
}

impl Destination {
    /// Short direction label used in logs.
    pub fn direction(self) -> &'static str {
        match self {
            Destination::Client => "S2C",
            Destination::Server => "C2S",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.direction())
    }
}

/// A mutable unit of proxied data.
#[derive(Clone)]
pub struct Pdu {
    buffer: Vec<u8>,
    size: usize,
    destination: Destination,
    tags: HashSet<String>,
    charset: &'static Encoding,
    protocol: &'static str,
    proxy: Option<Weak<dyn Proxy>>,
    connection: Option<Weak<dyn Connection>>,
    last_interceptor: Option<usize>,
}

impl Pdu {
    /// Create a detached PDU whose logical size is the whole buffer.
    pub fn new(destination: Destination, buffer: Vec<u8>) -> Self {
        Self {
            size: buffer.len(),
            buffer,
            destination,
            tags: HashSet::new(),
            charset: UTF_8,
            protocol: GENERIC_PROTOCOL,
            proxy: None,
            connection: None,
            last_interceptor: None,
        }
    }

    /// Create a PDU owned by `connection` (and its proxy).
    ///
    /// Only the first `size` bytes of `buffer` are payload.
    pub fn from_connection(
        connection: &Arc<dyn Connection>,
        destination: Destination,
        buffer: Vec<u8>,
        size: usize,
    ) -> Self {
        let mut pdu = Self::new(destination, buffer);
        pdu.size = size.min(pdu.buffer.len());
        pdu.connection = Some(Arc::downgrade(connection));
        pdu.proxy = connection.proxy().map(|proxy| Arc::downgrade(&proxy));
        pdu
    }

    /// Set the charset used by [`Pdu::text`].
    pub fn with_charset(mut self, charset: &'static Encoding) -> Self {
        self.charset = charset;
        self
    }

    /// Set the protocol marker checked by [`Proxy::supports`].
    pub fn with_protocol(mut self, protocol: &'static str) -> Self {
        self.protocol = protocol;
        self
    }

    /// Add tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_tags(tags);
        self
    }

    /// Whole byte storage (may be longer than the payload).
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable byte storage for in-place edits.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// The payload: the first `size` bytes of the buffer.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.size]
    }

    /// Logical payload size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Replace the buffer. `size` is clamped to the buffer length.
    pub fn set_buffer(&mut self, buffer: Vec<u8>, size: usize) {
        self.size = size.min(buffer.len());
        self.buffer = buffer;
    }

    /// Grow the storage to at least `size` bytes, keeping the payload.
    ///
    /// Never shrinks and never changes the logical size.
    pub fn resize(&mut self, size: usize) {
        if size > self.buffer.len() {
            self.buffer.resize(size, 0);
        }
    }

    /// Payload decoded with the PDU charset (lossy).
    pub fn text(&self) -> String {
        let (text, _, _) = self.charset.decode(self.payload());
        text.into_owned()
    }

    pub fn charset(&self) -> &'static Encoding {
        self.charset
    }

    pub fn set_charset(&mut self, charset: &'static Encoding) {
        self.charset = charset;
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn set_destination(&mut self, destination: Destination) {
        self.destination = destination;
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }

    pub fn remove_tag(&mut self, tag: &str) {
        self.tags.remove(tag);
    }

    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }

    /// Owning connection, if it is still alive.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_connection(&mut self, connection: &Arc<dyn Connection>) {
        self.connection = Some(Arc::downgrade(connection));
    }

    /// Owning proxy, if it is still alive.
    pub fn proxy(&self) -> Option<Arc<dyn Proxy>> {
        self.proxy.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_proxy(&mut self, proxy: &Arc<dyn Proxy>) {
        self.proxy = Some(Arc::downgrade(proxy));
    }

    /// Id of the last interceptor that handled this PDU.
    pub fn last_interceptor(&self) -> Option<usize> {
        self.last_interceptor
    }

    pub fn set_last_interceptor(&mut self, id: Option<usize>) {
        self.last_interceptor = id;
    }

    /// Deep copy with its own byte storage (payload bytes only).
    pub fn copy(&self) -> Self {
        let mut copy = self.clone();
        copy.buffer = self.payload().to_vec();
        copy
    }
}

impl fmt::Debug for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pdu")
            .field("destination", &self.destination)
            .field("size", &self.size)
            .field("protocol", &self.protocol)
            .field("tags", &self.tags)
            .field("charset", &self.charset.name())
            .field("last_interceptor", &self.last_interceptor)
            .finish()
    }
}
