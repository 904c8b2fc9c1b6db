use std::fmt::Debug;
use anyhow::bail;
use bytes::Bytes;

/// A single framed unit as it travels over the wire: the raw bytes, the header parsed from them,
///  and the body. `body` is a zero-copy slice of `raw`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package<H> {
    raw: Bytes,
    header: H,
    body: Bytes,
}

impl<H> Package<H> {
    /// `raw` is expected to contain exactly the header bytes followed by the body. Surplus bytes
    ///  must be sliced away by the caller before assembling.
    pub fn new(raw: Bytes, header: H, header_len: usize) -> Package<H> {
        let body = raw.slice(header_len.min(raw.len())..);
        Package { raw, header, body }
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn header(&self) -> &H {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// What the transport layer does with a package after it was framed, before it is handed to the
///  application.
#[derive(Debug)]
pub enum Reaction<H> {
    /// pass the package on to the delegate
    Deliver,
    /// the package is transport-internal and is dropped silently
    Consume,
    /// the package is transport-internal and is answered with the contained package
    Reply(Package<H>),
    /// pass the package on to the delegate, and answer it with the contained package
    Acknowledge(Package<H>),
    /// The package is one part of a larger one. Parts with the same key are collected until all
    ///  `parts` have arrived, and are then joined by [Framer::join].
    Collect {
        key: u64,
        index: u32,
        parts: u32,
    },
}

/// A wire schema: knows how to recognize and parse a header, how long a header and its body are,
///  and how to wrap application payload into a package.
///
/// Implementations must be pure - the seeker calls `parse_header` repeatedly on the same data
///  while resynchronizing.
pub trait Framer: Send + Sync + 'static {
    type Header: Clone + Debug + Send + Sync + 'static;

    /// Parse a header starting at offset 0 of `buf`. Returns `None` if the magic code does not
    ///  match, the declared lengths are invalid, or there are not enough bytes. This never fails
    ///  on short input.
    fn parse_header(&self, buf: &[u8]) -> Option<Self::Header>;

    fn header_length(&self, header: &Self::Header) -> usize;

    /// `None` means the body is open-ended, i.e. it extends to the end of available data
    fn body_length(&self, header: &Self::Header) -> Option<usize>;

    fn assemble(&self, raw: Bytes, header: Self::Header) -> Package<Self::Header> {
        let header_len = self.header_length(&header);
        Package::new(raw, header, header_len)
    }

    /// wrap an application payload into a package that is ready to be sent
    fn pack(&self, payload: &[u8]) -> anyhow::Result<Package<Self::Header>>;

    /// A package that is sent to keep an idle connection alive, if the schema has one
    fn heartbeat(&self) -> Option<Package<Self::Header>> {
        None
    }

    fn inspect(&self, _package: &Package<Self::Header>) -> Reaction<Self::Header> {
        Reaction::Deliver
    }

    /// Joins the parts of a package that was split for sending, ordered by index. This is only
    ///  called for schemas whose `inspect` asks for collecting parts.
    fn join(&self, _parts: Vec<Package<Self::Header>>) -> anyhow::Result<Package<Self::Header>> {
        bail!("this wire schema does not split packages")
    }
}
