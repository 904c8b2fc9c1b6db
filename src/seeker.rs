//! Locating packages in a byte buffer of unknown alignment.
//!
//! Inbound data may start with garbage (e.g. the tail of a package that was partially dropped),
//!  may be incomplete, or may contain several packages back to back. The seeker finds the first
//!  well-formed header by anchoring on the schema's magic code, and decides whether the data
//!  before it can be discarded, whether more data is needed, or whether the buffer is beyond
//!  recovery.
//!
//! Seeking is a pure function of the buffer: calling it again on the same data yields the same
//!  result, and it is the caller's responsibility to drop consumed or discarded bytes. The one
//!  exception is `take_package`, which drops them from a growable buffer in place.

use std::sync::Arc;
use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;
use crate::package::{Framer, Package};

/// If no magic code can be found in a buffer longer than this, the buffer is considered garbage
///  beyond recovery.
pub const DEFAULT_GIVE_UP_LEN: usize = 65536;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResyncPolicy {
    /// keep trying magic code candidates until a header parses or the buffer is exhausted. This
    ///  is needed for transports that deliver large batched reads.
    Iterative,
    /// try offset 0, then exactly one magic code candidate. This is sufficient for transports
    ///  that deliver small, mostly aligned reads.
    SingleShot,
}

#[derive(Clone, Debug)]
pub struct SeekerConfig {
    pub magic_code: Vec<u8>,
    /// byte offset of the magic code inside a valid header
    pub magic_offset: usize,
    /// Upper bound for header size. A buffer shorter than this that does not parse may just be
    ///  a truncated header, so it is retained rather than discarded.
    pub max_header_len: usize,
    pub give_up_len: usize,
    pub policy: ResyncPolicy,
}

impl SeekerConfig {
    pub fn new(magic_code: &[u8], magic_offset: usize, max_header_len: usize) -> SeekerConfig {
        SeekerConfig {
            magic_code: magic_code.to_vec(),
            magic_offset,
            max_header_len,
            give_up_len: DEFAULT_GIVE_UP_LEN,
            policy: ResyncPolicy::Iterative,
        }
    }

    pub fn with_policy(mut self, policy: ResyncPolicy) -> SeekerConfig {
        self.policy = policy;
        self
    }

    pub fn with_give_up_len(mut self, give_up_len: usize) -> SeekerConfig {
        self.give_up_len = give_up_len;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.magic_code.is_empty() {
            bail!("magic code must not be empty");
        }
        if self.magic_offset + self.magic_code.len() > self.max_header_len {
            bail!("magic code at offset {} does not fit into a header of at most {} bytes", self.magic_offset, self.max_header_len);
        }
        if self.give_up_len < self.max_header_len {
            bail!("give-up length {} is smaller than the maximum header length {}", self.give_up_len, self.max_header_len);
        }
        Ok(())
    }
}

/// The outcome of seeking a header or package in a buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seek<T> {
    /// `value` starts at `offset`; everything before it is garbage
    Found { value: T, offset: usize },
    /// More data is needed. The `offset` leading bytes are garbage and may be dropped, the rest
    ///  must be retained.
    Pending { offset: usize },
    /// There is no hope of finding a header in this buffer, it should be discarded completely
    Desync,
}

pub struct PackageSeeker<F: Framer> {
    framer: Arc<F>,
    config: SeekerConfig,
}

impl<F: Framer> PackageSeeker<F> {
    pub fn new(framer: Arc<F>, config: SeekerConfig) -> anyhow::Result<PackageSeeker<F>> {
        config.validate()?;
        Ok(PackageSeeker { framer, config })
    }

    pub fn framer(&self) -> &Arc<F> {
        &self.framer
    }

    /// Returns the start of the first header candidate at or after `from`, i.e. a position at
    ///  which the magic code would be at `magic_offset`.
    fn next_candidate(&self, buf: &[u8], from: usize) -> Option<usize> {
        let magic = self.config.magic_code.as_slice();
        let search_start = from + self.config.magic_offset;
        if search_start >= buf.len() {
            return None;
        }

        buf[search_start..].windows(magic.len())
            .position(|w| w == magic)
            .map(|pos| from + pos)
    }

    pub fn seek_header(&self, buf: &[u8]) -> Seek<F::Header> {
        let mut start = 0;
        loop {
            let remaining = &buf[start..];
            if let Some(header) = self.framer.parse_header(remaining) {
                return Seek::Found { value: header, offset: start };
            }
            if remaining.len() < self.config.max_header_len {
                // this may be the start of a header that is not complete yet
                return Seek::Pending { offset: start };
            }

            match self.next_candidate(buf, start + 1) {
                None => {
                    if remaining.len() > self.config.give_up_len {
                        return Seek::Desync;
                    }
                    return Seek::Pending { offset: start };
                }
                Some(candidate) => {
                    trace!("header does not parse at offset {}, trying candidate at {}", start, candidate);
                    start = candidate;

                    if self.config.policy == ResyncPolicy::SingleShot {
                        return match self.framer.parse_header(&buf[start..]) {
                            Some(header) => Seek::Found { value: header, offset: start },
                            None => Seek::Pending { offset: start },
                        };
                    }
                }
            }
        }
    }

    /// finds the next complete package, returning its header and its total length
    fn seek_frame(&self, buf: &[u8]) -> Seek<(F::Header, usize)> {
        let (header, offset) = match self.seek_header(buf) {
            Seek::Found { value, offset } => (value, offset),
            Seek::Pending { offset } => return Seek::Pending { offset },
            Seek::Desync => return Seek::Desync,
        };

        let available = buf.len() - offset;
        let package_len = match self.framer.body_length(&header) {
            Some(body_len) => self.framer.header_length(&header).saturating_add(body_len),
            None => available,
        };

        if package_len > available {
            trace!("package of {} bytes is incomplete, {} bytes available", package_len, available);
            return Seek::Pending { offset };
        }
        Seek::Found { value: (header, package_len), offset }
    }

    pub fn seek_package(&self, buf: &Bytes) -> Seek<Package<F::Header>> {
        match self.seek_frame(buf) {
            Seek::Found { value: (header, len), offset } => Seek::Found {
                value: self.framer.assemble(buf.slice(offset..offset + len), header),
                offset,
            },
            Seek::Pending { offset } => Seek::Pending { offset },
            Seek::Desync => Seek::Desync,
        }
    }

    /// Like [PackageSeeker::seek_package], but removes garbage and the package from the front of
    ///  `buf` without copying. A desynchronized buffer is left unchanged.
    pub fn take_package(&self, buf: &mut BytesMut) -> Seek<Package<F::Header>> {
        match self.seek_frame(&buf[..]) {
            Seek::Found { value: (header, len), offset } => {
                buf.advance(offset);
                let raw = buf.split_to(len).freeze();
                Seek::Found {
                    value: self.framer.assemble(raw, header),
                    offset,
                }
            }
            Seek::Pending { offset } => {
                buf.advance(offset);
                Seek::Pending { offset }
            }
            Seek::Desync => Seek::Desync,
        }
    }
}
