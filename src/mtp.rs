//! The MTP wire schema: a magic-code anchored header declaring its own length, the data type,
//!  a transaction serial number and the body length.
//!
//! ```ascii
//! 0:  magic code "DIM"
//! 3:  header length (17, or 25 for message fragments)
//! 4:  data type
//! 5:  transaction serial number (u64)
//! 13: body length (i32, -1 for 'rest of the data')
//! 17: number of fragments (u32, fragments only)
//! 21: fragment index (u32, fragments only)
//! ```
//!
//! All numbers are big endian.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;
use crate::package::{Framer, Package, Reaction};
use crate::seeker::SeekerConfig;

pub const MAGIC_CODE: &[u8] = b"DIM";
pub const BASE_HEADER_LEN: usize = 17;
pub const FRAGMENT_HEADER_LEN: usize = 25;
pub const MAX_HEADER_LEN: usize = FRAGMENT_HEADER_LEN;

pub const PING: &[u8] = b"PING";
pub const PONG: &[u8] = b"PONG";
pub const NOOP: &[u8] = b"NOOP";
pub const OK: &[u8] = b"OK";
pub const AGAIN: &[u8] = b"AGAIN";

/// bodies that only carry transport signalling, whatever the data type
fn is_signal(body: &[u8]) -> bool {
    body == PING || body == PONG || body == NOOP
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DataType {
    Command = 0x10,
    CommandResponse = 0x11,
    Message = 0x20,
    MessageResponse = 0x21,
    MessageFragment = 0x22,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub pages: u32,
    pub index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MtpHeader {
    pub data_type: DataType,
    pub sn: u64,
    /// `None` for an open-ended body. Declared lengths must fit into an i32.
    pub body_len: Option<u32>,
    /// present if and only if `data_type` is `MessageFragment`
    pub fragment: Option<Fragment>,
}

impl MtpHeader {
    pub fn for_body(data_type: DataType, sn: u64, body: &[u8]) -> anyhow::Result<MtpHeader> {
        if data_type == DataType::MessageFragment {
            bail!("fragment headers require pages and index");
        }
        Ok(MtpHeader {
            data_type,
            sn,
            body_len: Some(Self::checked_body_len(body)?),
            fragment: None,
        })
    }

    pub fn for_fragment(sn: u64, pages: u32, index: u32, body: &[u8]) -> anyhow::Result<MtpHeader> {
        if index >= pages {
            bail!("fragment index {} out of range for {} pages", index, pages);
        }
        Ok(MtpHeader {
            data_type: DataType::MessageFragment,
            sn,
            body_len: Some(Self::checked_body_len(body)?),
            fragment: Some(Fragment { pages, index }),
        })
    }

    fn checked_body_len(body: &[u8]) -> anyhow::Result<u32> {
        i32::try_from(body.len())
            .map(|l| l as u32)
            .map_err(|_| anyhow!("body of {} bytes is too long for an MTP package", body.len()))
    }

    pub fn header_len(&self) -> usize {
        if self.fragment.is_some() {
            FRAGMENT_HEADER_LEN
        }
        else {
            BASE_HEADER_LEN
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(MAGIC_CODE);
        buf.put_u8(self.header_len() as u8);
        buf.put_u8(self.data_type.into());
        buf.put_u64(self.sn);
        buf.put_i32(match self.body_len {
            Some(len) => len as i32,
            None => -1,
        });
        if let Some(fragment) = &self.fragment {
            buf.put_u32(fragment.pages);
            buf.put_u32(fragment.index);
        }
    }

    /// parses a header at the start of `buf`
    pub fn deser(buf: &[u8]) -> anyhow::Result<MtpHeader> {
        if buf.len() < BASE_HEADER_LEN {
            bail!("{} bytes are too short for a header", buf.len());
        }
        if !buf.starts_with(MAGIC_CODE) {
            bail!("magic code mismatch");
        }

        let header_len = buf[3] as usize;
        let data_type = DataType::try_from(buf[4])
            .map_err(|_| anyhow!("unknown data type {:#x}", buf[4]))?;
        let expected_len = if data_type == DataType::MessageFragment { FRAGMENT_HEADER_LEN } else { BASE_HEADER_LEN };
        if header_len != expected_len {
            bail!("header length {} does not match data type {:?}", header_len, data_type);
        }
        if buf.len() < header_len {
            bail!("{} bytes are too short for a header of {} bytes", buf.len(), header_len);
        }

        let mut b = &buf[5..header_len];
        let sn = b.get_u64();
        let body_len = match b.get_i32() {
            -1 => None,
            len if len >= 0 => Some(len as u32),
            len => bail!("invalid body length {}", len),
        };

        let fragment = if data_type == DataType::MessageFragment {
            let pages = b.get_u32();
            let index = b.get_u32();
            if index >= pages {
                bail!("fragment index {} out of range for {} pages", index, pages);
            }
            Some(Fragment { pages, index })
        }
        else {
            None
        };

        Ok(MtpHeader {
            data_type,
            sn,
            body_len,
            fragment,
        })
    }
}

#[derive(Default)]
pub struct MtpFramer {}

impl MtpFramer {
    pub fn new() -> MtpFramer {
        MtpFramer {}
    }

    /// The seeker configuration for this schema, with the default give-up length and iterative
    ///  resynchronization
    pub fn seeker_config() -> SeekerConfig {
        SeekerConfig::new(MAGIC_CODE, 0, MAX_HEADER_LEN)
    }

    pub fn package(&self, header: MtpHeader, body: &[u8]) -> Package<MtpHeader> {
        let mut buf = BytesMut::with_capacity(header.header_len() + body.len());
        header.ser(&mut buf);
        buf.put_slice(body);
        self.assemble(buf.freeze(), header)
    }

    fn command(&self, data_type: DataType, sn: u64, body: &'static [u8]) -> Package<MtpHeader> {
        let header = MtpHeader {
            data_type,
            sn,
            body_len: Some(body.len() as u32),
            fragment: None,
        };
        self.package(header, body)
    }
}

impl Framer for MtpFramer {
    type Header = MtpHeader;

    fn parse_header(&self, buf: &[u8]) -> Option<MtpHeader> {
        match MtpHeader::deser(buf) {
            Ok(header) => Some(header),
            Err(e) => {
                trace!("no MTP header: {}", e);
                None
            }
        }
    }

    fn header_length(&self, header: &MtpHeader) -> usize {
        header.header_len()
    }

    fn body_length(&self, header: &MtpHeader) -> Option<usize> {
        header.body_len.map(|len| len as usize)
    }

    fn pack(&self, payload: &[u8]) -> anyhow::Result<Package<MtpHeader>> {
        let header = MtpHeader::for_body(DataType::Message, rand::random(), payload)?;
        Ok(self.package(header, payload))
    }

    fn heartbeat(&self) -> Option<Package<MtpHeader>> {
        Some(self.command(DataType::Command, rand::random(), PING))
    }

    /// Commands and messages are acknowledged with `OK`, a `PING` command is answered with
    ///  `PONG`. Responses that only acknowledge are consumed, message fragments are collected by
    ///  their transaction id.
    fn inspect(&self, package: &Package<MtpHeader>) -> Reaction<MtpHeader> {
        let header = package.header();
        let body = package.body().as_ref();

        match header.data_type {
            DataType::Command if body == PING => {
                Reaction::Reply(self.command(DataType::CommandResponse, header.sn, PONG))
            }
            DataType::Command | DataType::Message => {
                let response_type = if header.data_type == DataType::Command { DataType::CommandResponse } else { DataType::MessageResponse };
                let ok = self.command(response_type, header.sn, OK);
                if is_signal(body) {
                    Reaction::Reply(ok)
                }
                else {
                    Reaction::Acknowledge(ok)
                }
            }
            DataType::CommandResponse if body == OK => Reaction::Consume,
            DataType::MessageResponse if body == OK || body == AGAIN => Reaction::Consume,
            DataType::CommandResponse | DataType::MessageResponse if is_signal(body) => Reaction::Consume,
            DataType::CommandResponse | DataType::MessageResponse => Reaction::Deliver,
            DataType::MessageFragment => match header.fragment {
                Some(fragment) => Reaction::Collect {
                    key: header.sn,
                    index: fragment.index,
                    parts: fragment.pages,
                },
                None => Reaction::Deliver,
            },
        }
    }

    /// joins fragments into a single message with the fragments' transaction id
    fn join(&self, parts: Vec<Package<MtpHeader>>) -> anyhow::Result<Package<MtpHeader>> {
        let Some(first) = parts.first() else {
            bail!("no fragments to join");
        };
        let sn = first.header().sn;
        if parts.iter().any(|p| p.header().sn != sn) {
            bail!("fragments of different messages can not be joined");
        }

        let mut body = BytesMut::with_capacity(parts.iter().map(|p| p.body().len()).sum());
        for part in &parts {
            body.put_slice(part.body());
        }
        let header = MtpHeader::for_body(DataType::Message, sn, &body)?;
        Ok(self.package(header, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::seeker::{PackageSeeker, Seek, DEFAULT_GIVE_UP_LEN};
    use rstest::rstest;
    use std::sync::Arc;

    fn ser(header: &MtpHeader) -> Vec<u8> {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        buf.to_vec()
    }

    #[rstest]
    #[case::command(MtpHeader { data_type: DataType::Command, sn: 0, body_len: Some(4), fragment: None })]
    #[case::message(MtpHeader { data_type: DataType::Message, sn: u64::MAX, body_len: Some(i32::MAX as u32), fragment: None })]
    #[case::open_ended(MtpHeader { data_type: DataType::MessageResponse, sn: 12345, body_len: None, fragment: None })]
    #[case::fragment(MtpHeader { data_type: DataType::MessageFragment, sn: 99, body_len: Some(0), fragment: Some(Fragment { pages: 3, index: 2 }) })]
    fn test_ser(#[case] header: MtpHeader) {
        let buf = ser(&header);
        assert_eq!(buf.len(), header.header_len());
        assert_eq!(MtpHeader::deser(&buf).unwrap(), header);
    }

    #[test]
    fn test_ser_layout() {
        let header = MtpHeader::for_body(DataType::Message, 0x0102030405060708, b"abc").unwrap();
        assert_eq!(ser(&header), vec![
            b'D', b'I', b'M', 17, 0x20,
            1, 2, 3, 4, 5, 6, 7, 8,
            0, 0, 0, 3,
        ]);
    }

    #[rstest]
    #[case::short(vec![b'D', b'I', b'M', 17, 0x20])]
    #[case::bad_magic(vec![b'D', b'I', b'X', 17, 0x20, 0,0,0,0,0,0,0,0, 0,0,0,0])]
    #[case::unknown_type(vec![b'D', b'I', b'M', 17, 0x99, 0,0,0,0,0,0,0,0, 0,0,0,0])]
    #[case::wrong_header_len(vec![b'D', b'I', b'M', 25, 0x20, 0,0,0,0,0,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0])]
    #[case::negative_body_len(vec![b'D', b'I', b'M', 17, 0x20, 0,0,0,0,0,0,0,0, 0xff,0xff,0xff,0xfe])]
    #[case::truncated_fragment(vec![b'D', b'I', b'M', 25, 0x22, 0,0,0,0,0,0,0,0, 0,0,0,0, 0,0,0,2])]
    #[case::fragment_index_out_of_range(vec![b'D', b'I', b'M', 25, 0x22, 0,0,0,0,0,0,0,0, 0,0,0,0, 0,0,0,2, 0,0,0,2])]
    fn test_parse_header_rejects(#[case] buf: Vec<u8>) {
        assert!(MtpFramer::new().parse_header(&buf).is_none());
    }

    #[rstest]
    #[case::empty(0, 1)]
    #[case::index_too_big(3, 3)]
    fn test_for_fragment_rejects(#[case] pages: u32, #[case] index: u32) {
        assert!(MtpHeader::for_fragment(1, pages, index, b"x").is_err());
    }

    #[test]
    fn test_pack() {
        let framer = MtpFramer::new();
        let package = framer.pack(b"hello").unwrap();

        assert_eq!(package.header().data_type, DataType::Message);
        assert_eq!(package.header().body_len, Some(5));
        assert_eq!(package.body().as_ref(), b"hello");
        assert_eq!(package.len(), BASE_HEADER_LEN + 5);
        assert_eq!(framer.parse_header(package.raw()).as_ref(), Some(package.header()));
    }

    #[test]
    fn test_inspect_ping() {
        let framer = MtpFramer::new();
        let ping = framer.heartbeat().unwrap();

        match framer.inspect(&ping) {
            Reaction::Reply(pong) => {
                assert_eq!(pong.header().data_type, DataType::CommandResponse);
                assert_eq!(pong.header().sn, ping.header().sn);
                assert_eq!(pong.body().as_ref(), PONG);
                assert!(matches!(framer.inspect(&pong), Reaction::Consume));
            }
            other => panic!("expected a reply, was {:?}", other),
        }
    }

    #[derive(Debug, PartialEq)]
    enum Expected {
        Deliver,
        Consume,
        Reply(DataType, &'static [u8]),
        Acknowledge(DataType),
    }

    #[rstest]
    #[case::command(DataType::Command, b"LOGIN".as_slice(), Expected::Acknowledge(DataType::CommandResponse))]
    #[case::noop_command(DataType::Command, NOOP, Expected::Reply(DataType::CommandResponse, OK))]
    #[case::message(DataType::Message, b"hello".as_slice(), Expected::Acknowledge(DataType::MessageResponse))]
    #[case::message_looking_like_pong(DataType::Message, PONG, Expected::Reply(DataType::MessageResponse, OK))]
    #[case::command_ok(DataType::CommandResponse, OK, Expected::Consume)]
    #[case::command_noop(DataType::CommandResponse, NOOP, Expected::Consume)]
    #[case::command_response_data(DataType::CommandResponse, b"result".as_slice(), Expected::Deliver)]
    #[case::message_ok(DataType::MessageResponse, OK, Expected::Consume)]
    #[case::message_again(DataType::MessageResponse, AGAIN, Expected::Consume)]
    #[case::message_response_data(DataType::MessageResponse, b"receipt".as_slice(), Expected::Deliver)]
    fn test_inspect(#[case] data_type: DataType, #[case] body: &[u8], #[case] expected: Expected) {
        let framer = MtpFramer::new();
        let package = framer.package(MtpHeader::for_body(data_type, 5, body).unwrap(), body);

        let actual = match framer.inspect(&package) {
            Reaction::Deliver => Expected::Deliver,
            Reaction::Consume => Expected::Consume,
            Reaction::Reply(reply) => {
                assert_eq!(reply.header().sn, 5);
                let body: &'static [u8] = if reply.body().as_ref() == OK { OK } else { PONG };
                Expected::Reply(reply.header().data_type, body)
            }
            Reaction::Acknowledge(ack) => {
                assert_eq!(ack.header().sn, 5);
                assert_eq!(ack.body().as_ref(), OK);
                Expected::Acknowledge(ack.header().data_type)
            }
            other => panic!("unexpected reaction {:?}", other),
        };
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_inspect_fragment() {
        let framer = MtpFramer::new();
        let package = framer.package(MtpHeader::for_fragment(42, 3, 1, b"mid").unwrap(), b"mid");

        assert!(matches!(framer.inspect(&package), Reaction::Collect { key: 42, index: 1, parts: 3 }));
    }

    #[test]
    fn test_join() {
        let framer = MtpFramer::new();
        let parts = [b"he".as_slice(), b"ll".as_slice(), b"o".as_slice()].iter()
            .enumerate()
            .map(|(i, body)| framer.package(MtpHeader::for_fragment(42, 3, i as u32, body).unwrap(), body))
            .collect::<Vec<_>>();

        let joined = framer.join(parts).unwrap();
        assert_eq!(joined.header().data_type, DataType::Message);
        assert_eq!(joined.header().sn, 42);
        assert_eq!(joined.body().as_ref(), b"hello");
        assert_eq!(framer.parse_header(joined.raw()).as_ref(), Some(joined.header()));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::mixed_messages(vec![(1, 0), (2, 1)])]
    fn test_join_rejects(#[case] parts: Vec<(u64, u32)>) {
        let framer = MtpFramer::new();
        let parts = parts.into_iter()
            .map(|(sn, index)| framer.package(MtpHeader::for_fragment(sn, 2, index, b"x").unwrap(), b"x"))
            .collect();

        assert!(framer.join(parts).is_err());
    }

    #[test]
    fn test_seek_after_partial_magic() {
        let framer = Arc::new(MtpFramer::new());
        let seeker = PackageSeeker::new(framer.clone(), MtpFramer::seeker_config()).unwrap();
        let package = framer.pack(b"payload").unwrap();

        let mut buf = b"DIDIMxx".to_vec();
        buf.extend_from_slice(package.raw());
        let buf = Bytes::from(buf);

        match seeker.seek_package(&buf) {
            Seek::Found { value, offset } => {
                assert_eq!(offset, 7);
                assert_eq!(value, package);
            }
            other => panic!("expected a package, was {:?}", other),
        }
    }

    #[test]
    fn test_seek_gives_up_on_large_garbage() {
        let seeker = PackageSeeker::new(Arc::new(MtpFramer::new()), MtpFramer::seeker_config()).unwrap();
        let buf = Bytes::from(vec![b'D'; DEFAULT_GIVE_UP_LEN + 1]);

        assert_eq!(seeker.seek_package(&buf), Seek::Desync);
    }
}
