use bytes::{BufMut, Bytes, BytesMut};
use crate::package::{Framer, Package};
use crate::seeker::SeekerConfig;

/// A minimal schema with the magic code in the middle of the header, to exercise a non-zero
///  magic offset:
///
/// ```ascii
/// 0: body length (u16, 0xffff for open-ended)
/// 2: magic "SG"
/// 4: header length (always 6)
/// 5: tag
/// ```
pub struct TestFramer;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestHeader {
    pub body_len: Option<u16>,
    pub tag: u8,
}

impl TestFramer {
    pub const HEADER_LEN: usize = 6;

    pub fn seeker_config() -> SeekerConfig {
        SeekerConfig::new(b"SG", 2, Self::HEADER_LEN)
    }
}

impl Framer for TestFramer {
    type Header = TestHeader;

    fn parse_header(&self, buf: &[u8]) -> Option<TestHeader> {
        if buf.len() < Self::HEADER_LEN || &buf[2..4] != b"SG" || buf[4] as usize != Self::HEADER_LEN {
            return None;
        }
        let raw_len = u16::from_be_bytes([buf[0], buf[1]]);
        Some(TestHeader {
            body_len: if raw_len == u16::MAX { None } else { Some(raw_len) },
            tag: buf[5],
        })
    }

    fn header_length(&self, _header: &TestHeader) -> usize {
        Self::HEADER_LEN
    }

    fn body_length(&self, header: &TestHeader) -> Option<usize> {
        header.body_len.map(usize::from)
    }

    fn pack(&self, payload: &[u8]) -> anyhow::Result<Package<TestHeader>> {
        let body_len = u16::try_from(payload.len())?;
        let raw = Bytes::from(test_package_bytes(0, payload));
        Ok(self.assemble(raw, TestHeader { body_len: Some(body_len), tag: 0 }))
    }
}

pub fn test_header_bytes(body_len: Option<u16>, tag: u8) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(body_len.unwrap_or(u16::MAX));
    buf.put_slice(b"SG");
    buf.put_u8(TestFramer::HEADER_LEN as u8);
    buf.put_u8(tag);
    buf.to_vec()
}

pub fn test_package_bytes(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut result = test_header_bytes(Some(body.len() as u16), tag);
    result.extend_from_slice(body);
    result
}
