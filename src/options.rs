//! DHCPv6 option codec.
//!
//! Options are modeled as a tree: every option carries a 16-bit code, an
//! opaque payload, and zero or more sub-options. Container options (the IA
//! family) keep their fixed-size header in `data` and their nested options
//! in `subs`, so packing an option tree reproduces the original wire bytes.

use std::net::Ipv6Addr;

use crate::error::{Error, Result};

/// Well-known DHCPv6 option codes (RFC 3315, RFC 3633, RFC 3646).
pub mod code {
    pub const CLIENT_ID: u16 = 1;
    pub const SERVER_ID: u16 = 2;
    pub const IA_NA: u16 = 3;
    pub const IA_TA: u16 = 4;
    pub const IAADDR: u16 = 5;
    pub const ORO: u16 = 6;
    pub const PREFERENCE: u16 = 7;
    pub const RELAY_MSG: u16 = 9;
    pub const STATUS_CODE: u16 = 13;
    pub const INTERFACE_ID: u16 = 18;
    pub const DNS_SERVERS: u16 = 23;
    pub const IA_PD: u16 = 25;
    pub const IAPREFIX: u16 = 26;
    pub const SUBSCRIBER_ID: u16 = 38;
}

/// A lifetime of all-ones means "infinity" on the wire.
pub const LIFETIME_INFINITY: u32 = 0xffff_ffff;

const OPTION_HDR_LEN: usize = 4;
const IA_HDR_LEN: usize = 12;
const IAADDR_HDR_LEN: usize = 24;
const IAPREFIX_HDR_LEN: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    Success = 0,
    UnspecFail = 1,
    NoAddrsAvail = 2,
    NoBinding = 3,
    NotOnLink = 4,
    UseMulticast = 5,
}

impl TryFrom<u16> for StatusCode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::UnspecFail),
            2 => Ok(Self::NoAddrsAvail),
            3 => Ok(Self::NoBinding),
            4 => Ok(Self::NotOnLink),
            5 => Ok(Self::UseMulticast),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::UnspecFail => write!(f, "UnspecFail"),
            Self::NoAddrsAvail => write!(f, "NoAddrsAvail"),
            Self::NoBinding => write!(f, "NoBinding"),
            Self::NotOnLink => write!(f, "NotOnLink"),
            Self::UseMulticast => write!(f, "UseMulticast"),
        }
    }
}

/// A single DHCPv6 option, possibly with nested sub-options.
///
/// Equality compares code, payload, and sub-options, which matches
/// byte-for-byte wire equality for options produced by this codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Option6 {
    pub code: u16,
    pub data: Vec<u8>,
    pub subs: Vec<Option6>,
}

impl Option6 {
    pub fn new(code: u16, data: Vec<u8>) -> Self {
        Self {
            code,
            data,
            subs: Vec::new(),
        }
    }

    /// Parses a full option list from a byte slice.
    ///
    /// Fails with [`Error::Malformed`] when a declared option length runs
    /// past the end of the buffer.
    pub fn parse_list(buf: &[u8]) -> Result<Vec<Option6>> {
        let mut options = Vec::new();
        let mut offset = 0;

        while offset < buf.len() {
            if offset + OPTION_HDR_LEN > buf.len() {
                return Err(Error::Malformed("truncated option header".to_string()));
            }
            let code = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let length = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let start = offset + OPTION_HDR_LEN;

            if start + length > buf.len() {
                return Err(Error::Malformed(format!(
                    "option {} length {} runs past the buffer",
                    code, length
                )));
            }

            options.push(Self::parse_one(code, &buf[start..start + length])?);
            offset = start + length;
        }

        Ok(options)
    }

    fn parse_one(code: u16, payload: &[u8]) -> Result<Self> {
        let header_len = match code {
            code::IA_NA | code::IA_TA | code::IA_PD => IA_HDR_LEN,
            code::IAADDR => IAADDR_HDR_LEN,
            code::IAPREFIX => IAPREFIX_HDR_LEN,
            _ => return Ok(Self::new(code, payload.to_vec())),
        };

        if payload.len() < header_len {
            return Err(Error::OutOfRange(format!(
                "option {} payload is {} bytes, need {}",
                code,
                payload.len(),
                header_len
            )));
        }

        let mut data = payload[..header_len].to_vec();

        if code == code::IAPREFIX {
            let prefix_len = data[8];
            if prefix_len > 128 {
                return Err(Error::BadValue(format!(
                    "prefix length {} exceeds 128",
                    prefix_len
                )));
            }
            // Host bits past the prefix length must read as zero.
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[9..25]);
            let masked = mask_prefix(Ipv6Addr::from(octets), prefix_len);
            data[9..25].copy_from_slice(&masked.octets());
        }

        let subs = Self::parse_list(&payload[header_len..])?;

        Ok(Self { code, data, subs })
    }

    /// Appends this option (header, payload, sub-options) to `out`.
    pub fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(&(self.payload_len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        for sub in &self.subs {
            sub.pack(out);
        }
    }

    fn payload_len(&self) -> usize {
        self.data.len()
            + self
                .subs
                .iter()
                .map(|sub| OPTION_HDR_LEN + sub.payload_len())
                .sum::<usize>()
    }

    /// Returns the first sub-option with the given code.
    pub fn find(&self, code: u16) -> Option<&Option6> {
        self.subs.iter().find(|sub| sub.code == code)
    }

    pub fn ia_na(iaid: u32, t1: u32, t2: u32) -> Self {
        let mut data = Vec::with_capacity(IA_HDR_LEN);
        data.extend_from_slice(&iaid.to_be_bytes());
        data.extend_from_slice(&t1.to_be_bytes());
        data.extend_from_slice(&t2.to_be_bytes());
        Self::new(code::IA_NA, data)
    }

    pub fn ia_addr(addr: Ipv6Addr, preferred: u32, valid: u32) -> Self {
        let mut data = Vec::with_capacity(IAADDR_HDR_LEN);
        data.extend_from_slice(&addr.octets());
        data.extend_from_slice(&preferred.to_be_bytes());
        data.extend_from_slice(&valid.to_be_bytes());
        Self::new(code::IAADDR, data)
    }

    /// Builds a Status-Code option: two bytes of status followed by UTF-8
    /// explanatory text.
    pub fn status(status: StatusCode, text: &str) -> Self {
        let mut data = Vec::with_capacity(2 + text.len());
        data.extend_from_slice(&(status as u16).to_be_bytes());
        data.extend_from_slice(text.as_bytes());
        Self::new(code::STATUS_CODE, data)
    }

    pub fn as_ia_na(&self) -> Result<IaNa> {
        if self.code != code::IA_NA && self.code != code::IA_TA && self.code != code::IA_PD {
            return Err(Error::BadValue(format!(
                "option {} is not an identity association",
                self.code
            )));
        }
        if self.data.len() < IA_HDR_LEN {
            return Err(Error::OutOfRange("IA header too short".to_string()));
        }
        Ok(IaNa {
            iaid: u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]),
            t1: u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]),
            t2: u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]]),
        })
    }

    pub fn as_ia_addr(&self) -> Result<IaAddress> {
        if self.data.len() < IAADDR_HDR_LEN {
            return Err(Error::OutOfRange("IA address too short".to_string()));
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[..16]);
        Ok(IaAddress {
            addr: Ipv6Addr::from(octets),
            preferred: u32::from_be_bytes([
                self.data[16],
                self.data[17],
                self.data[18],
                self.data[19],
            ]),
            valid: u32::from_be_bytes([
                self.data[20],
                self.data[21],
                self.data[22],
                self.data[23],
            ]),
        })
    }

    pub fn as_ia_prefix(&self) -> Result<IaPrefix> {
        if self.data.len() != IAPREFIX_HDR_LEN {
            return Err(Error::OutOfRange(format!(
                "IA prefix payload is {} bytes, expected {}",
                self.data.len(),
                IAPREFIX_HDR_LEN
            )));
        }
        let prefix_len = self.data[8];
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[9..25]);
        IaPrefix::new(
            u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]),
            u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]),
            prefix_len,
            Ipv6Addr::from(octets),
        )
    }

    /// Reads the payload as a status number plus explanatory text.
    pub fn as_status(&self) -> Result<(u16, String)> {
        if self.data.len() < 2 {
            return Err(Error::OutOfRange("status code too short".to_string()));
        }
        let status = u16::from_be_bytes([self.data[0], self.data[1]]);
        let text = String::from_utf8_lossy(&self.data[2..]).to_string();
        Ok((status, text))
    }

    /// Reads the payload as a list of 16-bit option codes (ORO).
    pub fn as_u16_list(&self) -> Vec<u16> {
        self.data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }
}

/// IA_NA / IA_TA / IA_PD header fields. Sub-options stay on the
/// containing [`Option6`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IaNa {
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
}

/// IA-Address sub-option fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IaAddress {
    pub addr: Ipv6Addr,
    pub preferred: u32,
    pub valid: u32,
}

/// IA-Prefix sub-option fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IaPrefix {
    pub preferred: u32,
    pub valid: u32,
    pub prefix_len: u8,
    pub prefix: Ipv6Addr,
}

impl IaPrefix {
    pub fn new(preferred: u32, valid: u32, prefix_len: u8, prefix: Ipv6Addr) -> Result<Self> {
        if prefix_len > 128 {
            return Err(Error::BadValue(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }
        Ok(Self {
            preferred,
            valid,
            prefix_len,
            prefix: mask_prefix(prefix, prefix_len),
        })
    }

    pub fn to_option(&self) -> Option6 {
        let mut data = Vec::with_capacity(IAPREFIX_HDR_LEN);
        data.extend_from_slice(&self.preferred.to_be_bytes());
        data.extend_from_slice(&self.valid.to_be_bytes());
        data.push(self.prefix_len);
        data.extend_from_slice(&self.prefix.octets());
        Option6::new(code::IAPREFIX, data)
    }
}

/// Clears all bits past `len` in `addr`.
pub fn mask_prefix(addr: Ipv6Addr, len: u8) -> Ipv6Addr {
    if len >= 128 {
        return addr;
    }
    let mask = if len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(len))
    };
    Ipv6Addr::from(u128::from(addr) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_wire_format() {
        let status = Option6::status(StatusCode::NoBinding, "ABCDE");
        let mut packed = Vec::new();
        status.pack(&mut packed);
        assert_eq!(
            packed,
            vec![0x00, 0x0d, 0x00, 0x07, 0x00, 0x03, 0x41, 0x42, 0x43, 0x44, 0x45]
        );
    }

    #[test]
    fn test_status_roundtrip() {
        let status = Option6::status(StatusCode::NoAddrsAvail, "no addresses left");
        let (number, text) = status.as_status().unwrap();
        assert_eq!(number, StatusCode::NoAddrsAvail as u16);
        assert_eq!(text, "no addresses left");
    }

    #[test]
    fn test_ia_na_roundtrip() {
        let mut ia = Option6::ia_na(234, 1500, 3000);
        ia.subs.push(Option6::ia_addr(
            "2001:db8:1:1::dead:beef".parse().unwrap(),
            3000,
            4000,
        ));

        let mut packed = Vec::new();
        ia.pack(&mut packed);

        let parsed = Option6::parse_list(&packed).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], ia);

        let header = parsed[0].as_ia_na().unwrap();
        assert_eq!(header.iaid, 234);
        assert_eq!(header.t1, 1500);
        assert_eq!(header.t2, 3000);

        let addr = parsed[0].find(code::IAADDR).unwrap().as_ia_addr().unwrap();
        assert_eq!(addr.addr, "2001:db8:1:1::dead:beef".parse::<Ipv6Addr>().unwrap());
        assert_eq!(addr.preferred, 3000);
        assert_eq!(addr.valid, 4000);
    }

    #[test]
    fn test_parse_preserves_order_and_bytes() {
        let mut wire = Vec::new();
        Option6::new(code::CLIENT_ID, vec![1, 2, 3, 4]).pack(&mut wire);
        Option6::ia_na(1, 0, 0).pack(&mut wire);
        Option6::new(code::ORO, vec![0, 23, 0, 38]).pack(&mut wire);

        let parsed = Option6::parse_list(&wire).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].code, code::CLIENT_ID);
        assert_eq!(parsed[1].code, code::IA_NA);
        assert_eq!(parsed[2].code, code::ORO);
        assert_eq!(parsed[2].as_u16_list(), vec![23, 38]);

        let mut repacked = Vec::new();
        for option in &parsed {
            option.pack(&mut repacked);
        }
        assert_eq!(repacked, wire);
    }

    #[test]
    fn test_truncated_option_rejected() {
        let mut wire = Vec::new();
        Option6::new(code::CLIENT_ID, vec![1, 2, 3, 4]).pack(&mut wire);
        wire[3] = 200; // declared length past the buffer
        assert!(matches!(
            Option6::parse_list(&wire),
            Err(Error::Malformed(_))
        ));

        assert!(matches!(
            Option6::parse_list(&[0, 1, 0]),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_short_ia_rejected() {
        let mut wire = Vec::new();
        Option6::new(code::IA_NA, vec![0; 8]).pack(&mut wire);
        assert!(matches!(
            Option6::parse_list(&wire),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_ia_prefix_masks_host_bits() {
        let prefix: Ipv6Addr = "2001:db8:1:2:3:4:5:6".parse().unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&1000u32.to_be_bytes());
        data.extend_from_slice(&2000u32.to_be_bytes());
        data.push(64);
        data.extend_from_slice(&prefix.octets());

        let mut wire = Vec::new();
        Option6::new(code::IAPREFIX, data).pack(&mut wire);

        let parsed = Option6::parse_list(&wire).unwrap();
        let ia_prefix = parsed[0].as_ia_prefix().unwrap();
        assert_eq!(ia_prefix.prefix, "2001:db8:1:2::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(ia_prefix.prefix_len, 64);
        assert_eq!(ia_prefix.preferred, 1000);
        assert_eq!(ia_prefix.valid, 2000);
    }

    #[test]
    fn test_ia_prefix_bad_length() {
        let mut data = vec![0u8; IAPREFIX_HDR_LEN];
        data[8] = 129;
        let mut wire = Vec::new();
        Option6::new(code::IAPREFIX, data).pack(&mut wire);
        assert!(matches!(
            Option6::parse_list(&wire),
            Err(Error::BadValue(_))
        ));

        let mut short = Vec::new();
        Option6::new(code::IAPREFIX, vec![0u8; 20]).pack(&mut short);
        assert!(matches!(
            Option6::parse_list(&short),
            Err(Error::OutOfRange(_))
        ));

        assert!(IaPrefix::new(0, 0, 200, Ipv6Addr::UNSPECIFIED).is_err());
    }

    #[test]
    fn test_option_equality() {
        let left = Option6::new(code::CLIENT_ID, vec![1, 2, 3]);
        let right = Option6::new(code::CLIENT_ID, vec![1, 2, 3]);
        assert_eq!(left, right);

        let other_code = Option6::new(code::SERVER_ID, vec![1, 2, 3]);
        assert_ne!(left, other_code);

        let other_payload = Option6::new(code::CLIENT_ID, vec![1, 2, 4]);
        assert_ne!(left, other_payload);
    }

    #[test]
    fn test_mask_prefix_edges() {
        let addr: Ipv6Addr = "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff".parse().unwrap();
        assert_eq!(mask_prefix(addr, 128), addr);
        assert_eq!(mask_prefix(addr, 0), Ipv6Addr::UNSPECIFIED);
        assert_eq!(
            mask_prefix(addr, 48),
            "ffff:ffff:ffff::".parse::<Ipv6Addr>().unwrap()
        );
    }
}
