use std::net::Ipv6Addr;

use crate::error::{Error, Result};
use crate::options::{Option6, code};

pub const DHCP6_SERVER_PORT: u16 = 547;
pub const DHCP6_CLIENT_PORT: u16 = 546;

/// All_DHCP_Relay_Agents_and_Servers multicast address.
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

const HEADER_LEN: usize = 4;
const RELAY_HEADER_LEN: usize = 34;
const HOP_COUNT_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationRequest = 11,
    RelayForw = 12,
    RelayRepl = 13,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Solicit),
            2 => Ok(Self::Advertise),
            3 => Ok(Self::Request),
            4 => Ok(Self::Confirm),
            5 => Ok(Self::Renew),
            6 => Ok(Self::Rebind),
            7 => Ok(Self::Reply),
            8 => Ok(Self::Release),
            9 => Ok(Self::Decline),
            10 => Ok(Self::Reconfigure),
            11 => Ok(Self::InformationRequest),
            12 => Ok(Self::RelayForw),
            13 => Ok(Self::RelayRepl),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Solicit => write!(f, "SOLICIT"),
            Self::Advertise => write!(f, "ADVERTISE"),
            Self::Request => write!(f, "REQUEST"),
            Self::Confirm => write!(f, "CONFIRM"),
            Self::Renew => write!(f, "RENEW"),
            Self::Rebind => write!(f, "REBIND"),
            Self::Reply => write!(f, "REPLY"),
            Self::Release => write!(f, "RELEASE"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Reconfigure => write!(f, "RECONFIGURE"),
            Self::InformationRequest => write!(f, "INFORMATION-REQUEST"),
            Self::RelayForw => write!(f, "RELAY-FORW"),
            Self::RelayRepl => write!(f, "RELAY-REPL"),
        }
    }
}

/// One traversed relay agent: its link-address, peer-address, and the
/// options it attached to the envelope (minus the Relay-Message itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInfo {
    pub hop_count: u8,
    pub link_addr: Ipv6Addr,
    pub peer_addr: Ipv6Addr,
    pub options: Vec<Option6>,
}

impl RelayInfo {
    pub fn new(link_addr: Ipv6Addr, peer_addr: Ipv6Addr) -> Self {
        Self {
            hop_count: 0,
            link_addr,
            peer_addr,
            options: Vec::new(),
        }
    }

    pub fn interface_id(&self) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|option| option.code == code::INTERFACE_ID)
            .map(|option| option.data.as_slice())
    }
}

/// A parsed or to-be-serialized DHCPv6 message.
///
/// The relay stack holds the traversed relay agents, outermost first; the
/// type, transaction id, and options describe the innermost client message.
#[derive(Debug, Clone)]
pub struct Packet {
    pub msg_type: MessageType,
    pub transid: u32,
    pub options: Vec<Option6>,
    pub remote_addr: Ipv6Addr,
    pub remote_port: u16,
    pub local_addr: Ipv6Addr,
    pub local_port: u16,
    pub iface: String,
    pub ifindex: u32,
    pub relay_info: Vec<RelayInfo>,
}

impl Packet {
    pub fn new(msg_type: MessageType, transid: u32) -> Self {
        Self {
            msg_type,
            transid: transid & 0x00ff_ffff,
            options: Vec::new(),
            remote_addr: Ipv6Addr::UNSPECIFIED,
            remote_port: 0,
            local_addr: Ipv6Addr::UNSPECIFIED,
            local_port: 0,
            iface: String::new(),
            ifindex: 0,
            relay_info: Vec::new(),
        }
    }

    /// Parses a wire-format message, unwrapping any RELAY-FORW envelopes
    /// into the relay stack.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut relay_info = Vec::new();
        let mut packet = Self::parse_inner(buf, &mut relay_info, 0)?;
        packet.relay_info = relay_info;
        Ok(packet)
    }

    fn parse_inner(buf: &[u8], relay_info: &mut Vec<RelayInfo>, depth: usize) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Malformed(format!(
                "packet too short: {} bytes",
                buf.len()
            )));
        }

        let msg_type = MessageType::try_from(buf[0])
            .map_err(|value| Error::Malformed(format!("unknown message type {}", value)))?;

        if msg_type == MessageType::RelayForw || msg_type == MessageType::RelayRepl {
            if depth >= HOP_COUNT_LIMIT {
                return Err(Error::Malformed("relay nesting too deep".to_string()));
            }
            if buf.len() < RELAY_HEADER_LEN {
                return Err(Error::Malformed("truncated relay envelope".to_string()));
            }

            let mut link = [0u8; 16];
            link.copy_from_slice(&buf[2..18]);
            let mut peer = [0u8; 16];
            peer.copy_from_slice(&buf[18..34]);

            let mut options = Option6::parse_list(&buf[RELAY_HEADER_LEN..])?;
            let relay_msg_at = options
                .iter()
                .position(|option| option.code == code::RELAY_MSG)
                .ok_or_else(|| {
                    Error::Malformed("relay envelope without relay-message".to_string())
                })?;
            let relay_msg = options.remove(relay_msg_at);

            relay_info.push(RelayInfo {
                hop_count: buf[1],
                link_addr: Ipv6Addr::from(link),
                peer_addr: Ipv6Addr::from(peer),
                options,
            });

            return Self::parse_inner(&relay_msg.data, relay_info, depth + 1);
        }

        let transid = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        let options = Option6::parse_list(&buf[HEADER_LEN..])?;

        let mut packet = Self::new(msg_type, transid);
        packet.options = options;
        Ok(packet)
    }

    /// Encodes the client message: one byte of type, three bytes of
    /// transaction id, then all top-level options in insertion order.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.push(self.msg_type as u8);
        let xid = self.transid.to_be_bytes();
        buf.extend_from_slice(&xid[1..4]);
        for option in &self.options {
            option.pack(&mut buf);
        }
        buf
    }

    /// Returns the first top-level option with the given code.
    pub fn option(&self, code: u16) -> Option<&Option6> {
        self.options.iter().find(|option| option.code == code)
    }

    pub fn add_option(&mut self, option: Option6) {
        self.options.push(option);
    }

    /// Removes all top-level options with the given code; returns whether
    /// any option was removed.
    pub fn del_option(&mut self, code: u16) -> bool {
        let before = self.options.len();
        self.options.retain(|option| option.code != code);
        self.options.len() != before
    }

    pub fn option_count(&self, code: u16) -> usize {
        self.options
            .iter()
            .filter(|option| option.code == code)
            .count()
    }

    pub fn client_id(&self) -> Option<&[u8]> {
        self.option(code::CLIENT_ID)
            .map(|option| option.data.as_slice())
    }

    pub fn server_id(&self) -> Option<&[u8]> {
        self.option(code::SERVER_ID)
            .map(|option| option.data.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_solicit_bytes() -> Vec<u8> {
        vec![
            1, // SOLICIT
            0xca, 0xfe, 0x01, // transaction id
            0, 1, // client-id
            0, 10, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, // DUID
            0, 3, // IA_NA
            0, 12, 0, 0, 0, 1, // iaid = 1
            0, 0, 0, 0, // T1
            0, 0, 0, 0, // T2
        ]
    }

    #[test]
    fn test_parse_simple_solicit() {
        let packet = Packet::parse(&simple_solicit_bytes()).unwrap();
        assert_eq!(packet.msg_type, MessageType::Solicit);
        assert_eq!(packet.transid, 0xcafe01);
        assert_eq!(packet.options.len(), 2);
        assert_eq!(
            packet.client_id(),
            Some(&[1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10][..])
        );
        assert!(packet.relay_info.is_empty());

        let ia = packet.option(code::IA_NA).unwrap().as_ia_na().unwrap();
        assert_eq!(ia.iaid, 1);
    }

    #[test]
    fn test_encode_roundtrip() {
        let original = simple_solicit_bytes();
        let packet = Packet::parse(&original).unwrap();
        assert_eq!(packet.encode(), original);
    }

    #[test]
    fn test_transaction_id_is_24_bits() {
        let packet = Packet::new(MessageType::Solicit, 0xffab_cdef);
        assert_eq!(packet.transid, 0x00ab_cdef);
        assert_eq!(&packet.encode()[1..4], &[0xab, 0xcd, 0xef]);
    }

    #[test]
    fn test_del_option_removes_all() {
        let mut packet = Packet::new(MessageType::Solicit, 1);
        packet.add_option(Option6::new(code::CLIENT_ID, vec![1]));
        packet.add_option(Option6::new(code::ORO, vec![0, 23]));
        packet.add_option(Option6::new(code::CLIENT_ID, vec![2]));

        assert_eq!(packet.option_count(code::CLIENT_ID), 2);
        assert!(packet.del_option(code::CLIENT_ID));
        assert_eq!(packet.option_count(code::CLIENT_ID), 0);
        assert!(!packet.del_option(code::CLIENT_ID));
        assert!(packet.option(code::ORO).is_some());
    }

    #[test]
    fn test_parse_relay_forward() {
        let inner = simple_solicit_bytes();

        let mut envelope = vec![12, 1]; // RELAY-FORW, hop count 1
        let link: Ipv6Addr = "2001:db8:2::1234".parse().unwrap();
        let peer: Ipv6Addr = "fe80::1".parse().unwrap();
        envelope.extend_from_slice(&link.octets());
        envelope.extend_from_slice(&peer.octets());
        Option6::new(code::INTERFACE_ID, b"relay2".to_vec()).pack(&mut envelope);
        Option6::new(code::RELAY_MSG, inner).pack(&mut envelope);

        let packet = Packet::parse(&envelope).unwrap();
        assert_eq!(packet.msg_type, MessageType::Solicit);
        assert_eq!(packet.transid, 0xcafe01);
        assert_eq!(packet.relay_info.len(), 1);

        let relay = &packet.relay_info[0];
        assert_eq!(relay.link_addr, link);
        assert_eq!(relay.peer_addr, peer);
        assert_eq!(relay.hop_count, 1);
        assert_eq!(relay.interface_id(), Some(&b"relay2"[..]));
    }

    #[test]
    fn test_relay_without_message_rejected() {
        let mut envelope = vec![12, 0];
        envelope.extend_from_slice(&[0u8; 32]);
        Option6::new(code::INTERFACE_ID, b"relay1".to_vec()).pack(&mut envelope);
        assert!(matches!(
            Packet::parse(&envelope),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(Packet::parse(&[]).is_err());
        assert!(Packet::parse(&[1, 2]).is_err());
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        assert!(matches!(
            Packet::parse(&[99, 0, 0, 1]),
            Err(Error::Malformed(_))
        ));
    }
}
