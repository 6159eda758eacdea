use std::net::Ipv6Addr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packet::Packet;

/// A contiguous closed range of IA_NA addresses inside one subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool6 {
    first: Ipv6Addr,
    last: Ipv6Addr,
}

impl Pool6 {
    pub fn new(first: Ipv6Addr, last: Ipv6Addr) -> Result<Self> {
        if u128::from(first) > u128::from(last) {
            return Err(Error::InvalidConfig(format!(
                "pool range {} - {} is inverted",
                first, last
            )));
        }
        Ok(Self { first, last })
    }

    /// Builds a pool spanning the whole prefix.
    pub fn from_prefix(prefix: Ipv6Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 128 {
            return Err(Error::InvalidConfig(format!(
                "pool prefix length {} exceeds 128",
                prefix_len
            )));
        }
        let first = crate::options::mask_prefix(prefix, prefix_len);
        let host_bits = 128 - u32::from(prefix_len);
        let last = if host_bits == 0 {
            first
        } else if host_bits == 128 {
            Ipv6Addr::from(u128::MAX)
        } else {
            Ipv6Addr::from(u128::from(first) | ((1u128 << host_bits) - 1))
        };
        Ok(Self { first, last })
    }

    pub fn first(&self) -> Ipv6Addr {
        self.first
    }

    pub fn last(&self) -> Ipv6Addr {
        self.last
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        let value = u128::from(addr);
        value >= u128::from(self.first) && value <= u128::from(self.last)
    }

    /// Next address after `addr` inside the pool, wrapping to the first.
    pub fn next_after(&self, addr: Ipv6Addr) -> Ipv6Addr {
        let value = u128::from(addr);
        if !self.contains(addr) || value == u128::from(self.last) {
            self.first
        } else {
            Ipv6Addr::from(value + 1)
        }
    }
}

/// Option payload configured for a subnet, delivered on request via the ORO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredOption {
    pub code: u16,
    pub data: Vec<u8>,
}

/// An administrator-configured IPv6 subnet with its pools and timers.
#[derive(Debug, Clone)]
pub struct Subnet6 {
    id: u32,
    prefix: Ipv6Addr,
    prefix_len: u8,
    pub t1: u32,
    pub t2: u32,
    pub preferred: u32,
    pub valid: u32,
    pools: Vec<Pool6>,
    pub interface: Option<String>,
    pub interface_id: Option<Vec<u8>>,
    pub options: Vec<ConfiguredOption>,
}

impl Subnet6 {
    pub fn new(
        prefix: Ipv6Addr,
        prefix_len: u8,
        t1: u32,
        t2: u32,
        preferred: u32,
        valid: u32,
    ) -> Result<Self> {
        if prefix_len > 128 {
            return Err(Error::InvalidConfig(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }
        Ok(Self {
            id: 0,
            prefix: crate::options::mask_prefix(prefix, prefix_len),
            prefix_len,
            t1,
            t2,
            preferred,
            valid,
            pools: Vec::new(),
            interface: None,
            interface_id: None,
            options: Vec::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn prefix(&self) -> (Ipv6Addr, u8) {
        (self.prefix, self.prefix_len)
    }

    pub fn in_range(&self, addr: Ipv6Addr) -> bool {
        crate::options::mask_prefix(addr, self.prefix_len) == self.prefix
    }

    pub fn in_pool(&self, addr: Ipv6Addr) -> bool {
        self.pools.iter().any(|pool| pool.contains(addr))
    }

    /// Adds a pool; every pool must lie inside the subnet prefix.
    pub fn add_pool(&mut self, pool: Pool6) -> Result<()> {
        if !self.in_range(pool.first()) || !self.in_range(pool.last()) {
            return Err(Error::InvalidConfig(format!(
                "pool {} - {} is outside subnet {}/{}",
                pool.first(),
                pool.last(),
                self.prefix,
                self.prefix_len
            )));
        }
        self.pools.push(pool);
        Ok(())
    }

    pub fn pools(&self) -> &[Pool6] {
        &self.pools
    }

    pub fn configured_option(&self, code: u16) -> Option<&ConfiguredOption> {
        self.options.iter().find(|option| option.code == code)
    }
}

fn is_link_local(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// The live, ordered set of subnets. Mutation is administrative; the hot
/// path only reads. Replace wholesale on reconfigure.
#[derive(Debug, Default)]
pub struct CfgSubnets {
    subnets: Vec<Arc<Subnet6>>,
    next_id: u32,
}

impl CfgSubnets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subnet and returns its assigned id.
    pub fn add(&mut self, mut subnet: Subnet6) -> u32 {
        self.next_id += 1;
        subnet.id = self.next_id;
        self.subnets.push(Arc::new(subnet));
        self.next_id
    }

    pub fn replace_all(&mut self, subnets: Vec<Subnet6>) {
        self.subnets.clear();
        for subnet in subnets {
            self.add(subnet);
        }
    }

    pub fn clear(&mut self) {
        self.subnets.clear();
    }

    pub fn subnets(&self) -> &[Arc<Subnet6>] {
        &self.subnets
    }

    pub fn by_id(&self, id: u32) -> Option<&Arc<Subnet6>> {
        self.subnets.iter().find(|subnet| subnet.id == id)
    }

    /// Selects the subnet for an inbound packet.
    ///
    /// Priority: relay interface-id match, then relay link-address, then
    /// receiving-interface name, then source address. A direct link-local
    /// client carries no topology hint, so it is placed only when the
    /// configuration is unambiguous (exactly one subnet).
    pub fn select(&self, packet: &Packet) -> Option<Arc<Subnet6>> {
        if let Some(relay) = packet.relay_info.last() {
            if let Some(iface_id) = relay.interface_id()
                && let Some(subnet) = self
                    .subnets
                    .iter()
                    .find(|subnet| subnet.interface_id.as_deref() == Some(iface_id))
            {
                return Some(Arc::clone(subnet));
            }
            return self
                .subnets
                .iter()
                .find(|subnet| subnet.in_range(relay.link_addr))
                .cloned();
        }

        if !packet.iface.is_empty() {
            return self
                .subnets
                .iter()
                .find(|subnet| subnet.interface.as_deref() == Some(packet.iface.as_str()))
                .cloned();
        }

        if is_link_local(packet.remote_addr) {
            if self.subnets.len() == 1 {
                return Some(Arc::clone(&self.subnets[0]));
            }
            return None;
        }

        self.subnets
            .iter()
            .find(|subnet| subnet.in_range(packet.remote_addr))
            .cloned()
    }
}

/// On-disk server configuration, matching the JSON shape the config
/// collaborator produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub renew_timer: u32,
    pub rebind_timer: u32,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    #[serde(default = "default_interface")]
    pub interface: Vec<String>,
    #[serde(default)]
    pub subnet6: Vec<SubnetConfig>,
    #[serde(default = "default_duid_file")]
    pub duid_file: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubnetConfig {
    pub subnet: String,
    pub pool: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub option_data: Vec<OptionData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OptionData {
    pub name: String,
    pub space: String,
    pub code: u16,
    pub data: String,
    pub csv_format: bool,
}

fn default_interface() -> Vec<String> {
    vec!["all".to_string()]
}

fn default_duid_file() -> String {
    "server-duid.txt".to_string()
}

fn default_port() -> u16 {
    crate::packet::DHCP6_SERVER_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            renew_timer: 1000,
            rebind_timer: 2000,
            preferred_lifetime: 3000,
            valid_lifetime: 4000,
            interface: default_interface(),
            subnet6: Vec::new(),
            duid_file: default_duid_file(),
            port: default_port(),
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.valid_lifetime == 0 {
            return Err(Error::InvalidConfig(
                "valid-lifetime must be greater than 0".to_string(),
            ));
        }
        if self.preferred_lifetime > self.valid_lifetime {
            return Err(Error::InvalidConfig(
                "preferred-lifetime must not exceed valid-lifetime".to_string(),
            ));
        }
        if self.renew_timer > self.rebind_timer {
            return Err(Error::InvalidConfig(
                "renew-timer must not exceed rebind-timer".to_string(),
            ));
        }
        // Subnet entries are validated during build_subnets.
        Ok(())
    }

    /// Converts the JSON subnet entries into the registry's subnet model.
    pub fn build_subnets(&self) -> Result<Vec<Subnet6>> {
        let mut subnets = Vec::with_capacity(self.subnet6.len());

        for entry in &self.subnet6 {
            let (prefix, prefix_len) = parse_prefix(&entry.subnet)?;
            let mut subnet = Subnet6::new(
                prefix,
                prefix_len,
                self.renew_timer,
                self.rebind_timer,
                self.preferred_lifetime,
                self.valid_lifetime,
            )?;

            for pool_text in &entry.pool {
                subnet.add_pool(parse_pool(pool_text)?)?;
            }

            subnet.interface = entry.interface.clone();
            subnet.interface_id = entry
                .interface_id
                .as_ref()
                .map(|text| text.as_bytes().to_vec());

            for option in &entry.option_data {
                subnet.options.push(ConfiguredOption {
                    code: option.code,
                    data: option.to_wire()?,
                });
            }

            subnets.push(subnet);
        }

        Ok(subnets)
    }
}

impl OptionData {
    /// Converts the textual `data` field into wire bytes: comma-separated
    /// IPv6 addresses when `csv-format` is set, hex octets otherwise.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        if self.csv_format {
            let mut wire = Vec::new();
            for item in self.data.split(',') {
                let addr: Ipv6Addr = item.trim().parse().map_err(|_| {
                    Error::BadValue(format!(
                        "option {} ({}): {:?} is not an IPv6 address",
                        self.name,
                        self.code,
                        item.trim()
                    ))
                })?;
                wire.extend_from_slice(&addr.octets());
            }
            return Ok(wire);
        }

        let text: String = self.data.chars().filter(|c| !c.is_whitespace()).collect();
        let text = text.replace(':', "");
        if text.len() % 2 != 0 {
            return Err(Error::BadValue(format!(
                "option {} ({}): odd-length hex string",
                self.name, self.code
            )));
        }
        (0..text.len())
            .step_by(2)
            .map(|at| {
                u8::from_str_radix(&text[at..at + 2], 16).map_err(|_| {
                    Error::BadValue(format!(
                        "option {} ({}): invalid hex data",
                        self.name, self.code
                    ))
                })
            })
            .collect()
    }
}

fn parse_prefix(text: &str) -> Result<(Ipv6Addr, u8)> {
    let (addr_text, len_text) = text
        .split_once('/')
        .ok_or_else(|| Error::InvalidConfig(format!("{:?} is not a prefix", text)))?;
    let addr: Ipv6Addr = addr_text
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{:?} is not an IPv6 address", addr_text)))?;
    let len: u8 = len_text
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{:?} is not a prefix length", len_text)))?;
    if len > 128 {
        return Err(Error::InvalidConfig(format!(
            "prefix length {} exceeds 128",
            len
        )));
    }
    Ok((addr, len))
}

/// Parses a pool entry: either `prefix/len` or `first - last`.
fn parse_pool(text: &str) -> Result<Pool6> {
    if text.contains('/') {
        let (prefix, len) = parse_prefix(text)?;
        return Pool6::from_prefix(prefix, len);
    }

    let (first_text, last_text) = text
        .split_once('-')
        .ok_or_else(|| Error::InvalidConfig(format!("{:?} is not a pool", text)))?;
    let first: Ipv6Addr = first_text
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{:?} is not an IPv6 address", first_text)))?;
    let last: Ipv6Addr = last_text
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{:?} is not an IPv6 address", last_text)))?;
    Pool6::new(first, last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MessageType, RelayInfo};

    fn subnet(prefix: &str, len: u8) -> Subnet6 {
        Subnet6::new(prefix.parse().unwrap(), len, 1, 2, 3, 4).unwrap()
    }

    fn direct_packet(remote: &str) -> Packet {
        let mut packet = Packet::new(MessageType::Solicit, 1234);
        packet.remote_addr = remote.parse().unwrap();
        packet
    }

    #[test]
    fn test_pool_from_prefix() {
        let pool = Pool6::from_prefix("2001:db8:1:1::".parse().unwrap(), 64).unwrap();
        assert_eq!(pool.first(), "2001:db8:1:1::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(
            pool.last(),
            "2001:db8:1:1:ffff:ffff:ffff:ffff".parse::<Ipv6Addr>().unwrap()
        );
        assert!(pool.contains("2001:db8:1:1::dead:beef".parse().unwrap()));
        assert!(!pool.contains("2001:db8:1:2::1".parse().unwrap()));
    }

    #[test]
    fn test_pool_wraparound() {
        let pool = Pool6::new(
            "2001:db8::10".parse().unwrap(),
            "2001:db8::12".parse().unwrap(),
        )
        .unwrap();
        let addr = pool.next_after(pool.first());
        assert_eq!(addr, "2001:db8::11".parse::<Ipv6Addr>().unwrap());
        assert_eq!(pool.next_after(pool.last()), pool.first());
    }

    #[test]
    fn test_inverted_pool_rejected() {
        assert!(
            Pool6::new(
                "2001:db8::2".parse().unwrap(),
                "2001:db8::1".parse().unwrap()
            )
            .is_err()
        );
    }

    #[test]
    fn test_pool_must_lie_inside_subnet() {
        let mut net = subnet("2001:db8:1::", 48);
        assert!(
            net.add_pool(Pool6::from_prefix("2001:db8:1:1::".parse().unwrap(), 64).unwrap())
                .is_ok()
        );
        assert!(
            net.add_pool(Pool6::from_prefix("2001:db8:2::".parse().unwrap(), 64).unwrap())
                .is_err()
        );
    }

    #[test]
    fn test_subnet_range_and_pool() {
        let mut net = subnet("2001:db8:1::", 48);
        net.add_pool(Pool6::from_prefix("2001:db8:1:1::".parse().unwrap(), 64).unwrap())
            .unwrap();

        assert!(net.in_range("2001:db8:1::cafe:babe".parse().unwrap()));
        assert!(!net.in_range("2001:db8:2::1".parse().unwrap()));
        assert!(net.in_pool("2001:db8:1:1::dead:beef".parse().unwrap()));
        assert!(!net.in_pool("2001:db8:1::cafe:babe".parse().unwrap()));
    }

    #[test]
    fn test_select_by_source_address() {
        let mut cfg = CfgSubnets::new();
        cfg.add(subnet("2001:db8:1::", 48));
        cfg.add(subnet("2001:db8:2::", 48));
        cfg.add(subnet("2001:db8:3::", 48));

        let selected = cfg.select(&direct_packet("2001:db8:2::baca")).unwrap();
        assert_eq!(selected.prefix(), ("2001:db8:2::".parse().unwrap(), 48));

        assert!(cfg.select(&direct_packet("2001:db8:4::baca")).is_none());
    }

    #[test]
    fn test_select_link_local_needs_unambiguous_config() {
        let mut cfg = CfgSubnets::new();
        cfg.add(subnet("2001:db8:1::", 48));
        assert!(cfg.select(&direct_packet("fe80::abcd")).is_some());

        cfg.add(subnet("2001:db8:2::", 48));
        cfg.add(subnet("2001:db8:3::", 48));
        assert!(cfg.select(&direct_packet("fe80::abcd")).is_none());
    }

    #[test]
    fn test_select_by_interface() {
        let mut cfg = CfgSubnets::new();
        let mut eth0 = subnet("2001:db8:1::", 48);
        eth0.interface = Some("eth0".to_string());
        cfg.add(eth0);
        cfg.add(subnet("2001:db8:2::", 48));
        let mut wifi1 = subnet("2001:db8:3::", 48);
        wifi1.interface = Some("wifi1".to_string());
        cfg.add(wifi1);

        let mut packet = direct_packet("fe80::abcd");
        packet.iface = "eth0".to_string();
        assert_eq!(cfg.select(&packet).unwrap().id(), 1);

        packet.iface = "wifi1".to_string();
        assert_eq!(cfg.select(&packet).unwrap().id(), 3);

        packet.iface = "eth3".to_string();
        assert!(cfg.select(&packet).is_none());
    }

    #[test]
    fn test_select_by_relay_link_address() {
        let mut cfg = CfgSubnets::new();
        cfg.add(subnet("2001:db8:1::", 48));
        cfg.add(subnet("2001:db8:2::", 48));
        cfg.add(subnet("2001:db8:3::", 48));

        let mut packet = direct_packet("2001:db8:1::baca");
        packet.relay_info.push(RelayInfo::new(
            "2001:db8:2::1234".parse().unwrap(),
            "fe80::1".parse().unwrap(),
        ));

        // Selection is driven by the relay link-address, not the source.
        assert_eq!(cfg.select(&packet).unwrap().id(), 2);

        packet.relay_info.clear();
        packet.relay_info.push(RelayInfo::new(
            "2001:db8:4::1234".parse().unwrap(),
            "fe80::1".parse().unwrap(),
        ));
        assert!(cfg.select(&packet).is_none());
    }

    #[test]
    fn test_relay_interface_id_wins_over_link_address() {
        let mut cfg = CfgSubnets::new();
        let mut relay1 = subnet("2001:db8:1::", 48);
        relay1.interface_id = Some(b"relay1".to_vec());
        cfg.add(relay1);
        let mut relay2 = subnet("2001:db8:2::", 48);
        relay2.interface_id = Some(b"relay2".to_vec());
        cfg.add(relay2);
        cfg.add(subnet("2001:db8:3::", 48));

        let mut relay = RelayInfo::new(
            // Link-address sits inside subnet 1, but the interface-id names
            // subnet 2.
            "2001:db8:1::1234".parse().unwrap(),
            "fe80::1".parse().unwrap(),
        );
        relay
            .options
            .push(crate::options::Option6::new(
                crate::options::code::INTERFACE_ID,
                b"relay2".to_vec(),
            ));

        let mut packet = direct_packet("fe80::1");
        packet.relay_info.push(relay);

        assert_eq!(cfg.select(&packet).unwrap().id(), 2);
    }

    #[test]
    fn test_replace_all_assigns_fresh_ids() {
        let mut cfg = CfgSubnets::new();
        cfg.add(subnet("2001:db8:1::", 48));
        cfg.replace_all(vec![subnet("2001:db8:2::", 48), subnet("2001:db8:3::", 48)]);

        assert_eq!(cfg.subnets().len(), 2);
        assert_eq!(cfg.subnets()[0].id(), 2);
        assert_eq!(cfg.subnets()[1].id(), 3);
        assert!(cfg.by_id(1).is_none());
        assert!(cfg.by_id(3).is_some());
    }

    #[test]
    fn test_config_json_shape() {
        let json = r#"{
            "interface": [ "all" ],
            "preferred-lifetime": 3000,
            "rebind-timer": 2000,
            "renew-timer": 1000,
            "subnet6": [ {
                "pool": [ "2001:db8:1:1::/64" ],
                "subnet": "2001:db8:1::/48",
                "option-data": [ {
                    "name": "dns-servers",
                    "space": "dhcp6",
                    "code": 23,
                    "data": "2001:db8:1234:FFFF::1, 2001:db8:1234:FFFF::2",
                    "csv-format": true
                }, {
                    "name": "subscriber-id",
                    "space": "dhcp6",
                    "code": 38,
                    "data": "1234",
                    "csv-format": false
                } ]
            } ],
            "valid-lifetime": 4000
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.renew_timer, 1000);
        assert_eq!(config.rebind_timer, 2000);
        assert_eq!(config.preferred_lifetime, 3000);
        assert_eq!(config.valid_lifetime, 4000);

        let subnets = config.build_subnets().unwrap();
        assert_eq!(subnets.len(), 1);
        let net = &subnets[0];
        assert_eq!(net.prefix(), ("2001:db8:1::".parse().unwrap(), 48));
        assert!(net.in_pool("2001:db8:1:1::dead:beef".parse().unwrap()));

        let dns = net.configured_option(23).unwrap();
        assert_eq!(dns.data.len(), 32);
        assert_eq!(
            &dns.data[..16],
            &"2001:db8:1234:ffff::1".parse::<Ipv6Addr>().unwrap().octets()
        );

        let subscriber = net.configured_option(38).unwrap();
        assert_eq!(subscriber.data, vec![0x12, 0x34]);
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());

        let invalid_configs = [
            Config {
                valid_lifetime: 0,
                ..Default::default()
            },
            Config {
                preferred_lifetime: 5000,
                ..Default::default()
            },
            Config {
                renew_timer: 3000,
                ..Default::default()
            },
        ];
        for config in invalid_configs {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_pool_range_syntax() {
        let pool = parse_pool("2001:db8:1:1::10 - 2001:db8:1:1::20").unwrap();
        assert_eq!(pool.first(), "2001:db8:1:1::10".parse::<Ipv6Addr>().unwrap());
        assert_eq!(pool.last(), "2001:db8:1:1::20".parse::<Ipv6Addr>().unwrap());

        assert!(parse_pool("not-a-pool").is_err());
        assert!(parse_pool("2001:db8::/129").is_err());
    }

    #[test]
    fn test_option_data_hex_forms() {
        let option = OptionData {
            name: "subscriber-id".to_string(),
            space: "dhcp6".to_string(),
            code: 38,
            data: "de:ad be:ef".to_string(),
            csv_format: false,
        };
        assert_eq!(option.to_wire().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);

        let odd = OptionData {
            data: "abc".to_string(),
            ..option.clone()
        };
        assert!(odd.to_wire().is_err());

        let bad_csv = OptionData {
            data: "not-an-address".to_string(),
            csv_format: true,
            ..option
        };
        assert!(bad_csv.to_wire().is_err());
    }
}
