//! DHCP Unique Identifiers and the server's own persisted identity.
//!
//! The server DUID is generated once (DUID-LLT from the first usable
//! interface) and written to a text file as colon-separated hex octets;
//! later runs read it back and never regenerate it.

use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const DUID_TYPE_LLT: u16 = 1;
pub const DUID_TYPE_EN: u16 = 2;
pub const DUID_TYPE_LL: u16 = 3;
pub const DUID_TYPE_UUID: u16 = 4;

const MAX_DUID_LEN: usize = 128;

/// 2000-01-01T00:00:00Z as a POSIX timestamp; DUID-LLT time counts from
/// here, not from the POSIX epoch.
const DUID_EPOCH_UNIX: i64 = 946_684_800;

/// An opaque DHCPv6 entity identifier, 1 to 128 octets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Duid(Vec<u8>);

impl Duid {
    pub fn new(octets: Vec<u8>) -> Result<Self> {
        if octets.is_empty() || octets.len() > MAX_DUID_LEN {
            return Err(Error::BadValue(format!(
                "DUID must be 1 to {} octets, got {}",
                MAX_DUID_LEN,
                octets.len()
            )));
        }
        Ok(Self(octets))
    }

    /// Builds a DUID-LLT: type, hardware type, seconds since 2000-01-01
    /// UTC, link-layer address. The link-layer address must be non-zero.
    pub fn new_llt(hardware_type: u16, time: u32, ll_addr: &[u8]) -> Result<Self> {
        if ll_addr.is_empty() || ll_addr.iter().all(|byte| *byte == 0) {
            return Err(Error::BadValue(
                "link-layer address must be non-zero".to_string(),
            ));
        }
        let mut octets = Vec::with_capacity(8 + ll_addr.len());
        octets.extend_from_slice(&DUID_TYPE_LLT.to_be_bytes());
        octets.extend_from_slice(&hardware_type.to_be_bytes());
        octets.extend_from_slice(&time.to_be_bytes());
        octets.extend_from_slice(ll_addr);
        Self::new(octets)
    }

    /// Parses colon-separated hex octets; case-insensitive.
    pub fn from_hex(text: &str) -> Result<Self> {
        let octets = text
            .split(':')
            .map(|part| {
                u8::from_str_radix(part, 16)
                    .map_err(|_| Error::BadValue(format!("invalid DUID octet {:?}", part)))
            })
            .collect::<Result<Vec<u8>>>()?;
        Self::new(octets)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// The leading two-byte type tag, if the DUID is long enough to have one.
    pub fn duid_type(&self) -> Option<u16> {
        if self.0.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.0[0], self.0[1]]))
    }
}

impl std::fmt::Display for Duid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self
            .0
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<Vec<_>>()
            .join(":");
        write!(f, "{}", hex)
    }
}

/// Loads the server DUID from `path`, generating and persisting a fresh
/// DUID-LLT when the file is absent or unreadable.
pub async fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Duid> {
    let path = path.as_ref();

    match load(path).await {
        Ok(Some(duid)) => {
            info!("Loaded server DUID {} from {}", duid, path.display());
            return Ok(duid);
        }
        Ok(None) => {}
        Err(error) => {
            warn!(
                "Ignoring server DUID file {}: {}",
                path.display(),
                error
            );
        }
    }

    let duid = generate()?;
    persist(path, &duid).await?;
    info!("Generated server DUID {}, stored in {}", duid, path.display());
    Ok(duid)
}

pub async fn load(path: &Path) -> Result<Option<Duid>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(path).await?;
    Duid::from_hex(content.trim()).map(Some)
}

pub async fn persist(path: &Path, duid: &Duid) -> Result<()> {
    tokio::fs::write(path, duid.to_string()).await?;
    Ok(())
}

/// Generates a DUID-LLT from the first detected interface that has a
/// non-zero link-layer address.
pub fn generate() -> Result<Duid> {
    let (hardware_type, ll_addr) = first_link_layer_address()?;
    let elapsed = (Utc::now().timestamp() - DUID_EPOCH_UNIX).max(0) as u32;
    Duid::new_llt(hardware_type, elapsed, &ll_addr)
}

fn first_link_layer_address() -> Result<(u16, Vec<u8>)> {
    let entries = std::fs::read_dir("/sys/class/net")
        .map_err(|error| Error::Library(format!("interface enumeration failed: {}", error)))?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    for name in names {
        if name == "lo" {
            continue;
        }
        let base = format!("/sys/class/net/{}", name);
        let Ok(type_text) = std::fs::read_to_string(format!("{}/type", base)) else {
            continue;
        };
        let Ok(hardware_type) = type_text.trim().parse::<u16>() else {
            continue;
        };
        let Ok(addr_text) = std::fs::read_to_string(format!("{}/address", base)) else {
            continue;
        };
        let octets: Vec<u8> = addr_text
            .trim()
            .split(':')
            .filter_map(|part| u8::from_str_radix(part, 16).ok())
            .collect();
        if octets.is_empty() || octets.iter().all(|byte| *byte == 0) {
            continue;
        }
        return Ok((hardware_type, octets));
    }

    Err(Error::Unsupported(
        "no interface with a usable link-layer address".to_string(),
    ))
}
