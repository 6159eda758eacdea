pub mod config;
pub mod duid;
pub mod error;
pub mod hooks;
pub mod lease;
pub mod options;
pub mod packet;
pub mod server;

pub use config::{CfgSubnets, Config, Pool6, Subnet6};
pub use duid::Duid;
pub use error::{Error, Result};
pub use hooks::{CalloutHandle, HooksRegistry};
pub use lease::{Lease6, LeaseStore, MemoryLeaseStore};
pub use options::{IaAddress, IaNa, IaPrefix, Option6, StatusCode};
pub use packet::{MessageType, Packet, RelayInfo};
pub use server::{Dhcp6Server, Requirement};
