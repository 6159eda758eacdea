//! The DHCPv6 message processor and UDP front end.
//!
//! Processing is single-threaded cooperative: the run loop pulls one
//! packet, runs it to completion, emits at most one reply, and only then
//! reads the next packet. All state the processor needs (subnet registry,
//! lease store, server DUID, hooks, allocation cursor) lives on the server
//! value, so tests can run several independent instances.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::{CfgSubnets, Subnet6};
use crate::duid::Duid;
use crate::error::{Error, Result};
use crate::hooks::HooksRegistry;
use crate::lease::{Lease6, LeaseStore, MemoryLeaseStore};
use crate::options::{Option6, StatusCode, code};
use crate::packet::{
    ALL_DHCP_RELAY_AGENTS_AND_SERVERS, DHCP6_SERVER_PORT, MessageType, Packet,
};

const RECV_BUFFER_SIZE: usize = 1500;

/// Presence expectation for a unique option during the sanity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Mandatory,
    Optional,
    Forbidden,
}

pub struct Dhcp6Server {
    cfg: CfgSubnets,
    leases: Arc<dyn LeaseStore>,
    server_id: Duid,
    hooks: HooksRegistry,
    port: u16,
    /// Last address handed out per subnet; allocation resumes after it.
    last_allocated: Mutex<HashMap<u32, Ipv6Addr>>,
}

impl Dhcp6Server {
    pub fn new(server_id: Duid) -> Self {
        Self::with_lease_store(server_id, Arc::new(MemoryLeaseStore::new()))
    }

    pub fn with_lease_store(server_id: Duid, leases: Arc<dyn LeaseStore>) -> Self {
        Self {
            cfg: CfgSubnets::new(),
            leases,
            server_id,
            hooks: HooksRegistry::new(),
            port: DHCP6_SERVER_PORT,
            last_allocated: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn cfg(&self) -> &CfgSubnets {
        &self.cfg
    }

    pub fn cfg_mut(&mut self) -> &mut CfgSubnets {
        &mut self.cfg
    }

    pub fn hooks_mut(&mut self) -> &mut HooksRegistry {
        &mut self.hooks
    }

    pub fn leases(&self) -> &Arc<dyn LeaseStore> {
        &self.leases
    }

    pub fn server_id(&self) -> &Duid {
        &self.server_id
    }

    pub fn server_id_option(&self) -> Option6 {
        Option6::new(code::SERVER_ID, self.server_id.as_slice().to_vec())
    }

    /// Runs one packet through the full pipeline: pkt6_receive callouts,
    /// per-type processing, pkt6_send callouts. Returns the reply to
    /// transmit, or `None` when the packet is dropped or needs no answer.
    pub fn process(&self, packet: &mut Packet) -> Option<Packet> {
        if self.hooks.invoke_pkt6_receive(packet) {
            debug!(
                "pkt6_receive callout dropped {} from {}",
                packet.msg_type, packet.remote_addr
            );
            return None;
        }

        let result = match packet.msg_type {
            MessageType::Solicit => self.process_solicit(packet),
            MessageType::Request => self.process_request(packet),
            MessageType::Renew => self.process_renew(packet),
            MessageType::Release => self.process_release(packet),
            other => {
                debug!("Ignoring {} message from {}", other, packet.remote_addr);
                return None;
            }
        };

        let mut reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                debug!(
                    "Dropping {} from {}: {}",
                    packet.msg_type, packet.remote_addr, err
                );
                return None;
            }
        };

        if self.hooks.invoke_pkt6_send(&mut reply) {
            debug!("pkt6_send callout dropped the reply to {}", packet.remote_addr);
            return None;
        }

        Some(reply)
    }

    pub fn process_solicit(&self, solicit: &mut Packet) -> Result<Packet> {
        self.sanity_check(solicit, Requirement::Mandatory, Requirement::Forbidden)?;

        let subnet = self.select_subnet(solicit);
        let duid = client_duid(solicit)?;

        let mut advertise = self.build_reply(MessageType::Advertise, solicit);
        for option in ia_na_options(solicit) {
            advertise.add_option(self.answer_ia_na(subnet.as_deref(), &duid, option, false)?);
        }
        self.append_requested_options(solicit, &mut advertise, subnet.as_deref());

        Ok(advertise)
    }

    pub fn process_request(&self, request: &mut Packet) -> Result<Packet> {
        self.sanity_check(request, Requirement::Mandatory, Requirement::Mandatory)?;
        self.check_server_id(request)?;

        let subnet = self.select_subnet(request);
        let duid = client_duid(request)?;

        let mut reply = self.build_reply(MessageType::Reply, request);
        for option in ia_na_options(request) {
            reply.add_option(self.answer_ia_na(subnet.as_deref(), &duid, option, true)?);
        }
        self.append_requested_options(request, &mut reply, subnet.as_deref());

        Ok(reply)
    }

    pub fn process_renew(&self, renew: &mut Packet) -> Result<Packet> {
        self.sanity_check(renew, Requirement::Mandatory, Requirement::Mandatory)?;
        self.check_server_id(renew)?;

        let subnet = self.select_subnet(renew);
        let duid = client_duid(renew)?;

        let mut reply = self.build_reply(MessageType::Reply, renew);
        for option in ia_na_options(renew) {
            reply.add_option(self.extend_ia_na(subnet.as_deref(), &duid, option)?);
        }

        Ok(reply)
    }

    pub fn process_release(&self, release: &mut Packet) -> Result<Packet> {
        self.sanity_check(release, Requirement::Mandatory, Requirement::Mandatory)?;
        self.check_server_id(release)?;

        let duid = client_duid(release)?;

        let mut reply = self.build_reply(MessageType::Reply, release);
        let mut all_released = true;
        for option in ia_na_options(release) {
            let (ia_reply, released) = self.release_ia_na(&duid, option)?;
            all_released &= released;
            reply.add_option(ia_reply);
        }

        let (status, text) = if all_released {
            (StatusCode::Success, "all bindings released")
        } else {
            (StatusCode::NoBinding, "some bindings could not be released")
        };
        reply.add_option(Option6::status(status, text));

        Ok(reply)
    }

    /// Verifies option presence rules for the message type: a Mandatory
    /// option must be present, a Forbidden one absent, and a unique option
    /// may appear at most once regardless of the expectation.
    pub fn sanity_check(
        &self,
        packet: &Packet,
        client_id: Requirement,
        server_id: Requirement,
    ) -> Result<()> {
        check_unique_option(packet, code::CLIENT_ID, client_id, "client-id")?;
        check_unique_option(packet, code::SERVER_ID, server_id, "server-id")?;
        Ok(())
    }

    fn check_server_id(&self, packet: &Packet) -> Result<()> {
        match packet.server_id() {
            Some(server_id) if server_id == self.server_id.as_slice() => Ok(()),
            _ => Err(Error::RfcViolation(
                "server-id does not match this server".to_string(),
            )),
        }
    }

    /// Picks the subnet for a packet and runs the subnet6_select callouts.
    /// A callout may replace the selection; skip keeps the registry's
    /// pre-callout candidate.
    fn select_subnet(&self, packet: &mut Packet) -> Option<Arc<Subnet6>> {
        let pre_callout = self.cfg.select(packet);
        let mut selected = pre_callout.clone();
        let skip = self
            .hooks
            .invoke_subnet6_select(packet, &mut selected, self.cfg.subnets());
        if skip {
            return pre_callout;
        }
        selected
    }

    fn build_reply(&self, msg_type: MessageType, request: &Packet) -> Packet {
        let mut reply = Packet::new(msg_type, request.transid);
        reply.remote_addr = request.remote_addr;
        reply.remote_port = request.remote_port;
        reply.local_addr = request.local_addr;
        reply.local_port = request.local_port;
        reply.iface = request.iface.clone();
        reply.ifindex = request.ifindex;

        reply.add_option(self.server_id_option());
        if let Some(client_id) = request.option(code::CLIENT_ID) {
            reply.add_option(client_id.clone());
        }
        reply
    }

    /// Answers one IA_NA from a SOLICIT or REQUEST. With `commit` set the
    /// chosen address is recorded in the lease store before replying.
    fn answer_ia_na(
        &self,
        subnet: Option<&Subnet6>,
        duid: &Duid,
        ia_option: &Option6,
        commit: bool,
    ) -> Result<Option6> {
        let ia = ia_option.as_ia_na()?;

        let Some(subnet) = subnet else {
            return Ok(ia_reject(
                ia.iaid,
                StatusCode::NoAddrsAvail,
                "no subnet available for this client",
            ));
        };

        let hint = ia_option
            .find(code::IAADDR)
            .and_then(|option| option.as_ia_addr().ok())
            .map(|ia_addr| ia_addr.addr);

        let Some(addr) = self.pick_address(subnet, duid, ia.iaid, hint) else {
            warn!(
                "Subnet {} has no free addresses for client {}",
                subnet.id(),
                duid
            );
            return Ok(ia_reject(
                ia.iaid,
                StatusCode::NoAddrsAvail,
                "no addresses available",
            ));
        };

        if commit {
            let lease = Lease6::new(
                addr,
                duid.clone(),
                ia.iaid,
                subnet.id(),
                subnet.t1,
                subnet.t2,
                subnet.preferred,
                subnet.valid,
            );
            let stored = match self.leases.get_by_client(duid, ia.iaid, subnet.id()) {
                Some(existing) if existing.addr == addr => self.leases.update(lease),
                _ => self.leases.add(lease),
            };
            if let Err(err) = stored {
                debug!("Lease insert for {} failed: {}", addr, err);
                return Ok(ia_reject(
                    ia.iaid,
                    StatusCode::NoAddrsAvail,
                    "no addresses available",
                ));
            }
            info!("Assigned {} to client {} (IAID {})", addr, duid, ia.iaid);
        }

        let mut reply_ia = Option6::ia_na(ia.iaid, subnet.t1, subnet.t2);
        reply_ia
            .subs
            .push(Option6::ia_addr(addr, subnet.preferred, subnet.valid));
        Ok(reply_ia)
    }

    /// Refreshes one IA_NA binding for a RENEW.
    fn extend_ia_na(
        &self,
        subnet: Option<&Subnet6>,
        duid: &Duid,
        ia_option: &Option6,
    ) -> Result<Option6> {
        let ia = ia_option.as_ia_na()?;

        let Some(subnet) = subnet else {
            return Ok(ia_reject(
                ia.iaid,
                StatusCode::NoBinding,
                "no binding for this client",
            ));
        };

        let Some(mut lease) = self.leases.get_by_client(duid, ia.iaid, subnet.id()) else {
            return Ok(ia_reject(
                ia.iaid,
                StatusCode::NoBinding,
                "no binding for this duid/iaid",
            ));
        };

        if let Some(requested) = ia_option
            .find(code::IAADDR)
            .and_then(|option| option.as_ia_addr().ok())
            && requested.addr != lease.addr
        {
            return Ok(ia_reject(
                ia.iaid,
                StatusCode::NoBinding,
                "address does not match the recorded binding",
            ));
        }

        lease.t1 = subnet.t1;
        lease.t2 = subnet.t2;
        lease.preferred = subnet.preferred;
        lease.valid = subnet.valid;
        lease.cltt = Utc::now();

        if let Err(err) = self.leases.update(lease.clone()) {
            warn!("Lease refresh for {} failed: {}", lease.addr, err);
            return Ok(ia_reject(
                ia.iaid,
                StatusCode::NoBinding,
                "no binding for this duid/iaid",
            ));
        }
        info!("Renewed {} for client {} (IAID {})", lease.addr, duid, ia.iaid);

        let mut reply_ia = Option6::ia_na(ia.iaid, subnet.t1, subnet.t2);
        reply_ia
            .subs
            .push(Option6::ia_addr(lease.addr, subnet.preferred, subnet.valid));
        Ok(reply_ia)
    }

    /// Releases one IA_NA binding. The reply IA never carries an
    /// IA-Address. Returns the IA reply and whether the release succeeded.
    fn release_ia_na(&self, duid: &Duid, ia_option: &Option6) -> Result<(Option6, bool)> {
        let ia = ia_option.as_ia_na()?;

        let Some(requested) = ia_option
            .find(code::IAADDR)
            .and_then(|option| option.as_ia_addr().ok())
        else {
            return Ok((
                ia_reject(ia.iaid, StatusCode::NoBinding, "release without an address"),
                false,
            ));
        };

        let Some(lease) = self.leases.get_by_address(requested.addr) else {
            return Ok((
                ia_reject(ia.iaid, StatusCode::NoBinding, "no lease for this address"),
                false,
            ));
        };

        if lease.duid != *duid || lease.iaid != ia.iaid {
            return Ok((
                ia_reject(
                    ia.iaid,
                    StatusCode::NoBinding,
                    "lease is held by another binding",
                ),
                false,
            ));
        }

        self.leases.delete(requested.addr);
        info!("Released {} for client {} (IAID {})", requested.addr, duid, ia.iaid);

        let mut reply_ia = Option6::ia_na(ia.iaid, 0, 0);
        reply_ia
            .subs
            .push(Option6::status(StatusCode::Success, "lease released"));
        Ok((reply_ia, true))
    }

    /// Chooses an address for a binding: an existing lease keeps its
    /// address, a usable hint is honored, otherwise allocation resumes
    /// from the per-subnet cursor.
    fn pick_address(
        &self,
        subnet: &Subnet6,
        duid: &Duid,
        iaid: u32,
        hint: Option<Ipv6Addr>,
    ) -> Option<Ipv6Addr> {
        if let Some(existing) = self.leases.get_by_client(duid, iaid, subnet.id()) {
            return Some(existing.addr);
        }

        if let Some(hint) = hint
            && subnet.in_pool(hint)
            && self.leases.get_by_address(hint).is_none()
        {
            return Some(hint);
        }

        self.pick_free(subnet)
    }

    fn pick_free(&self, subnet: &Subnet6) -> Option<Ipv6Addr> {
        let pools = subnet.pools();
        if pools.is_empty() {
            return None;
        }

        let mut cursors = self.last_allocated.lock().expect("allocator lock poisoned");

        let (mut pool_at, mut candidate) = match cursors
            .get(&subnet.id())
            .and_then(|last| pools.iter().position(|pool| pool.contains(*last)).zip(Some(*last)))
        {
            Some((at, last)) => {
                if last == pools[at].last() {
                    let next = (at + 1) % pools.len();
                    (next, pools[next].first())
                } else {
                    (at, pools[at].next_after(last))
                }
            }
            None => (0, pools[0].first()),
        };

        let started_at = (pool_at, candidate);
        loop {
            if self.leases.get_by_address(candidate).is_none() {
                cursors.insert(subnet.id(), candidate);
                return Some(candidate);
            }
            if candidate == pools[pool_at].last() {
                pool_at = (pool_at + 1) % pools.len();
                candidate = pools[pool_at].first();
            } else {
                candidate = pools[pool_at].next_after(candidate);
            }
            if (pool_at, candidate) == started_at {
                return None;
            }
        }
    }

    /// Honors the ORO: each requested code with configured data on the
    /// selected subnet is appended to the reply.
    fn append_requested_options(
        &self,
        request: &Packet,
        reply: &mut Packet,
        subnet: Option<&Subnet6>,
    ) {
        let Some(subnet) = subnet else {
            return;
        };
        let Some(oro) = request.option(code::ORO) else {
            return;
        };

        for requested in oro.as_u16_list() {
            if let Some(configured) = subnet.configured_option(requested) {
                reply.add_option(Option6::new(requested, configured.data.clone()));
            }
        }
    }

    /// Receives packets on UDP port 547 and processes them one at a time.
    pub async fn run(&self) -> Result<()> {
        let socket = self.create_socket()?;
        info!("DHCPv6 server ready and listening on [::]:{}", self.port);

        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            let (size, source) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(err) => {
                    error!("Error receiving packet: {}", err);
                    continue;
                }
            };
            let SocketAddr::V6(source) = source else {
                continue;
            };

            let mut packet = match Packet::parse(&buffer[..size]) {
                Ok(packet) => packet,
                Err(err) => {
                    debug!("Dropping packet from {}: {}", source, err);
                    continue;
                }
            };
            packet.remote_addr = *source.ip();
            packet.remote_port = source.port();
            packet.local_port = self.port;

            debug!("{} from {}", packet.msg_type, source);

            if let Some(reply) = self.process(&mut packet) {
                let destination = SocketAddr::from(source);
                if let Err(err) = socket.send_to(&reply.encode(), destination).await {
                    warn!("Failed to send {} to {}: {}", reply.msg_type, destination, err);
                }
            }
        }
    }

    fn create_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|err| Error::Socket(format!("Failed to create socket: {}", err)))?;

        socket
            .set_only_v6(true)
            .map_err(|err| Error::Socket(format!("Failed to set IPV6_V6ONLY: {}", err)))?;

        socket
            .set_reuse_address(true)
            .map_err(|err| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", err)))?;

        socket
            .set_nonblocking(true)
            .map_err(|err| Error::Socket(format!("Failed to set non-blocking: {}", err)))?;

        let bind_addr = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), self.port);
        socket
            .bind(&bind_addr.into())
            .map_err(|err| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, err)))?;

        if let Err(err) = socket.join_multicast_v6(&ALL_DHCP_RELAY_AGENTS_AND_SERVERS, 0) {
            warn!(
                "Failed to join {}: {}",
                ALL_DHCP_RELAY_AGENTS_AND_SERVERS, err
            );
        }

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
            .map_err(|err| Error::Socket(format!("Failed to convert to tokio socket: {}", err)))
    }
}

fn client_duid(packet: &Packet) -> Result<Duid> {
    let octets = packet
        .client_id()
        .ok_or_else(|| Error::RfcViolation("missing client-id option".to_string()))?;
    Duid::new(octets.to_vec())
}

fn ia_na_options(packet: &Packet) -> impl Iterator<Item = &Option6> {
    packet
        .options
        .iter()
        .filter(|option| option.code == code::IA_NA)
}

/// An IA_NA reply that rejects the request: zeroed timers, no IA-Address,
/// and a Status-Code sub-option.
fn ia_reject(iaid: u32, status: StatusCode, text: &str) -> Option6 {
    let mut ia = Option6::ia_na(iaid, 0, 0);
    ia.subs.push(Option6::status(status, text));
    ia
}

fn check_unique_option(
    packet: &Packet,
    code: u16,
    requirement: Requirement,
    name: &str,
) -> Result<()> {
    let count = packet.option_count(code);
    if count > 1 {
        return Err(Error::RfcViolation(format!(
            "exactly one {} option allowed, got {}",
            name, count
        )));
    }
    match requirement {
        Requirement::Mandatory if count == 0 => Err(Error::RfcViolation(format!(
            "missing mandatory {} option",
            name
        ))),
        Requirement::Forbidden if count != 0 => Err(Error::RfcViolation(format!(
            "{} option is forbidden in this message",
            name
        ))),
        _ => Ok(()),
    }
}
