//! Callout registration and dispatch.
//!
//! Three extension points fire synchronously on the processing path:
//! `pkt6_receive` after parse, `subnet6_select` after the registry picks a
//! candidate, and `pkt6_send` after the reply is built. A callout may
//! mutate its arguments and may set `skip` on its handle: skip on receive
//! discards the packet, skip on select keeps the pre-callout subnet, skip
//! on send drops the reply.

use std::sync::Arc;

use crate::config::Subnet6;
use crate::packet::Packet;

/// Per-invocation state shared by a callout chain.
#[derive(Debug, Default)]
pub struct CalloutHandle {
    skip: bool,
}

impl CalloutHandle {
    pub fn set_skip(&mut self, skip: bool) {
        self.skip = skip;
    }

    pub fn skip(&self) -> bool {
        self.skip
    }
}

type PacketCallout = Box<dyn Fn(&mut CalloutHandle, &mut Packet) + Send + Sync>;

type SubnetSelectCallout = Box<
    dyn Fn(&mut CalloutHandle, &mut Packet, &mut Option<Arc<Subnet6>>, &[Arc<Subnet6>])
        + Send
        + Sync,
>;

/// Registry of callouts, keyed by hook point. All dispatch is synchronous
/// and runs on the processor's task.
#[derive(Default)]
pub struct HooksRegistry {
    pkt6_receive: Vec<PacketCallout>,
    subnet6_select: Vec<SubnetSelectCallout>,
    pkt6_send: Vec<PacketCallout>,
}

impl HooksRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pkt6_receive(
        &mut self,
        callout: impl Fn(&mut CalloutHandle, &mut Packet) + Send + Sync + 'static,
    ) {
        self.pkt6_receive.push(Box::new(callout));
    }

    pub fn register_subnet6_select(
        &mut self,
        callout: impl Fn(&mut CalloutHandle, &mut Packet, &mut Option<Arc<Subnet6>>, &[Arc<Subnet6>])
        + Send
        + Sync
        + 'static,
    ) {
        self.subnet6_select.push(Box::new(callout));
    }

    pub fn register_pkt6_send(
        &mut self,
        callout: impl Fn(&mut CalloutHandle, &mut Packet) + Send + Sync + 'static,
    ) {
        self.pkt6_send.push(Box::new(callout));
    }

    /// Runs the `pkt6_receive` chain; returns whether skip was set.
    pub fn invoke_pkt6_receive(&self, packet: &mut Packet) -> bool {
        let mut handle = CalloutHandle::default();
        for callout in &self.pkt6_receive {
            callout(&mut handle, packet);
        }
        handle.skip()
    }

    /// Runs the `subnet6_select` chain; returns whether skip was set. The
    /// caller decides what to do with the possibly-replaced selection.
    pub fn invoke_subnet6_select(
        &self,
        packet: &mut Packet,
        selected: &mut Option<Arc<Subnet6>>,
        all: &[Arc<Subnet6>],
    ) -> bool {
        let mut handle = CalloutHandle::default();
        for callout in &self.subnet6_select {
            callout(&mut handle, packet, selected, all);
        }
        handle.skip()
    }

    /// Runs the `pkt6_send` chain; returns whether skip was set.
    pub fn invoke_pkt6_send(&self, packet: &mut Packet) -> bool {
        let mut handle = CalloutHandle::default();
        for callout in &self.pkt6_send {
            callout(&mut handle, packet);
        }
        handle.skip()
    }
}

impl std::fmt::Debug for HooksRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HooksRegistry")
            .field("pkt6_receive", &self.pkt6_receive.len())
            .field("subnet6_select", &self.subnet6_select.len())
            .field("pkt6_send", &self.pkt6_send.len())
            .finish()
    }
}
