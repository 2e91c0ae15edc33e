use crate::custody::CustodyTimerSpec;
use aloft_bp::eid::EndpointId;

/// Engine configuration. Values arrive already parsed from whatever
/// configuration surface the embedding process uses.
#[derive(Debug, Clone)]
pub struct Config {
    /// The EID this node writes into hop-scoped blocks and uses as the
    /// custodian identity.
    pub local_eid: EndpointId,

    /// Emit status-report bundles.
    pub status_rpts_enabled: bool,

    /// Include a Bundle Age block on locally-sourced BPv7 bundles.
    pub use_age_block: bool,

    /// Include a Hop Count block when non-zero.
    pub default_hop_limit: u8,

    /// Include an Age block on outbound bundles.
    pub age_outbound_enabled: bool,

    /// Honor the Age block on inbound bundles.
    pub age_inbound_processing: bool,

    /// Zero out the creation timestamp when the Age block is in use.
    pub age_zero_creation_ts_time: bool,

    /// Default custody retransmission timer.
    pub custody_timer: CustodyTimerSpec,

    /// Recursion cap for route-to chains in the route table.
    pub max_route_to_chain: u32,

    /// Stop routing after the first always-on link accepts the bundle.
    pub static_router_prefer_always_on: bool,

    /// Write forwarding-log updates through to the durable store.
    pub persistent_fwd_logs: bool,

    /// Add a next-hop route for a link's remote EID when a contact
    /// comes up.
    pub add_nexthop_routes: bool,

    /// Payload storage quota in bytes.
    pub payload_quota: u64,

    /// Depth of bounded consumer queues (e.g. the BIBE extractor's).
    pub event_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_eid: EndpointId::null(),
            status_rpts_enabled: false,
            use_age_block: false,
            default_hop_limit: 0,
            age_outbound_enabled: false,
            age_inbound_processing: true,
            age_zero_creation_ts_time: true,
            custody_timer: CustodyTimerSpec::default(),
            max_route_to_chain: 10,
            static_router_prefer_always_on: true,
            persistent_fwd_logs: false,
            add_nexthop_routes: true,
            payload_quota: 1024 * 1024 * 1024,
            event_queue_depth: 1024,
        }
    }
}
