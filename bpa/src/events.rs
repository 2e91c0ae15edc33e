/*!
Events flowing between the convergence layers, the daemon, and the router.
*/

use crate::bundle::{BundleId, BundleRef};
use crate::link::Link;
use crate::route::RouteEntry;
use aloft_bp::eid::EidPattern;
use std::sync::Arc;

/// Where a received bundle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Arrived from a peer over a link.
    Peer,
    /// Generated by a local application.
    App,
    /// Reloaded from the durable store at startup.
    Store,
    /// Administrative path (e.g. unwrapped from a BIBE bundle).
    Admin,
}

#[derive(Debug)]
pub enum Event {
    BundleReceived {
        bundle: BundleRef,
        source: EventSource,
        link: Option<Arc<Link>>,
    },
    BundleTransmitted {
        bundle: BundleRef,
        link: Arc<Link>,
        success: bool,
    },
    BundleDelivered {
        bundle: BundleRef,
        regid: u32,
    },
    BundleSendCancelled {
        bundle: BundleRef,
        link: Arc<Link>,
    },
    BundleExpired {
        bundle: BundleRef,
    },
    BundleTryDelete {
        bundle: BundleRef,
    },
    RouteAdd(Arc<RouteEntry>),
    RouteDel(EidPattern),
    ContactUp(Arc<Link>),
    ContactDown(Arc<Link>),
    LinkAvailable(Arc<Link>),
    LinkCreated(Arc<Link>),
    LinkDeleted(Arc<Link>),
    CustodyTimeout {
        bundle_id: BundleId,
        link: Arc<Link>,
    },
    RegistrationAdded(u32),
    RegistrationRemoved(u32),
    RegistrationExpired(u32),
}
