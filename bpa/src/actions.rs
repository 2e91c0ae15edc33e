/*!
The action surface the daemon provides to routers.

Routers never touch links or the store directly; they ask for work through
this trait, which the daemon implements. Tests substitute a recording
stub.
*/

use crate::bundle::BundleRef;
use crate::custody::CustodyTimerSpec;
use crate::fwd_log::ForwardAction;
use crate::link::Link;
use std::sync::Arc;

pub trait BundleActions: Send + Sync {
    /// Asks the convergence layer to open the link.
    fn open_link(&self, link: &Arc<Link>);

    /// Queues the bundle on the link, recording a `Queued` forwarding-log
    /// entry carrying the route's action and custody parameters.
    fn queue_bundle(
        &self,
        bundle: &BundleRef,
        link: &Arc<Link>,
        action: ForwardAction,
        custody_spec: &CustodyTimerSpec,
    );

    /// Cancels a queued or in-flight transmission; completion surfaces as
    /// a `BundleSendCancelled` event.
    fn cancel_bundle(&self, bundle: &BundleRef, link: &Arc<Link>);

    /// Schedules a durable-store update for the bundle's metadata.
    fn store_update(&self, bundle: &BundleRef);
}
