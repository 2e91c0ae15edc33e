/*!
The bundle processing agent: everything between the wire codec and the
convergence layers.

The daemon owns every pending bundle behind a [`bundle::BundleRef`]; links,
routers, and timers refer to bundles by id and resolve them through the
pending table, so nothing outlives the daemon's ownership. One thread runs
the daemon event loop; the timer service runs another; convergence-layer
I/O threads live outside this crate and talk to the daemon by posting
[`events::Event`]s.

Lock ordering, outermost first: bundle lock, link lock, route-table lock,
pending-map lock. Nothing in this crate acquires them in any other order.
*/

pub mod acs;
pub mod actions;
pub mod bundle;
pub mod config;
pub mod custody;
pub mod daemon;
pub mod events;
pub mod fwd_log;
pub mod link;
pub mod payload_store;
pub mod route;
pub mod route_table;
pub mod router;
pub mod storage;
pub mod timers;

pub use bytes::Bytes;

#[cfg(test)]
mod engine_tests;
