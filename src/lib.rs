//! Pathfinder service discovery server.
//!
//! Producers publish service records (an id, a multi-valued property
//! map and a TTL) into a domain; consumers install filtered
//! subscriptions and are pushed `appeared`/`modified`/`disappeared`
//! notifications as the population changes. State is volatile by
//! design: clients own the truth and re-publish after a server
//! restart.
//!
//! Layering, leaves first: [`props`] and [`filter`] are pure, [`proto`]
//! is the wire codec, [`sd`] is the in-memory domain store, [`server`]
//! runs the per-domain engine over [`transport`] listeners, configured
//! by [`config`] and logged through [`telemetry`].

pub mod config;
pub mod filter;
pub mod props;
pub mod proto;
pub mod sd;
pub mod server;
pub mod telemetry;
pub mod transport;
