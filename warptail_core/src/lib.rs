//! Router kernel for publishing tailnet services.
//!
//! The crate is organized around a [`router::Router`] that owns a keyed
//! collection of [`service::Service`]s, each an ordered bundle of
//! [`route::Route`] handlers forwarding traffic between a public ingress and
//! a target inside the overlay network managed by [`tailnet::TailnetNode`].

pub mod config;
pub mod error;
pub mod route;
pub mod router;
pub mod service;
pub mod tailnet;
pub mod timeseries;

pub use error::{ErrorKind, RouterError};
pub use route::{Route, RouterStatus};
pub use router::{Controller, Router, RouterSnapshot};
pub use service::Service;
pub use tailnet::{BackendState, TailnetNode, TailscaleConfig};
pub use timeseries::TimeSeries;
