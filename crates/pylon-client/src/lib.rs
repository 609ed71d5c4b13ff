//! # pylon-client
//!
//! Resilient connection and session layer for a client-services backend.
//!
//! Clients issue correlated request/response commands and receive
//! uncorrelated push notifications over a single WebSocket. This crate
//! provides:
//!
//! - **Transport**: [`transport::WsTransport`] plus trait seams for tests
//! - **Connection**: [`connection::Connection`] — state machine, automatic
//!   reconnection, command correlation with timeouts, typed notification
//!   dispatch
//! - **Session**: [`session::ClientService`] — idempotent bootstrap
//!   orchestration with bounded retry and generation-based cancellation
//! - **Invites**: [`invite::InviteService`] — invite link creation/query
//! - **Geo**: [`geo::GeoProvider`] — best-effort geolocation with a disk cache
//!
//! All outcomes of command execution are [`pylon_core::CommandResult`]
//! values; nothing in the connection layer panics or returns `Err` for
//! protocol-level failures.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod geo;
pub mod invite;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use connection::{CaughtNotify, Connection, ConnectionState, NotifySubscription, StateChange};
pub use geo::{GeoInfo, GeoProvider, GeoQuery, NoGeo};
pub use invite::{CreatedInvite, InviteError, InviteService};
pub use session::{ClientService, LocalAgent, ServiceConfig, ServiceEvent};
pub use transport::{Transport, TransportError, WsTransport};
