//! # pylon-core
//!
//! Wire protocol vocabulary shared by the Pylon client services SDK.
//!
//! This crate defines the JSON frame types exchanged with a client-services
//! backend over a single duplex transport:
//!
//! - **Frames**: [`Frame`] with `Command`, `CommandResult`, and `Notify` variants
//! - **Commands**: [`Command`] and its payload structs (session bootstrap, invites)
//! - **Results**: [`CommandResult`] with transport-level, retryable, and
//!   domain-specific outcome tags
//! - **Notifications**: [`Notify`] push events and [`NotifyKind`] dispatch keys
//!
//! Everything here is pure data; connection handling lives in `pylon-client`.

#![deny(unsafe_code)]

pub mod messages;

pub use messages::{
    ClientsOnline, Command, CommandResult, Frame, InviteCreate, InviteCreated, InviteInfo,
    InviteLogAction, InviteQueryInfo, Notify, NotifyKind, SessionInitialize,
    SessionInitializeAgent, SessionType, SessionUpdateLocale,
};
