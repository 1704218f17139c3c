//! playctl Core - Playback-control service
//!
//! This crate provides the transport-agnostic core of the service: the
//! player session, command dispatch, multi-client event broadcast, the
//! line-delimited wire format, and a simulated player engine.

pub mod broadcast;
pub mod command;
pub mod dispatcher;
pub mod event;
mod main_context;
pub mod player;
pub mod protocol;
pub mod service;
pub mod session;
pub mod sim;

#[cfg( test )]
mod testing;

pub use broadcast::{ Broadcaster, Client, DeliveryError, EventSink };
pub use command::{ Command, CommandError, Message, Request };
pub use dispatcher::Dispatcher;
pub use event::Event;
pub use player::{ Credential, PlayerError, PlayerFactory, PlayerListener, PlayerState, TrackPlayer };
pub use protocol::ProtocolError;
pub use service::{ Service, ServiceError };
pub use session::SessionManager;
pub use sim::{ SimulatedPlayerFactory, SimulationConfig };
