// seanet-core: client-side connection and routing engine for the seanet
// maritime network. Exposes modules for integration testing.

pub mod broadcast;
mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod future;
mod position;
pub mod services;
mod session;
pub mod transport;

pub use broadcast::{
    BroadcastFuture, BroadcastHeader, BroadcastMessage, BroadcastRecipient, BroadcastSubscription,
};
pub use client::{MaritimeClient, State, StateListenerHandle};
pub use config::{ClientConfig, ReconnectPolicy, position_now};
pub use error::ClientError;
pub use future::ConnectionFuture;
pub use services::{InvocationContext, ServiceInit, ServiceLocator, ServiceRegistration};
pub use sn_protocol::{BroadcastOptions, MaritimeId, PositionTime};
