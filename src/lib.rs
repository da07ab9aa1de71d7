// seanet: umbrella crate re-exporting the client engine's public API and
// hosting the cross-crate integration suites under tests/integration/.

pub use seanet_core::{
    BroadcastFuture, BroadcastHeader, BroadcastMessage, BroadcastOptions, BroadcastRecipient,
    BroadcastSubscription, ClientConfig, ClientError, ConnectionFuture, InvocationContext,
    MaritimeClient, MaritimeId, PositionTime, ReconnectPolicy, ServiceInit, ServiceLocator,
    ServiceRegistration, State, StateListenerHandle, position_now,
};
