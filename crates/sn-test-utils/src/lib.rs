// sn-test-utils: in-process server and raw frame client for exercising the
// seanet client engine in tests.

mod mock_server;
mod raw_client;

pub use mock_server::MockSeaServer;
pub use raw_client::RawFrameClient;
