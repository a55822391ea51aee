pub mod connection;
pub mod data_channel;
pub mod events;
pub mod ice;
pub mod media;
pub mod types;

pub use connection::{ConnectionHandle, PeerConnectionManager};
pub use events::{EventDispatcher, PeerEvent};
pub use media::{CapturedDisplay, DisplayFeed, DisplaySource, SampleDisplaySource};
pub use types::{ConnectionStatus, SdpKind, ServerConfig, SessionDescription, SurfaceKind};
