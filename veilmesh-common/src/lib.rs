//! Veilmesh Common - Shared types between the coordinator and egress nodes
//!
//! This crate holds the relay wire protocol (frame classification, batch
//! container, JSON envelopes, compressed control frames) and the API data
//! types exchanged over the coordinator's HTTP surface.

pub mod frame;
pub mod types;

pub use frame::{decode_frame, encode_batch, Direction, FrameError, RelayFrame, RelayMessage};
pub use types::{
    Capabilities, ClientNetworkInfo, HeartbeatMetrics, HeartbeatRequest, HeartbeatResponse,
    Location, NatType, NetworkInfo, NodeAction, NodeRecord, NodeStatus, RegisterRequest,
    RegisterResponse, RouteKind, RouteRecord, RouteRequest, RouteRequirements, RouteResponse,
    SelectedRoute, SessionRecord, SessionStatus,
};
