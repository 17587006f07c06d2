//! overlay-services — overlay construction, routing, and the registry and
//! messaging-node runtimes built on them.

pub mod connection;
pub mod coordinator;
pub mod node;
pub mod peer;
pub mod registry;
pub mod routing;
pub mod topology;

pub use connection::{Connection, ConnectionError, FrameReader};
pub use coordinator::{Coordinator, CoordinatorError};
pub use node::{MessagingNode, NodeStatus};
pub use peer::{BurstOutcome, Delivery, Link, MessagingPeer, PeerError, PeerState};
pub use registry::{PeerRegistry, RegistryError};
pub use routing::{RouteError, RoutingTable};
pub use topology::{Overlay, TopologyError};
