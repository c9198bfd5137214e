/*!
# Vigil Core - shared building blocks for the aggregator and the fleet

- Session and reconnect records persisted on both sides
- Sliding window spike detection
- Durable JSON snapshot stores with a single critical section
- Transport capability (trait + MQTT adapter) and topic naming
*/

pub mod error;
pub mod models;
pub mod store;
pub mod topics;
pub mod transport;
pub mod window;

pub use error::{DecodeError, PersistenceError, TransportError};
pub use models::{AlertMessage, PresenceMessage, PresenceStatus, ReconnectRecord, SessionRecord, StreamMessage};
pub use store::DurableStore;
pub use transport::{Endpoint, EventReceiver, Transport, TransportEvent, TransportFactory};
pub use window::{SlidingWindowDetector, SpikeAlert};
