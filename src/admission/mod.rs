//! # Session Admission
//!
//! Everything that happens between "a socket opened" and "audio is flowing":
//! normalizing the first frame, validating it into a canonical session
//! descriptor, keeping session uids unique, and deciding which frames are legal
//! in which phase of the connection.
//!
//! ## Data flow:
//! raw JSON → `normalize` → `validate` → `SessionRegistry::claim` →
//! `ConnectionState` (`AwaitingHandshake → Active`) → `router` for every
//! subsequent frame.
//!
//! Nothing in here performs I/O; the WebSocket actor in `websocket.rs` drives it.

pub mod error;        // Rejection taxonomy and close causes
pub mod normalize;    // Alias mapping onto canonical keys
pub mod registry;     // Process-wide uid uniqueness and session limit
pub mod router;       // Post-handshake frame classification
pub mod state_machine; // Per-connection phase tracking
pub mod validate;     // Defaulting, coercion, required fields

pub use error::{AdmissionError, CloseCause};
pub use registry::SessionRegistry;
pub use router::{ControlMessage, RoutedFrame};
pub use state_machine::{ConnectionState, Step};
pub use validate::SessionDescriptor;
