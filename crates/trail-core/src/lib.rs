pub mod auth;
pub mod errors;
pub mod event;
pub mod ids;
pub mod location;
pub mod platform;
pub mod registration;
pub mod signals;
pub mod transport;

pub use errors::PipelineError;
pub use event::{Category, Event, EventType};
pub use ids::{DeviceId, EventId};
pub use location::{ActivityClass, Coordinate, LocationSample};
