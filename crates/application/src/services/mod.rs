pub mod presence_service;


pub use presence_service::{PresenceService, PresenceServiceDependencies, SetStatusRequest};
