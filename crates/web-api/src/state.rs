use std::sync::Arc;

use application::{LocalPresenceBroadcaster, OnlineViewRegistry, PresenceService};

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub presence_service: Arc<PresenceService>,
    pub broadcaster: Arc<LocalPresenceBroadcaster>,
    pub online_view: Arc<OnlineViewRegistry>,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(
        presence_service: Arc<PresenceService>,
        broadcaster: Arc<LocalPresenceBroadcaster>,
        online_view: Arc<OnlineViewRegistry>,
        jwt_service: Arc<JwtService>,
    ) -> Self {
        Self {
            presence_service,
            broadcaster,
            online_view,
            jwt_service,
        }
    }
}
