//! Typed integration hooks
//!
//! Authentication, multi-tenancy and response shaping live outside the bus;
//! the middleware consults these function-typed fields instead. `None` means
//! "not configured". Lookups are fallible — a raised error is mapped through
//! `on_middleware_error` when that is configured, otherwise it surfaces as a
//! plain 500 from the endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use parking_lot::RwLock;

use super::BusMessage;

/// Request view handed to the configured lookups
#[derive(Debug, Clone, Default)]
pub struct PollRequest {
    pub headers: HeaderMap,
    pub path: String,
    pub query: HashMap<String, String>,
}

pub type UserIdLookup = Arc<dyn Fn(&PollRequest) -> anyhow::Result<Option<i64>> + Send + Sync>;
pub type GroupIdsLookup = Arc<dyn Fn(&PollRequest) -> anyhow::Result<Vec<i64>> + Send + Sync>;
pub type SiteIdLookup = Arc<dyn Fn(&PollRequest) -> anyhow::Result<Option<String>> + Send + Sync>;
pub type IsAdminLookup = Arc<dyn Fn(&PollRequest) -> anyhow::Result<bool> + Send + Sync>;
pub type ExtraHeadersLookup = Arc<dyn Fn(&PollRequest) -> Vec<(String, String)> + Send + Sync>;
pub type ConnectionHook = Arc<dyn Fn(Option<&str>) + Send + Sync>;
pub type MiddlewareErrorHook = Arc<dyn Fn(&anyhow::Error) -> Option<(u16, String)> + Send + Sync>;
pub type MessageFilter = Arc<dyn Fn(&BusMessage) -> bool + Send + Sync>;

/// Hook registry consulted by the middleware and the delivery path
#[derive(Clone, Default)]
pub struct BusHooks {
    pub user_id_lookup: Option<UserIdLookup>,
    pub group_ids_lookup: Option<GroupIdsLookup>,
    pub site_id_lookup: Option<SiteIdLookup>,
    pub is_admin_lookup: Option<IsAdminLookup>,
    pub extra_response_headers_lookup: Option<ExtraHeadersLookup>,
    pub on_connect: Option<ConnectionHook>,
    pub on_disconnect: Option<ConnectionHook>,
    pub on_middleware_error: Option<MiddlewareErrorHook>,
    /// Per-channel-prefix delivery filters, applied after the target checks
    filters: Arc<RwLock<Vec<(String, MessageFilter)>>>,
}

impl BusHooks {
    /// Register a delivery filter for channels starting with `prefix`
    ///
    /// Any matching filter returning false denies the message.
    pub fn register_message_filter(
        &self,
        prefix: impl Into<String>,
        filter: impl Fn(&BusMessage) -> bool + Send + Sync + 'static,
    ) {
        self.filters
            .write()
            .push((prefix.into(), Arc::new(filter)));
    }

    /// Run every filter whose prefix matches the message channel
    pub fn run_message_filters(&self, msg: &BusMessage) -> bool {
        let filters = self.filters.read();
        filters
            .iter()
            .filter(|(prefix, _)| msg.channel.starts_with(prefix.as_str()))
            .all(|(_, filter)| filter(msg))
    }
}
