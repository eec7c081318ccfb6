//! HTTP surface of the record service.

mod error;
mod routes;
mod subscriptions;

pub use error::{ApiError, ApiResult, ErrorBody, ErrorCode};
pub use routes::{
    router, AppState, DataResponse, ExistsResponse, PermissionsResponse, PollResponse,
    SaveAllBody, SaveResponse, StatusResponse, SubscribeBody, SubscribeResponse,
};
pub use subscriptions::SubscriptionRegistry;
