use async_trait::async_trait;
use thiserror::Error;

/// Identity used for clients that connect without a username.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Not authorized")]
    NotAuthorized,
}

/// Access control consulted for every PUBLISH and SUBSCRIBE.
///
/// `username` is the CONNECT username, `None` for anonymous clients.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize_publish(&self, username: Option<&str>, topic: &str) -> Result<(), AuthError>;
    async fn authorize_subscribe(
        &self,
        username: Option<&str>,
        topic_filter: &str,
    ) -> Result<(), AuthError>;
}
