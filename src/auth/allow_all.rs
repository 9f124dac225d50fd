use async_trait::async_trait;

use crate::auth::traits::{AuthError, Authorizer};

#[derive(Debug)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize_publish(&self, _username: Option<&str>, _topic: &str) -> Result<(), AuthError> {
        Ok(())
    }

    async fn authorize_subscribe(
        &self,
        _username: Option<&str>,
        _topic_filter: &str,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}
