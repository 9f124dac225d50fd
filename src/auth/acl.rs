use async_trait::async_trait;
use std::collections::HashMap;

use crate::auth::traits::{AuthError, Authorizer, ANONYMOUS};
use crate::topic::{self, MULTI_LEVEL_WILDCARD};

/// Topic-filter allow list keyed by identity.
///
/// A publish is allowed when the topic matches one of the identity's
/// filters; a subscription when the requested filter is fully covered by
/// one of them. A bare `#` rule grants everything, `$` topics included.
/// Identities missing from the table are denied everything.
#[derive(Debug)]
pub struct AclAuthorizer {
    rules: HashMap<String, Vec<String>>,
}

impl AclAuthorizer {
    pub fn new(rules: &HashMap<String, Vec<String>>) -> Self {
        Self {
            rules: rules.clone(),
        }
    }

    fn filters(&self, username: Option<&str>) -> &[String] {
        let identity = username.unwrap_or(ANONYMOUS);
        self.rules.get(identity).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[async_trait]
impl Authorizer for AclAuthorizer {
    async fn authorize_publish(&self, username: Option<&str>, topic: &str) -> Result<(), AuthError> {
        if self
            .filters(username)
            .iter()
            .any(|filter| filter == MULTI_LEVEL_WILDCARD || topic::matches(topic, filter))
        {
            return Ok(());
        }
        Err(AuthError::NotAuthorized)
    }

    async fn authorize_subscribe(
        &self,
        username: Option<&str>,
        topic_filter: &str,
    ) -> Result<(), AuthError> {
        if self
            .filters(username)
            .iter()
            .any(|filter| filter == MULTI_LEVEL_WILDCARD || topic::filter_covers(filter, topic_filter))
        {
            return Ok(());
        }
        Err(AuthError::NotAuthorized)
    }
}
