pub mod acl;
pub mod allow_all;
pub mod traits;

pub use acl::AclAuthorizer;
pub use allow_all::AllowAll;
pub use traits::*;

use crate::config::AuthConfig;
use std::sync::Arc;

/// Create authorizer based on auth configuration
pub fn new(config: &AuthConfig) -> Arc<dyn Authorizer> {
    if config.topic_check {
        Arc::new(AclAuthorizer::new(&config.acl))
    } else {
        Arc::new(AllowAll)
    }
}
