//! Topic names, topic filters and the matching rules between them.
//!
//! Topics beginning with `$` (for example `$SYS/...`) are reserved for the
//! broker and never match a filter whose first level is a wildcard, so a
//! bare `#` subscription does not receive broker statistics.

use thiserror::Error;

pub const LEVEL_SEPARATOR: char = '/';
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

const MAX_TOPIC_LENGTH: usize = 65_535;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic is empty")]
    Empty,
    #[error("Topic exceeds {MAX_TOPIC_LENGTH} bytes")]
    TooLong,
    #[error("Topic contains an empty level")]
    EmptyLevel,
    #[error("Topic contains a NUL character")]
    NulCharacter,
    #[error("Wildcards are not allowed in a topic name")]
    WildcardInTopicName,
    #[error("Wildcard must occupy an entire level")]
    FusedWildcard,
    #[error("'#' is only allowed as the last level")]
    MisplacedMultiLevelWildcard,
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    if topic.split(LEVEL_SEPARATOR).any(str::is_empty) {
        return Err(TopicError::EmptyLevel);
    }
    Ok(())
}

/// Validates a topic name used for publishing.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopicName);
    }
    Ok(())
}

/// Validates a topic filter used for subscribing.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;

    let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if *level == SINGLE_LEVEL_WILDCARD {
            continue;
        }
        if *level == MULTI_LEVEL_WILDCARD {
            if index != last {
                return Err(TopicError::MisplacedMultiLevelWildcard);
            }
            continue;
        }
        if level.contains(['+', '#']) {
            return Err(TopicError::FusedWildcard);
        }
    }
    Ok(())
}

pub fn is_system_topic(topic: &str) -> bool {
    topic.starts_with('$')
}

/// Returns true when `topic` is matched by `filter`.
///
/// Both arguments are assumed valid. Runs in O(levels) without
/// backtracking because `#` can only be the final filter level.
pub fn matches(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);
    let mut filter_levels = filter.split(LEVEL_SEPARATOR).peekable();

    if is_system_topic(topic) {
        if let Some(&first) = filter_levels.peek() {
            if first == SINGLE_LEVEL_WILDCARD || first == MULTI_LEVEL_WILDCARD {
                return false;
            }
        }
    }

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Returns true when every topic matched by `requested` is also matched by
/// `granted`. Used to check a subscription filter against access rules.
pub fn filter_covers(granted: &str, requested: &str) -> bool {
    let mut granted_levels = granted.split(LEVEL_SEPARATOR).peekable();
    let mut requested_levels = requested.split(LEVEL_SEPARATOR).peekable();

    if let (Some(&first_granted), Some(&first_requested)) =
        (granted_levels.peek(), requested_levels.peek())
    {
        let granted_is_wildcard =
            first_granted == SINGLE_LEVEL_WILDCARD || first_granted == MULTI_LEVEL_WILDCARD;
        if granted_is_wildcard && is_system_topic(first_requested) {
            return false;
        }
    }

    loop {
        match (granted_levels.next(), requested_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(level)) if level != MULTI_LEVEL_WILDCARD => continue,
            (Some(expected), Some(actual))
                if expected == actual
                    && expected != SINGLE_LEVEL_WILDCARD
                    && expected != MULTI_LEVEL_WILDCARD =>
            {
                continue
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
