//! Topic construction for the Homegear MQTT namespace
//!
//! Every published topic lives under the configured prefix, e.g.
//! `homegear/0123-4567/plain/12/1/STATE`. Relative topics passed by
//! callers (`c/d`) never carry the prefix themselves.

use thiserror::Error;

/// Collapse repeated slashes and strip leading/trailing ones.
///
/// MQTT treats `a//b` and `/a` as having empty levels, which is never what
/// a caller composing `prefix + topic` means.
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|level| !level.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Check a topic name is publishable (non-empty, no wildcards, no NUL)
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > u16::MAX as usize {
        return Err(TopicError::TooLong(topic.len()));
    }

    for ch in topic.chars() {
        if ch == '+' || ch == '#' || ch == '\0' {
            return Err(TopicError::InvalidChar(ch));
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic contains invalid character: '{0}'")]
    InvalidChar(char),
    #[error("Topic is {0} bytes long, maximum is 65535")]
    TooLong(usize),
}

/// Builds full topics below a fixed prefix
#[derive(Debug, Clone, PartialEq)]
pub struct TopicBuilder {
    prefix: String,
}

impl TopicBuilder {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: canonicalize_topic(prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}/{relative}`
    pub fn build(&self, relative: &str) -> String {
        canonicalize_topic(&format!("{}/{relative}", self.prefix))
    }

    /// Topic filter for incoming commands; wildcards are kept as-is
    pub fn build_command_filter(&self, command_topic: &str) -> String {
        self.build(command_topic)
    }

    /// `{prefix}/plain/{peer}/{channel}/{key}`
    pub fn build_plain_topic(&self, peer_id: u64, channel: i32, key: &str) -> String {
        self.build(&format!("plain/{peer_id}/{channel}/{key}"))
    }

    /// `{prefix}/json/{peer}/{channel}/{key}`
    pub fn build_json_topic(&self, peer_id: u64, channel: i32, key: &str) -> String {
        self.build(&format!("json/{peer_id}/{channel}/{key}"))
    }

    /// `{prefix}/jsonobj/{peer}/{channel}`
    pub fn build_json_object_topic(&self, peer_id: u64, channel: i32) -> String {
        self.build(&format!("jsonobj/{peer_id}/{channel}"))
    }

    /// Strip the prefix from an incoming topic, if it is ours
    pub fn relative<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}
