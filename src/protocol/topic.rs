//! Topic layout for the pub/sub bus
//!
//! Uplink: `{scope}device/{gear_id}/{state|stats|input_audio_stream}`.
//! Downlink: `{scope}device/{gear_id}/{output_audio_stream|command}`.
//! The scope may be empty; when non-empty a trailing `/` is implied.

/// Message kind, identified from the final topic segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    State,
    Stats,
    InputAudio,
    OutputAudio,
    Command,
}

impl TopicKind {
    fn segment(self) -> &'static str {
        match self {
            TopicKind::State => "state",
            TopicKind::Stats => "stats",
            TopicKind::InputAudio => "input_audio_stream",
            TopicKind::OutputAudio => "output_audio_stream",
            TopicKind::Command => "command",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "state" => Some(TopicKind::State),
            "stats" => Some(TopicKind::Stats),
            "input_audio_stream" => Some(TopicKind::InputAudio),
            "output_audio_stream" => Some(TopicKind::OutputAudio),
            "command" => Some(TopicKind::Command),
            _ => None,
        }
    }
}

/// Scope-prefixed topic builder and parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    // Empty, or normalized to end with '/'
    scope: String,
}

impl TopicScheme {
    pub fn new(scope: &str) -> Self {
        let trimmed = scope.trim_matches('/');
        let scope = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        };
        Self { scope }
    }

    pub fn topic(&self, gear_id: &str, kind: TopicKind) -> String {
        format!("{}device/{}/{}", self.scope, gear_id, kind.segment())
    }

    /// Single-level wildcard filter matching every gear for one kind
    pub fn wildcard(&self, kind: TopicKind) -> String {
        format!("{}device/+/{}", self.scope, kind.segment())
    }

    /// The three uplink filters a listener subscribes to
    pub fn uplink_wildcards(&self) -> [String; 3] {
        [
            self.wildcard(TopicKind::State),
            self.wildcard(TopicKind::Stats),
            self.wildcard(TopicKind::InputAudio),
        ]
    }

    /// Extract the gear id and message kind from an inbound topic
    pub fn parse(&self, topic: &str) -> Option<(String, TopicKind)> {
        let rest = if self.scope.is_empty() {
            topic
        } else {
            topic.strip_prefix(&self.scope)?
        };
        let mut segments = rest.split('/');
        if segments.next()? != "device" {
            return None;
        }
        let gear_id = segments.next()?;
        if gear_id.is_empty() {
            return None;
        }
        let kind = TopicKind::from_segment(segments.next()?)?;
        if segments.next().is_some() {
            return None;
        }
        Some((gear_id.to_string(), kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_topics() {
        let scheme = TopicScheme::new("prod");
        assert_eq!(
            scheme.topic("g1", TopicKind::InputAudio),
            "prod/device/g1/input_audio_stream"
        );
        assert_eq!(scheme.wildcard(TopicKind::State), "prod/device/+/state");
    }

    #[test]
    fn test_empty_scope() {
        let scheme = TopicScheme::new("");
        assert_eq!(scheme.topic("g1", TopicKind::Command), "device/g1/command");
        assert_eq!(scheme.wildcard(TopicKind::Stats), "device/+/stats");
    }

    #[test]
    fn test_scope_normalization() {
        assert_eq!(TopicScheme::new("prod/"), TopicScheme::new("prod"));
        assert_eq!(TopicScheme::new("/"), TopicScheme::new(""));
    }

    #[test]
    fn test_parse_roundtrip() {
        let scheme = TopicScheme::new("prod");
        for kind in [
            TopicKind::State,
            TopicKind::Stats,
            TopicKind::InputAudio,
            TopicKind::OutputAudio,
            TopicKind::Command,
        ] {
            let topic = scheme.topic("gear-42", kind);
            assert_eq!(scheme.parse(&topic), Some(("gear-42".to_string(), kind)));
        }
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        let scheme = TopicScheme::new("prod");
        assert_eq!(scheme.parse("other/device/g1/state"), None);
        assert_eq!(scheme.parse("prod/device/g1/unknown"), None);
        assert_eq!(scheme.parse("prod/device/g1/state/extra"), None);
        assert_eq!(scheme.parse("prod/device//state"), None);
        assert_eq!(scheme.parse("prod/gadget/g1/state"), None);
    }
}
