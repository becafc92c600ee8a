use changeprop_core::config::KafkaConfig;

/// Maps logical topic names to datacenter-qualified bus topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNaming {
    consume_dc: String,
    produce_dc: String,
}

impl TopicNaming {
    pub fn new(consume_dc: &str, produce_dc: &str) -> Self {
        Self {
            consume_dc: consume_dc.to_string(),
            produce_dc: produce_dc.to_string(),
        }
    }

    pub fn from_config(config: &KafkaConfig) -> Self {
        Self::new(&config.consume_dc(), &config.produce_dc())
    }

    pub fn consume(&self, topic: &str) -> String {
        prefixed(&self.consume_dc, topic)
    }

    pub fn produce(&self, topic: &str) -> String {
        prefixed(&self.produce_dc, topic)
    }
}

impl Default for TopicNaming {
    fn default() -> Self {
        Self::new("datacenter1", "datacenter1")
    }
}

fn prefixed(dc: &str, topic: &str) -> String {
    if dc.is_empty() {
        topic.to_string()
    } else {
        format!("{dc}.{topic}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixing() {
        let naming = TopicNaming::new("eqiad", "codfw");
        assert_eq!(naming.consume("resource_change"), "eqiad.resource_change");
        assert_eq!(naming.produce("change-prop.error"), "codfw.change-prop.error");
    }

    #[test]
    fn test_empty_dc_disables_prefix() {
        let naming = TopicNaming::new("", "");
        assert_eq!(naming.consume("resource_change"), "resource_change");
        assert_eq!(naming.produce("resource_change"), "resource_change");
    }

    #[test]
    fn test_default_dc() {
        assert_eq!(
            TopicNaming::default().consume("simple_test_rule"),
            "datacenter1.simple_test_rule"
        );
    }
}
