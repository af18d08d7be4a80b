//! Statically enumerated topic plugins.
//!
//! Every converter the gateway can run is listed in [`ConverterKind`]; the
//! topic table in the configuration picks one per plugin id and optionally
//! overrides its network name.

pub mod command;
pub mod rpi_demo;
pub mod test_topic;

use serde::{Deserialize, Serialize};

use crate::converter::TopicConverter;

pub use command::CommandConverter;
pub use rpi_demo::RpiDemoConverter;
pub use test_topic::TestConverter;

/// Selector for the compiled-in converters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConverterKind {
    /// Raspberry Pi demo telemetry: three rates and a light level.
    RpiDemo,
    /// Integer/float pair used for end-to-end checks.
    Test,
    /// Generic command carrying a function code and hex payload.
    Command,
}

impl ConverterKind {
    pub fn default_name(self) -> &'static str {
        match self {
            ConverterKind::RpiDemo => "basecamp/rpi/demo",
            ConverterKind::Test => "basecamp/test",
            ConverterKind::Command => "basecamp/cmd",
        }
    }

    /// Instantiate the converter, named `name` or its default name.
    pub fn build(self, name: Option<&str>) -> Box<dyn TopicConverter> {
        let name = name.unwrap_or(self.default_name()).to_string();
        match self {
            ConverterKind::RpiDemo => Box::new(RpiDemoConverter::new(name)),
            ConverterKind::Test => Box::new(TestConverter::new(name)),
            ConverterKind::Command => Box::new(CommandConverter::new(name)),
        }
    }
}

impl std::fmt::Display for ConverterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConverterKind::RpiDemo => "rpi-demo",
            ConverterKind::Test => "test",
            ConverterKind::Command => "command",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use topicbridge_types::MessageKind;

    #[test]
    fn build_uses_default_or_override_name() {
        let conv = ConverterKind::RpiDemo.build(None);
        assert_eq!(conv.topic_name(), "basecamp/rpi/demo");
        assert_eq!(conv.kind(), MessageKind::Telemetry);

        let conv = ConverterKind::Command.build(Some("rover/cmd"));
        assert_eq!(conv.topic_name(), "rover/cmd");
        assert_eq!(conv.kind(), MessageKind::Command);
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ConverterKind::RpiDemo).unwrap();
        assert_eq!(json, "\"rpi-demo\"");
        assert_eq!(ConverterKind::RpiDemo.to_string(), "rpi-demo");
        let back: ConverterKind = serde_json::from_str("\"test\"").unwrap();
        assert_eq!(back, ConverterKind::Test);
    }
}
