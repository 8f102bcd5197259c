use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// Holding registers of the tower light, one coil per colour. Writing 1 turns
/// the colour on, 0 turns it off.
pub const GREEN_REGISTER: u16 = 0x0000;
pub const YELLOW_REGISTER: u16 = 0x0001;
pub const RED_REGISTER: u16 = 0x0002;

/// Every colour register, in the order they are cleared.
pub const LIGHT_REGISTERS: [u16; 3] = [GREEN_REGISTER, YELLOW_REGISTER, RED_REGISTER];

/// Desired tower light state. At most one colour is lit at a time.
#[derive(
    Deserialize,
    Serialize,
    EnumString,
    IntoStaticStr,
    Display,
    EnumIter,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LightCommand {
    Green,
    Yellow,
    Red,
    /// All colours off.
    Off,
}

impl LightCommand {
    /// Register to set after clearing, `None` for [`LightCommand::Off`].
    pub fn register(self) -> Option<u16> {
        match self {
            LightCommand::Green => Some(GREEN_REGISTER),
            LightCommand::Yellow => Some(YELLOW_REGISTER),
            LightCommand::Red => Some(RED_REGISTER),
            LightCommand::Off => None,
        }
    }
}

/// Who asked for a light change. Only used for logging, requests are applied
/// in arrival order whatever their source.
#[derive(
    Deserialize, Serialize, Display, IntoStaticStr, Copy, Clone, Debug, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LightSource {
    /// Verdict from the analysis scheduler.
    Danger,
    /// Low light from the sensor poller.
    Sensor,
    /// Operator or startup request.
    Manual,
}

/// A light change queued on the arbiter.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct LightRequest {
    pub command: LightCommand,
    pub source: LightSource,
}

impl LightRequest {
    pub fn new(command: LightCommand, source: LightSource) -> Self {
        Self { command, source }
    }

    /// Yellow for a dangerous scene, green otherwise.
    ///
    /// * `danger`: verdict of the latest analysis.
    pub fn from_verdict(danger: bool) -> Self {
        let command = if danger {
            LightCommand::Yellow
        } else {
            LightCommand::Green
        };
        Self::new(command, LightSource::Danger)
    }

    /// Red warning raised by the sensor poller.
    pub fn low_light() -> Self {
        Self::new(LightCommand::Red, LightSource::Sensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[rstest]
    #[case("green", LightCommand::Green)]
    #[case("yellow", LightCommand::Yellow)]
    #[case("red", LightCommand::Red)]
    #[case("off", LightCommand::Off)]
    fn test_parse_light_command(#[case] raw: &str, #[case] expected: LightCommand) {
        assert_eq!(LightCommand::from_str(raw).unwrap(), expected);
        let parsed: LightCommand = serde_json::from_str(&format!("\"{raw}\"")).unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_each_colour_has_its_own_register() {
        let registers: Vec<u16> = LightCommand::iter().filter_map(LightCommand::register).collect();
        assert_eq!(registers, LIGHT_REGISTERS.to_vec());
        assert_eq!(LightCommand::Off.register(), None);
    }

    #[rstest]
    #[case(true, LightCommand::Yellow)]
    #[case(false, LightCommand::Green)]
    fn test_verdict_maps_to_colour(#[case] danger: bool, #[case] expected: LightCommand) {
        let request = LightRequest::from_verdict(danger);
        assert_eq!(request.command, expected);
        assert_eq!(request.source, LightSource::Danger);
    }

    #[test]
    fn test_parse_and_compare_light_request() {
        let parsed: LightRequest =
            serde_json::from_str(r#"{"command": "red", "source": "sensor"}"#).unwrap();
        assert_eq!(parsed, LightRequest::low_light());
    }
}
