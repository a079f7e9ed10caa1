//! Autonomy levels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How much a session may do without asking a human.
///
/// Ordered from most to least supervised: `AskFirst < Safe < Moderate < Yolo`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    /// Every action waits for a human
    AskFirst,
    /// Non-destructive actions run automatically
    #[default]
    Safe,
    /// Like `Safe`; the tier between safe and fully autonomous
    Moderate,
    /// Everything not denied runs; warnings are accepted and recorded
    Yolo,
}

impl SafetyLevel {
    /// Every level, in ascending order.
    pub const ALL: [SafetyLevel; 4] = [
        SafetyLevel::AskFirst,
        SafetyLevel::Safe,
        SafetyLevel::Moderate,
        SafetyLevel::Yolo,
    ];

    /// The next more supervised level. `AskFirst` stays put.
    pub fn step_down(self) -> Self {
        match self {
            SafetyLevel::Yolo => SafetyLevel::Moderate,
            SafetyLevel::Moderate => SafetyLevel::Safe,
            SafetyLevel::Safe | SafetyLevel::AskFirst => SafetyLevel::AskFirst,
        }
    }

    /// Name used in configuration and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::AskFirst => "ask_first",
            SafetyLevel::Safe => "safe",
            SafetyLevel::Moderate => "moderate",
            SafetyLevel::Yolo => "yolo",
        }
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SafetyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "ask_first" | "askfirst" | "ask" => Ok(SafetyLevel::AskFirst),
            "safe" => Ok(SafetyLevel::Safe),
            "moderate" => Ok(SafetyLevel::Moderate),
            "yolo" => Ok(SafetyLevel::Yolo),
            _ => Err(format!("unknown safety level: {s}")),
        }
    }
}
