// =============================================================================
// Scenario actions: typed, validated improvement hypotheses
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::SignalKey;

/// Improvement category. Each one lifts a single signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ImproveAiv,
    ImproveAti,
    ImproveZeroClick,
    ImproveUgc,
    ImproveGeo,
}

impl ActionType {
    pub const ALL: [ActionType; 5] = [
        ActionType::ImproveAiv,
        ActionType::ImproveAti,
        ActionType::ImproveZeroClick,
        ActionType::ImproveUgc,
        ActionType::ImproveGeo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImproveAiv => "improve_aiv",
            Self::ImproveAti => "improve_ati",
            Self::ImproveZeroClick => "improve_zero_click",
            Self::ImproveUgc => "improve_ugc",
            Self::ImproveGeo => "improve_geo",
        }
    }

    /// The signal this action moves.
    pub fn target(self) -> SignalKey {
        match self {
            Self::ImproveAiv => SignalKey::Aiv,
            Self::ImproveAti => SignalKey::Ati,
            Self::ImproveZeroClick => SignalKey::ZeroClick,
            Self::ImproveUgc => SignalKey::UgcHealth,
            Self::ImproveGeo => SignalKey::GeoTrust,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = ();

    /// Accepts the category name or the bare signal key it targets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Some(t) = Self::ALL.into_iter().find(|t| t.as_str() == s) {
            return Ok(t);
        }
        let key = s.strip_prefix("improve_").unwrap_or(&s).parse::<SignalKey>()?;
        Self::ALL.into_iter().find(|t| t.target() == key).ok_or(())
    }
}

/// An action as it arrives over the wire, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioActionRequest {
    #[serde(rename = "type")]
    pub action_type: String,
    pub magnitude: f64,
    pub confidence: f64,
    #[serde(alias = "timeframe")]
    pub timeframe_days: f64,
    #[serde(default)]
    pub cost: Option<f64>,
}

/// A validated improvement hypothesis: `magnitude` points on the target
/// signal, realised over roughly `timeframe_days`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioAction {
    action_type: ActionType,
    magnitude: f64,
    confidence: f64,
    timeframe_days: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cost: Option<f64>,
}

impl ScenarioAction {
    pub fn new(
        action_type: ActionType,
        magnitude: f64,
        confidence: f64,
        timeframe_days: f64,
    ) -> Result<Self, EngineError> {
        Self::checked(action_type, magnitude, confidence, timeframe_days, None, "action")
    }

    pub fn with_cost(mut self, cost: f64) -> Result<Self, EngineError> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(EngineError::scenario("action.cost", "must be a non-negative number"));
        }
        self.cost = Some(cost);
        Ok(self)
    }

    fn checked(
        action_type: ActionType,
        magnitude: f64,
        confidence: f64,
        timeframe_days: f64,
        cost: Option<f64>,
        path: &str,
    ) -> Result<Self, EngineError> {
        if !magnitude.is_finite() || !(0.0..=100.0).contains(&magnitude) {
            return Err(EngineError::scenario(
                format!("{path}.magnitude"),
                format!("{magnitude} is outside [0, 100]"),
            ));
        }
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::scenario(
                format!("{path}.confidence"),
                format!("{confidence} is outside [0, 1]"),
            ));
        }
        if !timeframe_days.is_finite() || timeframe_days <= 0.0 {
            return Err(EngineError::scenario(
                format!("{path}.timeframe_days"),
                "must be a positive number of days",
            ));
        }
        if let Some(c) = cost {
            if !c.is_finite() || c < 0.0 {
                return Err(EngineError::scenario(
                    format!("{path}.cost"),
                    "must be a non-negative number",
                ));
            }
        }
        Ok(Self {
            action_type,
            magnitude,
            confidence,
            timeframe_days,
            cost,
        })
    }

    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn timeframe_days(&self) -> f64 {
        self.timeframe_days
    }

    pub fn cost(&self) -> Option<f64> {
        self.cost
    }
}

/// Validate a request's action list. The first offending field is reported
/// by its path, e.g. `actions[2].confidence`.
pub fn validate_actions(raw: &[ScenarioActionRequest]) -> Result<Vec<ScenarioAction>, EngineError> {
    if raw.is_empty() {
        return Err(EngineError::scenario("actions", "at least one action is required"));
    }
    raw.iter()
        .enumerate()
        .map(|(i, a)| {
            let path = format!("actions[{i}]");
            let action_type = a.action_type.parse::<ActionType>().map_err(|_| {
                EngineError::scenario(
                    format!("{path}.type"),
                    format!("unknown action type `{}`", a.action_type),
                )
            })?;
            ScenarioAction::checked(
                action_type,
                a.magnitude,
                a.confidence,
                a.timeframe_days,
                a.cost,
                &path,
            )
        })
        .collect()
}
