// =============================================================================
// Shared types used across the signal fusion engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Directional opinion carried by a signal or a fused decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[serde(alias = "long", alias = "BUY", alias = "buy")]
    Long,
    #[serde(alias = "short", alias = "SELL", alias = "sell")]
    Short,
    #[serde(alias = "neutral", alias = "HOLD", alias = "hold")]
    Neutral,
}

impl Direction {
    /// Order side implied by this direction. `None` for neutral.
    pub fn side(self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Buy),
            Self::Short => Some(Side::Sell),
            Self::Neutral => None,
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Exchange order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// What the validator recommends doing with a fused decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Execute,
    Hold,
    Reject,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execute => write!(f, "EXECUTE"),
            Self::Hold => write!(f, "HOLD"),
            Self::Reject => write!(f, "REJECT"),
        }
    }
}

/// Lifecycle of a decision's validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationState {
    Pending,
    Valid,
    Rejected,
}

impl Default for ValidationState {
    fn default() -> Self {
        Self::Pending
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Family of exchange endpoints sharing one set of rate-limit quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    Spot,
    Futures,
}

impl EndpointClass {
    /// Infer the endpoint class from a request path or URL.
    ///
    /// Anything under the futures API (`/fapi/`, `fapi.` host, `fstream`)
    /// is futures; everything else is spot.
    pub fn infer(path: &str) -> Self {
        if path.contains("fapi") || path.contains("fstream") {
            Self::Futures
        } else {
            Self::Spot
        }
    }
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Futures => write!(f, "futures"),
        }
    }
}

/// HTTP verb understood by the connectivity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}
