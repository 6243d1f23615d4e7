//! Conflict resolution for identity merges.
//!
//! When two identities collapse into one, every column either side holds is
//! decided independently by [`resolve`]. The function is pure: it looks only
//! at the candidate values and their provenance.

use serde::{Deserialize, Serialize};

use crate::value::ValueTuple;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetMode {
    #[default]
    Normal,
    Once,
}

impl SetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetMode::Normal => "normal",
            SetMode::Once => "once",
        }
    }
}

impl std::str::FromStr for SetMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(SetMode::Normal),
            "once" => Ok(SetMode::Once),
            other => Err(anyhow::anyhow!("Unknown property set mode '{other}'")),
        }
    }
}

/// When and how a column was last written on an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    pub timestamp: i64,
    pub mode: SetMode,
}

#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub value: &'a ValueTuple,
    pub provenance: Option<Provenance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Survivor,
    Absorbed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub side: Side,
    pub provenance: Option<Provenance>,
}

/// Picks the winning side for one column.
///
/// Timestamp ties and the no-provenance fallback both favour the survivor.
pub fn resolve(survivor: Option<Candidate<'_>>, absorbed: Option<Candidate<'_>>) -> Option<Resolution> {
    let pick = |side: Side, candidate: Candidate<'_>| Resolution {
        side,
        provenance: candidate.provenance,
    };
    match (survivor, absorbed) {
        (None, None) => None,
        (Some(s), None) => Some(pick(Side::Survivor, s)),
        (None, Some(a)) => Some(pick(Side::Absorbed, a)),
        (Some(s), Some(a)) => match (s.provenance, a.provenance) {
            (Some(sp), Some(ap)) => {
                let absorbed_wins = if sp.mode == SetMode::Once && ap.mode == SetMode::Once {
                    ap.timestamp < sp.timestamp
                } else {
                    ap.timestamp > sp.timestamp
                };
                if absorbed_wins {
                    Some(pick(Side::Absorbed, a))
                } else {
                    Some(pick(Side::Survivor, s))
                }
            }
            (None, Some(_)) => Some(pick(Side::Absorbed, a)),
            _ => Some(pick(Side::Survivor, s)),
        },
    }
}
