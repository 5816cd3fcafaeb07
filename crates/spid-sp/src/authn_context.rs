use std::fmt;
use std::str::FromStr;

pub const SPID_L1: &str = "https://www.spid.gov.it/SpidL1";
pub const SPID_L2: &str = "https://www.spid.gov.it/SpidL2";
pub const SPID_L3: &str = "https://www.spid.gov.it/SpidL3";

/// SPID assurance levels, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthnLevel {
    L1,
    L2,
    L3,
}

impl AuthnLevel {
    pub fn class_ref(&self) -> &'static str {
        match self {
            AuthnLevel::L1 => SPID_L1,
            AuthnLevel::L2 => SPID_L2,
            AuthnLevel::L3 => SPID_L3,
        }
    }

    pub fn from_class_ref(class_ref: &str) -> Option<Self> {
        match class_ref.trim() {
            SPID_L1 => Some(AuthnLevel::L1),
            SPID_L2 => Some(AuthnLevel::L2),
            SPID_L3 => Some(AuthnLevel::L3),
            _ => None,
        }
    }
}

impl fmt::Display for AuthnLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_ref())
    }
}

impl FromStr for AuthnLevel {
    type Err = String;

    /// Accepts either the full class reference or the short forms `L1`..`L3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(level) = Self::from_class_ref(s) {
            return Ok(level);
        }
        match s.trim().to_ascii_uppercase().as_str() {
            "L1" | "SPIDL1" => Ok(AuthnLevel::L1),
            "L2" | "SPIDL2" => Ok(AuthnLevel::L2),
            "L3" | "SPIDL3" => Ok(AuthnLevel::L3),
            _ => Err(format!("unknown SPID level {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Comparison {
    Exact,
    #[default]
    Minimum,
    Maximum,
    Better,
}

impl Comparison {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Exact => "exact",
            Comparison::Minimum => "minimum",
            Comparison::Maximum => "maximum",
            Comparison::Better => "better",
        }
    }
}

impl FromStr for Comparison {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(Comparison::Exact),
            "minimum" => Ok(Comparison::Minimum),
            "maximum" => Ok(Comparison::Maximum),
            "better" => Ok(Comparison::Better),
            _ => Err(format!("unknown comparison {s}")),
        }
    }
}

/// The authentication context an AuthnRequest asks for, and the rule the
/// matching assertion is held to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedAuthnContext {
    pub level: AuthnLevel,
    pub comparison: Comparison,
}

impl Default for RequestedAuthnContext {
    fn default() -> Self {
        Self {
            level: AuthnLevel::L2,
            comparison: Comparison::Minimum,
        }
    }
}

impl RequestedAuthnContext {
    pub fn new(level: AuthnLevel, comparison: Comparison) -> Self {
        Self { level, comparison }
    }

    pub fn is_satisfied_by(&self, actual: AuthnLevel) -> bool {
        match self.comparison {
            Comparison::Exact => actual == self.level,
            Comparison::Minimum => actual >= self.level,
            Comparison::Maximum => actual <= self.level,
            Comparison::Better => actual > self.level,
        }
    }
}

impl fmt::Display for RequestedAuthnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.comparison.as_str(), self.level)
    }
}
