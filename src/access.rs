use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Which calling AE titles may store objects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Admit every calling AE title
    #[serde(default)]
    pub permit_all: bool,

    /// Calling AE titles admitted when `permit_all` is off
    #[serde(default)]
    pub allowed_aets: HashSet<String>,
}

impl AccessPolicy {
    pub fn permit_all() -> Self {
        Self {
            permit_all: true,
            allowed_aets: HashSet::new(),
        }
    }

    pub fn allow<I, S>(aets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permit_all: false,
            allowed_aets: aets.into_iter().map(Into::into).collect(),
        }
    }

    /// True when no calling AE title can ever be admitted
    pub fn denies_everyone(&self) -> bool {
        !self.permit_all && self.allowed_aets.is_empty()
    }
}

/// Decides whether a calling AE title may store objects
#[derive(Debug, Clone)]
pub struct AccessGate {
    policy: Arc<AccessPolicy>,
}

impl AccessGate {
    pub fn new(policy: AccessPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn authorize(&self, calling_aet: &str) -> bool {
        if self.policy.permit_all {
            return true;
        }

        let permitted = self.policy.allowed_aets.contains(calling_aet.trim());
        if !permitted {
            tracing::warn!("Client association NOT permitted: {}", calling_aet);
        }
        permitted
    }
}
