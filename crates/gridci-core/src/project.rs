//! Project records.

use serde::{Deserialize, Serialize};
use url::Url;

/// A project: one watched repository.
///
/// Immutable after creation except for credential rotation. Created and
/// administered by external collaborators; the engine only reads it from
/// the bundle's `project.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Owner of the repository (user or organization).
    pub owner: String,
    /// Repository name.
    pub name: String,
    /// Remote URL used for cloning.
    pub url: Url,
    /// Private deploy key, if the remote needs authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_key: Option<String>,
    /// Secret used to sign webhook callbacks to collaborators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
}

impl Project {
    /// "owner/name", the human-readable identifier collaborators use.
    pub fn long_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_name_joins_owner_and_name() {
        let project = Project {
            owner: "acme".to_string(),
            name: "widgets".to_string(),
            url: "https://example.com/acme/widgets.git".parse().unwrap(),
            deploy_key: None,
            webhook_secret: None,
        };
        assert_eq!(project.long_name(), "acme/widgets");
    }
}
