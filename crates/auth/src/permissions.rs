use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use larder_core::DomainError;

/// Capabilities whose vocabulary is fixed by the platform.
///
/// Everything else is a domain-qualified [`Permission::Action`]
/// (e.g. `"orders:create"`), whose vocabulary grows with the services.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Wildcard: grants every permission.
    All,
    ManageUsers,
    ManageRoles,
    ManageSessions,
    ViewReports,
    ManageSettings,
}

impl Capability {
    pub const VARIANTS: [Capability; 6] = [
        Capability::All,
        Capability::ManageUsers,
        Capability::ManageRoles,
        Capability::ManageSessions,
        Capability::ViewReports,
        Capability::ManageSettings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::All => "*",
            Capability::ManageUsers => "users:manage",
            Capability::ManageRoles => "roles:manage",
            Capability::ManageSessions => "sessions:manage",
            Capability::ViewReports => "reports:view",
            Capability::ManageSettings => "settings:manage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::VARIANTS.into_iter().find(|c| c.as_str() == s)
    }
}

/// A single permission held by a principal.
///
/// Serialized as its string form (`"*"`, `"sessions:manage"`, `"orders:create"`).
/// Parsing prefers the known [`Capability`] vocabulary, so a composed
/// `"sessions:manage"` and the capability compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    Capability(Capability),
    Action { domain: String, action: String },
}

impl Permission {
    /// Build a domain-qualified permission (normalized to a capability when one matches).
    pub fn action(domain: &str, action: &str) -> Result<Self, DomainError> {
        format!("{domain}:{action}").parse()
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Permission::Capability(Capability::All))
    }
}

impl From<Capability> for Permission {
    fn from(value: Capability) -> Self {
        Permission::Capability(value)
    }
}

impl core::str::FromStr for Permission {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(cap) = Capability::parse(s) {
            return Ok(Permission::Capability(cap));
        }

        let (domain, action) = s
            .split_once(':')
            .ok_or_else(|| DomainError::validation(format!("permission '{s}' is not 'domain:action'")))?;

        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        };
        if !valid(domain) || !valid(action) {
            return Err(DomainError::validation(format!(
                "permission '{s}' has an invalid domain or action"
            )));
        }

        Ok(Permission::Action {
            domain: domain.to_string(),
            action: action.to_string(),
        })
    }
}

impl TryFrom<String> for Permission {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.to_string()
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Permission::Capability(cap) => f.write_str(cap.as_str()),
            Permission::Action { domain, action } => write!(f, "{domain}:{action}"),
        }
    }
}

/// Set of permissions granted to a principal (and denormalized onto sessions).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, permission: &Permission) -> bool {
        self.0.contains(permission)
    }

    pub fn insert(&mut self, permission: impl Into<Permission>) -> bool {
        self.0.insert(permission.into())
    }

    pub fn grants_all(&self) -> bool {
        self.contains(&Permission::Capability(Capability::All))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String forms, in stable order (used by storage backends).
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }

    /// Parse string forms (as loaded from storage).
    pub fn from_strings<I, S>(values: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        values
            .into_iter()
            .map(|s| s.as_ref().parse::<Permission>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_capabilities_parse_to_the_enum() {
        for cap in Capability::VARIANTS {
            let parsed: Permission = cap.as_str().parse().unwrap();
            assert_eq!(parsed, Permission::Capability(cap));
        }
    }

    #[test]
    fn composed_action_normalizes_to_capability() {
        let p = Permission::action("sessions", "manage").unwrap();
        assert_eq!(p, Permission::Capability(Capability::ManageSessions));
    }

    #[test]
    fn unknown_domain_action_stays_opaque() {
        let p: Permission = "orders:create".parse().unwrap();
        assert_eq!(
            p,
            Permission::Action {
                domain: "orders".into(),
                action: "create".into()
            }
        );
        assert_eq!(p.to_string(), "orders:create");
    }

    #[test]
    fn rejects_malformed_strings() {
        for bad in ["", "orders", ":create", "orders:", "orders:cre ate", "a:b:c"] {
            assert!(bad.parse::<Permission>().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn set_serializes_as_string_array() {
        let set: PermissionSet = [
            Permission::from(Capability::ViewReports),
            "orders:create".parse().unwrap(),
        ]
        .into_iter()
        .collect();

        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json, serde_json::json!(["reports:view", "orders:create"]));

        let back: PermissionSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn deserializing_garbage_fails() {
        let res: Result<PermissionSet, _> = serde_json::from_value(serde_json::json!(["nope"]));
        assert!(res.is_err());
    }

    proptest! {
        #[test]
        fn action_display_parses_back(domain in "[a-z][a-z_]{0,12}", action in "[a-z][a-z_]{0,12}") {
            let p = Permission::action(&domain, &action).unwrap();
            let reparsed: Permission = p.to_string().parse().unwrap();
            prop_assert_eq!(p, reparsed);
        }
    }
}
