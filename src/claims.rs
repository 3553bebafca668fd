//! Claims, identities and the read-only view handlers use once a session is
//! established.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const NAME_CLAIM: &str = "name";
pub const SUBJECT_CLAIM: &str = "sub";

/// Authentication type stamped on identities restored from the session cookie.
pub const COOKIE_AUTHENTICATION_TYPE: &str = "cookie";

/// id token claims that only matter to protocol validation.
const PROTOCOL_CLAIMS: &[&str] = &[
    "nonce", "at_hash", "c_hash", "aud", "azp", "iss", "iat", "nbf", "exp",
];

/// An ordered set of `(claim type, value)` pairs.
///
/// Claim types are compared case-sensitively. A set holds at most one
/// [`NAME_CLAIM`] and at most one [`SUBJECT_CLAIM`]; pushing a second one is
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Vec<(String, String)>);

impl Claims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, claim_type: impl Into<String>, value: impl Into<String>) {
        let claim_type = claim_type.into();
        if (claim_type == NAME_CLAIM || claim_type == SUBJECT_CLAIM) && self.contains(&claim_type)
        {
            return;
        }
        self.0.push((claim_type, value.into()));
    }

    pub fn find_first(&self, claim_type: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(t, _)| t == claim_type)
            .map(|(_, v)| v.as_str())
    }

    pub fn find_all<'a>(&'a self, claim_type: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(t, _)| t == claim_type)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, claim_type: &str) -> bool {
        self.0.iter().any(|(t, _)| t == claim_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(t, v)| (t.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flattens a JSON claims object. Protocol-only id token claims are
    /// dropped; every other claim type is kept verbatim.
    pub fn from_json_object(object: &Map<String, Value>) -> Self {
        let mut claims = Claims::new();
        claims.extend_from_json(object, false);
        claims
    }

    /// Adds claims from `object` whose type is not already present. Used to
    /// merge userinfo claims without overriding token-asserted ones.
    pub fn merge_missing(&mut self, object: &Map<String, Value>) {
        self.extend_from_json(object, true);
    }

    fn extend_from_json(&mut self, object: &Map<String, Value>, only_missing: bool) {
        let present: Vec<String> = if only_missing {
            self.0.iter().map(|(t, _)| t.clone()).collect()
        } else {
            Vec::new()
        };

        for (claim_type, value) in object {
            if PROTOCOL_CLAIMS.contains(&claim_type.as_str()) || present.contains(claim_type) {
                continue;
            }
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    for item in items {
                        if let Some(v) = json_claim_value(item) {
                            self.push(claim_type.as_str(), v);
                        }
                    }
                }
                other => {
                    if let Some(v) = json_claim_value(other) {
                        self.push(claim_type.as_str(), v);
                    }
                }
            }
        }
    }

    /// Name claim if not blank, else subject if not blank, else empty.
    pub fn display_name(&self) -> &str {
        if let Some(name) = self.find_first(NAME_CLAIM)
            && !name.trim().is_empty()
        {
            return name;
        }

        if let Some(sub) = self.find_first(SUBJECT_CLAIM)
            && !sub.trim().is_empty()
        {
            return sub;
        }

        ""
    }
}

fn json_claim_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).ok(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub claims: Claims,
    pub authentication_type: Option<String>,
}

impl Identity {
    pub fn authenticated(claims: Claims, authentication_type: impl Into<String>) -> Self {
        Self {
            claims,
            authentication_type: Some(authentication_type.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authentication_type.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub identity: Option<Identity>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self { identity: None }
    }

    pub fn from_identity(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    pub fn claims(&self) -> Option<&Claims> {
        self.identity.as_ref().map(|identity| &identity.claims)
    }

    pub fn claim(&self, claim_type: &str) -> Option<&str> {
        self.claims()?.find_first(claim_type)
    }

    pub fn display_name(&self) -> &str {
        self.claims().map(Claims::display_name).unwrap_or_default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity
            .as_ref()
            .is_some_and(Identity::is_authenticated)
    }
}

/// Display name of an optional principal; empty when there is none.
pub fn display_name(principal: Option<&Principal>) -> String {
    principal
        .map(|p| p.display_name().to_string())
        .unwrap_or_default()
}

pub fn is_authenticated(principal: Option<&Principal>) -> bool {
    principal.is_some_and(Principal::is_authenticated)
}

/// How inbound claim types are named in the session.
///
/// `PassThrough` keeps provider claim types as-is. Remapping renames them,
/// which breaks lookups such as [`Claims::display_name`] that expect the
/// provider's names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ClaimMapping {
    #[default]
    PassThrough,
    Remap(HashMap<String, String>),
}

impl ClaimMapping {
    /// The classic JWT to XML-SOAP claim URI table.
    pub fn legacy_jwt() -> Self {
        const SOAP: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims";
        const MS: &str = "http://schemas.microsoft.com/ws/2008/06/identity/claims";
        let table = [
            ("sub", format!("{SOAP}/nameidentifier")),
            ("name", format!("{SOAP}/name")),
            ("email", format!("{SOAP}/emailaddress")),
            ("given_name", format!("{SOAP}/givenname")),
            ("family_name", format!("{SOAP}/surname")),
            ("gender", format!("{SOAP}/gender")),
            ("birthdate", format!("{SOAP}/dateofbirth")),
            ("website", format!("{SOAP}/webpage")),
            ("role", format!("{MS}/role")),
            ("roles", format!("{MS}/role")),
        ];
        Self::Remap(
            table
                .into_iter()
                .map(|(from, to)| (from.to_string(), to))
                .collect(),
        )
    }

    pub fn apply(&self, claims: Claims) -> Claims {
        match self {
            ClaimMapping::PassThrough => claims,
            ClaimMapping::Remap(table) => {
                let mut mapped = Claims::new();
                for (claim_type, value) in claims.0 {
                    let claim_type = table.get(&claim_type).cloned().unwrap_or(claim_type);
                    mapped.push(claim_type, value);
                }
                mapped
            }
        }
    }
}
