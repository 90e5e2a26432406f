use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomIdError {
    #[error("resource type must not be empty")]
    EmptyType,
    #[error("resource id must not be empty")]
    EmptyId,
    #[error("'{0}' must not contain '/'")]
    Separator(String),
    #[error("expected '<resource_type>/<resource_id>', got '{0}'")]
    Format(String),
}

/// Identifies the room of one resource. Scoped by resource type, so a
/// `board/1` and a `page/1` never share a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId {
    resource_type: String,
    resource_id: String,
}

impl RoomId {
    pub fn new(resource_type: &str, resource_id: &str) -> Result<Self, RoomIdError> {
        if resource_type.is_empty() {
            return Err(RoomIdError::EmptyType);
        }
        if resource_id.is_empty() {
            return Err(RoomIdError::EmptyId);
        }
        for part in [resource_type, resource_id] {
            if part.contains('/') {
                return Err(RoomIdError::Separator(part.to_string()));
            }
        }
        Ok(Self {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        })
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource_type, resource_id) = s
            .split_once('/')
            .ok_or_else(|| RoomIdError::Format(s.to_string()))?;
        RoomId::new(resource_type, resource_id)
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_types_do_not_collide() {
        let a = RoomId::new("board", "1").unwrap();
        let b = RoomId::new("page", "1").unwrap();
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn parses_canonical_form() {
        let id: RoomId = "board/42".parse().unwrap();
        assert_eq!(id.resource_type(), "board");
        assert_eq!(id.resource_id(), "42");
        assert_eq!(id.to_string(), "board/42");
    }

    #[test]
    fn rejects_ambiguous_ids() {
        assert_eq!(RoomId::new("", "1"), Err(RoomIdError::EmptyType));
        assert_eq!(RoomId::new("board", ""), Err(RoomIdError::EmptyId));
        assert!(matches!(RoomId::new("a/b", "1"), Err(RoomIdError::Separator(_))));
        assert!("board/1/2".parse::<RoomId>().is_err());
        assert!("board".parse::<RoomId>().is_err());
    }
}
