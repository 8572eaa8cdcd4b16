use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(MessageId);

impl MessageId {
    /// Ordering used to break `created_at` ties. Numeric ids come first,
    /// ordered by value; the rest follow in lexical order.
    pub fn timeline_cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(left), Ok(right)) => left.cmp(&right).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

/// Client-generated identifier of a message that has not been confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub Uuid);

impl LocalId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[serde(alias = "conversation")]
    Direct,
    Group,
}

impl ChannelKind {
    pub fn is_group(self) -> bool {
        matches!(self, ChannelKind::Group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    #[serde(other)]
    File,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_cmp_is_numeric_for_numeric_ids() {
        assert_eq!(
            MessageId::from("9").timeline_cmp(&MessageId::from("10")),
            Ordering::Less
        );
        assert_eq!(
            MessageId::from("b").timeline_cmp(&MessageId::from("a")),
            Ordering::Greater
        );
    }

    #[test]
    fn timeline_cmp_is_total_for_mixed_ids() {
        let mut ids: Vec<MessageId> = ["1a", "10", "2", "b", "02"]
            .into_iter()
            .map(MessageId::from)
            .collect();
        ids.sort_by(MessageId::timeline_cmp);
        let sorted: Vec<&str> = ids.iter().map(MessageId::as_str).collect();
        assert_eq!(sorted, ["02", "2", "10", "1a", "b"]);

        let (two, ten, mixed) = (MessageId::from("2"), MessageId::from("10"), MessageId::from("1a"));
        assert_eq!(two.timeline_cmp(&ten), Ordering::Less);
        assert_eq!(ten.timeline_cmp(&mixed), Ordering::Less);
        assert_eq!(two.timeline_cmp(&mixed), Ordering::Less);
    }

    #[test]
    fn local_id_parses_its_display_form() {
        let id = LocalId::generate();
        assert_eq!(id.to_string().parse::<LocalId>().expect("parse"), id);
        assert!("not-a-uuid".parse::<LocalId>().is_err());
    }

    #[test]
    fn conversation_is_an_alias_for_direct() {
        let kind: ChannelKind = serde_json::from_str("\"conversation\"").expect("decode");
        assert_eq!(kind, ChannelKind::Direct);
        assert!(!kind.is_group());
    }
}
