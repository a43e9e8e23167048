//! Identifier newtypes so records never pass around bare strings.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generates a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().simple().to_string())
            }

            /// Borrows the identifier.
            #[must_use]
            pub const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

newtype!(
    /// Identifier of a [`crate::model::Project`].
    ProjectId
);
newtype!(
    /// Identifier of a [`crate::model::Task`].
    TaskId
);
newtype!(
    /// Identifier of a [`crate::model::Instance`].
    InstanceId
);
newtype!(
    /// Identifier of a [`crate::model::SshKey`].
    SshKeyId
);

/// Numeric identity of the user owning a record.
///
/// [`ADMIN_ID`] is reserved: a caller presenting it bypasses owner scoping.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OwnerId(u64);

/// Sentinel owner used by administrators.
pub const ADMIN_ID: OwnerId = OwnerId(0);

impl OwnerId {
    /// Wraps a raw user identifier.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns `true` for the administrator sentinel.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        self.0 == ADMIN_ID.0
    }

    /// Returns `true` when this caller may see records owned by `owner`.
    #[must_use]
    pub const fn can_access(self, owner: Self) -> bool {
        self.is_admin() || self.0 == owner.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
