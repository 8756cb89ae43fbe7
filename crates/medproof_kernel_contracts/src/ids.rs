#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $field:literal, $max:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
                let id = id.into();
                let out = Self(id);
                out.validate()?;
                Ok(out)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Validate for $name {
            fn validate(&self) -> Result<(), ContractViolation> {
                if self.0.trim().is_empty() {
                    return Err(ContractViolation::InvalidValue {
                        field: $field,
                        reason: "must not be empty",
                    });
                }
                if self.0.len() > $max {
                    return Err(ContractViolation::InvalidValue {
                        field: $field,
                        reason: concat!("must be <= ", stringify!($max), " chars"),
                    });
                }
                if self.0.chars().any(char::is_control) {
                    return Err(ContractViolation::InvalidValue {
                        field: $field,
                        reason: "must not contain control characters",
                    });
                }
                Ok(())
            }
        }

        impl TryFrom<String> for $name {
            type Error = ContractViolation;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Caller-chosen identifier of a registered artifact; also its key on the ledger.
    RecordId,
    "record_id",
    128
);
string_id!(
    /// Account identifier of a patient, provider or third party.
    UserId,
    "user_id",
    128
);
string_id!(ConsentId, "consent_id", 128);
