// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain entities.
//!
//! Identifiers are 64-bit integers, amounts are cents, times are UTC. Status
//! enums are stored as their lowercase text form.

/// Declares a status enum stored and serialized as text.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type)]
        #[sqlx(type_name = "text")]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $text)]
                #[sqlx(rename = $text)]
                $variant
            ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(crate::error::Error::InvalidInput(format!(
                        "unknown {} `{}`",
                        stringify!($name),
                        s
                    ))),
                }
            }
        }
    };
}

mod billing;
mod catalog;
mod order;
mod plugin;
mod records;
mod tier;
mod user;
mod vps;

pub use billing::*;
pub use catalog::*;
pub use order::*;
pub use plugin::*;
pub use records::*;
pub use tier::*;
pub use user::*;
pub use vps::*;

/// Page of results plus the unpaged total.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enum_round_trip_through_str() {
        for status in OrderStatus::ALL {
            let parsed: OrderStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, *status);
        }
        assert!("paid".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_text_enum_serde_uses_text() {
        let v = serde_json::to_value(VpsStatus::ExpiredLocked).unwrap();
        assert_eq!(v, "expired_locked");
        let s: SignatureStatus = serde_json::from_value("community".into()).unwrap();
        assert_eq!(s, SignatureStatus::Community);
    }
}
