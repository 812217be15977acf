use core::fmt;

use serde::{Deserialize, Serialize};
use sqlx::prelude::Type;

/// Payment platform a webhook originated from.
#[derive(Type, Debug, Deserialize, Serialize, PartialEq, Eq, Copy, Clone, Hash)]
#[sqlx(type_name = "provider", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Hotmart,
    Doppus,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Hotmart => "hotmart",
            Provider::Doppus => "doppus",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
