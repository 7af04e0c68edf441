//! `Client`. Unique by *name* (case-sensitive ASCII after
//! normalisation); survives rename via `ub-config`'s `moved_clients` table.

use crate::ClientUid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimal bitflags-alike macro: other crates in this workspace reach
/// for the real `bitflags` crate for exactly this, but this is a small,
/// fixed capability set, so a couple of `const` associated values plus
/// `Copy`/`BitOr` is enough and keeps this leaf crate dependency-free.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name(pub $repr);

        impl $name {
            $(pub const $variant: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

bitflags_like! {
    /// Capability bitset reported during identification / capability
    /// exchange, in the Probing -> Authenticated step.
    pub struct Capability: u32 {
        const FILE_BACKUPS        = 1 << 0;
        const IMAGE_BACKUPS       = 1 << 1;
        const EFI_LEFT_TO_GPT     = 1 << 2;
        const CLIENT_BSD          = 1 << 3;
        const TOKEN_AUTH          = 1 << 4;
        const ECDSA_409K1         = 1 << 5;
        const METADATA_V2         = 1 << 6;
        const FILE_METADATA_STREAMS = 1 << 7;
        const CBT                = 1 << 8;
    }
}

/// Per-protocol version negotiated with a client (`protocol_versions`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersions {
    pub filesrv: u32,
    pub file: u32,
    pub file_v2: u32,
    pub image: u32,
    pub eta: u32,
    pub metadata: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub uid: ClientUid,
    pub name: String,
    pub group_id: i64,
    pub lastseen: i64,
    pub last_filebackup: Option<i64>,
    /// Per-drive-letter (or, off-Windows, per logical volume name) last
    /// successful image backup time.
    pub last_image_backup: HashMap<String, i64>,
    pub file_ok: bool,
    pub image_ok: bool,
    pub capabilities: Capability,
    pub protocol_versions: ProtocolVersions,
    pub perm_uid: Option<String>,
}

impl Client {
    pub fn new(id: i64, uid: ClientUid, name: impl Into<String>, group_id: i64) -> Self {
        Self {
            id,
            uid,
            name: normalise_name(name.into()),
            group_id,
            lastseen: 0,
            last_filebackup: None,
            last_image_backup: HashMap::new(),
            file_ok: false,
            image_ok: false,
            capabilities: Capability::empty(),
            protocol_versions: ProtocolVersions::default(),
            perm_uid: None,
        }
    }
}

/// Normalises a client name the way identification does: trims
/// surrounding whitespace and strips any byte outside printable ASCII,
/// since names participate in on-disk path construction.
pub fn normalise_name(name: String) -> String {
    name.trim()
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_union_and_contains() {
        let caps = Capability::FILE_BACKUPS | Capability::CBT;
        assert!(caps.contains(Capability::FILE_BACKUPS));
        assert!(caps.contains(Capability::CBT));
        assert!(!caps.contains(Capability::IMAGE_BACKUPS));
    }

    #[test]
    fn name_normalisation_strips_control_bytes() {
        assert_eq!(normalise_name("  host\u{7}-01  ".to_string()), "host-01");
    }
}
