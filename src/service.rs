//! `Service` (`spec.md` §3): the two Git server-side programs the gateway
//! can front.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    /// Wire-name string form: `upload-pack` / `receive-pack`.
    #[must_use]
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    #[must_use]
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "upload-pack" => Some(Self::UploadPack),
            "receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    /// `Content-Type` suffix used on advertisement/result/request bodies:
    /// `application/x-git-{service}-...`.
    #[must_use]
    pub fn content_type_segment(self) -> &'static str {
        self.wire_name()
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}
