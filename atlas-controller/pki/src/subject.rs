use openssl::{
    error::ErrorStack,
    nid::Nid,
    x509::{X509Name, X509NameBuilder},
};
use sha2::{Digest, Sha256};

/// The distinguished name of a certificate issued by this controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub common_name: Option<String>,
    pub organization: String,
    pub organizational_unit: String,
    pub country: String,
    pub province: String,
    pub locality: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Usage {
    ServerAuth,
    ClientAuth,
}

// === impl Subject ===

impl Subject {
    pub fn atlas(common_name: Option<String>) -> Self {
        Self {
            common_name,
            organization: "goatlas.io".to_string(),
            organizational_unit: "Atlas".to_string(),
            country: "US".to_string(),
            province: "DC".to_string(),
            locality: "Washington".to_string(),
        }
    }

    pub(crate) fn to_name(&self) -> Result<X509Name, ErrorStack> {
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COUNTRYNAME, &self.country)?;
        name.append_entry_by_nid(Nid::STATEORPROVINCENAME, &self.province)?;
        name.append_entry_by_nid(Nid::LOCALITYNAME, &self.locality)?;
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, &self.organization)?;
        name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit)?;
        if let Some(cn) = &self.common_name {
            name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
        }
        Ok(name.build())
    }
}

// === impl Usage ===

impl Usage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerAuth => "serverAuth",
            Self::ClientAuth => "clientAuth",
        }
    }
}

/// Hashes the inputs that determine a leaf certificate's identity. Key
/// material, serials and validity are not part of the hash.
///
/// The result is stored as a label value, so it is the hex encoding of the
/// first 16 bytes of the digest and fits the 63 character limit.
pub fn checksum(subject: &Subject, usages: &[Usage]) -> String {
    let mut hasher = Sha256::new();
    let fields = [
        ("CN", subject.common_name.as_deref().unwrap_or_default()),
        ("O", subject.organization.as_str()),
        ("OU", subject.organizational_unit.as_str()),
        ("C", subject.country.as_str()),
        ("ST", subject.province.as_str()),
        ("L", subject.locality.as_str()),
    ];
    for (field, value) in fields {
        hasher.update(field.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    for usage in usages {
        hasher.update(b"usage=");
        hasher.update(usage.as_str().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize()[..CHECKSUM_BYTES])
}

const CHECKSUM_BYTES: usize = 16;
