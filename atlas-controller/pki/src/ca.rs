use crate::{subject::Subject, Error};
use atlas_controller_k8s_api::{self as k8s, labels, ByteString, ObjectMeta, ResourceExt};
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, BigNumRef},
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier},
        X509,
    },
};
use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

pub const CA_SECRET: &str = "atlas-ca";

const CERT_KEY: &str = "ca.pem";
const PRIVATE_KEY_KEY: &str = "ca-key.pem";

pub(crate) const VALIDITY_DAYS: u32 = 3650;

/// The self-signed root of trust.
pub struct RootCa {
    serial: String,
    revision: u64,
    cert: X509,
    key: PKey<Private>,
    cert_pem: String,
    key_pem: String,
    /// Prior root certificates keyed by serial.
    archived: BTreeMap<String, String>,
}

// === impl RootCa ===

impl RootCa {
    pub(crate) fn generate(key_bits: u32) -> Result<Self, ErrorStack> {
        Self::build(key_bits, 1, None, BTreeMap::new())
    }

    /// Produces the successor of this root. The current certificate is
    /// archived under its serial and the new serial is strictly greater.
    pub(crate) fn rotate(&self, key_bits: u32) -> Result<Self, ErrorStack> {
        let floor = self.cert.serial_number().to_bn()?;
        let mut archived = self.archived.clone();
        archived.insert(self.serial.clone(), self.cert_pem.clone());
        Self::build(key_bits, self.revision + 1, Some(&*floor), archived)
    }

    fn build(
        key_bits: u32,
        revision: u64,
        floor: Option<&BigNumRef>,
        archived: BTreeMap<String, String>,
    ) -> Result<Self, ErrorStack> {
        let rsa = Rsa::generate(key_bits)?;
        let key_pem = pem_string(rsa.private_key_to_pem()?);
        let key = PKey::from_rsa(rsa)?;

        let serial = next_serial(floor)?;
        let name = Subject::atlas(None).to_name()?;

        let serial_number = serial.to_asn1_integer()?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial_number)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_cert_sign()
                .build()?,
        )?;
        builder.append_extension(
            ExtendedKeyUsage::new()
                .client_auth()
                .server_auth()
                .build()?,
        )?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;
        builder.sign(&key, MessageDigest::sha256())?;
        let cert = builder.build();

        Ok(Self {
            serial: serial.to_dec_str()?.to_string(),
            revision,
            cert_pem: pem_string(cert.to_pem()?),
            cert,
            key,
            key_pem,
            archived,
        })
    }

    pub(crate) fn from_secret(secret: &k8s::Secret) -> Result<Self, Error> {
        let name = secret.name_any();
        let data = secret.data.as_ref();
        let field = |key: &'static str| -> Result<String, Error> {
            data.and_then(|d| d.get(key))
                .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).into_owned())
                .ok_or_else(|| Error::MissingKey {
                    name: name.clone(),
                    key,
                })
        };
        let malformed = |key: &'static str| {
            let name = name.clone();
            move |source: ErrorStack| Error::Malformed { name, key, source }
        };

        let cert_pem = field(CERT_KEY)?;
        let key_pem = field(PRIVATE_KEY_KEY)?;
        let cert = X509::from_pem(cert_pem.as_bytes()).map_err(malformed(CERT_KEY))?;
        let key = PKey::private_key_from_pem(key_pem.as_bytes())
            .map_err(malformed(PRIVATE_KEY_KEY))?;
        let serial = cert
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_dec_str().map(|s| s.to_string()))
            .map_err(malformed(CERT_KEY))?;

        let revision = match secret.labels().get(labels::CA_REVISION).map(|v| v.parse::<u64>()) {
            Some(Ok(revision)) => revision,
            value => {
                tracing::warn!(secret = %name, ?value, "Invalid root CA revision; assuming 1");
                1
            }
        };

        let archived = data
            .into_iter()
            .flatten()
            .filter_map(|(key, ByteString(bytes))| {
                let serial = archived_serial(key)?;
                Some((serial.to_string(), String::from_utf8_lossy(bytes).into_owned()))
            })
            .collect();

        Ok(Self {
            serial,
            revision,
            cert,
            key,
            cert_pem,
            key_pem,
            archived,
        })
    }

    /// The secret holding this root and every archived predecessor. Writing
    /// it replaces any rotation marker on the stored secret.
    pub(crate) fn to_secret(&self) -> k8s::Secret {
        let mut data = BTreeMap::new();
        data.insert(CERT_KEY.to_string(), ByteString(self.cert_pem.clone().into_bytes()));
        data.insert(
            PRIVATE_KEY_KEY.to_string(),
            ByteString(self.key_pem.clone().into_bytes()),
        );
        for (serial, pem) in &self.archived {
            data.insert(archive_key(serial), ByteString(pem.clone().into_bytes()));
        }

        let labels = [
            (labels::CA.to_string(), "true".to_string()),
            (labels::CA_REVISION.to_string(), self.revision.to_string()),
            (labels::CA_SERIAL.to_string(), self.serial.clone()),
        ];

        k8s::Secret {
            metadata: ObjectMeta {
                name: Some(CA_SECRET.to_string()),
                labels: Some(labels.into_iter().collect()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// An archived root certificate, by serial.
    pub fn archived(&self, serial: &str) -> Option<&str> {
        self.archived.get(serial).map(String::as_str)
    }

    /// Whether `secret` archives exactly the certificates this root does.
    pub(crate) fn archive_matches(&self, secret: &k8s::Secret) -> bool {
        let stored = secret
            .data
            .iter()
            .flatten()
            .filter_map(|(key, ByteString(bytes))| Some((archived_serial(key)?, bytes.as_slice())))
            .collect::<BTreeMap<_, _>>();
        let archived = self
            .archived
            .iter()
            .map(|(serial, pem)| (serial.as_str(), pem.as_bytes()))
            .collect::<BTreeMap<_, _>>();
        stored == archived
    }

    /// The active certificate followed by every archived one, in key order.
    pub fn trust_bundle(&self) -> String {
        let mut bundle = String::with_capacity(self.cert_pem.len() * (self.archived.len() + 1));
        for pem in std::iter::once(&self.cert_pem).chain(self.archived.values()) {
            bundle.push_str(pem);
            if !pem.ends_with('\n') {
                bundle.push('\n');
            }
        }
        bundle
    }

    pub(crate) fn cert(&self) -> &X509 {
        &self.cert
    }

    pub(crate) fn key(&self) -> &PKey<Private> {
        &self.key
    }
}

impl std::fmt::Debug for RootCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCa")
            .field("serial", &self.serial)
            .field("revision", &self.revision)
            .field("archived", &self.archived.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

pub fn archive_key(serial: &str) -> String {
    format!("ca-{serial}.pem")
}

fn archived_serial(key: &str) -> Option<&str> {
    let serial = key.strip_prefix("ca-")?.strip_suffix(".pem")?;
    if serial.is_empty() || !serial.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(serial)
}

/// A serial derived from the current time in nanoseconds. When `floor` is set
/// the result is strictly greater than it.
pub(crate) fn next_serial(floor: Option<&BigNumRef>) -> Result<BigNum, ErrorStack> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let now = BigNum::from_dec_str(&nanos.to_string())?;
    match floor {
        Some(floor) if now <= *floor => {
            let mut next = BigNum::new()?;
            let one = BigNum::from_u32(1)?;
            next.checked_add(floor, &one)?;
            Ok(next)
        }
        _ => Ok(now),
    }
}

fn pem_string(pem: Vec<u8>) -> String {
    String::from_utf8_lossy(&pem).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serials_increase_past_floor() {
        let far = BigNum::from_dec_str("99999999999999999999999999").expect("must parse");
        let next = next_serial(Some(&*far)).expect("must generate");
        assert!(next > far);

        let now = next_serial(None).expect("must generate");
        assert!(now > BigNum::from_u32(0).expect("must build"));
    }

    #[test]
    fn archive_keys() {
        assert_eq!(archived_serial(&archive_key("1234")), Some("1234"));
        assert_eq!(archived_serial(PRIVATE_KEY_KEY), None);
        assert_eq!(archived_serial(CERT_KEY), None);
        assert_eq!(archived_serial("ca-.pem"), None);
    }

    #[test]
    fn round_trips_through_secret() {
        let root = RootCa::generate(2048).expect("must generate root");
        let rotated = root.rotate(2048).expect("must rotate root");
        let parsed = RootCa::from_secret(&rotated.to_secret()).expect("must parse");

        assert_eq!(parsed.serial(), rotated.serial());
        assert_eq!(parsed.revision(), 2);
        assert_eq!(parsed.archived(root.serial()), Some(root.cert_pem()));
        assert!(parsed.trust_bundle().starts_with(rotated.cert_pem()));
        assert!(parsed.trust_bundle().ends_with(root.cert_pem()));
    }

    #[test]
    fn archive_matches_stored_entries() {
        let root = RootCa::generate(2048).expect("must generate root");
        let rotated = root.rotate(2048).expect("must rotate root");
        let mut secret = rotated.to_secret();
        assert!(rotated.archive_matches(&secret));
        assert!(!root.archive_matches(&secret));

        let data = secret.data.as_mut().expect("must have data");
        data.insert(archive_key("7"), ByteString(root.cert_pem().as_bytes().to_vec()));
        assert!(!rotated.archive_matches(&secret));

        let data = secret.data.as_mut().expect("must have data");
        data.remove(&archive_key("7"));
        data.insert(
            archive_key(root.serial()),
            ByteString(rotated.cert_pem().as_bytes().to_vec()),
        );
        assert!(!rotated.archive_matches(&secret));
    }

    #[test]
    fn rejects_malformed_pem() {
        let mut secret = RootCa::generate(2048)
            .expect("must generate root")
            .to_secret();
        secret
            .data
            .as_mut()
            .expect("must have data")
            .insert(CERT_KEY.to_string(), ByteString(b"garbage".to_vec()));
        assert!(matches!(
            RootCa::from_secret(&secret),
            Err(Error::Malformed { key: CERT_KEY, .. })
        ));
    }
}
