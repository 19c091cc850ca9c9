use crate::{
    ca::{next_serial, RootCa, VALIDITY_DAYS},
    subject::{checksum, Subject, Usage},
    Error, Settings,
};
use atlas_controller_k8s_api::{self as k8s, labels, ByteString, ObjectMeta, ResourceExt};
use openssl::{
    asn1::Asn1Time,
    bn::BigNumRef,
    error::ErrorStack,
    hash::MessageDigest,
    pkey::PKey,
    rsa::Rsa,
    x509::{
        extension::{AuthorityKeyIdentifier, ExtendedKeyUsage, KeyUsage, SubjectKeyIdentifier},
        X509,
    },
};
use std::collections::BTreeMap;

const CA_CERT_KEY: &str = "ca.crt";
const CERT_KEY: &str = "tls.crt";
const PRIVATE_KEY_KEY: &str = "tls.key";

/// The fixed purposes leaf certificates are issued for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeafKind {
    /// Presented by the hub's public ingress.
    Ingress,
    /// Presented by proxies accepting mutually authenticated connections.
    Server,
    /// Presented by proxies originating mutually authenticated connections.
    Client,
}

/// A leaf certificate signed by the active root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leaf {
    pub kind: LeafKind,
    pub serial: String,
    pub signed_by: String,
    pub checksum: String,
    pub certificate: String,
    pub private_key: String,
}

/// Why a stored leaf must be reissued.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Stale {
    Missing,
    SignedByInactiveRoot,
    ChecksumMismatch,
}

// === impl LeafKind ===

impl LeafKind {
    pub const ALL: [Self; 3] = [Self::Ingress, Self::Server, Self::Client];

    pub fn secret_name(self) -> &'static str {
        match self {
            Self::Ingress => "atlas-tls",
            Self::Server => "atlas-server",
            Self::Client => "atlas-client",
        }
    }

    pub fn usage(self) -> Usage {
        match self {
            Self::Ingress | Self::Server => Usage::ServerAuth,
            Self::Client => Usage::ClientAuth,
        }
    }

    pub fn subject(self, settings: &Settings) -> Subject {
        let cn = match self {
            Self::Ingress => settings.ingress_common_name.clone(),
            Self::Server => "server.atlas".to_string(),
            Self::Client => "client.atlas".to_string(),
        };
        Subject::atlas(Some(cn))
    }

    pub fn checksum(self, settings: &Settings) -> String {
        checksum(&self.subject(settings), &[self.usage()])
    }

    fn usage_label(self) -> &'static str {
        match self.usage() {
            Usage::ServerAuth => labels::CA_USAGE_SERVER,
            Usage::ClientAuth => labels::CA_USAGE_CLIENT,
        }
    }
}

// === impl Leaf ===

impl Leaf {
    /// Issues a fresh key pair and certificate. When `floor` is set the
    /// serial is strictly greater than it.
    pub(crate) fn issue(
        kind: LeafKind,
        root: &RootCa,
        settings: &Settings,
        floor: Option<&BigNumRef>,
    ) -> Result<Self, ErrorStack> {
        let rsa = Rsa::generate(settings.key_bits)?;
        let private_key = String::from_utf8_lossy(&rsa.private_key_to_pem()?).into_owned();
        let key = PKey::from_rsa(rsa)?;

        let serial = next_serial(floor)?;
        let serial_number = serial.to_asn1_integer()?;
        let subject = kind.subject(settings);
        let name = subject.to_name()?;
        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&serial_number)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(root.cert().subject_name())?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        let mut usage = ExtendedKeyUsage::new();
        match kind.usage() {
            Usage::ServerAuth => usage.server_auth(),
            Usage::ClientAuth => usage.client_auth(),
        };
        builder.append_extension(usage.build()?)?;
        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(root.cert()), None))?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(root.cert()), None))?;
        builder.append_extension(aki)?;
        builder.sign(root.key(), MessageDigest::sha256())?;
        let cert = builder.build();

        Ok(Self {
            kind,
            serial: serial.to_dec_str()?.to_string(),
            signed_by: root.serial().to_string(),
            checksum: checksum(&subject, &[kind.usage()]),
            certificate: String::from_utf8_lossy(&cert.to_pem()?).into_owned(),
            private_key,
        })
    }

    pub(crate) fn to_secret(&self, root: &RootCa) -> k8s::Secret {
        let data = [
            (CA_CERT_KEY, root.cert_pem()),
            (CERT_KEY, self.certificate.as_str()),
            (PRIVATE_KEY_KEY, self.private_key.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect::<BTreeMap<_, _>>();

        let labels = [
            (labels::CERT, "true"),
            (labels::CA_SERIAL, self.serial.as_str()),
            (labels::CA_SIGNED, self.signed_by.as_str()),
            (labels::CA_CHECKSUM, self.checksum.as_str()),
            (self.kind.usage_label(), "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        k8s::Secret {
            metadata: ObjectMeta {
                name: Some(self.kind.secret_name().to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub(crate) fn from_secret(kind: LeafKind, secret: &k8s::Secret) -> Result<Self, Error> {
        let name = secret.name_any();
        let field = |key: &'static str| -> Result<String, Error> {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).into_owned())
                .ok_or_else(|| Error::MissingKey {
                    name: name.clone(),
                    key,
                })
        };
        let certificate = field(CERT_KEY)?;
        let private_key = field(PRIVATE_KEY_KEY)?;

        X509::from_pem(certificate.as_bytes()).map_err(|source| Error::Malformed {
            name: name.clone(),
            key: CERT_KEY,
            source,
        })?;
        PKey::private_key_from_pem(private_key.as_bytes()).map_err(|source| Error::Malformed {
            name: name.clone(),
            key: PRIVATE_KEY_KEY,
            source,
        })?;

        let label = |key: &str| secret.labels().get(key).cloned().unwrap_or_default();
        Ok(Self {
            kind,
            serial: label(labels::CA_SERIAL),
            signed_by: label(labels::CA_SIGNED),
            checksum: label(labels::CA_CHECKSUM),
            certificate,
            private_key,
        })
    }
}

// === impl Stale ===

impl Stale {
    /// Compares a stored leaf against the active root and the expected
    /// checksum. Returns `None` when the leaf can be kept.
    pub(crate) fn check(
        secret: Option<&k8s::Secret>,
        active_serial: &str,
        expected_checksum: &str,
    ) -> Option<Self> {
        let Some(secret) = secret else {
            return Some(Self::Missing);
        };
        let meta = secret.labels();
        if meta.get(labels::CA_SIGNED).map(String::as_str) != Some(active_serial) {
            return Some(Self::SignedByInactiveRoot);
        }
        if meta.get(labels::CA_CHECKSUM).map(String::as_str) != Some(expected_checksum) {
            return Some(Self::ChecksumMismatch);
        }
        None
    }
}

impl std::fmt::Display for Stale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => "missing",
            Self::SignedByInactiveRoot => "signed by an inactive root",
            Self::ChecksumMismatch => "checksum mismatch",
        }
        .fmt(f)
    }
}
