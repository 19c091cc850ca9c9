use std::{collections::BTreeMap, str::FromStr, sync::Arc};

/// Marks the root CA secret.
pub const CA: &str = "atlas.ekristen.github.com/ca";
/// Requests rotation of the root CA when present on its secret.
pub const CA_ROTATE: &str = "atlas.ekristen.github.com/ca-rotate";
pub const CA_REVISION: &str = "atlas.ekristen.github.com/ca-revision";
pub const CA_SERIAL: &str = "atlas.ekristen.github.com/ca-serial";
/// The serial of the CA that signed a leaf certificate.
pub const CA_SIGNED: &str = "atlas.ekristen.github.com/ca-signed";
pub const CA_CHECKSUM: &str = "atlas.ekristen.github.com/ca-checksum";
pub const CA_USAGE_CLIENT: &str = "atlas.ekristen.github.com/ca-usage-client";
pub const CA_USAGE_SERVER: &str = "atlas.ekristen.github.com/ca-usage-server";
/// Marks leaf certificate secrets.
pub const CERT: &str = "atlas.ekristen.github.com/cert";

/// Marks a service as a registered downstream cluster.
pub const CLUSTER: &str = "atlas.ekristen.github.com/atlas";
pub const REPLICAS: &str = "atlas.ekristen.github.com/replicas";
pub const THANOS_SIDECAR: &str = "atlas.ekristen.github.com/thanos-sidecar";
pub const ENVOY_SELECTORS: &str = "atlas.ekristen.github.com/envoy-selectors";
pub const THANOS_SERVICE: &str = "atlas.ekristen.github.com/thanos-service";
pub const PROMETHEUS_SERVICE: &str = "atlas.ekristen.github.com/prometheus-service";

/// Present in the selector of a service that targets one stateful pod.
pub const STATEFULSET_POD_NAME: &str = "statefulset.kubernetes.io/pod-name";

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

/// An equality-based label selector, e.g. `app=envoy,release!=canary`.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSelector {
    #[error("empty requirement in selector {0:?}")]
    Empty(String),

    #[error("invalid label key {0:?}")]
    Key(String),
}

// === Selector ===

impl Selector {
    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels.as_ref()))
    }

    /// The selector as a plain key/value map, ignoring any requirement that
    /// is not an equality.
    pub fn to_map(&self) -> Map {
        self.requirements
            .iter()
            .filter_map(|r| match r {
                Requirement::Equals(k, v) => Some((k.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }
}

impl FromStr for Selector {
    type Err = InvalidSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }

        let requirements = s
            .split(',')
            .map(|part| {
                let part = part.trim();
                if part.is_empty() {
                    return Err(InvalidSelector::Empty(s.to_string()));
                }
                let requirement = if let Some((k, v)) = part.split_once("!=") {
                    Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
                } else if let Some((k, v)) = part.split_once("==") {
                    Requirement::Equals(k.trim().to_string(), v.trim().to_string())
                } else if let Some((k, v)) = part.split_once('=') {
                    Requirement::Equals(k.trim().to_string(), v.trim().to_string())
                } else {
                    Requirement::Exists(part.to_string())
                };
                if requirement.key().is_empty() {
                    return Err(InvalidSelector::Key(part.to_string()));
                }
                Ok(requirement)
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { requirements })
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match r {
                Requirement::Equals(k, v) => write!(f, "{k}={v}")?,
                Requirement::NotEquals(k, v) => write!(f, "{k}!={v}")?,
                Requirement::Exists(k) => f.write_str(k)?,
            }
        }
        Ok(())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self {
            requirements: iter
                .into_iter()
                .map(|(k, v)| Requirement::Equals(k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

// === Requirement ===

impl Requirement {
    fn key(&self) -> &str {
        match self {
            Self::Equals(k, _) | Self::NotEquals(k, _) | Self::Exists(k) => k,
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self {
            Self::Equals(k, v) => labels.get(k) == Some(v),
            Self::NotEquals(k, v) => labels.get(k) != Some(v),
            Self::Exists(k) => labels.contains_key(k),
        }
    }
}

// === Labels ===

impl Labels {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            ("", Labels::default(), true, "empty match"),
            (
                "foo=bar",
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                "foo=bar",
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                "foo=bar,bah=baz",
                Labels::from_iter(Some(("foo", "bar"))),
                false,
                "missing label",
            ),
            (
                "foo==bar, bah!=qux",
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "double equals and inequality",
            ),
            (
                "bah!=baz",
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                false,
                "inequality mismatch",
            ),
            (
                "foo",
                Labels::from_iter(Some(("foo", "anything"))),
                true,
                "existence",
            ),
        ] {
            let selector = selector.parse::<Selector>().expect("selector must parse");
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn rejects_malformed_selectors() {
        assert_eq!(
            "app=envoy,,release=atlas".parse::<Selector>(),
            Err(InvalidSelector::Empty("app=envoy,,release=atlas".to_string()))
        );
        assert_eq!(
            "=atlas".parse::<Selector>(),
            Err(InvalidSelector::Key("=atlas".to_string()))
        );
    }

    #[test]
    fn selector_map_and_display() {
        let selector = "app=envoy,release=atlas"
            .parse::<Selector>()
            .expect("selector must parse");
        assert_eq!(selector.to_string(), "app=envoy,release=atlas");
        assert_eq!(
            selector.to_map(),
            Map::from_iter([
                ("app".to_string(), "envoy".to_string()),
                ("release".to_string(), "atlas".to_string()),
            ])
        );
        assert_eq!(selector, Selector::from_iter([("app", "envoy"), ("release", "atlas")]));
    }
}
