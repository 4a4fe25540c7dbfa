use serde::{Deserialize, Serialize};
use std::hash::Hasher;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("label name cannot be empty")]
    EmptyName,
    #[error("duplicate label name {0:?}")]
    DuplicateName(String),
}

/// A single name/value pair identifying one dimension of a time series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// LabelSet is an ordered set of labels: sorted by name, with unique names.
///
/// The ordering invariant is established at construction and holds for the
/// lifetime of the set, which lets lookups binary-search and lets
/// [`LabelSet::with_defaults`] run as a linear merge of two sorted streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Label>", into = "Vec<Label>")]
pub struct LabelSet(Vec<Label>);

/// Build a LabelSet from (name, value) pairs, in any order.
pub fn build_set<S, I>(pairs: I) -> Result<LabelSet, Error>
where
    S: Into<String>,
    I: IntoIterator<Item = (S, S)>,
{
    LabelSet::from_unsorted(
        pairs
            .into_iter()
            .map(|(name, value)| Label::new(name, value))
            .collect(),
    )
}

impl LabelSet {
    /// Build a LabelSet from labels in any order.
    /// Fails if a name is empty or appears more than once.
    pub fn from_unsorted(mut labels: Vec<Label>) -> Result<Self, Error> {
        labels.sort_by(|l, r| l.name.cmp(&r.name));

        for (i, label) in labels.iter().enumerate() {
            if label.name.is_empty() {
                return Err(Error::EmptyName);
            }
            if i != 0 && labels[i - 1].name == label.name {
                return Err(Error::DuplicateName(label.name.clone()));
            }
        }
        Ok(Self(labels))
    }

    pub fn labels(&self) -> &[Label] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of the named label, if present.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Merge `defaults` into this set, producing a new sorted set which holds
    /// every default whose name does not appear in `self`, and all of `self`
    /// unchanged. `self` wins on name collision. Applying the same defaults
    /// twice is equivalent to applying them once.
    pub fn with_defaults(&self, defaults: &LabelSet) -> LabelSet {
        if defaults.is_empty() {
            return self.clone();
        }
        let mut merged = Vec::with_capacity(self.0.len() + defaults.0.len());
        let mut d = 0;

        for label in &self.0 {
            while d < defaults.0.len() && defaults.0[d].name < label.name {
                merged.push(defaults.0[d].clone());
                d += 1;
            }
            if d < defaults.0.len() && defaults.0[d].name == label.name {
                d += 1; // Shadowed by `self`.
            }
            merged.push(label.clone());
        }
        merged.extend(defaults.0[d..].iter().cloned());

        LabelSet(merged)
    }

    /// A stable signature of this set, suitable for hashed routing.
    ///
    /// The signature is computed over a canonical byte encoding of the sorted
    /// labels, so it depends only on label content and never on in-memory
    /// layout or platform.
    pub fn signature(&self) -> u64 {
        let mut hasher = fxhash::FxHasher::default();
        for Label { name, value } in &self.0 {
            hasher.write(name.as_bytes());
            hasher.write_u8(0xff);
            hasher.write(value.as_bytes());
            hasher.write_u8(0xfe);
        }
        hasher.finish()
    }
}

impl TryFrom<Vec<Label>> for LabelSet {
    type Error = Error;

    fn try_from(labels: Vec<Label>) -> Result<Self, Error> {
        Self::from_unsorted(labels)
    }
}

impl From<LabelSet> for Vec<Label> {
    fn from(set: LabelSet) -> Self {
        set.0
    }
}

impl<'s> IntoIterator for &'s LabelSet {
    type Item = &'s Label;
    type IntoIter = std::slice::Iter<'s, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_construction_sorts_and_validates() {
        let set = build_set([("zone", "us-east-1"), ("app", "api"), ("host", "h1")]).unwrap();
        let names: Vec<&str> = set.labels().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["app", "host", "zone"]);

        assert_eq!(set.value_of("host"), Some("h1"));
        assert_eq!(set.value_of("missing"), None);

        assert_eq!(
            build_set([("app", "a"), ("app", "b")]).unwrap_err(),
            Error::DuplicateName("app".to_string()),
        );
        assert_eq!(build_set([("", "a")]).unwrap_err(), Error::EmptyName);
    }

    #[test]
    fn test_with_defaults_merge() {
        let series = build_set([("app", "api"), ("region", "local")]).unwrap();
        let defaults = build_set([("cluster", "c1"), ("region", "us"), ("zone", "z1")]).unwrap();

        let merged = series.with_defaults(&defaults);
        let pairs: Vec<(&str, &str)> = merged
            .labels()
            .iter()
            .map(|l| (l.name.as_str(), l.value.as_str()))
            .collect();

        // Defaults interleave in sorted position; the series value wins on
        // the `region` collision.
        assert_eq!(
            pairs,
            vec![
                ("app", "api"),
                ("cluster", "c1"),
                ("region", "local"),
                ("zone", "z1"),
            ]
        );

        // Idempotent.
        assert_eq!(merged.with_defaults(&defaults), merged);

        // Empty defaults are a no-op.
        assert_eq!(series.with_defaults(&LabelSet::default()), series);

        // Defaults against an empty series are the defaults.
        assert_eq!(LabelSet::default().with_defaults(&defaults), defaults);
    }

    #[test]
    fn test_signature_depends_only_on_content() {
        let a = build_set([("app", "api"), ("host", "h1")]).unwrap();
        let b = build_set([("host", "h1"), ("app", "api")]).unwrap();
        assert_eq!(a.signature(), b.signature());

        let c = build_set([("app", "api"), ("host", "h2")]).unwrap();
        assert_ne!(a.signature(), c.signature());

        // Name/value boundaries matter: ("ab", "c") != ("a", "bc").
        let d = build_set([("ab", "c")]).unwrap();
        let e = build_set([("a", "bc")]).unwrap();
        assert_ne!(d.signature(), e.signature());
    }

    #[test]
    fn test_serde_round_trip() {
        let set = build_set([("app", "api"), ("zone", "z1")]).unwrap();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(
            json,
            r#"[{"name":"app","value":"api"},{"name":"zone","value":"z1"}]"#
        );

        // Deserialization canonicalizes ordering and re-validates.
        let parsed: LabelSet =
            serde_json::from_str(r#"[{"name":"zone","value":"z1"},{"name":"app","value":"api"}]"#)
                .unwrap();
        assert_eq!(parsed, set);

        let dup = r#"[{"name":"a","value":"1"},{"name":"a","value":"2"}]"#;
        assert!(serde_json::from_str::<LabelSet>(dup).is_err());
    }
}
