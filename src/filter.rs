//! Filtering of resolved instances by name and TXT record globs.

use crate::error::{Error, Result};
use crate::instance::ServiceInstance;
use glob::Pattern;

/// A predicate over a [`ServiceInstance`].
///
/// All criteria are AND connected: the instance name must match the name
/// pattern, and each TXT pattern successively narrows the instance's TXT
/// record list, which must end up non-empty. Patterns are case-sensitive
/// Unix-style globs (`*`, `?`, `[…]`). An empty filter matches everything.
///
/// The engine applies two filters in conjunction: the engine-wide primary
/// filter and the per-query secondary filter. A typical use is selecting
/// instances by a uuid carried in a TXT record:
///
/// ```rust
/// use svc_discovery::Filter;
///
/// let filter = Filter::new("prod-*", &["uuid=a7005ade-*"]).unwrap();
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    name: Option<Pattern>,
    txt_records: Vec<Pattern>,
}

impl Filter {
    /// Creates a filter from a name glob and TXT record globs.
    ///
    /// An empty `name` matches any instance name; an empty pattern slice
    /// matches any TXT record list.
    pub fn new(name: &str, txt_records: &[&str]) -> Result<Self> {
        let name = if name.is_empty() {
            None
        } else {
            Some(compile(name)?)
        };

        let txt_records = txt_records
            .iter()
            .map(|pat| compile(pat))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { name, txt_records })
    }

    /// Creates a filter matching on the instance name only.
    pub fn by_name(name: &str) -> Result<Self> {
        Self::new(name, &[])
    }

    /// Whether `instance` passes this filter.
    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        if let Some(pattern) = &self.name {
            if !pattern.matches(instance.name()) {
                return false;
            }
        }

        if !self.txt_records.is_empty() {
            let mut texts: Vec<&str> = instance.txt_records().iter().map(String::as_str).collect();
            for pattern in &self.txt_records {
                texts.retain(|text| pattern.matches(text));
            }
            if texts.is_empty() {
                return false;
            }
        }

        true
    }
}

fn compile(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|e| Error::InvalidPattern(format!("{}: {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, texts: &[&str]) -> ServiceInstance {
        let mut item = ServiceInstance::new(name, "_test._tcp.local");
        item.set_txt_records(texts.iter().map(|t| t.to_string()).collect());
        item
    }

    #[test]
    fn empty_filter_matches_all() {
        let filter = Filter::default();
        assert!(filter.matches(&instance("anything", &[])));
        assert!(filter.matches(&instance("", &["a=b"])));
    }

    #[test]
    fn name_glob_is_anchored_and_case_sensitive() {
        let filter = Filter::by_name("prod-*").unwrap();
        assert!(filter.matches(&instance("prod-1", &[])));
        assert!(!filter.matches(&instance("dev-1", &[])));
        // the glob must cover the whole name
        assert!(!filter.matches(&instance("my-prod-1", &[])));

        let exact = Filter::by_name("Printer").unwrap();
        assert!(!exact.matches(&instance("printer", &[])));
        assert!(exact.matches(&instance("Printer", &[])));
    }

    #[test]
    fn char_class_glob() {
        let filter = Filter::by_name("node-[0-9]").unwrap();
        assert!(filter.matches(&instance("node-3", &[])));
        assert!(!filter.matches(&instance("node-x", &[])));
    }

    #[test]
    fn txt_patterns_narrow_successively() {
        let filter = Filter::new("", &["uuid=*", "*beaca"]).unwrap();
        // one record satisfies both patterns
        assert!(filter.matches(&instance("x", &["uuid=7f45436beaca", "v=2"])));
        // each pattern matches a record, but no single record survives both
        assert!(!filter.matches(&instance("x", &["uuid=1234", "7f45436beaca"])));
        // no TXT records at all
        assert!(!filter.matches(&instance("x", &[])));
    }

    #[test]
    fn name_and_txt_are_and_connected() {
        let filter = Filter::new("prod-*", &["role=db"]).unwrap();
        assert!(filter.matches(&instance("prod-1", &["role=db"])));
        assert!(!filter.matches(&instance("prod-1", &["role=web"])));
        assert!(!filter.matches(&instance("dev-1", &["role=db"])));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(matches!(
            Filter::by_name("bad[range"),
            Err(Error::InvalidPattern(_))
        ));
    }

    #[test]
    fn matching_is_deterministic() {
        let filter = Filter::new("svc-?", &["k=*"]).unwrap();
        let item = instance("svc-a", &["k=1"]);
        let first = filter.matches(&item);
        assert_eq!(first, filter.matches(&item));
        assert!(first);
    }
}
