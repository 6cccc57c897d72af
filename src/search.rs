//! Recursive search over any backend.
//!
//! A [`SearchQuery`] is compiled into a [`SearchMatcher`] up front, so a bad
//! regular expression is reported before any key is visited. Plain-text
//! queries become escaped patterns, which keeps one matching path for both.

use crate::dispatch::{BackendDispatcher, StreamOptions};
use crate::error::{RegistryError, Result};
use crate::path::NodeAddress;
use crate::utils::fold_case;
use crate::value::ValueEntry;
use regex::{Regex, RegexBuilder};
use tracing::debug;

/// What to look for and where.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SearchQuery {
    /// Text or regular expression.
    pub pattern: String,
    /// Match key names.
    pub keys: bool,
    /// Match value names.
    pub value_names: bool,
    /// Match decoded value data.
    pub data: bool,
    /// Respect case.
    pub case_sensitive: bool,
    /// Require the whole string to match.
    pub whole_string: bool,
    /// Treat `pattern` as a regular expression.
    pub regex: bool,
}

impl SearchQuery {
    /// Case-insensitive substring search over keys, value names and data.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            keys: true,
            value_names: true,
            data: true,
            case_sensitive: false,
            whole_string: false,
            regex: false,
        }
    }

    /// Selects which parts are matched.
    pub fn targets(mut self, keys: bool, value_names: bool, data: bool) -> Self {
        self.keys = keys;
        self.value_names = value_names;
        self.data = data;
        self
    }

    /// Sets case sensitivity.
    pub fn case_sensitive(mut self, yes: bool) -> Self {
        self.case_sensitive = yes;
        self
    }

    /// Requires whole-string matches.
    pub fn whole_string(mut self, yes: bool) -> Self {
        self.whole_string = yes;
        self
    }

    /// Treats the pattern as a regular expression.
    pub fn regex(mut self, yes: bool) -> Self {
        self.regex = yes;
        self
    }

    /// Validates the query.
    ///
    /// # Errors
    ///
    /// `InvalidPattern` for an empty pattern, a query that matches nothing,
    /// or a regular expression that does not compile.
    pub fn compile(&self) -> Result<SearchMatcher> {
        if self.pattern.is_empty() {
            return Err(RegistryError::InvalidPattern("empty pattern".to_string()));
        }
        if !(self.keys || self.value_names || self.data) {
            return Err(RegistryError::InvalidPattern(
                "nothing selected to search".to_string(),
            ));
        }

        let body = if self.regex {
            self.pattern.clone()
        } else {
            regex::escape(&self.pattern)
        };
        let source = if self.whole_string {
            format!("^(?:{})$", body)
        } else {
            body
        };
        let regex = RegexBuilder::new(&source)
            .case_insensitive(!self.case_sensitive)
            .build()
            .map_err(|e| RegistryError::InvalidPattern(e.to_string()))?;

        Ok(SearchMatcher {
            regex,
            keys: self.keys,
            value_names: self.value_names,
            data: self.data,
        })
    }
}

/// A validated query.
#[derive(Debug, Clone)]
pub struct SearchMatcher {
    regex: Regex,
    keys: bool,
    value_names: bool,
    data: bool,
}

impl SearchMatcher {
    /// True if `text` matches.
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchHit {
    /// A key whose name matched.
    Key(NodeAddress),
    /// A value whose name matched.
    ValueName(NodeAddress, ValueEntry),
    /// A value whose decoded data matched.
    ValueData(NodeAddress, ValueEntry),
}

/// Searches the subtree below `node` depth-first, children in name order.
///
/// `on_hit` returning false stops the search and the call returns
/// `Ok(false)`. Subkeys that cannot be read are skipped.
pub fn search<F>(dispatcher: &BackendDispatcher, node: &NodeAddress, matcher: &SearchMatcher, mut on_hit: F) -> Result<bool>
where
    F: FnMut(SearchHit) -> bool,
{
    search_key(dispatcher, node, matcher, &mut on_hit, true)
}

fn search_key(
    dispatcher: &BackendDispatcher,
    node: &NodeAddress,
    matcher: &SearchMatcher,
    on_hit: &mut dyn FnMut(SearchHit) -> bool,
    top: bool,
) -> Result<bool> {
    let options = StreamOptions {
        values: matcher.value_names || matcher.data,
        data: matcher.data,
        subkeys: true,
    };
    let mut values = Vec::new();
    let mut subkeys = Vec::new();
    let listed = dispatcher.try_stream_enumerate(
        node,
        options,
        |value| {
            values.push(value);
            true
        },
        |name| {
            subkeys.push(name.to_string());
            true
        },
    );
    match listed {
        Ok(_) => {}
        Err(e) if !top => {
            debug!(node = %node, error = %e, "Skipping unreadable key");
            return Ok(true);
        }
        Err(e) => return Err(e),
    }

    for value in values {
        let hit = if matcher.value_names && matcher.is_match(&value.name) {
            Some(SearchHit::ValueName(node.clone(), value))
        } else if matcher.data && matcher.is_match(&value.decoded().as_text()) {
            Some(SearchHit::ValueData(node.clone(), value))
        } else {
            None
        };
        if let Some(hit) = hit {
            if !on_hit(hit) {
                return Ok(false);
            }
        }
    }

    subkeys.sort_by_key(|name| fold_case(name));
    for name in subkeys {
        let child = node.child(&name);
        if matcher.keys && matcher.is_match(&name) && !on_hit(SearchHit::Key(child.clone())) {
            return Ok(false);
        }
        if !search_key(dispatcher, &child, matcher, on_hit, false)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_tree::{VirtualRegistryData, VirtualRegistryKey};
    use std::sync::Arc;

    fn sample() -> (BackendDispatcher, NodeAddress) {
        let dispatcher = BackendDispatcher::default();
        let data = Arc::new(VirtualRegistryData::new("s.reg", VirtualRegistryKey::default()));
        let root = dispatcher.register_virtual_root(data);
        let app = root.child("Software").child("App");
        assert!(dispatcher.create_key(&app.child("Plugins")));
        assert!(dispatcher.set_value(&app, &ValueEntry::string("InstallDir", "C:\\Program Files\\App")));
        assert!(dispatcher.set_value(&app, &ValueEntry::dword("Version", 42)));
        (dispatcher, root)
    }

    fn collect(dispatcher: &BackendDispatcher, root: &NodeAddress, query: SearchQuery) -> Vec<SearchHit> {
        let matcher = query.compile().unwrap();
        let mut hits = Vec::new();
        assert!(search(dispatcher, root, &matcher, |hit| {
            hits.push(hit);
            true
        })
        .unwrap());
        hits
    }

    #[test]
    fn test_finds_keys_names_and_data() {
        let (dispatcher, root) = sample();
        let hits = collect(&dispatcher, &root, SearchQuery::new("app"));
        assert_eq!(hits.len(), 2);
        assert!(matches!(&hits[0], SearchHit::Key(node) if node.path.to_string() == "Software\\App"));
        assert!(matches!(&hits[1], SearchHit::ValueData(_, v) if v.name == "InstallDir"));

        let hits = collect(&dispatcher, &root, SearchQuery::new("42").targets(false, false, true));
        assert!(matches!(&hits[..], [SearchHit::ValueData(_, v)] if v.name == "Version"));
    }

    #[test]
    fn test_options() {
        let (dispatcher, root) = sample();
        assert!(collect(&dispatcher, &root, SearchQuery::new("APP").case_sensitive(true)).is_empty());
        assert_eq!(
            collect(&dispatcher, &root, SearchQuery::new("plug").whole_string(true)).len(),
            0
        );
        let hits = collect(&dispatcher, &root, SearchQuery::new("^Plug.*s$").regex(true));
        assert!(matches!(&hits[..], [SearchHit::Key(node)] if node.name() == "Plugins"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            SearchQuery::new("(unclosed").regex(true).compile(),
            Err(RegistryError::InvalidPattern(_))
        ));
        assert!(SearchQuery::new("").compile().is_err());
        assert!(SearchQuery::new("x").targets(false, false, false).compile().is_err());
        assert!(SearchQuery::new("(literal").compile().is_ok());
    }

    #[test]
    fn test_cancel() {
        let (dispatcher, root) = sample();
        let matcher = SearchQuery::new("a").compile().unwrap();
        let mut count = 0;
        let finished = search(&dispatcher, &root, &matcher, |_| {
            count += 1;
            false
        })
        .unwrap();
        assert!(!finished);
        assert_eq!(count, 1);
    }
}
