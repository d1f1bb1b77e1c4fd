//! Scope heuristics
//!
//! Queries such as "current standings" or "latest news" imply a bounded
//! result set even when they name no number. The trigger words are
//! configuration (`[perception.scope]`); an explicit count in the query
//! always takes precedence.

use regex::Regex;

use super::{Perception, ScopeType};
use crate::config::ScopeConfig;

#[derive(Debug, Clone)]
pub struct ScopeRules {
    default_limit: u32,
    keywords: Vec<String>,
    recency_keywords: Vec<String>,
    explicit: Regex,
}

impl ScopeRules {
    pub fn new(config: &ScopeConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            default_limit: config.default_limit,
            keywords: lowercase_all(&config.keywords),
            recency_keywords: lowercase_all(&config.recency_keywords),
            explicit: Regex::new(r"(?i)\b(top|first|latest|last|best|recent)\s+(\d{1,6})\b")?,
        })
    }

    /// Count stated in the query, e.g. "top 20" or "latest 3"
    pub fn explicit_count(&self, query: &str) -> Option<(u32, ScopeType)> {
        let caps = self.explicit.captures(query)?;
        let count = caps.get(2)?.as_str().parse::<u32>().ok()?;
        let scope_type = match caps.get(1)?.as_str().to_lowercase().as_str() {
            "latest" | "last" | "recent" => ScopeType::Latest,
            _ => ScopeType::Top,
        };
        Some((count, scope_type))
    }

    /// Fill in the scope of a perception from its query
    pub fn apply(&self, query: &str, perception: &mut Perception) {
        if let Some((count, scope_type)) = self.explicit_count(query) {
            perception.scope_limit = Some(count);
            perception.scope_type = Some(scope_type);
            return;
        }

        let words = words(query);
        if perception.scope_limit.is_none() && contains_any(&words, &self.keywords) {
            perception.scope_limit = Some(self.default_limit);
            perception.scope_type = Some(if contains_any(&words, &self.recency_keywords) {
                ScopeType::Latest
            } else {
                ScopeType::Top
            });
            return;
        }

        match (perception.scope_limit, perception.scope_type) {
            (Some(_), None) => perception.scope_type = Some(ScopeType::Top),
            (None, None) => perception.scope_type = Some(ScopeType::All),
            _ => {}
        }
    }
}

fn lowercase_all(words: &[String]) -> Vec<String> {
    words.iter().map(|w| w.to_lowercase()).collect()
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn contains_any(words: &[String], keywords: &[String]) -> bool {
    keywords.iter().any(|k| words.iter().any(|w| w == k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ScopeRules {
        ScopeRules::new(&ScopeConfig::default()).unwrap()
    }

    fn scoped(query: &str) -> Perception {
        let mut p = Perception::default();
        rules().apply(query, &mut p);
        p
    }

    #[test]
    fn test_standings_default_to_top_ten() {
        let p = scoped("Find current standings");
        assert_eq!(p.scope_limit, Some(10));
        assert_eq!(p.scope_type, Some(ScopeType::Top));
    }

    #[test]
    fn test_explicit_count_wins() {
        let p = scoped("Show the top 20 standings");
        assert_eq!(p.scope_limit, Some(20));
        assert_eq!(p.scope_type, Some(ScopeType::Top));
    }

    #[test]
    fn test_explicit_count_overrides_collaborator() {
        let mut p = Perception {
            scope_limit: Some(3),
            ..Perception::default()
        };
        rules().apply("first 7 results", &mut p);
        assert_eq!(p.scope_limit, Some(7));
    }

    #[test]
    fn test_recency_keyword_sets_latest() {
        let p = scoped("latest news about the league");
        assert_eq!(p.scope_limit, Some(10));
        assert_eq!(p.scope_type, Some(ScopeType::Latest));

        let p = scoped("last 5 race results");
        assert_eq!(p.scope_limit, Some(5));
        assert_eq!(p.scope_type, Some(ScopeType::Latest));
    }

    #[test]
    fn test_no_trigger_leaves_scope_open() {
        let p = scoped("what is the capital of France");
        assert_eq!(p.scope_limit, None);
        assert_eq!(p.scope_type, Some(ScopeType::All));
    }

    #[test]
    fn test_keywords_match_whole_words_only() {
        // "topic" must not trigger "top"
        let p = scoped("pick a topic");
        assert_eq!(p.scope_limit, None);
    }

    #[test]
    fn test_custom_keywords() {
        let config = ScopeConfig {
            default_limit: 5,
            keywords: vec!["Prices".to_string()],
            recency_keywords: vec![],
        };
        let mut p = Perception::default();
        ScopeRules::new(&config).unwrap().apply("stock prices", &mut p);
        assert_eq!(p.scope_limit, Some(5));
    }
}
