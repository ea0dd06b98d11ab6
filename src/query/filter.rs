use crate::model::Repository;

/// Predicates applied by `/repos`.  Empty strings and non-positive limits
/// disable the corresponding predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterConfig {
    /// Exact (case-sensitive) language key.
    pub language: String,
    /// Exact owner login.
    pub owner: String,
    /// Maximum number of results; `<= 0` means unlimited.
    pub limit: i64,
}

impl FilterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Set the limit from a raw query value.  Anything that is not an integer
    /// means no limit.
    pub fn with_limit_str(self, raw: &str) -> Self {
        self.with_limit(parse_limit(raw))
    }

    fn matches(&self, repository: &Repository) -> bool {
        if !self.language.is_empty() && !repository.languages.contains_key(&self.language) {
            return false;
        }
        if !self.owner.is_empty() && repository.owner != self.owner {
            return false;
        }
        true
    }

    fn limit(&self) -> Option<usize> {
        if self.limit > 0 {
            Some(usize::try_from(self.limit).unwrap_or(usize::MAX))
        } else {
            None
        }
    }
}

pub fn parse_limit(raw: &str) -> i64 {
    raw.trim().parse().unwrap_or(0)
}

/// Matching repositories in snapshot order, stopping once the limit is hit.
pub fn filter_repositories<'a>(
    config: &FilterConfig,
    repositories: &'a [Repository],
) -> Vec<&'a Repository> {
    let matching = repositories.iter().filter(|repo| config.matches(repo));
    match config.limit() {
        Some(limit) => matching.take(limit).collect(),
        None => matching.collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::fixtures::repositories;

    fn names(repos: &[&Repository]) -> Vec<String> {
        repos.iter().map(|r| r.repository.clone()).collect()
    }

    #[test]
    fn language_owner_and_limit_combine() {
        let repos = repositories();
        let config = FilterConfig::new()
            .with_language("golang")
            .with_owner("owner3")
            .with_limit_str("1");

        let filtered = filter_repositories(&config, &repos);
        assert_eq!(filtered, vec![&repos[2]]);
    }

    #[test]
    fn default_config_keeps_everything() {
        let repos = repositories();
        let filtered = filter_repositories(&FilterConfig::default(), &repos);
        assert_eq!(names(&filtered), ["repo1", "repo2", "repo3", "repo4"]);
    }

    #[test]
    fn language_only() {
        let repos = repositories();
        let filtered = filter_repositories(&FilterConfig::new().with_language("golang"), &repos);
        assert_eq!(names(&filtered), ["repo1", "repo3", "repo4"]);
    }

    #[test]
    fn language_match_is_case_sensitive() {
        let repos = repositories();
        let filtered = filter_repositories(&FilterConfig::new().with_language("Golang"), &repos);
        assert!(filtered.is_empty());
    }

    #[test]
    fn owner_only() {
        let repos = repositories();
        let filtered = filter_repositories(&FilterConfig::new().with_owner("owner3"), &repos);
        assert_eq!(names(&filtered), ["repo3", "repo4"]);
    }

    #[test]
    fn limit_keeps_first_matches() {
        let repos = repositories();
        let filtered = filter_repositories(&FilterConfig::new().with_limit(2), &repos);
        assert_eq!(names(&filtered), ["repo1", "repo2"]);
    }

    #[test]
    fn non_positive_limit_is_unlimited() {
        let repos = repositories();
        assert_eq!(filter_repositories(&FilterConfig::new().with_limit(0), &repos).len(), 4);
        assert_eq!(filter_repositories(&FilterConfig::new().with_limit(-3), &repos).len(), 4);
    }

    #[test]
    fn parse_limit_falls_back_to_zero() {
        assert_eq!(parse_limit("3"), 3);
        assert_eq!(parse_limit("-1"), -1);
        assert_eq!(parse_limit(""), 0);
        assert_eq!(parse_limit("ten"), 0);
        assert_eq!(parse_limit("2.5"), 0);
    }

    #[test]
    fn empty_snapshot() {
        let filtered = filter_repositories(&FilterConfig::new().with_language("golang"), &[]);
        assert!(filtered.is_empty());
    }
}
