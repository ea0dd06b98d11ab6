use serde::{Deserialize, Serialize};

use crate::model::Repository;

/// Usage statistics of one language across a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub language: String,
    /// Repositories containing the language.
    pub total_usage: u64,
    /// Bytes of the language summed over those repositories.
    pub total_code_size: u64,
    /// All repositories in the snapshot.
    pub total_repositories: u64,
    /// `total_code_size / total_usage`, truncated; 0 when unused.
    #[serde(rename = "avg_code_size")]
    pub average_code_size: u64,
}

pub fn build_stats(repositories: &[Repository], language: &str) -> Stats {
    let (total_usage, total_code_size) = repositories
        .iter()
        .filter_map(|repo| repo.languages.get(language))
        .fold((0u64, 0u64), |(usage, size), lang| {
            (usage + 1, size.saturating_add(lang.bytes))
        });

    Stats {
        language: language.to_string(),
        total_usage,
        total_code_size,
        total_repositories: repositories.len() as u64,
        average_code_size: total_code_size.checked_div(total_usage).unwrap_or(0),
    }
}
