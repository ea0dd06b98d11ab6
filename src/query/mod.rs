//! Read-side queries over a published snapshot.

pub mod filter;
pub mod stats;

pub use filter::{filter_repositories, FilterConfig};
pub use stats::{build_stats, Stats};

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::model::{Language, Repository};

    pub fn repository(owner: &str, name: &str, langs: &[(&str, u64)]) -> Repository {
        Repository {
            full_name: format!("{owner}/{name}"),
            owner: owner.to_string(),
            repository: name.to_string(),
            languages: langs
                .iter()
                .map(|(lang, bytes)| (lang.to_string(), Language { bytes: *bytes }))
                .collect(),
        }
    }

    /// Four repositories, three of them carrying 1234 bytes of `golang`.
    pub fn repositories() -> Vec<Repository> {
        vec![
            repository("owner1", "repo1", &[("golang", 1234)]),
            repository("owner2", "repo2", &[("c++", 1234)]),
            repository("owner3", "repo3", &[("golang", 1234)]),
            repository("owner3", "repo4", &[("golang", 1234)]),
        ]
    }
}
