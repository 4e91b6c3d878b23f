use crate::config::FilterConfig;
use crate::models::NormalizedItem;
use crate::parser::title;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionTier {
    Keyword,
    FuzzyKeyword,
    Category,
}

impl fmt::Display for ExclusionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Keyword => "keyword",
            Self::FuzzyKeyword => "fuzzy_keyword",
            Self::Category => "category",
        })
    }
}

/// Why an item was excluded: the tier that fired and the configured rule it matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exclusion {
    pub tier: ExclusionTier,
    pub rule: String,
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.tier, self.rule)
    }
}

struct Keyword {
    rule: String,
    folded: String,
    words: usize,
}

/// Content filter with a fixed tier order: exact keyword, fuzzy keyword,
/// category. The first tier that fires decides.
pub struct ContentFilter {
    keywords: Vec<Keyword>,
    fuzzy_enabled: bool,
    fuzzy_threshold: f64,
    categories: Vec<(String, String)>,
}

impl ContentFilter {
    #[must_use]
    pub fn new(config: &FilterConfig) -> Self {
        let keywords = config
            .exclude_keywords
            .iter()
            .map(|k| {
                let folded = title::fold(k);
                Keyword {
                    rule: k.clone(),
                    words: folded.split(' ').count(),
                    folded,
                }
            })
            .filter(|k| !k.folded.is_empty())
            .collect();

        let categories = config
            .exclude_categories
            .iter()
            .map(|c| (c.clone(), title::fold(c)))
            .filter(|(_, folded)| !folded.is_empty())
            .collect();

        Self {
            keywords,
            fuzzy_enabled: config.fuzzy_enabled,
            fuzzy_threshold: config.fuzzy_threshold,
            categories,
        }
    }

    /// `None` means the item passes.
    #[must_use]
    pub fn should_exclude(&self, item: &NormalizedItem) -> Option<Exclusion> {
        let titles: Vec<String> = item.titles().map(title::fold).collect();

        if let Some(k) = self
            .keywords
            .iter()
            .find(|k| titles.iter().any(|t| t.contains(&k.folded)))
        {
            return Some(Exclusion {
                tier: ExclusionTier::Keyword,
                rule: k.rule.clone(),
            });
        }

        if self.fuzzy_enabled
            && let Some(k) = self
                .keywords
                .iter()
                .find(|k| titles.iter().any(|t| self.fuzzy_hit(t, k)))
        {
            return Some(Exclusion {
                tier: ExclusionTier::FuzzyKeyword,
                rule: k.rule.clone(),
            });
        }

        let item_categories: Vec<String> = item.categories.iter().map(|c| title::fold(c)).collect();
        self.categories
            .iter()
            .find(|(_, folded)| item_categories.contains(folded))
            .map(|(rule, _)| Exclusion {
                tier: ExclusionTier::Category,
                rule: rule.clone(),
            })
    }

    /// Compares the keyword against every run of title words of the same length.
    fn fuzzy_hit(&self, folded_title: &str, keyword: &Keyword) -> bool {
        let words: Vec<&str> = folded_title.split(' ').collect();
        if words.len() < keyword.words {
            return title::meets_threshold(
                title::similarity(folded_title, &keyword.folded),
                self.fuzzy_threshold,
            );
        }

        words.windows(keyword.words).any(|window| {
            let candidate = window.join(" ");
            title::meets_threshold(
                title::similarity(&candidate, &keyword.folded),
                self.fuzzy_threshold,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MediaKind;

    fn item(title: &str, categories: &[&str]) -> NormalizedItem {
        NormalizedItem {
            source_id: "test".into(),
            title: title.into(),
            alternate_titles: Vec::new(),
            media_kind: MediaKind::SerialVideo,
            status: None,
            categories: categories.iter().map(|c| (*c).to_string()).collect(),
            external_url: None,
            release: None,
        }
    }

    fn filter(fuzzy: bool) -> ContentFilter {
        ContentFilter::new(&FilterConfig {
            exclude_keywords: vec!["Recap Special".into(), "hentai".into()],
            fuzzy_enabled: fuzzy,
            fuzzy_threshold: 0.8,
            exclude_categories: vec!["Ecchi".into()],
        })
    }

    #[test]
    fn test_exact_keyword_is_case_insensitive() {
        let hit = filter(true)
            .should_exclude(&item("Demon Tale RECAP SPECIAL", &[]))
            .unwrap();
        assert_eq!(hit.tier, ExclusionTier::Keyword);
        assert_eq!(hit.rule, "Recap Special");
    }

    #[test]
    fn test_fuzzy_keyword() {
        // One substitution in 13 characters.
        let hit = filter(true)
            .should_exclude(&item("Demon Tale Recap Speciel", &[]))
            .unwrap();
        assert_eq!(hit.tier, ExclusionTier::FuzzyKeyword);

        assert!(filter(false)
            .should_exclude(&item("Demon Tale Recap Speciel", &[]))
            .is_none());
    }

    #[test]
    fn test_category_tier_runs_last() {
        let hit = filter(true)
            .should_exclude(&item("Demon Tale", &["ecchi"]))
            .unwrap();
        assert_eq!(hit.tier, ExclusionTier::Category);

        let hit = filter(true)
            .should_exclude(&item("Demon Tale Recap Special", &["Ecchi"]))
            .unwrap();
        assert_eq!(hit.tier, ExclusionTier::Keyword);
    }

    #[test]
    fn test_clean_item_passes() {
        assert!(filter(true)
            .should_exclude(&item("Demon Tale", &["Action"]))
            .is_none());
    }
}
