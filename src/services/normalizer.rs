//! Converts adapter-specific raw records into [`NormalizedItem`]s.
//!
//! This is the only place that branches on record shape. A record without a
//! usable title or media kind is discarded with a logged reason; a record
//! without a date or installment label still names a Work but carries no
//! release.

use crate::clients::{AnilistAiring, FeedItem, RawRecord, SourcedRecord};
use crate::config::Config;
use crate::domain::{MediaKind, ReleaseKind, WorkStatus};
use crate::models::{NormalizedItem, ReleaseFields};
use crate::parser::{date, release, title};
use chrono::FixedOffset;
use std::collections::HashMap;
use tracing::debug;

/// Broadcast slots in the AniList calendar are Japanese times.
const ANILIST_MARKET_OFFSET_SECS: i32 = 9 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscardReason {
    #[error("record has no title")]
    MissingTitle,
    #[error("media kind of '{0}' could not be determined")]
    UnknownMediaKind(String),
}

#[derive(Debug, Clone, Default)]
struct SourceHints {
    media_kind: Option<MediaKind>,
    default_channel: Option<String>,
}

pub struct Normalizer {
    channel_aliases: HashMap<String, String>,
    default_channel: String,
    sources: HashMap<String, SourceHints>,
}

impl Normalizer {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let channel_aliases = config
            .normalizer
            .channel_aliases
            .iter()
            .map(|(alias, canonical)| (title::fold(alias), canonical.clone()))
            .collect();

        let sources = config
            .sources
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    SourceHints {
                        media_kind: s.media_kind,
                        default_channel: s.default_channel.clone(),
                    },
                )
            })
            .collect();

        Self {
            channel_aliases,
            default_channel: config.normalizer.default_channel.clone(),
            sources,
        }
    }

    /// Normalizes a record, logging why it was dropped when it cannot be.
    pub fn normalize(&self, record: &SourcedRecord) -> Option<NormalizedItem> {
        match self.try_normalize(record) {
            Ok(item) => Some(item),
            Err(reason) => {
                debug!(
                    event = "record_discarded",
                    source = %record.source_id,
                    reason = %reason,
                    "Discarding record"
                );
                metrics::counter!("shinkan_records_discarded_total").increment(1);
                None
            }
        }
    }

    pub fn try_normalize(&self, record: &SourcedRecord) -> Result<NormalizedItem, DiscardReason> {
        let hints = self
            .sources
            .get(&record.source_id)
            .cloned()
            .unwrap_or_default();

        match &record.record {
            RawRecord::Anilist(airing) => self.from_anilist(&record.source_id, &hints, airing),
            RawRecord::Feed(item) => self.from_feed(&record.source_id, &hints, item),
        }
    }

    /// Canonical channel name: configured alias, else the folded spelling,
    /// else the source default, else the global default.
    #[must_use]
    pub fn canonical_channel(&self, raw: Option<&str>, source_default: Option<&str>) -> String {
        let pick = |value: &str| {
            let key = title::fold(value);
            if key.is_empty() {
                return None;
            }
            Some(self.channel_aliases.get(&key).cloned().unwrap_or(key))
        };

        raw.and_then(pick)
            .or_else(|| source_default.and_then(pick))
            .unwrap_or_else(|| self.default_channel.clone())
    }

    fn from_anilist(
        &self,
        source_id: &str,
        hints: &SourceHints,
        airing: &AnilistAiring,
    ) -> Result<NormalizedItem, DiscardReason> {
        let mut titles = [
            airing.title_romaji.as_deref(),
            airing.title_english.as_deref(),
            airing.title_native.as_deref(),
        ]
        .into_iter()
        .flatten()
        .chain(airing.synonyms.iter().map(String::as_str))
        .map(title::tidy)
        .filter(|t| !t.is_empty());

        let primary = titles.next().ok_or(DiscardReason::MissingTitle)?;
        let alternates = dedup_titles(&primary, titles);

        let media_kind = airing
            .format
            .as_deref()
            .and_then(media_kind_from_format)
            .or(hints.media_kind)
            .or_else(|| infer_from_title(&primary))
            .ok_or_else(|| DiscardReason::UnknownMediaKind(primary.clone()))?;

        let offset = FixedOffset::east_opt(ANILIST_MARKET_OFFSET_SECS);
        let release = offset
            .and_then(|o| date::from_unix_in(airing.airing_at, o))
            .map(|date| ReleaseFields {
                kind: ReleaseKind::Episode,
                label: release::canonical_label(&airing.episode.to_string()),
                channel: self.canonical_channel(
                    airing.streaming_site.as_deref(),
                    hints.default_channel.as_deref(),
                ),
                date,
                source_id: source_id.to_string(),
                source_url: airing.site_url.clone(),
            });

        Ok(NormalizedItem {
            source_id: source_id.to_string(),
            title: primary,
            alternate_titles: alternates,
            media_kind,
            status: airing.status.as_deref().and_then(WorkStatus::from_upstream),
            categories: airing.genres.clone(),
            external_url: airing.site_url.clone(),
            release,
        })
    }

    fn from_feed(
        &self,
        source_id: &str,
        hints: &SourceHints,
        item: &FeedItem,
    ) -> Result<NormalizedItem, DiscardReason> {
        let headline = title::tidy(&item.title);
        let announcement =
            release::parse_announcement(&headline).ok_or(DiscardReason::MissingTitle)?;
        if announcement.title.is_empty() {
            return Err(DiscardReason::MissingTitle);
        }

        let media_kind = media_kind_from_categories(&item.categories)
            .or(hints.media_kind)
            .or_else(|| announcement.kind.map(media_kind_for_release))
            .or_else(|| infer_from_title(&headline))
            .ok_or_else(|| DiscardReason::UnknownMediaKind(announcement.title.clone()))?;

        let date = item
            .release_date
            .as_deref()
            .or(item.published.as_deref())
            .and_then(date::parse_date);

        let release = match (announcement.label, date) {
            (Some(label), Some(date)) => Some(ReleaseFields {
                kind: announcement
                    .kind
                    .unwrap_or_else(|| media_kind.default_release_kind()),
                label,
                channel: self.canonical_channel(None, hints.default_channel.as_deref()),
                date,
                source_id: source_id.to_string(),
                source_url: item.link.clone(),
            }),
            _ => None,
        };

        Ok(NormalizedItem {
            source_id: source_id.to_string(),
            title: announcement.title,
            alternate_titles: Vec::new(),
            media_kind,
            status: None,
            categories: item.categories.clone(),
            external_url: item.link.clone(),
            release,
        })
    }
}

fn dedup_titles(primary: &str, rest: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = vec![title::fold(primary)];
    let mut out = Vec::new();
    for t in rest {
        let key = title::fold(&t);
        if !seen.contains(&key) {
            seen.push(key);
            out.push(t);
        }
    }
    out
}

fn media_kind_from_format(format: &str) -> Option<MediaKind> {
    match format.to_ascii_uppercase().as_str() {
        "TV" | "TV_SHORT" | "ONA" | "OVA" | "SPECIAL" | "MOVIE" | "MUSIC" => {
            Some(MediaKind::SerialVideo)
        }
        "MANGA" | "NOVEL" | "ONE_SHOT" => Some(MediaKind::SerialPrint),
        _ => None,
    }
}

fn media_kind_from_categories(categories: &[String]) -> Option<MediaKind> {
    categories.iter().find_map(|c| {
        match title::fold(c).as_str() {
            "anime" | "tv" | "animation" | "アニメ" => Some(MediaKind::SerialVideo),
            "manga" | "light novel" | "novel" | "comic" | "comics" | "漫画" | "マンガ" => {
                Some(MediaKind::SerialPrint)
            }
            _ => None,
        }
    })
}

const fn media_kind_for_release(kind: ReleaseKind) -> MediaKind {
    match kind {
        ReleaseKind::Episode => MediaKind::SerialVideo,
        ReleaseKind::Volume => MediaKind::SerialPrint,
    }
}

/// Last-resort inference from words in the headline itself.
fn infer_from_title(headline: &str) -> Option<MediaKind> {
    const PRINT: &[&str] = &["manga", "light novel", "vol.", "volume", "巻", "漫画"];
    const VIDEO: &[&str] = &["anime", "episode", "season", "話", "アニメ"];

    let folded = title::fold(headline);

    if PRINT.iter().any(|m| folded.contains(m)) {
        Some(MediaKind::SerialPrint)
    } else if VIDEO.iter().any(|m| folded.contains(m)) {
        Some(MediaKind::SerialVideo)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceConfig, SourceKind};
    use chrono::NaiveDate;

    fn config() -> Config {
        let mut config = Config::default();
        config.sources = vec![
            SourceConfig {
                id: "anilist".into(),
                kind: SourceKind::Anilist,
                ..SourceConfig::default()
            },
            SourceConfig {
                id: "print".into(),
                kind: SourceKind::Feed,
                url: Some("https://example.com/rss".into()),
                media_kind: Some(MediaKind::SerialPrint),
                default_channel: Some("kodansha".into()),
                ..SourceConfig::default()
            },
            SourceConfig {
                id: "news".into(),
                kind: SourceKind::Feed,
                url: Some("https://example.com/news".into()),
                ..SourceConfig::default()
            },
        ];
        config
    }

    fn airing() -> AnilistAiring {
        AnilistAiring {
            media_id: 1,
            episode: 10,
            // 2025-12-09T16:00:00Z, already the 10th in Tokyo.
            airing_at: 1_765_296_000,
            title_romaji: Some("Demon  Tale".into()),
            title_english: Some("demon tale".into()),
            title_native: Some("デーモンテイル".into()),
            synonyms: vec!["DT".into()],
            format: Some("TV".into()),
            status: Some("RELEASING".into()),
            genres: vec!["Action".into()],
            site_url: Some("https://anilist.co/anime/1".into()),
            streaming_site: Some("CR".into()),
        }
    }

    fn feed(title: &str, categories: &[&str]) -> FeedItem {
        FeedItem {
            title: title.into(),
            link: Some("https://example.com/item".into()),
            published: Some("Mon, 01 Dec 2025 09:00:00 +0000".into()),
            release_date: Some("2025年12月10日".into()),
            categories: categories.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    fn sourced(source: &str, record: RawRecord) -> SourcedRecord {
        SourcedRecord {
            source_id: source.into(),
            record,
        }
    }

    #[test]
    fn test_anilist_record() {
        let normalizer = Normalizer::new(&config());
        let item = normalizer
            .normalize(&sourced("anilist", RawRecord::Anilist(airing())))
            .unwrap();

        assert_eq!(item.title, "Demon Tale");
        assert_eq!(item.alternate_titles, vec!["デーモンテイル", "DT"]);
        assert_eq!(item.media_kind, MediaKind::SerialVideo);
        assert_eq!(item.status, Some(WorkStatus::Ongoing));

        let release = item.release.unwrap();
        assert_eq!(release.kind, ReleaseKind::Episode);
        assert_eq!(release.label, "10");
        assert_eq!(release.channel, "Crunchyroll");
        assert_eq!(release.date, NaiveDate::from_ymd_opt(2025, 12, 10).unwrap());
    }

    #[test]
    fn test_anilist_without_title_is_discarded() {
        let normalizer = Normalizer::new(&config());
        let mut record = airing();
        record.title_romaji = None;
        record.title_english = Some("   ".into());
        record.title_native = None;
        record.synonyms.clear();

        let result = normalizer.try_normalize(&sourced("anilist", RawRecord::Anilist(record)));
        assert_eq!(result, Err(DiscardReason::MissingTitle));
    }

    #[test]
    fn test_feed_volume_uses_source_hints() {
        let normalizer = Normalizer::new(&config());
        let item = normalizer
            .normalize(&sourced("print", RawRecord::Feed(feed("Demon Tale Vol. 05", &[]))))
            .unwrap();

        assert_eq!(item.title, "Demon Tale");
        assert_eq!(item.media_kind, MediaKind::SerialPrint);
        let release = item.release.unwrap();
        assert_eq!(release.kind, ReleaseKind::Volume);
        assert_eq!(release.label, "5");
        assert_eq!(release.channel, "Kodansha");
        assert_eq!(release.date, NaiveDate::from_ymd_opt(2025, 12, 10).unwrap());
    }

    #[test]
    fn test_feed_without_label_keeps_work_only() {
        let normalizer = Normalizer::new(&config());
        let item = normalizer
            .normalize(&sourced("news", RawRecord::Feed(feed("Demon Tale", &["Anime"]))))
            .unwrap();

        assert_eq!(item.media_kind, MediaKind::SerialVideo);
        assert!(item.release.is_none());
    }

    #[test]
    fn test_feed_without_date_keeps_work_only() {
        let normalizer = Normalizer::new(&config());
        let mut record = feed("Demon Tale Episode 3", &[]);
        record.published = Some("soon".into());
        record.release_date = None;

        let item = normalizer
            .normalize(&sourced("news", RawRecord::Feed(record)))
            .unwrap();
        assert_eq!(item.media_kind, MediaKind::SerialVideo);
        assert!(item.release.is_none());
    }

    #[test]
    fn test_feed_unknown_media_kind_is_discarded() {
        let normalizer = Normalizer::new(&config());
        let result =
            normalizer.try_normalize(&sourced("news", RawRecord::Feed(feed("Demon Tale", &[]))));
        assert_eq!(
            result,
            Err(DiscardReason::UnknownMediaKind("Demon Tale".into()))
        );
    }

    #[test]
    fn test_channel_canonicalization() {
        let normalizer = Normalizer::new(&config());
        assert_eq!(normalizer.canonical_channel(Some("  CR "), None), "Crunchyroll");
        assert_eq!(normalizer.canonical_channel(Some("Funimation"), None), "funimation");
        assert_eq!(normalizer.canonical_channel(None, Some("講談社")), "Kodansha");
        assert_eq!(normalizer.canonical_channel(Some(""), None), "unspecified");
    }
}
