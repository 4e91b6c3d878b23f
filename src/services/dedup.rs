//! Tiered Work resolution.
//!
//! An incoming item is resolved against a [`CatalogIndex`] by trying, in order,
//! exact folded-title equality, normalized-title equality, fuzzy similarity of
//! normalized titles and phonetic-key equality. Every tier only considers
//! Works of the item's media kind, and the first tier with a candidate wins.
//!
//! Within a tier, candidates are ranked by similarity (fuzzy tier only), then
//! by provenance count, then by lowest Work id, so the decision depends only
//! on the index contents and the item.

use crate::config::DedupConfig;
use crate::db::CatalogSnapshot;
use crate::domain::{MatchTier, MediaKind, WorkId};
use crate::models::{NormalizedItem, Work};
use crate::parser::title;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDecision {
    Existing { work_id: WorkId, tier: MatchTier },
    New,
}

#[derive(Debug, Clone)]
struct IndexedWork {
    media_kind: MediaKind,
    provenance: i32,
    deleted: bool,
    normalized: Vec<String>,
}

type Key = (MediaKind, String);

/// Run-scoped view of the catalog the engine matches against.
///
/// Built once from a store snapshot and kept current by the pipeline after
/// every decision, so later items in the same run see Works created or
/// extended by earlier ones.
#[derive(Debug, Clone, Default)]
pub struct CatalogIndex {
    works: BTreeMap<WorkId, IndexedWork>,
    exact: HashMap<Key, BTreeSet<WorkId>>,
    normalized: HashMap<Key, BTreeSet<WorkId>>,
    phonetic: HashMap<Key, BTreeSet<WorkId>>,
}

impl CatalogIndex {
    #[must_use]
    pub fn from_snapshot(snapshot: &CatalogSnapshot) -> Self {
        let mut index = Self::default();
        for work in &snapshot.works {
            index.upsert(work);
        }
        index
    }

    /// Adds a Work or replaces the indexed copy of it.
    pub fn upsert(&mut self, work: &Work) {
        self.remove(work.id);

        let mut normalized = Vec::new();
        for t in work.titles() {
            let kind = work.media_kind;
            self.exact
                .entry((kind, title::fold(t)))
                .or_default()
                .insert(work.id);

            let norm = title::normalize(t);
            if !norm.is_empty() {
                self.normalized
                    .entry((kind, norm.clone()))
                    .or_default()
                    .insert(work.id);
                if !normalized.contains(&norm) {
                    normalized.push(norm);
                }
            }

            let key = title::phonetic_key(t);
            if !key.is_empty() {
                self.phonetic.entry((kind, key)).or_default().insert(work.id);
            }
        }

        self.works.insert(
            work.id,
            IndexedWork {
                media_kind: work.media_kind,
                provenance: work.provenance_count,
                deleted: work.is_deleted(),
                normalized,
            },
        );
    }

    fn remove(&mut self, id: WorkId) {
        if self.works.remove(&id).is_none() {
            return;
        }
        for map in [&mut self.exact, &mut self.normalized, &mut self.phonetic] {
            map.retain(|_, ids| {
                ids.remove(&id);
                !ids.is_empty()
            });
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.works.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.works.is_empty()
    }

    #[must_use]
    pub fn is_deleted(&self, id: WorkId) -> bool {
        self.works.get(&id).is_some_and(|w| w.deleted)
    }

    fn provenance(&self, id: WorkId) -> i32 {
        self.works.get(&id).map_or(0, |w| w.provenance)
    }
}

pub struct DeduplicationEngine {
    fuzzy_enabled: bool,
    fuzzy_threshold: f64,
    phonetic_enabled: bool,
    phonetic_min_key_len: usize,
    /// Normalized spelling to every spelling in its alias group.
    aliases: HashMap<String, Vec<String>>,
}

impl DeduplicationEngine {
    #[must_use]
    pub fn new(config: &DedupConfig) -> Self {
        let mut aliases: HashMap<String, Vec<String>> = HashMap::new();
        for group in &config.aliases {
            let spellings: Vec<String> = std::iter::once(group.canonical.clone())
                .chain(group.variants.iter().cloned())
                .collect();
            for spelling in &spellings {
                let key = title::normalize(spelling);
                if key.is_empty() {
                    continue;
                }
                let entry = aliases.entry(key).or_default();
                for s in &spellings {
                    if !entry.contains(s) {
                        entry.push(s.clone());
                    }
                }
            }
        }

        Self {
            fuzzy_enabled: config.fuzzy_enabled,
            fuzzy_threshold: config.fuzzy_threshold,
            phonetic_enabled: config.phonetic_enabled,
            phonetic_min_key_len: config.phonetic_min_key_len,
            aliases,
        }
    }

    /// The item's own titles followed by any configured aliases of them.
    fn probes(&self, item: &NormalizedItem) -> Vec<String> {
        let mut probes: Vec<String> = item.titles().map(str::to_string).collect();
        for t in item.titles() {
            if let Some(group) = self.aliases.get(&title::normalize(t)) {
                for alias in group {
                    if !probes.contains(alias) {
                        probes.push(alias.clone());
                    }
                }
            }
        }
        probes
    }

    #[must_use]
    pub fn resolve(&self, item: &NormalizedItem, index: &CatalogIndex) -> MatchDecision {
        fn lookup(
            map: &HashMap<Key, BTreeSet<WorkId>>,
            kind: MediaKind,
            key: String,
        ) -> impl Iterator<Item = WorkId> + '_ {
            map.get(&(kind, key)).into_iter().flatten().copied()
        }

        let kind = item.media_kind;
        let probes = self.probes(item);

        let exact: BTreeSet<WorkId> = probes
            .iter()
            .flat_map(|p| lookup(&index.exact, kind, title::fold(p)))
            .collect();
        if let Some(id) = best(index, exact.into_iter().map(|id| (id, 1.0))) {
            return existing(id, MatchTier::Exact);
        }

        let normalized_probes: Vec<String> = probes
            .iter()
            .map(|p| title::normalize(p))
            .filter(|n| !n.is_empty())
            .collect();

        let normalized: BTreeSet<WorkId> = normalized_probes
            .iter()
            .flat_map(|n| lookup(&index.normalized, kind, n.clone()))
            .collect();
        if let Some(id) = best(index, normalized.into_iter().map(|id| (id, 1.0))) {
            return existing(id, MatchTier::Normalized);
        }

        if self.fuzzy_enabled {
            let scored = index
                .works
                .iter()
                .filter(|(_, w)| w.media_kind == kind)
                .filter_map(|(id, w)| {
                    let score = w
                        .normalized
                        .iter()
                        .flat_map(|candidate| {
                            normalized_probes
                                .iter()
                                .map(move |probe| title::similarity(probe, candidate))
                        })
                        .fold(0.0_f64, f64::max);
                    title::meets_threshold(score, self.fuzzy_threshold).then_some((*id, score))
                });
            if let Some(id) = best(index, scored) {
                return existing(id, MatchTier::Fuzzy);
            }
        }

        if self.phonetic_enabled {
            let phonetic: BTreeSet<WorkId> = probes
                .iter()
                .map(|p| title::phonetic_key(p))
                .filter(|k| k.chars().count() >= self.phonetic_min_key_len)
                .flat_map(|k| lookup(&index.phonetic, kind, k))
                .collect();
            if let Some(id) = best(index, phonetic.into_iter().map(|id| (id, 1.0))) {
                return existing(id, MatchTier::Phonetic);
            }
        }

        MatchDecision::New
    }
}

const fn existing(work_id: WorkId, tier: MatchTier) -> MatchDecision {
    MatchDecision::Existing { work_id, tier }
}

/// Highest score, then most provenance, then lowest id.
fn best(index: &CatalogIndex, candidates: impl Iterator<Item = (WorkId, f64)>) -> Option<WorkId> {
    candidates
        .min_by(|(a_id, a_score), (b_id, b_score)| {
            b_score
                .partial_cmp(a_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| index.provenance(*b_id).cmp(&index.provenance(*a_id)))
                .then_with(|| a_id.cmp(b_id))
        })
        .map(|(id, _)| id)
}
