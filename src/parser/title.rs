//! Title normalization shared by the normalizer, the content filter and the
//! deduplication engine.
//!
//! Three keys of increasing coarseness are derived from a title:
//! - [`fold`]: lowercase with whitespace collapsed,
//! - [`normalize`]: script-variant insensitive (width, kana, okurigana, punctuation),
//! - [`phonetic_key`]: consonant skeleton of the romanized title.

/// Tolerance for comparing similarity scores against configured thresholds.
const SIMILARITY_EPSILON: f64 = 1e-9;

/// Collapses runs of whitespace (including ideographic spaces) into one ASCII space.
#[must_use]
pub fn clean_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Display form of an upstream title: canonical width, single spaces.
#[must_use]
pub fn tidy(input: &str) -> String {
    clean_whitespace(&fold_width(input))
}

/// Case and whitespace folded form used by the exact tier.
#[must_use]
pub fn fold(title: &str) -> String {
    clean_whitespace(&title.to_lowercase())
}

/// Script-variant insensitive form used by the normalized and fuzzy tiers.
///
/// Full-width ASCII and half-width katakana are folded to their canonical width,
/// okurigana following kanji is dropped, hiragana is folded onto katakana and
/// everything that is not a letter or digit is removed.
#[must_use]
pub fn normalize(title: &str) -> String {
    let widened = fold_width(title).to_lowercase();

    let mut out = String::with_capacity(widened.len());
    let mut after_kanji = false;
    for c in widened.chars() {
        if is_hiragana(c) && after_kanji {
            continue;
        }
        after_kanji = is_kanji(c);

        let c = hiragana_to_katakana(c);
        if c.is_alphanumeric() {
            out.push(c);
        }
    }
    out
}

/// Consonant skeleton of the romanized title, used by the phonetic tier to
/// absorb transliteration drift ("Demon Tale" / "デーモンテイル").
#[must_use]
pub fn phonetic_key(title: &str) -> String {
    let romanized = romanize(&normalize(title));

    let mut key = String::with_capacity(romanized.len());
    for (i, c) in romanized.chars().filter(char::is_ascii_alphanumeric).enumerate() {
        let c = match c {
            'l' => 'r',
            'v' => 'b',
            'c' | 'q' => 'k',
            'z' => 's',
            other => other,
        };
        if i > 0 && matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y') {
            continue;
        }
        if key.ends_with(c) {
            continue;
        }
        key.push(c);
    }
    key
}

/// Normalized Levenshtein similarity in `[0, 1]` over characters.
#[must_use]
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

/// Threshold comparison that treats a score equal to the threshold as a hit.
#[must_use]
pub fn meets_threshold(score: f64, threshold: f64) -> bool {
    score + SIMILARITY_EPSILON >= threshold
}

fn fold_width(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\u{3000}' => out.push(' '),
            '\u{FF01}'..='\u{FF5E}' => {
                out.push(char::from_u32(c as u32 - 0xFEE0).unwrap_or(c));
            }
            '\u{FF9E}' | '\u{FF9F}' => {
                // Voiced marks combine with the kana before them.
                let offset = if c == '\u{FF9E}' { 1 } else { 2 };
                if let Some(prev) = out.pop() {
                    out.push(char::from_u32(prev as u32 + offset).unwrap_or(prev));
                }
            }
            '\u{FF66}'..='\u{FF9D}' => out.push(halfwidth_katakana(c)),
            other => out.push(other),
        }
    }
    out
}

fn halfwidth_katakana(c: char) -> char {
    const TABLE: &[char] = &[
        'ヲ', 'ァ', 'ィ', 'ゥ', 'ェ', 'ォ', 'ャ', 'ュ', 'ョ', 'ッ', 'ー', 'ア', 'イ', 'ウ', 'エ',
        'オ', 'カ', 'キ', 'ク', 'ケ', 'コ', 'サ', 'シ', 'ス', 'セ', 'ソ', 'タ', 'チ', 'ツ', 'テ',
        'ト', 'ナ', 'ニ', 'ヌ', 'ネ', 'ノ', 'ハ', 'ヒ', 'フ', 'ヘ', 'ホ', 'マ', 'ミ', 'ム', 'メ',
        'モ', 'ヤ', 'ユ', 'ヨ', 'ラ', 'リ', 'ル', 'レ', 'ロ', 'ワ', 'ン',
    ];
    let idx = (c as u32 - 0xFF66) as usize;
    TABLE.get(idx).copied().unwrap_or(c)
}

const fn is_hiragana(c: char) -> bool {
    matches!(c, '\u{3041}'..='\u{3096}')
}

const fn is_kanji(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '々')
}

fn hiragana_to_katakana(c: char) -> char {
    if is_hiragana(c) {
        char::from_u32(c as u32 + 0x60).unwrap_or(c)
    } else {
        c
    }
}

/// Hepburn-ish romanization of katakana; other characters pass through.
fn romanize(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 2);
    for c in input.chars() {
        match c {
            'ャ' | 'ュ' | 'ョ' => {
                let vowel = match c {
                    'ャ' => 'a',
                    'ュ' => 'u',
                    _ => 'o',
                };
                if out.ends_with('i') {
                    out.pop();
                    if !(out.ends_with("sh") || out.ends_with("ch") || out.ends_with('j')) {
                        out.push('y');
                    }
                } else {
                    out.push('y');
                }
                out.push(vowel);
            }
            'ァ' | 'ィ' | 'ゥ' | 'ェ' | 'ォ' => {
                if out.ends_with(['a', 'i', 'u', 'e', 'o']) {
                    out.pop();
                }
                out.push(match c {
                    'ァ' => 'a',
                    'ィ' => 'i',
                    'ゥ' => 'u',
                    'ェ' => 'e',
                    _ => 'o',
                });
            }
            'ッ' | 'ー' => {}
            other => match kana_syllable(other) {
                Some(syllable) => out.push_str(syllable),
                None => out.push(other),
            },
        }
    }
    out
}

const fn kana_syllable(c: char) -> Option<&'static str> {
    Some(match c {
        'ア' => "a",
        'イ' => "i",
        'ウ' => "u",
        'エ' => "e",
        'オ' => "o",
        'カ' => "ka",
        'キ' => "ki",
        'ク' => "ku",
        'ケ' => "ke",
        'コ' => "ko",
        'ガ' => "ga",
        'ギ' => "gi",
        'グ' => "gu",
        'ゲ' => "ge",
        'ゴ' => "go",
        'サ' => "sa",
        'シ' => "shi",
        'ス' => "su",
        'セ' => "se",
        'ソ' => "so",
        'ザ' => "za",
        'ジ' | 'ヂ' => "ji",
        'ズ' | 'ヅ' => "zu",
        'ゼ' => "ze",
        'ゾ' => "zo",
        'タ' => "ta",
        'チ' => "chi",
        'ツ' => "tsu",
        'テ' => "te",
        'ト' => "to",
        'ダ' => "da",
        'デ' => "de",
        'ド' => "do",
        'ナ' => "na",
        'ニ' => "ni",
        'ヌ' => "nu",
        'ネ' => "ne",
        'ノ' => "no",
        'ハ' => "ha",
        'ヒ' => "hi",
        'フ' => "fu",
        'ヘ' => "he",
        'ホ' => "ho",
        'バ' => "ba",
        'ビ' => "bi",
        'ブ' => "bu",
        'ベ' => "be",
        'ボ' => "bo",
        'パ' => "pa",
        'ピ' => "pi",
        'プ' => "pu",
        'ペ' => "pe",
        'ポ' => "po",
        'マ' => "ma",
        'ミ' => "mi",
        'ム' => "mu",
        'メ' => "me",
        'モ' => "mo",
        'ヤ' => "ya",
        'ユ' => "yu",
        'ヨ' => "yo",
        'ラ' => "ra",
        'リ' => "ri",
        'ル' => "ru",
        'レ' => "re",
        'ロ' => "ro",
        'ワ' => "wa",
        'ヲ' => "wo",
        'ン' => "n",
        'ヴ' => "vu",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tidy() {
        assert_eq!(tidy("  Ｄｅｍｏｎ　Tale  "), "Demon Tale");
        assert_eq!(tidy("ﾃﾞｰﾓﾝ"), "デーモン");
    }

    #[test]
    fn test_fold() {
        assert_eq!(fold("  Demon   TALE "), "demon tale");
        assert_eq!(fold("Demon\u{3000}Tale"), "demon tale");
    }

    #[test]
    fn test_normalize_full_width() {
        assert_eq!(normalize("ＤＥＭＯＮ　ＴＡＬＥ"), normalize("Demon Tale"));
        assert_eq!(normalize("Demon Tale!"), "demontale");
    }

    #[test]
    fn test_normalize_half_width_katakana() {
        assert_eq!(normalize("ﾃﾞｰﾓﾝ"), "デーモン");
        assert_eq!(normalize("ﾊﾟﾝ"), "パン");
    }

    #[test]
    fn test_normalize_kana_and_okurigana() {
        assert_eq!(normalize("とらいあんぐる"), normalize("トライアングル"));
        assert_eq!(normalize("取り扱い説明書"), normalize("取扱説明書"));
    }

    #[test]
    fn test_phonetic_key_transliteration() {
        assert_eq!(phonetic_key("Demon Tale"), phonetic_key("デーモンテイル"));
        assert_eq!(phonetic_key("Demon Tale"), "dmntr");
        assert_ne!(phonetic_key("Demon Tale"), phonetic_key("Dragon Tale"));
    }

    #[test]
    fn test_romanize_contracted_sounds() {
        assert_eq!(romanize("キャ"), "kya");
        assert_eq!(romanize("シュ"), "shu");
        assert_eq!(romanize("ティ"), "ti");
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        // 20 characters, 3 substitutions: similarity exactly 0.85.
        let a = "abcdefghijklmnopqrst";
        let at = "xyzdefghijklmnopqrst";
        let below = "xyzwefghijklmnopqrst";
        assert!(meets_threshold(similarity(a, at), 0.85));
        assert!(!meets_threshold(similarity(a, below), 0.85));
    }
}
