//! Latin→Cyrillic transliteration.
//!
//! Ported from the digraph table in `transcyrillic.cpp`: HL7-style Latin
//! transcriptions of Russian names use a handful of multi-letter digraphs
//! (`ZH`, `KH`, `SHCH`, ...) to stand in for single Cyrillic letters, plus
//! a few single-letter substitutions and one word-boundary special case
//! (`Y` at the end of a word reads back as `ИЙ`). The enrichment client
//! applies this after parsing an enrichment response, to recover the
//! patient's name in Cyrillic script.

/// Transliterate a Latin-script string into Cyrillic, letter by letter,
/// preferring the longest digraph match at each position. Characters with
/// no mapping (digits, punctuation other than `^` and `.`, non-Latin
/// input) pass through unchanged.
pub fn transliterate(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        let (replacement, consumed) = match_at(&chars, i);
        out.push_str(&replacement);
        i += consumed;
    }
    out
}

fn is_upper(c: char) -> bool {
    c.is_uppercase()
}

fn cased(upper: &str, lower: &str, like: char) -> String {
    if is_upper(like) {
        upper.to_string()
    } else {
        lower.to_string()
    }
}

fn is_word_boundary(c: Option<char>) -> bool {
    matches!(c, None | Some(' ') | Some('.'))
}

/// Returns the Cyrillic replacement for the character(s) starting at `i`,
/// and how many input characters it consumed.
fn match_at(chars: &[char], i: usize) -> (String, usize) {
    let c = chars[i];
    let next = chars.get(i + 1).copied();
    let next2 = chars.get(i + 2).copied();

    if c == '^' {
        return (" ".to_string(), 1);
    }

    match c.to_ascii_uppercase() {
        'A' => return (cased("А", "а", c), 1),
        'B' => return (cased("Б", "б", c), 1),
        'V' => return (cased("В", "в", c), 1),
        'G' => return (cased("Г", "г", c), 1),
        'D' => return (cased("Д", "д", c), 1),
        'I' => return (cased("И", "и", c), 1),
        'L' => return (cased("Л", "л", c), 1),
        'M' => return (cased("М", "м", c), 1),
        'N' => return (cased("Н", "н", c), 1),
        'O' => return (cased("О", "о", c), 1),
        'P' => return (cased("П", "п", c), 1),
        'R' => return (cased("Р", "р", c), 1),
        'U' => return (cased("У", "у", c), 1),
        'F' => return (cased("Ф", "ф", c), 1),
        _ => {}
    }

    if c.eq_ignore_ascii_case(&'e') {
        let at_start = i == 0;
        return if at_start {
            (cased("Э", "э", c), 1)
        } else {
            (cased("Е", "е", c), 1)
        };
    }

    if c.eq_ignore_ascii_case(&'z') {
        return if next.is_some_and(|n| n.eq_ignore_ascii_case(&'h')) {
            (cased("Ж", "ж", c), 2)
        } else {
            (cased("З", "з", c), 1)
        };
    }

    if c.eq_ignore_ascii_case(&'k') {
        return if next.is_some_and(|n| n.eq_ignore_ascii_case(&'h')) {
            (cased("Х", "х", c), 2)
        } else {
            (cased("К", "к", c), 1)
        };
    }

    if c.eq_ignore_ascii_case(&'s') {
        if next.is_some_and(|n| n.eq_ignore_ascii_case(&'h')) {
            let is_shch = next2.is_some_and(|n| n.eq_ignore_ascii_case(&'c'))
                && chars
                    .get(i + 3)
                    .is_some_and(|n| n.eq_ignore_ascii_case(&'h'));
            return if is_shch {
                (cased("Щ", "щ", c), 4)
            } else {
                (cased("Ш", "ш", c), 2)
            };
        }
        return (cased("С", "с", c), 1);
    }

    if c.eq_ignore_ascii_case(&'t') {
        return if next.is_some_and(|n| n.eq_ignore_ascii_case(&'s')) {
            (cased("Ц", "ц", c), 2)
        } else {
            (cased("Т", "т", c), 1)
        };
    }

    if c.eq_ignore_ascii_case(&'c') {
        if next.is_some_and(|n| n.eq_ignore_ascii_case(&'h')) {
            return (cased("Ч", "ч", c), 2);
        }
        return (cased("К", "к", c), 1);
    }

    if c.eq_ignore_ascii_case(&'x') {
        let k = cased("К", "к", c);
        let s = if next.map(|n| !is_upper(n)).unwrap_or(false) {
            "с"
        } else {
            "С"
        };
        return (format!("{k}{s}"), 1);
    }

    if c.eq_ignore_ascii_case(&'y') {
        if next.is_some_and(|n| n.eq_ignore_ascii_case(&'e')) {
            return (cased("Е", "е", c), 2);
        }
        if next.is_some_and(|n| n.eq_ignore_ascii_case(&'o')) {
            return (cased("Ё", "ё", c), 2);
        }
        if next.is_some_and(|n| n.eq_ignore_ascii_case(&'u')) {
            return (cased("Ю", "ю", c), 2);
        }
        if next.is_some_and(|n| n.eq_ignore_ascii_case(&'i')) {
            // Consumes only the `Y`; the following `I` is re-mapped on the
            // next call, giving the soft sign + `И` (e.g. "Ilyin").
            return (cased("Ь", "ь", c), 1);
        }
        if next.is_some_and(|n| n.eq_ignore_ascii_case(&'a')) {
            return (cased("Я", "я", c), 2);
        }
        if is_word_boundary(next) {
            return (cased("ИЙ", "ий", c), 1);
        }
        return (cased("Ы", "ы", c), 1);
    }

    (c.to_string(), 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn passes_through_unmapped_characters() {
        assert_eq!(transliterate("42"), "42");
    }

    #[test]
    fn caret_becomes_space() {
        assert_eq!(transliterate("B^V"), "Б В");
    }

    #[rstest]
    #[case("ZH", "Ж")]
    #[case("KH", "Х")]
    #[case("SH", "Ш")]
    #[case("SHCH", "Щ")]
    #[case("TS", "Ц")]
    #[case("CH", "Ч")]
    #[case("YA", "Я")]
    #[case("YO", "Ё")]
    #[case("YU", "Ю")]
    #[case("YE", "Е")]
    #[case("YI", "ЬИ")]
    fn digraphs_map_to_single_cyrillic_letters(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(transliterate(input), expected);
    }

    #[rstest]
    #[case("A", "А")]
    #[case("I", "И")]
    #[case("O", "О")]
    #[case("U", "У")]
    #[case("K", "К")]
    #[case("S", "С")]
    #[case("T", "Т")]
    #[case("Z", "З")]
    fn bare_single_letters_map_to_single_cyrillic_letters(
        #[case] input: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(transliterate(input), expected);
    }

    #[test]
    fn y_at_word_boundary_reads_as_iy() {
        let result = transliterate("MAKAROVSKIY");
        assert!(result.ends_with("ИЙ"));
    }

    #[test]
    fn lowercase_input_produces_lowercase_output() {
        assert_eq!(transliterate("ivanov"), "иванов");
    }

    #[test]
    fn ivanov_round_trips_end_to_end() {
        assert_eq!(transliterate("IVANOV"), "ИВАНОВ");
    }

    #[test]
    fn ilyin_keeps_soft_sign_before_i() {
        assert_eq!(transliterate("ILYIN"), "ИЛЬИН");
    }
}
