//! OCR Tagger (C5).
//!
//! The real recognition backend (a Tesseract-style OCR engine reading a
//! rendered bitmap of the print job's first frame) is out of scope for
//! this crate -- §1 of the printer's design calls it out as an external
//! collaborator. [`OcrEngine`] is the seam the rest of the tagger is
//! built against; [`NullOcrEngine`] is the only implementation shipped
//! here; a deployment that needs real recognition supplies its own.

use std::collections::HashMap;

use dicom::object::InMemDicomObject;
use regex::Regex;
use toml::Value;

use crate::dicom_tags::write_named_tag;

/// An OCR-recognizable rectangle within the rendered print job bitmap.
/// Negative coordinates are relative to the right/bottom edge, matching
/// the config format documented in §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    fn from_value(v: &Value) -> Option<Self> {
        let arr = v.as_array()?;
        if arr.len() != 4 {
            return None;
        }
        let n = |i: usize| arr.get(i)?.as_integer().map(|x| x as i32);
        Some(Rect {
            left: n(0)?,
            top: n(1)?,
            right: n(2)?,
            bottom: n(3)?,
        })
    }
}

/// One `tag[]` config entry (§4.5, §6 `<printer>.tag[]`).
struct TagRule {
    key: Option<String>,
    rect: Option<Rect>,
    pattern: Option<Regex>,
    value: String,
    query_parameter: Option<String>,
}

impl TagRule {
    fn from_value(v: &Value) -> Option<Self> {
        let table = v.as_table()?;
        let key = table.get("key").and_then(Value::as_str).map(str::to_owned);
        let rect = table.get("rect").and_then(Rect::from_value);
        let pattern = table
            .get("pattern")
            .and_then(Value::as_str)
            .and_then(|p| Regex::new(p).ok());
        let value = table
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let query_parameter = table
            .get("query-parameter")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Some(TagRule {
            key,
            rect,
            pattern,
            value,
            query_parameter,
        })
    }
}

/// Text recognized in one region of the print job's first frame.
pub trait OcrEngine {
    /// Prepare the engine for `lang` (e.g. `"eng"`). Called once per
    /// `PrintSession`. Implementations that shell out to a locale-
    /// sensitive library should use [`with_c_numeric_locale`] around any
    /// initialization that parses decimal numbers.
    fn init(&mut self, lang: &str);

    /// Recognize text within `rect` of the currently loaded frame,
    /// stripped of non-printable characters and trailing whitespace.
    fn recognize(&mut self, rect: Rect) -> String;
}

/// Always returns empty recognized text. Every `tag[]` rule then falls
/// through to its `pattern`/`value` default, which is the correct
/// behavior for a deployment with no OCR backend configured.
#[derive(Debug, Default)]
pub struct NullOcrEngine;

impl OcrEngine for NullOcrEngine {
    fn init(&mut self, _lang: &str) {}

    fn recognize(&mut self, _rect: Rect) -> String {
        String::new()
    }
}

/// Run every `tag[]` rule from `root` (falling back) and `printer` scope
/// against `engine`, writing resolved tags into `dataset` and accumulating
/// `query_parameter` bindings.
///
/// Config entries are read in array order; an entry whose `rect` matches
/// the previous entry's reuses the cached recognition instead of
/// re-running OCR, per §4.5.
pub fn tag(
    rules: &[Value],
    engine: &mut dyn OcrEngine,
    dataset: &mut InMemDicomObject,
) -> HashMap<String, String> {
    let mut query_params = HashMap::new();
    let mut cached_rect: Option<Rect> = None;
    let mut cached_text = String::new();

    for raw in rules {
        let Some(rule) = TagRule::from_value(raw) else {
            continue;
        };

        let text = if let Some(rect) = rule.rect {
            if cached_rect != Some(rect) {
                cached_text = clean(&engine.recognize(rect));
                cached_rect = Some(rect);
            }
            &cached_text
        } else {
            ""
        };

        let resolved = rule
            .pattern
            .as_ref()
            .and_then(|re| re.captures(text))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| rule.value.clone());

        if let Some(key) = &rule.key {
            write_named_tag(dataset, key, &resolved);
        }
        if let Some(param) = &rule.query_parameter {
            query_params.insert(param.clone(), resolved);
        }
    }

    query_params
}

/// Strip non-printable characters and trailing whitespace from recognized
/// text, per §4.5.
fn clean(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// The DCMTK-derived OCR backend this is modeled on is sensitive to the
/// active numeric locale's decimal separator; run `f` with `LC_NUMERIC`
/// forced to `"C"`, restoring whatever was set before on the way out.
///
/// This crate has no direct libc/locale dependency, so the guard is
/// expressed over the process environment rather than `setlocale(3)`
/// itself; a real OCR backend reads its numeric locale from the
/// environment at the FFI boundary it owns.
pub fn with_c_numeric_locale<T>(f: impl FnOnce() -> T) -> T {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    let _guard = LOCK.lock().unwrap_or_else(|p| p.into_inner());
    let previous = std::env::var("LC_NUMERIC").ok();
    std::env::set_var("LC_NUMERIC", "C");
    let result = f();
    match previous {
        Some(value) => std::env::set_var("LC_NUMERIC", value),
        None => std::env::remove_var("LC_NUMERIC"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEngine {
        text: String,
    }

    impl OcrEngine for FixedEngine {
        fn init(&mut self, _lang: &str) {}

        fn recognize(&mut self, _rect: Rect) -> String {
            self.text.clone()
        }
    }

    fn rule(table: toml::map::Map<String, Value>) -> Value {
        Value::Table(table)
    }

    #[test]
    fn pattern_capture_group_wins_over_default() {
        let mut table = toml::map::Map::new();
        table.insert("key".into(), Value::String("PatientID".into()));
        table.insert(
            "rect".into(),
            Value::Array(vec![0.into(), 0.into(), 10.into(), 10.into()]),
        );
        table.insert("pattern".into(), Value::String(r"ID:(\d+)".into()));
        table.insert("value".into(), Value::String("UNKNOWN".into()));
        let rules = vec![rule(table)];

        let mut engine = FixedEngine {
            text: "ID:4242".to_string(),
        };
        let mut dataset = InMemDicomObject::new_empty();
        tag(&rules, &mut engine, &mut dataset);

        assert_eq!(
            dataset
                .element(dicom::dictionary_std::tags::PATIENT_ID)
                .unwrap()
                .to_str()
                .unwrap(),
            "4242"
        );
    }

    #[test]
    fn no_pattern_match_falls_back_to_value() {
        let mut table = toml::map::Map::new();
        table.insert("key".into(), Value::String("PatientID".into()));
        table.insert(
            "rect".into(),
            Value::Array(vec![0.into(), 0.into(), 10.into(), 10.into()]),
        );
        table.insert("pattern".into(), Value::String(r"ID:(\d+)".into()));
        table.insert("value".into(), Value::String("UNKNOWN".into()));
        let rules = vec![rule(table)];

        let mut engine = FixedEngine {
            text: "garbled".to_string(),
        };
        let mut dataset = InMemDicomObject::new_empty();
        tag(&rules, &mut engine, &mut dataset);

        assert_eq!(
            dataset
                .element(dicom::dictionary_std::tags::PATIENT_ID)
                .unwrap()
                .to_str()
                .unwrap(),
            "UNKNOWN"
        );
    }

    #[test]
    fn query_parameter_is_recorded() {
        let mut table = toml::map::Map::new();
        table.insert("value".into(), Value::String("hello".into()));
        table.insert("query-parameter".into(), Value::String("p1".into()));
        let rules = vec![rule(table)];

        let mut engine = FixedEngine {
            text: String::new(),
        };
        let mut dataset = InMemDicomObject::new_empty();
        let params = tag(&rules, &mut engine, &mut dataset);
        assert_eq!(params.get("p1"), Some(&"hello".to_string()));
    }

    #[test]
    fn same_rect_reuses_cached_recognition() {
        let rect = Value::Array(vec![0.into(), 0.into(), 10.into(), 10.into()]);
        let mut t1 = toml::map::Map::new();
        t1.insert("rect".into(), rect.clone());
        t1.insert("query-parameter".into(), Value::String("a".into()));
        let mut t2 = toml::map::Map::new();
        t2.insert("rect".into(), rect);
        t2.insert("query-parameter".into(), Value::String("b".into()));
        let rules = vec![rule(t1), rule(t2)];

        struct CountingEngine {
            calls: std::cell::Cell<u32>,
        }
        impl OcrEngine for CountingEngine {
            fn init(&mut self, _lang: &str) {}
            fn recognize(&mut self, _rect: Rect) -> String {
                self.calls.set(self.calls.get() + 1);
                "X".to_string()
            }
        }

        let mut engine = CountingEngine {
            calls: std::cell::Cell::new(0),
        };
        let mut dataset = InMemDicomObject::new_empty();
        let params = tag(&rules, &mut engine, &mut dataset);
        assert_eq!(engine.calls.get(), 1);
        assert_eq!(params.get("a"), Some(&"X".to_string()));
        assert_eq!(params.get("b"), Some(&"X".to_string()));
    }
}
