//! Enrichment Client (C4).
//!
//! Looks a print job up against an external "hardcopy" information
//! system over HTTP, merging whatever fields it returns back into the
//! dataset before storage. The wire formats (XML and JSON) and the
//! query-parameter binding rules are as specified in §4.4; the HTTP
//! client itself is built the same way the teacher's `cube_client.rs`/
//! `chris.rs` build theirs, on `reqwest::blocking`.

use std::collections::HashMap;
use std::time::Duration;

use dicom::core::{DataDictionary, DataElement, PrimitiveValue, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::InMemDicomObject;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use crate::config::ConfigView;
use crate::ocr::OcrEngine;

struct EnrichmentConfig {
    url: String,
    username: String,
    password: String,
    content_type: String,
    query_parameters: Vec<(String, String)>,
    ignore_errors: Vec<String>,
    timeout: Duration,
}

impl EnrichmentConfig {
    fn resolve(config: &ConfigView, printer: &str) -> Self {
        let mut config = config.clone();
        config.begin_group(printer);
        let timeout = Duration::from_secs(config.get_i64("timeout", 30).max(1) as u64);
        let url = config.get_string("query.url", "");
        let username = config.get_string("query.username", "");
        let password = config.get_string("query.password", "");
        let content_type = config.get_string("query.content-type", "application/xml");
        let query_parameters = config
            .get_string_list("query.query-parameters")
            .into_iter()
            .filter_map(|entry| entry.split_once(':').map(|(p, t)| (p.to_string(), t.to_string())))
            .collect();
        let ignore_errors = config.get_string_list("query.ignore-errors");
        config.end_group();
        Self {
            url,
            username,
            password,
            content_type,
            query_parameters,
            ignore_errors,
            timeout,
        }
    }
}

/// Both `tag[]` scopes (§6: "root+printer") contribute rules; root rules
/// run first, then the printer's own.
fn combined_tag_rules(config: &ConfigView, printer: &str) -> Vec<toml::Value> {
    let mut rules = config.root_array("tag");
    let mut scoped = config.clone();
    scoped.begin_group(printer);
    rules.extend(scoped.local_array("tag"));
    rules
}

/// Run the enrichment query for `printer` against `dataset`, per §4.4.
/// Returns `true` if the dataset was successfully merged with an
/// enrichment response (or no enrichment is configured), `false` if the
/// caller should spool the dataset instead.
pub fn query(
    config: &ConfigView,
    printer: &str,
    dataset: &mut InMemDicomObject,
    ocr_engine: &mut dyn OcrEngine,
) -> bool {
    let cfg = EnrichmentConfig::resolve(config, printer);
    if cfg.url.is_empty() {
        return true;
    }

    let rules = combined_tag_rules(config, printer);
    let mut query_params = crate::ocr::tag(&rules, ocr_engine, dataset);

    for (param, tag_name) in &cfg.query_parameters {
        match read_named_tag_as_string(dataset, tag_name) {
            Some(value) => {
                query_params.insert(param.clone(), value);
            }
            None => {
                tracing::warn!(printer, param, tag_name, "enrichment query parameter tag not found");
                query_params.insert(param.clone(), String::new());
            }
        }
    }

    let is_json = cfg.content_type.contains("json");
    let body = if is_json {
        encode_json_request(&query_params)
    } else {
        encode_xml_request(&query_params)
    };

    let client = match Client::builder().timeout(cfg.timeout).build() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(printer, error = %e, "could not build enrichment HTTP client");
            force_safe_defaults(dataset);
            return false;
        }
    };

    let content_type_header = if cfg.content_type.contains("charset") {
        cfg.content_type.clone()
    } else {
        format!("{}; charset=UTF-8", cfg.content_type)
    };

    let mut request = client
        .post(&cfg.url)
        .header(ACCEPT, "*/*")
        .header(CONTENT_TYPE, content_type_header)
        .body(body);
    if !cfg.username.is_empty() {
        request = request.basic_auth(&cfg.username, Some(&cfg.password));
    }

    let response = match request.send() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(printer, url = cfg.url, error = %e, "enrichment request failed");
            force_safe_defaults(dataset);
            return false;
        }
    };

    let status_ok = response.status().is_success();
    let response_is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("json"))
        .unwrap_or(is_json);
    let body_text = match response.text() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(printer, error = %e, "could not read enrichment response body");
            force_safe_defaults(dataset);
            return false;
        }
    };

    if !status_ok && !cfg.ignore_errors.iter().any(|s| body_text.contains(s)) {
        tracing::error!(printer, status = %status_ok, body = body_text, "enrichment server returned an error");
        force_safe_defaults(dataset);
        return false;
    }

    let parsed = if response_is_json {
        parse_json_response(&body_text)
    } else {
        parse_xml_response(&body_text)
    };

    apply_fields(dataset, &parsed);
    true
}

fn force_safe_defaults(dataset: &mut InMemDicomObject) {
    dataset.put(DataElement::new(
        dicom::dictionary_std::tags::PATIENT_ID,
        VR::LO,
        PrimitiveValue::from("0"),
    ));
    dataset.put(DataElement::new(
        dicom::dictionary_std::tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from("^"),
    ));
}

fn read_named_tag_as_string(dataset: &InMemDicomObject, key: &str) -> Option<String> {
    let tag = resolve_tag(key)?.0;
    dataset
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').to_string())
}

fn resolve_tag(key: &str) -> Option<(Tag, VR)> {
    if let Some(entry) = StandardDataDictionary.by_name(key) {
        return Some((entry.tag.inner(), entry.vr.relaxed()));
    }
    let tag = parse_hex_tag(key)?;
    let vr = StandardDataDictionary
        .by_tag(tag)
        .map(|e| e.vr.relaxed())
        .unwrap_or(VR::LO);
    Some((tag, vr))
}

/// Parse `"gggg,eeee"` or `"(gggg,eeee)"` into a [`Tag`].
fn parse_hex_tag(s: &str) -> Option<Tag> {
    let trimmed = s.trim_start_matches('(').trim_end_matches(')');
    let (group, element) = trimmed.split_once(',')?;
    let group = u16::from_str_radix(group.trim(), 16).ok()?;
    let element = u16::from_str_radix(element.trim(), 16).ok()?;
    Some(Tag(group, element))
}

fn encode_xml_request(query_params: &HashMap<String, String>) -> String {
    let mut out = String::from("<save-hardcopy-grayscale-image-request>");
    for (param, value) in query_params {
        let escaped = quick_xml::escape::escape(value);
        out.push_str(&format!("<{param}>{escaped}</{param}>"));
    }
    out.push_str("</save-hardcopy-grayscale-image-request>");
    out
}

fn encode_json_request(query_params: &HashMap<String, String>) -> String {
    let object: serde_json::Map<String, serde_json::Value> = query_params
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    serde_json::Value::Object(object).to_string()
}

/// Parse an XML enrichment response (§4.4 step 7): `<element tag="...">text</element>`
/// become `tag→text`; other leaf elements become `name→text`; `data-set`
/// and `business-logic-error` containers are traversed into (not emitted
/// themselves).
fn parse_xml_response(body: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<(String, Option<String>)> = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let tag_attr = e.attributes().flatten().find_map(|a| {
                    (a.key.as_ref() == b"tag")
                        .then(|| String::from_utf8_lossy(&a.value).to_string())
                });
                stack.push((name, tag_attr));
            }
            Ok(Event::Empty(_)) => {}
            Ok(Event::Text(t)) => {
                if let Some((name, tag_attr)) = stack.last() {
                    let text = t.unescape().unwrap_or_default().trim().to_string();
                    if !text.is_empty() {
                        let key = tag_attr.clone().unwrap_or_else(|| name.clone());
                        if name != "data-set" && name != "business-logic-error" {
                            fields.insert(key, text);
                        }
                    }
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    fields
}

/// Parse a JSON enrichment response (§4.4 step 7): a top-level array of
/// `{tag, value}` objects.
fn parse_json_response(body: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let Ok(serde_json::Value::Array(items)) = serde_json::from_str(body) else {
        return fields;
    };
    for item in items {
        let (Some(tag), Some(value)) = (
            item.get("tag").and_then(|v| v.as_str()),
            item.get("value"),
        ) else {
            continue;
        };
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        fields.insert(tag.to_string(), value);
    }
    fields
}

/// Write every parsed field into `dataset`, reformatting date/time
/// values, transliterating string values, and parsing numeric values per
/// VR, per §4.4 step 9.
fn apply_fields(dataset: &mut InMemDicomObject, parsed: &HashMap<String, String>) {
    for (key, raw_value) in parsed {
        let Some((tag, vr)) = resolve_tag(key) else {
            tracing::warn!(key, "enrichment response named an unrecognized tag");
            continue;
        };
        let value = reformat_value(vr, raw_value);
        dataset.put(DataElement::new(tag, vr, value));
    }
}

fn reformat_value(vr: VR, raw: &str) -> PrimitiveValue {
    match vr {
        VR::DA => PrimitiveValue::from(reformat_date(raw).unwrap_or_else(|| raw.to_string())),
        VR::TM => PrimitiveValue::from(reformat_time(raw).unwrap_or_else(|| raw.to_string())),
        VR::DT => PrimitiveValue::from(reformat_datetime(raw).unwrap_or_else(|| raw.to_string())),
        VR::IS | VR::DS => PrimitiveValue::from(raw.trim().to_string()),
        VR::US | VR::SS | VR::UL | VR::SL => raw
            .trim()
            .parse::<i32>()
            .map(|n| dicom_value!(I32, [n]))
            .unwrap_or_else(|_| PrimitiveValue::from(raw.to_string())),
        VR::FL | VR::FD => raw
            .trim()
            .parse::<f64>()
            .map(|n| dicom_value!(F64, [n]))
            .unwrap_or_else(|_| PrimitiveValue::from(raw.to_string())),
        VR::LO | VR::PN | VR::SH | VR::CS | VR::UT | VR::ST | VR::LT => {
            PrimitiveValue::from(crate::transliteration::transliterate(raw))
        }
        _ => PrimitiveValue::from(raw.to_string()),
    }
}

fn reformat_date(raw: &str) -> Option<String> {
    let (y, m, d) = raw.split_once('-').and_then(|(y, rest)| {
        let (m, d) = rest.split_once('-')?;
        Some((y, m, d))
    })?;
    Some(format!("{y:0>4}{m:0>2}{d:0>2}"))
}

fn reformat_time(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    Some(format!("{:0>2}{:0>2}{:0>2}", parts[0], parts[1], parts[2]))
}

fn reformat_datetime(raw: &str) -> Option<String> {
    let (date_part, time_part) = raw.split_once(['T', ' '])?;
    let date = reformat_date(date_part)?;
    let time = reformat_time(time_part)?;
    Some(format!("{date}{time}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reformats_iso_date_to_dicom() {
        assert_eq!(reformat_date("2024-01-05").unwrap(), "20240105");
    }

    #[test]
    fn reformats_iso_time_to_dicom() {
        assert_eq!(reformat_time("08:30:02").unwrap(), "083002");
    }

    #[test]
    fn reformats_iso_datetime_to_dicom() {
        assert_eq!(
            reformat_datetime("2024-01-05T08:30:02").unwrap(),
            "20240105083002"
        );
    }

    #[test]
    fn parses_xml_response_skipping_containers() {
        let xml = r#"<response>
            <data-set>
                <element tag="0010,0010">DOE^JOHN</element>
                <PatientID>12345</PatientID>
            </data-set>
        </response>"#;
        let fields = parse_xml_response(xml);
        assert_eq!(fields.get("0010,0010"), Some(&"DOE^JOHN".to_string()));
        assert_eq!(fields.get("PatientID"), Some(&"12345".to_string()));
    }

    #[test]
    fn parses_json_array_response() {
        let json = r#"[{"tag": "PatientID", "value": "12345"}]"#;
        let fields = parse_json_response(json);
        assert_eq!(fields.get("PatientID"), Some(&"12345".to_string()));
    }

    #[test]
    fn empty_url_short_circuits_to_success() {
        let config = ConfigView::load("/nonexistent/vdicomprint-enrichment-test.toml").unwrap();
        let mut dataset = InMemDicomObject::new_empty();
        let mut engine = crate::ocr::NullOcrEngine;
        assert!(query(&config, "P1", &mut dataset, &mut engine));
    }
}
