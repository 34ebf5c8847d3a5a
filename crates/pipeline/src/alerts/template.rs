use lazy_static::lazy_static;
use regex::Regex;

use super::IncidentEvent;
use crate::store::AlertRule;
use crate::{Error, Result};

lazy_static! {
    static ref FIELD_RE: Regex = Regex::new(r"\{([a-z_]+)\}").unwrap();
}

/// Render a rule's `dedup_key_template`, substituting `{field}` placeholders
/// from the rule and the event. Supported fields: `source_id`, `rule_id`,
/// `event_id`, `severity`, `risk_level`. An unknown field fails the rule.
pub fn render_dedup_key(template: &str, rule: &AlertRule, event: &IncidentEvent) -> Result<String> {
    let mut unknown = None;
    let rendered = FIELD_RE.replace_all(template, |caps: &regex::Captures| match &caps[1] {
        "source_id" => event.source_id.clone(),
        "rule_id" => rule.id.clone(),
        "event_id" => event.event_id.to_string(),
        "severity" => rule.severity.to_string(),
        "risk_level" => event.risk.risk_level.to_string(),
        field => {
            unknown = Some(field.to_string());
            String::new()
        }
    });

    if let Some(field) = unknown {
        return Err(Error::Client(format!(
            "Unknown field '{{{}}}' in dedup key template '{}'",
            field, template
        )));
    }
    Ok(rendered.into_owned())
}
