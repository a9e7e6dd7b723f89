//! Deterministic effort estimate for rebuilding a site.
//!
//! An entity inventory (content types, paragraphs, views and so on, each
//! rated simple/medium/complex) is priced against a fixed hours table.
//! Percentage multipliers, content migration, fixed extra effort, project
//! management and a risk buffer are layered on top.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Infrastructure setup plus training and handover, in hours.
const INFRASTRUCTURE_HOURS: f64 = 60.0;
const TRAINING_HOURS: f64 = 30.0;
/// Project management as a share of everything before it.
const PM_SHARE: f64 = 0.18;
/// Fixed migration setup, plus hours per hundred nodes before the
/// complexity factor.
const MIGRATION_SETUP_HOURS: f64 = 30.0;
const MIGRATION_HOURS_PER_100_NODES: f64 = 10.0;
const PESSIMISTIC_FACTOR: f64 = 1.3;
const HOURLY_RATE_EUR: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
    /// A label outside the table. Prices entities at zero.
    Unrated,
}

impl From<String> for Complexity {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "simple" => Self::Simple,
            "medium" => Self::Medium,
            "complex" => Self::Complex,
            _ => Self::Unrated,
        }
    }
}

impl From<Complexity> for String {
    fn from(c: Complexity) -> Self {
        c.as_str().to_string()
    }
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::Unrated => "unrated",
        }
    }

    fn migration_factor(self) -> f64 {
        match self {
            Self::Simple => 1.0,
            Self::Complex => 3.5,
            Self::Medium | Self::Unrated => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl From<String> for RiskLevel {
    /// Unknown labels fall back to medium.
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }
}

impl From<RiskLevel> for String {
    fn from(r: RiskLevel) -> Self {
        r.as_str().to_string()
    }
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn buffer_share(self) -> f64 {
        match self {
            Self::Low => 0.15,
            Self::Medium => 0.20,
            Self::High => 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ContentType,
    Paragraph,
    Taxonomy,
    MediaType,
    View,
    Webform,
    Block,
    CustomModule,
    ThemeComponent,
}

impl EntityKind {
    /// Hours for one entity of this kind.
    pub fn hours(self, complexity: Complexity) -> f64 {
        let (simple, medium, complex) = match self {
            Self::ContentType | Self::View | Self::Webform | Self::ThemeComponent => {
                (3.0, 6.0, 12.0)
            }
            Self::Paragraph => (1.5, 3.5, 6.0),
            Self::Taxonomy | Self::Block => (1.5, 3.0, 6.0),
            Self::MediaType => (1.5, 3.0, 3.5),
            Self::CustomModule => (12.0, 28.0, 70.0),
        };
        match complexity {
            Complexity::Simple => simple,
            Complexity::Medium => medium,
            Complexity::Complex => complex,
            Complexity::Unrated => 0.0,
        }
    }

    fn heading(self) -> &'static str {
        match self {
            Self::ContentType => "Content Types",
            Self::Paragraph => "Paragraphs",
            Self::Taxonomy => "Taxonomies",
            Self::MediaType => "Media Types",
            Self::View => "Views",
            Self::Webform => "Webforms",
            Self::Block => "Blocks",
            Self::CustomModule => "Custom Modules",
            Self::ThemeComponent => "Theme Components",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityItem {
    #[serde(default = "unknown_name")]
    pub name: String,
    #[serde(default)]
    pub complexity: Complexity,
}

fn unknown_name() -> String {
    "Unknown".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    #[serde(default)]
    pub nodes: u64,
    #[serde(default)]
    pub complexity: Complexity,
}

/// What an expert extracted from the site, in the shape the estimator
/// prices.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EntityInventory {
    pub project_name: Option<String>,
    pub content_types: Vec<EntityItem>,
    pub paragraphs: Vec<EntityItem>,
    pub taxonomies: Vec<EntityItem>,
    pub media_types: Vec<EntityItem>,
    pub views: Vec<EntityItem>,
    pub webforms: Vec<EntityItem>,
    pub blocks: Vec<EntityItem>,
    pub custom_modules: Vec<EntityItem>,
    pub theme_components: Vec<EntityItem>,
    /// Extra work as a fraction of base hours, e.g. `testing: 0.25`.
    pub multipliers: BTreeMap<String, f64>,
    pub migration: Option<Migration>,
    pub risk_level: RiskLevel,
    pub assumptions: Option<Vec<String>>,
    pub risks: Option<Vec<String>>,
}

impl EntityInventory {
    /// Parses an inventory out of an executor answer. The JSON may be the
    /// whole answer or sit in a ```json fence.
    pub fn from_answer(answer: &str) -> Result<Self> {
        let json = extract_json(answer).context("answer contains no JSON object")?;
        let inventory: Self =
            serde_json::from_str(json).context("failed to parse entity inventory")?;
        for (key, share) in &inventory.multipliers {
            if !share.is_finite() || *share < 0.0 {
                bail!("multiplier {key} must be a non-negative fraction, got {share}");
            }
        }
        Ok(inventory)
    }

    fn items(&self) -> impl Iterator<Item = (EntityKind, &EntityItem)> {
        [
            (EntityKind::ContentType, &self.content_types),
            (EntityKind::Paragraph, &self.paragraphs),
            (EntityKind::Taxonomy, &self.taxonomies),
            (EntityKind::MediaType, &self.media_types),
            (EntityKind::View, &self.views),
            (EntityKind::Webform, &self.webforms),
            (EntityKind::Block, &self.blocks),
            (EntityKind::CustomModule, &self.custom_modules),
            (EntityKind::ThemeComponent, &self.theme_components),
        ]
        .into_iter()
        .flat_map(|(kind, items)| items.iter().map(move |item| (kind, item)))
    }
}

fn extract_json(answer: &str) -> Option<&str> {
    if let Some(start) = answer.find("```json") {
        let body = &answer[start + "```json".len()..];
        let end = body.find("```")?;
        return Some(body[..end].trim());
    }
    let start = answer.find('{')?;
    let end = answer.rfind('}')?;
    (start < end).then(|| &answer[start..=end])
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    pub kind: EntityKind,
    pub name: String,
    pub complexity: Complexity,
    pub hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub base_hours: f64,
    pub multiplier_hours: f64,
    pub migration_hours: f64,
    pub pm_hours: f64,
    /// Infrastructure, training and project management.
    pub additional_hours: f64,
    pub subtotal: f64,
    pub risk_level: RiskLevel,
    pub buffer_hours: f64,
    pub total_hours: f64,
    pub breakdown: Vec<LineItem>,
    pub multipliers_applied: BTreeMap<String, f64>,
    pub assumptions: Vec<String>,
    pub risks: Vec<String>,
}

pub fn migration_hours(migration: Option<&Migration>) -> f64 {
    match migration {
        Some(m) if m.nodes > 0 => {
            MIGRATION_SETUP_HOURS
                + (m.nodes as f64 / 100.0)
                    * MIGRATION_HOURS_PER_100_NODES
                    * m.complexity.migration_factor()
        }
        _ => 0.0,
    }
}

pub fn estimate(inventory: &EntityInventory) -> Estimate {
    let breakdown: Vec<LineItem> = inventory
        .items()
        .map(|(kind, item)| LineItem {
            kind,
            name: item.name.clone(),
            complexity: item.complexity,
            hours: kind.hours(item.complexity),
        })
        .collect();
    let base_hours: f64 = breakdown.iter().map(|i| i.hours).sum();

    let multipliers_applied: BTreeMap<String, f64> = inventory
        .multipliers
        .iter()
        .map(|(key, share)| (key.clone(), base_hours * share))
        .collect();
    let multiplier_hours: f64 = multipliers_applied.values().sum();

    let migration_hours = migration_hours(inventory.migration.as_ref());
    let fixed_hours = INFRASTRUCTURE_HOURS + TRAINING_HOURS;
    let before_pm = base_hours + multiplier_hours + migration_hours + fixed_hours;
    let pm_hours = before_pm * PM_SHARE;
    let subtotal = before_pm + pm_hours;

    let risk_level = inventory.risk_level;
    let buffer_hours = subtotal * risk_level.buffer_share();

    Estimate {
        base_hours,
        multiplier_hours,
        migration_hours,
        pm_hours,
        additional_hours: fixed_hours + pm_hours,
        subtotal,
        risk_level,
        buffer_hours,
        total_hours: subtotal + buffer_hours,
        breakdown,
        multipliers_applied,
        assumptions: inventory.assumptions.clone().unwrap_or_else(default_assumptions),
        risks: inventory.risks.clone().unwrap_or_else(default_risks),
    }
}

fn default_assumptions() -> Vec<String> {
    [
        "Requirements are clearly defined",
        "Team has CMS experience",
        "Standard development practices followed",
        "No major scope changes expected",
    ]
    .map(String::from)
    .to_vec()
}

fn default_risks() -> Vec<String> {
    [
        "Requirements may evolve during development",
        "Migration complexity may be higher than assessed",
        "Third-party integrations may require additional effort",
    ]
    .map(String::from)
    .to_vec()
}

fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

impl Estimate {
    pub fn render_markdown(&self, project: &str, migration: Option<&Migration>) -> String {
        let share = |hours: f64| hours / self.total_hours * 100.0;
        let mut out = format!("# Effort Estimate: {project}\n\n## Summary\n\n");
        out.push_str("| Metric | Hours | % of Total |\n|--------|-------|-----------|\n");
        for (label, hours) in [
            ("Base Hours (Entities)", self.base_hours),
            ("Multipliers", self.multiplier_hours),
            ("Migration", self.migration_hours),
            ("Additional Effort", self.additional_hours),
            ("Subtotal", self.subtotal),
        ] {
            out.push_str(&format!("| {label} | {hours:.1} | {:.1}% |\n", share(hours)));
        }
        out.push_str(&format!(
            "| Buffer ({}) | {:.1} | {:.1}% |\n| **TOTAL ESTIMATE** | **{:.1}** | **100%** |\n",
            title_case(self.risk_level.as_str()),
            self.buffer_hours,
            share(self.buffer_hours),
            self.total_hours
        ));
        out.push_str(&format!(
            "\nIndicative cost at €{HOURLY_RATE_EUR:.0}/h: €{:.0}\n",
            self.total_hours * HOURLY_RATE_EUR
        ));

        out.push_str("\n## Timeline\n\n| Pace | Weeks | Months |\n|------|-------|--------|\n");
        for (label, per_week) in [("Full-time", 40.0), ("Realistic", 30.0), ("Part-time", 20.0)] {
            out.push_str(&format!(
                "| {label} ({per_week:.0}h/week) | {:.1} | {:.1} |\n",
                self.total_hours / per_week,
                self.total_hours / (per_week * 4.0)
            ));
        }

        out.push_str("\n## Ranges\n\n| Confidence | Hours | Months (30h/week) |\n|-----------|-------|-------------------|\n");
        let pessimistic = self.total_hours * PESSIMISTIC_FACTOR;
        for (label, hours) in [
            ("Optimistic (base)", self.base_hours),
            ("Likely (recommended)", self.total_hours),
            ("Pessimistic (+30%)", pessimistic),
        ] {
            out.push_str(&format!("| {label} | {hours:.0} | {:.1} |\n", hours / 120.0));
        }

        out.push_str("\n## Breakdown\n");
        let mut kind = None;
        let mut kind_hours = 0.0;
        for item in &self.breakdown {
            if kind != Some(item.kind) {
                if kind.is_some() {
                    out.push_str(&format!("| **Subtotal** | | **{kind_hours:.1}** |\n"));
                }
                kind = Some(item.kind);
                kind_hours = 0.0;
                out.push_str(&format!(
                    "\n### {}\n\n| Name | Complexity | Hours |\n|------|-----------|-------|\n",
                    item.kind.heading()
                ));
            }
            kind_hours += item.hours;
            out.push_str(&format!(
                "| {} | {} | {:.1} |\n",
                item.name,
                title_case(item.complexity.as_str()),
                item.hours
            ));
        }
        if kind.is_some() {
            out.push_str(&format!("| **Subtotal** | | **{kind_hours:.1}** |\n"));
        } else {
            out.push_str("\nNo entities found.\n");
        }

        if !self.multipliers_applied.is_empty() {
            out.push_str("\n### Multipliers\n\n| Multiplier | Hours |\n|-----------|-------|\n");
            for (key, hours) in &self.multipliers_applied {
                out.push_str(&format!("| {} | {hours:.1} |\n", title_case(key)));
            }
        }

        out.push_str("\n### Migration\n\n");
        match migration {
            Some(m) if m.nodes > 0 => out.push_str(&format!(
                "- Content volume: {} nodes\n- Complexity: {}\n- Hours: {:.1}\n",
                m.nodes,
                title_case(m.complexity.as_str()),
                self.migration_hours
            )),
            _ => out.push_str("No migration required.\n"),
        }

        out.push_str(&format!(
            "\n### Additional effort\n\n| Item | Hours |\n|------|-------|\n\
             | Infrastructure Setup | {INFRASTRUCTURE_HOURS:.1} |\n\
             | Training & Handover | {TRAINING_HOURS:.1} |\n\
             | Project Management ({:.0}%) | {:.1} |\n",
            PM_SHARE * 100.0,
            self.pm_hours
        ));

        out.push_str("\n## Assumptions\n\n");
        for (i, a) in self.assumptions.iter().enumerate() {
            out.push_str(&format!("{}. {a}\n", i + 1));
        }
        out.push_str("\n## Risks\n\n");
        for (i, r) in self.risks.iter().enumerate() {
            out.push_str(&format!("{}. {r}\n", i + 1));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn item(name: &str, complexity: Complexity) -> EntityItem {
        EntityItem {
            name: name.into(),
            complexity,
        }
    }

    #[test]
    fn test_hours_table() {
        use Complexity::*;
        assert_eq!(EntityKind::ContentType.hours(Medium), 6.0);
        assert_eq!(EntityKind::Paragraph.hours(Medium), 3.5);
        assert_eq!(EntityKind::Taxonomy.hours(Complex), 6.0);
        assert_eq!(EntityKind::MediaType.hours(Complex), 3.5);
        assert_eq!(EntityKind::Webform.hours(Simple), 3.0);
        assert_eq!(EntityKind::Block.hours(Medium), 3.0);
        assert_eq!(EntityKind::CustomModule.hours(Simple), 12.0);
        assert_eq!(EntityKind::CustomModule.hours(Medium), 28.0);
        assert_eq!(EntityKind::CustomModule.hours(Complex), 70.0);
        assert_eq!(EntityKind::ThemeComponent.hours(Complex), 12.0);
        assert_eq!(EntityKind::View.hours(Unrated), 0.0);
    }

    #[test]
    fn test_minimal_inventory() {
        let inventory = EntityInventory {
            content_types: vec![item("Page", Complexity::Medium)],
            paragraphs: vec![item("Hero", Complexity::Complex)],
            ..Default::default()
        };
        let e = estimate(&inventory);
        assert!(close(e.base_hours, 12.0));
        assert!(close(e.pm_hours, 18.36));
        assert!(close(e.additional_hours, 108.36));
        assert!(close(e.subtotal, 120.36));
        assert!(close(e.buffer_hours, 24.072));
        assert!(close(e.total_hours, 144.432));
        assert_eq!(e.assumptions.len(), 4);
        assert_eq!(e.risks.len(), 3);
    }

    #[test]
    fn test_full_inventory_from_json() {
        let answer = r#"Here is the inventory:

```json
{
  "project_name": "Acme",
  "content_types": [
    {"name": "Page", "complexity": "simple"},
    {"name": "Article", "complexity": "Medium"}
  ],
  "paragraphs": [
    {"name": "Text", "complexity": "simple"},
    {"name": "Hero", "complexity": "complex"}
  ],
  "multipliers": {"testing": 0.25, "documentation": 0.15, "multilingual": 0.30},
  "migration": {"nodes": 500, "complexity": "medium"},
  "risk_level": "medium"
}
```
"#;
        let inventory = EntityInventory::from_answer(answer).unwrap();
        assert_eq!(inventory.project_name.as_deref(), Some("Acme"));
        assert_eq!(inventory.content_types[1].complexity, Complexity::Medium);

        let e = estimate(&inventory);
        assert!(close(e.base_hours, 16.5));
        assert!(close(e.multiplier_hours, 11.55));
        assert!(close(e.multipliers_applied["testing"], 4.125));
        assert!(close(e.migration_hours, 130.0));
        assert!(close(e.additional_hours, 134.649));
        assert!(close(e.subtotal, 292.699));
        assert!(close(e.buffer_hours, 58.5398));
        assert!(close(e.total_hours, 351.2388));
    }

    #[test]
    fn test_high_risk_with_complex_migration() {
        let answer = r#"{
  "custom_modules": [{"name": "Sync", "complexity": "complex"}],
  "views": [{"name": "News"}],
  "migration": {"nodes": 250, "complexity": "complex"},
  "risk_level": "HIGH"
}"#;
        let inventory = EntityInventory::from_answer(answer).unwrap();
        let e = estimate(&inventory);
        assert!(close(e.base_hours, 76.0));
        assert!(close(e.migration_hours, 117.5));
        assert!(close(e.subtotal, 334.53));
        assert!(close(e.buffer_hours, 83.6325));
        assert!(close(e.total_hours, 418.1625));
    }

    #[test]
    fn test_empty_low_risk_inventory_keeps_fixed_effort() {
        let e = estimate(&EntityInventory::from_answer(r#"{"risk_level": "low"}"#).unwrap());
        assert_eq!(e.base_hours, 0.0);
        assert_eq!(e.migration_hours, 0.0);
        assert!(close(e.additional_hours, 106.2));
        assert!(close(e.buffer_hours, 15.93));
        assert!(close(e.total_hours, 122.13));
    }

    #[test]
    fn test_unknown_labels() {
        let inventory = EntityInventory::from_answer(
            r#"{"blocks": [{"complexity": "epic"}], "risk_level": "extreme",
                "migration": {"nodes": 100, "complexity": "odd"}}"#,
        )
        .unwrap();
        assert_eq!(inventory.blocks[0].name, "Unknown");
        assert_eq!(inventory.blocks[0].complexity, Complexity::Unrated);
        assert_eq!(inventory.risk_level, RiskLevel::Medium);

        let e = estimate(&inventory);
        assert_eq!(e.base_hours, 0.0);
        assert!(close(e.migration_hours, 50.0));
    }

    #[test]
    fn test_zero_nodes_means_no_migration() {
        let m = Migration {
            nodes: 0,
            complexity: Complexity::Complex,
        };
        assert_eq!(migration_hours(Some(&m)), 0.0);
        assert_eq!(migration_hours(None), 0.0);
    }

    #[test]
    fn test_rejects_bad_answers() {
        assert!(EntityInventory::from_answer("no idea, sorry").is_err());
        assert!(EntityInventory::from_answer(r#"{"multipliers": {"testing": -0.5}}"#).is_err());
        assert!(EntityInventory::from_answer(r#"{"views": "lots"}"#).is_err());
    }

    #[test]
    fn test_report_sections() {
        let inventory = EntityInventory {
            views: vec![item("News", Complexity::Medium), item("Events", Complexity::Simple)],
            custom_modules: vec![item("Sync", Complexity::Complex)],
            multipliers: BTreeMap::from([("multilingual".to_string(), 0.3)]),
            risks: Some(vec!["Legacy API".into()]),
            ..Default::default()
        };
        let e = estimate(&inventory);
        let report = e.render_markdown("Acme", inventory.migration.as_ref());

        assert!(report.starts_with("# Effort Estimate: Acme"));
        assert!(report.contains("### Views\n"));
        assert!(report.contains("| News | Medium | 6.0 |"));
        assert!(report.contains("| **Subtotal** | | **9.0** |"));
        assert!(report.contains("### Custom Modules\n"));
        assert!(report.contains("| Multilingual | 23.7 |"));
        assert!(report.contains("No migration required."));
        assert!(report.contains("1. Legacy API\n"));
        assert!(report.contains(&format!("| **TOTAL ESTIMATE** | **{:.1}** |", e.total_hours)));
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("content_migration"), "Content Migration");
        assert_eq!(title_case("medium"), "Medium");
    }
}
