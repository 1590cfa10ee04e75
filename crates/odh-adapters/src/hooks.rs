//! Pre-declared transform rules applied to assembled documents.

use std::path::Path;

use anyhow::{Context, Result};
use odh_core::{CanonicalDocument, License};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<TransformRule>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum TransformRule {
    AddKeyword {
        keyword: String,
        contains_any: Vec<String>,
    },
    AddCategory {
        category: String,
        contains_any: Vec<String>,
    },
    DefaultLicense {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        url: Option<String>,
    },
    DefaultPeriodicity {
        code: String,
    },
    /// Drop the record when none of these keywords is present.
    RequireKeyword {
        any_of: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformRules {
    rules: Vec<TransformRule>,
}

impl TransformRules {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(rules: Vec<TransformRule>) -> Self {
        Self { rules }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(text).context("parsing transform rules")?;
        Ok(Self { rules: file.rules })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply(&self, doc: &mut CanonicalDocument) {
        let haystack = searchable_text(doc);

        for rule in &self.rules {
            match rule {
                TransformRule::AddKeyword {
                    keyword,
                    contains_any,
                } => {
                    if matches_any(&haystack, contains_any) && !doc.keywords.contains(keyword) {
                        doc.keywords.push(keyword.clone());
                    }
                }
                TransformRule::AddCategory {
                    category,
                    contains_any,
                } => {
                    if matches_any(&haystack, contains_any) && !doc.categories.contains(category) {
                        doc.categories.push(category.clone());
                    }
                }
                TransformRule::DefaultLicense { id, title, url } => {
                    if doc.license.is_none() {
                        doc.license = Some(License {
                            id: id.clone(),
                            title: title.clone(),
                            url: url.clone(),
                        });
                    }
                }
                TransformRule::DefaultPeriodicity { code } => {
                    if doc.accrual_periodicity.is_none() {
                        doc.accrual_periodicity = Some(code.clone());
                    }
                }
                TransformRule::RequireKeyword { .. } => {}
            }
        }
    }

    pub fn should_skip(&self, keywords: &[String]) -> bool {
        self.rules.iter().any(|rule| match rule {
            TransformRule::RequireKeyword { any_of } => !any_of
                .iter()
                .any(|wanted| keywords.iter().any(|k| k.eq_ignore_ascii_case(wanted))),
            _ => false,
        })
    }
}

fn searchable_text(doc: &CanonicalDocument) -> String {
    let mut text = String::new();
    text.push_str(doc.title.as_deref().unwrap_or_default());
    text.push(' ');
    text.push_str(doc.description.as_deref().unwrap_or_default());
    for keyword in &doc.keywords {
        text.push(' ');
        text.push_str(keyword);
    }
    text.to_ascii_lowercase()
}

fn matches_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|needle| haystack.contains(&needle.to_ascii_lowercase()))
}
