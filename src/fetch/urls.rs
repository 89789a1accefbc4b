// src/fetch/urls.rs
use anyhow::{bail, Context, Result};
use url::Url;

const PLACEHOLDER: &str = "{id}";

/// A base URL with a `{id}` slot for the country id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    template: String,
}

impl UrlTemplate {
    /// Validates that the template has a placeholder and yields a parseable URL.
    pub fn parse(template: &str) -> Result<Self> {
        if !template.contains(PLACEHOLDER) {
            bail!("url template {:?} has no {} placeholder", template, PLACEHOLDER);
        }
        let t = Self {
            template: template.to_string(),
        };
        t.url_for(0)
            .with_context(|| format!("url template {:?} does not form a valid URL", template))?;
        Ok(t)
    }

    pub fn url_for(&self, id: u32) -> Result<Url> {
        let s = self.template.replace(PLACEHOLDER, &id.to_string());
        Ok(Url::parse(&s)?)
    }
}
