//! Tera templates for generated configuration.
//!
//! Two templates ship embedded in the binary: the systemd unit used for
//! application services and the reverse-proxy configuration. Either can be
//! overridden (per-service `unit_template`, config `edge_template_path`).

mod builtin;

use crate::error::{Result, VezaError};
use std::error::Error as _;
use tera::{Context, Tera};
use tracing::debug;

pub use builtin::{EDGE_TEMPLATE, UNIT_TEMPLATE};

/// Embedded template names.
pub const UNIT: &str = "unit.service";
pub const EDGE: &str = "haproxy.cfg";

pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    /// Renderer preloaded with the embedded templates.
    pub fn new() -> Result<Self> {
        let mut tera = Tera::default();
        for (name, content) in [(UNIT, UNIT_TEMPLATE), (EDGE, EDGE_TEMPLATE)] {
            tera.add_raw_template(name, content).map_err(|e| template_error(name, &e))?;
        }
        Ok(Self { tera })
    }

    /// Replace one template with operator-supplied content.
    pub fn set_template(&mut self, name: &str, content: &str) -> Result<()> {
        self.tera.add_raw_template(name, content).map_err(|e| template_error(name, &e))?;
        debug!(template = name, "Template overridden");
        Ok(())
    }

    pub fn render(&self, name: &str, context: &Context) -> Result<String> {
        self.tera.render(name, context).map_err(|e| template_error(name, &e))
    }

    /// Render an inline template (a catalog-supplied unit template).
    pub fn render_inline(name: &str, content: &str, context: &Context) -> Result<String> {
        Tera::one_off(content, context, false).map_err(|e| template_error(name, &e))
    }
}

fn template_error(name: &str, e: &tera::Error) -> VezaError {
    let mut reason = format!("template {}: {}", name, e);
    let mut source = e.source();
    while let Some(cause) = source {
        reason.push_str(&format!(": {}", cause));
        source = cause.source();
    }
    VezaError::InvalidConfig { reason }
}
