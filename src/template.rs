use std::collections::BTreeMap;
use std::fs;

use camino::Utf8PathBuf;

use crate::error::SeqstageError;

pub const PBS_HEADER_TEMPLATE: &str = "pbs_header";

const PBS_HEADER_TEXT: &str = "\
#!/bin/bash
#PBS -q @cluster@
#PBS -N @jobname@
#PBS -l nodes=1:ppn=@nthread@
#PBS -o @log@
#PBS -j oe
cd \"$PBS_O_WORKDIR\"
";

/// Renders named shell-script templates with `@name@` placeholders.
/// Substitution is purely textual: no quoting is applied and placeholders
/// without a matching parameter are left verbatim for the caller to spot at
/// execution time.
pub struct TemplateEngine {
    root: Option<Utf8PathBuf>,
    builtin: BTreeMap<String, String>,
}

impl TemplateEngine {
    /// Built-in templates only.
    pub fn new() -> Self {
        let mut builtin = BTreeMap::new();
        builtin.insert(PBS_HEADER_TEMPLATE.to_string(), PBS_HEADER_TEXT.to_string());
        Self {
            root: None,
            builtin,
        }
    }

    /// A `<root>/<name>.sh` file takes precedence over the built-in template
    /// of the same name.
    pub fn with_root(root: Utf8PathBuf) -> Self {
        let mut engine = Self::new();
        engine.root = Some(root);
        engine
    }

    pub fn register(&mut self, name: &str, text: &str) {
        self.builtin.insert(name.to_string(), text.to_string());
    }

    pub fn render(
        &self,
        template_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, SeqstageError> {
        let text = self.template_text(template_id)?;
        Ok(substitute(&text, params))
    }

    fn template_text(&self, template_id: &str) -> Result<String, SeqstageError> {
        if let Some(root) = &self.root {
            let path = root.join(format!("{template_id}.sh"));
            if path.as_std_path().is_file() {
                return fs::read_to_string(path.as_std_path())
                    .map_err(|err| SeqstageError::Filesystem(format!("read {path}: {err}")));
            }
        }
        self.builtin
            .get(template_id)
            .cloned()
            .ok_or_else(|| SeqstageError::TemplateNotFound(template_id.to_string()))
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub fn substitute(text: &str, params: &BTreeMap<String, String>) -> String {
    let mut out = text.to_string();
    for (name, value) in params {
        out = out.replace(&format!("@{name}@"), value);
    }
    out
}
