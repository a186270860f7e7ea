//! A named, reversible unit of schema change.
//!
//! Scripts may refer to the owning schema through placeholders, rendered once
//! when the migration is constructed:
//!
//! | placeholder  | renders as          |
//! |--------------|---------------------|
//! | `${schema}`  | `my_schema`         |
//! | `${schema~}` | `"my_schema"`       |
//!
//! A script that cannot be rendered is rejected at construction time.

use std::path::Path;

use crate::error::IndexerError;
use crate::store::StoreTransaction;

/// A reversible schema change owned by one schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    name: String,
    schema: String,
    up: String,
    down: Option<String>,
}

impl Migration {
    /// Build a migration from script text.
    pub fn new(
        name: impl Into<String>,
        schema: impl Into<String>,
        up: &str,
        down: Option<&str>,
    ) -> Result<Self, IndexerError> {
        let name = name.into();
        let schema = schema.into();
        if name.trim().is_empty() {
            return Err(IndexerError::MalformedScript {
                migration: name,
                reason: "migration name is empty".into(),
            });
        }
        let up = render_script(&name, up, &schema)?;
        let down = down
            .map(|script| render_script(&name, script, &schema))
            .transpose()?;
        Ok(Self {
            name,
            schema,
            up,
            down,
        })
    }

    /// Build a migration from script files on disk.
    pub fn from_files(
        name: impl Into<String>,
        schema: impl Into<String>,
        up_path: impl AsRef<Path>,
        down_path: Option<&Path>,
    ) -> Result<Self, IndexerError> {
        let name = name.into();
        let up = read_script(&name, up_path.as_ref())?;
        let down = down_path.map(|p| read_script(&name, p)).transpose()?;
        Self::new(name, schema, &up, down.as_deref())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Rendered forward script.
    pub fn up_script(&self) -> &str {
        &self.up
    }

    /// Rendered reverse script, if one was supplied.
    pub fn down_script(&self) -> Option<&str> {
        self.down.as_deref()
    }

    /// Run the forward script inside `tx`.
    pub async fn up<T: StoreTransaction>(&self, tx: &mut T) -> Result<(), IndexerError> {
        tx.execute(&self.up).await
    }

    /// Run the reverse script inside `tx`.
    pub async fn down<T: StoreTransaction>(&self, tx: &mut T) -> Result<(), IndexerError> {
        match &self.down {
            Some(script) => tx.execute(script).await,
            None => Err(IndexerError::MissingDownQuery(self.name.clone())),
        }
    }
}

fn read_script(name: &str, path: &Path) -> Result<String, IndexerError> {
    std::fs::read_to_string(path).map_err(|e| IndexerError::MalformedScript {
        migration: name.to_string(),
        reason: format!("cannot read {}: {e}", path.display()),
    })
}

/// Substitute schema placeholders, rejecting anything else that looks like one.
fn render_script(name: &str, template: &str, schema: &str) -> Result<String, IndexerError> {
    let malformed = |reason: String| IndexerError::MalformedScript {
        migration: name.to_string(),
        reason,
    };

    if template.trim().is_empty() {
        return Err(malformed("script is empty".into()));
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            let offset = template.len() - rest.len() + start;
            malformed(format!("unterminated placeholder at byte {offset}"))
        })?;
        match after[..end].trim() {
            "schema" => out.push_str(schema),
            "schema~" => {
                out.push('"');
                out.push_str(&schema.replace('"', "\"\""));
                out.push('"');
            }
            other => return Err(malformed(format!("unknown parameter '{other}'"))),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
