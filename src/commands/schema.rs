use std::io::{self, Write};

use anyhow::{Context, Result};

use crate::cli::SchemaArgs;
use crate::schema::{FormSchema, load_schema};

pub fn run(args: SchemaArgs) -> Result<()> {
    let schema = load_schema(args.schema.form, args.schema.schema_path.as_deref())?;

    let rendered = if args.json {
        let mut text =
            serde_json::to_string_pretty(&schema).context("failed to serialize form schema")?;
        text.push('\n');
        text
    } else {
        render_text(&schema)
    };

    io::stdout()
        .lock()
        .write_all(rendered.as_bytes())
        .context("failed to write schema to stdout")
}

fn render_text(schema: &FormSchema) -> String {
    let mut out = format!(
        "form: {}\nreference field: {}\nwide table: {}\n",
        schema.form_name(),
        schema.reference_field(),
        schema.wide_table()
    );

    for page in schema.pages() {
        out.push_str(&format!(
            "\npage {} (table {}, {} fields)\n",
            page.page_number,
            page.table_name(),
            page.fields.len()
        ));
        if let Some(context) = &page.context {
            out.push_str(&format!("  {context}\n"));
        }
        for field in &page.fields {
            out.push_str(&format!("  - {field}\n"));
        }
    }

    out
}
