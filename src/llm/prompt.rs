use std::fmt::Write as _;

use indexmap::IndexMap;
use serde_json::Value;

use crate::schema::PageSchema;

const EXTRACTION_RULES: &str = "\
Extract only information that is clearly visible on the page.
- Checkbox questions: answer Yes or No according to the ticked box.
- Dates: copy them in the format printed on the form.
- Measurements: include units when they are written.
- Illegible or empty entries: use null rather than guessing.
Reply with a single JSON object and nothing else. Use the field names below
exactly as written, including punctuation, as the object keys.";

/// Prompt for one page: fixed rules, the page context, and a JSON template
/// keyed by the page's fields.
pub fn page_prompt(form_name: &str, page: &PageSchema) -> String {
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "You are reading page {} of the form \"{}\".",
        page.page_number, form_name
    );
    if let Some(context) = page.context.as_deref() {
        let _ = writeln!(prompt, "Page contents: {context}");
    }
    prompt.push('\n');
    prompt.push_str(EXTRACTION_RULES);
    prompt.push_str("\n\nFields:\n");
    for field in &page.fields {
        let _ = writeln!(prompt, "- {field}");
    }

    let template: IndexMap<&str, Value> = page
        .fields
        .iter()
        .map(|field| (field.as_str(), Value::Null))
        .collect();
    prompt.push_str("\nTemplate:\n");
    prompt.push_str(&serde_json::to_string_pretty(&template).unwrap_or_else(|_| "{}".into()));
    prompt.push('\n');

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_fields_and_template_in_order() {
        let mut page = PageSchema::new(2, &["surname", "Any thyroid disorder or lupus?"]);
        page.context = Some("Medical history questions".to_string());

        let prompt = page_prompt("medical_examiners_report", &page);

        assert!(prompt.contains("page 2 of the form \"medical_examiners_report\""));
        assert!(prompt.contains("Page contents: Medical history questions"));
        assert!(prompt.contains("- surname\n- Any thyroid disorder or lupus?\n"));
        let template_start = prompt.find("Template:").unwrap();
        let template = &prompt[template_start..];
        let surname = template.find("\"surname\": null").unwrap();
        let question = template.find("\"Any thyroid disorder or lupus?\": null").unwrap();
        assert!(surname < question);
    }
}
