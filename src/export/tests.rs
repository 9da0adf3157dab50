use super::csv::{read_csv, write_csv};
use super::*;
use crate::cli::BuiltinForm;
use crate::record::empty_page;
use crate::schema::PageSchema;

fn page_fields(pairs: &[(&str, Option<&str>)]) -> PageFields {
    pairs
        .iter()
        .map(|(field, value)| ((*field).to_string(), value.map(str::to_string)))
        .collect()
}

fn small_schema() -> FormSchema {
    FormSchema::new(
        "small",
        "reference_number",
        vec![
            PageSchema::new(0, &["reference_number", "name"]).with_table("applicant"),
            PageSchema::new(1, &["address", "occupation"]).with_table("applicant"),
            PageSchema::new(2, &["height", "weight"]).with_table("measurements"),
        ],
    )
    .unwrap()
}

fn full_record(schema: &FormSchema) -> ExtractedRecord {
    let mut record = ExtractedRecord::new();
    for page in schema.pages() {
        let mut fields = empty_page(page);
        for (index, value) in fields.values_mut().enumerate() {
            if index % 2 == 0 {
                *value = Some(format!("p{}-{}", page.page_number, index));
            }
        }
        record.insert_page(page.page_number, fields);
    }
    record
}

#[test]
fn flat_record_splits_back_into_pages() {
    let schema = FormSchema::builtin(BuiltinForm::MedicalReport).unwrap();
    let record = full_record(&schema);

    let flat = to_record(&record);
    assert_eq!(flat.len(), schema.all_fields().len());
    assert_eq!(split_record(&flat, &schema), record);
}

#[test]
fn later_page_wins_on_field_collision() {
    let mut record = ExtractedRecord::new();
    record.insert_page(0, page_fields(&[("date", Some("first")), ("a", None)]));
    record.insert_page(4, page_fields(&[("date", Some("second"))]));

    let flat = to_record(&record);
    assert_eq!(flat.get_index(0).unwrap().0, "date");
    assert_eq!(flat["date"].as_deref(), Some("second"));
}

#[test]
fn grouped_rows_follow_page_tables() {
    let schema = FormSchema::builtin(BuiltinForm::MedicalReport).unwrap();
    let mut record = ExtractedRecord::new();
    record.insert_page(
        0,
        page_fields(&[
            ("reference_number", Some("REF1")),
            ("name_of_life_to_be_insured", Some("Jane Citizen")),
        ]),
    );
    let page_one = schema.page(1).unwrap();
    record.insert_page(1, empty_page(page_one));
    let page_three = schema.page(3).unwrap();
    let mut measurements = empty_page(page_three);
    if let Some((_, value)) = measurements.get_index_mut(0) {
        *value = Some("172 cm".to_string());
    }
    record.insert_page(3, measurements);

    let tables = to_grouped_rows(&record, &schema).unwrap();
    let names: Vec<&str> = tables.keys().map(String::as_str).collect();
    assert_eq!(names, ["applicant_details", "examination_measurements"]);

    for row in tables.values() {
        assert_eq!(row.get_index(0).unwrap().0, "reference_number");
        assert_eq!(row["reference_number"].as_deref(), Some("REF1"));
    }
    let applicant = &tables["applicant_details"];
    assert_eq!(
        applicant["name_of_life_to_be_insured"].as_deref(),
        Some("Jane Citizen")
    );
    assert_eq!(applicant.len(), 2 + page_one.fields.len());
    assert_eq!(
        tables["examination_measurements"].len(),
        1 + page_three.fields.len()
    );
}

#[test]
fn missing_reference_blocks_export() {
    let schema = small_schema();
    let mut record = ExtractedRecord::new();
    record.insert_page(0, page_fields(&[("reference_number", None), ("name", Some("x"))]));
    record.insert_page(2, page_fields(&[("height", Some("180"))]));

    assert!(matches!(
        to_grouped_rows(&record, &schema),
        Err(ExportError::MissingReference(field)) if field == "reference_number"
    ));
    assert!(matches!(
        to_wide_row(&record, &schema),
        Err(ExportError::MissingReference(_))
    ));
}

#[test]
fn wide_row_leads_with_reference() {
    let schema = small_schema();
    let mut record = ExtractedRecord::new();
    record.insert_page(2, page_fields(&[("height", Some("180")), ("weight", None)]));
    record.insert_page(
        0,
        page_fields(&[("reference_number", Some("REF9")), ("name", Some("Sam"))]),
    );

    let row = to_wide_row(&record, &schema).unwrap();
    let columns: Vec<&str> = row.keys().map(String::as_str).collect();
    assert_eq!(columns, ["reference_number", "name", "height", "weight"]);
    assert_eq!(row["reference_number"].as_deref(), Some("REF9"));
}

#[test]
fn csv_output_is_deterministic_and_reads_back() {
    let schema = small_schema();
    let first = full_record(&schema);
    let mut second = ExtractedRecord::new();
    second.insert_page(
        0,
        page_fields(&[("reference_number", Some("REF2")), ("name", Some("Lee, Sam"))]),
    );

    let records = vec![first.clone(), second];
    let mut once = Vec::new();
    write_csv(&mut once, &schema, &records).unwrap();
    let mut twice = Vec::new();
    write_csv(&mut twice, &schema, &records).unwrap();
    assert_eq!(once, twice);

    let text = String::from_utf8(once.clone()).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("reference_number,name,address,occupation,height,weight")
    );
    assert_eq!(lines.nth(1), Some("REF2,\"Lee, Sam\",,,,"));

    let restored = read_csv(once.as_slice(), &schema).unwrap();
    assert_eq!(restored.len(), 2);
    assert_eq!(restored[0], first);
    assert_eq!(
        restored[1].page(0).unwrap()["name"].as_deref(),
        Some("Lee, Sam")
    );
    assert_eq!(restored[1].page(1).unwrap()["address"], None);
}
